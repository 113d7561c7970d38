//! Headless-browser fetching behind a pluggable driver.
//!
//! The crate does not ship a browser. It ships the `BrowserDriver` seam, the
//! CAPTCHA probe (one opaque script), and the detect → solve → inject loop;
//! wiring an actual driver is the integrator's job.

use super::normalize;
use super::{FetchOptions, FetchResult};
use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Contract a headless-browser integration must satisfy. One tab per worker;
/// drivers that support tab reuse can pool internally.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;
    /// Serialized DOM after scripts have run.
    async fn content(&self) -> Result<String>;
    async fn current_url(&self) -> Result<String>;
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptchaChallenge {
    pub kind: String,
    pub site_key: String,
    pub page_url: String,
}

/// External solving service: challenge in, response token out.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String>;
}

/// The DOM probe is a single opaque script; everything else goes through
/// `detect`/`inject` so the driver never sees challenge internals.
const CAPTCHA_PROBE_SCRIPT: &str = r#"(() => {
  const g = document.querySelector('.g-recaptcha[data-sitekey]');
  if (g) return { type: 'recaptcha_v2', siteKey: g.getAttribute('data-sitekey') };
  const h = document.querySelector('.h-captcha[data-sitekey]');
  if (h) return { type: 'hcaptcha', siteKey: h.getAttribute('data-sitekey') };
  const t = document.querySelector('.cf-turnstile[data-sitekey]');
  if (t) return { type: 'turnstile', siteKey: t.getAttribute('data-sitekey') };
  if (document.title === 'Just a moment...') return { type: 'cloudflare_challenge', siteKey: '' };
  return null;
})()"#;

fn injection_script(kind: &str, token: &str) -> String {
    let field = match kind {
        "hcaptcha" => "h-captcha-response",
        "turnstile" => "cf-turnstile-response",
        _ => "g-recaptcha-response",
    };
    let token_js = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"(() => {{
  let el = document.querySelector('textarea[name="{field}"], input[name="{field}"]');
  if (!el) {{
    el = document.createElement('textarea');
    el.name = '{field}';
    el.style.display = 'none';
    document.body.appendChild(el);
  }}
  el.value = {token_js};
  return true;
}})()"#
    )
}

/// Probe the current page for a challenge.
pub async fn detect(driver: &dyn BrowserDriver) -> Result<Option<CaptchaChallenge>> {
    let value = driver.evaluate(CAPTCHA_PROBE_SCRIPT).await?;
    if value.is_null() {
        return Ok(None);
    }
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let site_key = value
        .get("siteKey")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok(Some(CaptchaChallenge {
        kind,
        site_key,
        page_url: String::new(),
    }))
}

/// Write a solved token into the conventional response field.
pub async fn inject(driver: &dyn BrowserDriver, kind: &str, token: &str) -> Result<()> {
    driver.evaluate(&injection_script(kind, token)).await?;
    Ok(())
}

pub(super) async fn fetch_dynamic(
    driver: &Arc<dyn BrowserDriver>,
    solver: Option<&Arc<dyn CaptchaSolver>>,
    url: &Url,
    opts: &FetchOptions,
    selector_timeout: Duration,
) -> Result<FetchResult> {
    let start = Instant::now();

    driver.navigate(url.as_str()).await?;
    if let Some(selector) = &opts.wait_for_selector {
        driver.wait_for_selector(selector, selector_timeout).await?;
    }

    if let Some(mut challenge) = detect(driver.as_ref()).await? {
        challenge.page_url = url.to_string();
        match solver {
            None => {
                return Err(Error::new(
                    ErrorKind::CaptchaBlocked,
                    format!("captcha challenge on {}", url),
                )
                .with_detail("challenge", challenge.kind));
            }
            Some(solver) => {
                debug!("Solving {} challenge on {}", challenge.kind, url);
                let token = solver.solve(&challenge).await?;
                inject(driver.as_ref(), &challenge.kind, &token).await?;
                if let Some(still) = detect(driver.as_ref()).await? {
                    warn!("Challenge on {} persisted after solve", url);
                    return Err(Error::new(
                        ErrorKind::CaptchaBlocked,
                        format!("captcha challenge persisted on {}", url),
                    )
                    .with_detail("challenge", still.kind));
                }
            }
        }
    }

    let html = driver.content().await?;
    let final_url = driver
        .current_url()
        .await
        .unwrap_or_else(|_| url.to_string());
    let base = Url::parse(&final_url).unwrap_or_else(|_| url.clone());

    let extracted = normalize::extract(&html, &base, opts.include_links, opts.include_images);
    let word_count = normalize::word_count(&extracted.markdown);

    Ok(FetchResult {
        url: url.to_string(),
        final_url,
        title: extracted.title,
        content: extracted.markdown,
        links: extracted.links,
        images: extracted.images,
        word_count,
        // The driver does not surface the HTTP status of the navigation.
        status_code: 200,
        fetcher_used: "dynamic".to_string(),
        fetch_time_ms: start.elapsed().as_millis() as u64,
    })
}
