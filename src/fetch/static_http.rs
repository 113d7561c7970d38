//! Single-shot HTTP fetching with PDF sniffing.

use super::normalize;
use super::{FetchOptions, FetchResult};
use crate::error::{Error, Result};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use std::time::Instant;
use url::Url;

/// A static fetch keeps the raw HTML around so auto mode can re-inspect it
/// for SPA signals without refetching.
pub(super) struct StaticFetch {
    pub result: FetchResult,
    pub raw_html: Option<String>,
}

pub(super) async fn fetch_static(
    client: &reqwest::Client,
    url: &Url,
    opts: &FetchOptions,
) -> Result<StaticFetch> {
    let start = Instant::now();

    let response = client.get(url.clone()).send().await?;
    let status = response.status();

    if status.as_u16() == 429 {
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let mut err = Error::new(
            crate::error::ErrorKind::RateLimited,
            format!("upstream rate limited {}", url),
        );
        if let Some(ms) = retry_after_ms {
            err = err.with_detail("retry_after_ms", ms);
        }
        return Err(err);
    }
    if !status.is_success() {
        return Err(Error::http_status(status.as_u16()));
    }

    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let bytes = response.bytes().await?;

    if normalize::is_pdf(content_type.as_deref(), &bytes) {
        let content = normalize::pdf_to_text(&bytes)?;
        let word_count = normalize::word_count(&content);
        return Ok(StaticFetch {
            result: FetchResult {
                url: url.to_string(),
                final_url: final_url.to_string(),
                title: None,
                content,
                links: Vec::new(),
                images: Vec::new(),
                word_count,
                status_code: status.as_u16(),
                fetcher_used: "pdf".to_string(),
                fetch_time_ms: start.elapsed().as_millis() as u64,
            },
            raw_html: None,
        });
    }

    let html = String::from_utf8_lossy(&bytes).into_owned();
    let extracted = normalize::extract(&html, &final_url, opts.include_links, opts.include_images);
    let word_count = normalize::word_count(&extracted.markdown);

    Ok(StaticFetch {
        result: FetchResult {
            url: url.to_string(),
            final_url: final_url.to_string(),
            title: extracted.title,
            content: extracted.markdown,
            links: extracted.links,
            images: extracted.images,
            word_count,
            status_code: status.as_u16(),
            fetcher_used: "static".to_string(),
            fetch_time_ms: start.elapsed().as_millis() as u64,
        },
        raw_html: Some(html),
    })
}
