//! Sitemap discovery: robots.txt directives first, conventional paths second,
//! then XML parsing with bounded sitemap-index recursion.

use crate::config::SITEMAP_INDEX_MAX_DEPTH;
use crate::error::{Error, Result};
use crate::urls;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::collections::VecDeque;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SitemapSource {
    RobotsTxt,
    CommonPath,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SitemapDiscovery {
    pub discovered_urls: Vec<String>,
    pub source: SitemapSource,
}

/// Discover page URLs for a domain.
pub async fn discover(
    client: &reqwest::Client,
    domain: &str,
    max_urls: usize,
    path_filter: Option<&Regex>,
) -> Result<SitemapDiscovery> {
    let origin = urls::domain_to_origin(domain)
        .ok_or_else(|| Error::invalid_input(format!("invalid domain '{}'", domain)))?;

    let (sitemap_urls, source) = locate_sitemaps(client, &origin).await?;
    debug!(
        "Found {} sitemap file(s) for {} via {:?}",
        sitemap_urls.len(),
        origin,
        source
    );

    let mut seen: HashSet<String> = HashSet::new();
    let mut discovered: Vec<String> = Vec::new();
    let mut queue: VecDeque<(String, usize)> = sitemap_urls.into_iter().map(|u| (u, 0)).collect();

    while let Some((sitemap_url, depth)) = queue.pop_front() {
        if discovered.len() >= max_urls {
            break;
        }
        let body = match fetch_text(client, &sitemap_url).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Skipping sitemap {}: {}", sitemap_url, e);
                continue;
            }
        };
        let parsed = parse_sitemap_xml(&body)?;
        match parsed {
            SitemapXml::Index(children) => {
                // Bounded recursion: indexes of indexes flatten to depth 2
                if depth < SITEMAP_INDEX_MAX_DEPTH {
                    for child in children {
                        queue.push_back((child, depth + 1));
                    }
                } else {
                    debug!("Sitemap index depth cap reached at {}", sitemap_url);
                }
            }
            SitemapXml::UrlSet(locs) => {
                for loc in locs {
                    let Some(normalized) = urls::normalize(&loc) else {
                        continue;
                    };
                    if let Some(filter) = path_filter {
                        let path = Url::parse(&normalized)
                            .map(|u| u.path().to_string())
                            .unwrap_or_default();
                        if !filter.is_match(&path) {
                            continue;
                        }
                    }
                    if seen.insert(normalized.clone()) {
                        discovered.push(normalized);
                        if discovered.len() >= max_urls {
                            break;
                        }
                    }
                }
            }
        }
    }

    Ok(SitemapDiscovery {
        discovered_urls: discovered,
        source,
    })
}

/// Find sitemap file URLs: robots.txt `Sitemap:` lines, then common paths.
async fn locate_sitemaps(
    client: &reqwest::Client,
    origin: &Url,
) -> Result<(Vec<String>, SitemapSource)> {
    let robots_url = origin
        .join("/robots.txt")
        .map_err(|e| Error::internal(format!("robots url: {}", e)))?;

    match fetch_text(client, robots_url.as_str()).await {
        Ok(robots) => {
            let from_robots = parse_robots_sitemaps(&robots);
            if !from_robots.is_empty() {
                return Ok((from_robots, SitemapSource::RobotsTxt));
            }
        }
        Err(e) => debug!("No robots.txt at {}: {}", robots_url, e),
    }

    for probe in ["/sitemap.xml", "/sitemap_index.xml"] {
        let candidate = origin
            .join(probe)
            .map_err(|e| Error::internal(format!("probe url: {}", e)))?;
        if fetch_text(client, candidate.as_str()).await.is_ok() {
            return Ok((vec![candidate.to_string()], SitemapSource::CommonPath));
        }
    }

    Err(Error::not_found(format!("no sitemap found for {}", origin))
        .with_detail("reason", "no_sitemap"))
}

fn parse_robots_sitemaps(robots: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if !key.trim().eq_ignore_ascii_case("sitemap") {
                return None;
            }
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        })
        .collect()
}

#[derive(Debug)]
enum SitemapXml {
    Index(Vec<String>),
    UrlSet(Vec<String>),
}

fn parse_sitemap_xml(body: &str) -> Result<SitemapXml> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| Error::parse(format!("sitemap xml: {}", e)))?;
    let root = doc.root_element();

    let locs = |parent_tag: &str| -> Vec<String> {
        root.children()
            .filter(|n| n.is_element() && n.tag_name().name() == parent_tag)
            .filter_map(|entry| {
                entry
                    .children()
                    .find(|c| c.is_element() && c.tag_name().name() == "loc")
                    .and_then(|loc| loc.text())
                    .map(|t| t.trim().to_string())
            })
            .filter(|t| !t.is_empty())
            .collect()
    };

    match root.tag_name().name() {
        "sitemapindex" => Ok(SitemapXml::Index(locs("sitemap"))),
        "urlset" => Ok(SitemapXml::UrlSet(locs("url"))),
        other => Err(Error::parse(format!("unexpected sitemap root <{}>", other))),
    }
}

async fn fetch_text(client: &reqwest::Client, url: &str) -> Result<String> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(Error::http_status(status.as_u16()));
    }
    Ok(response.text().await?)
}
