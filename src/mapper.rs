//! Bounded breadth-first link discovery from a seed URL.

use crate::error::{Error, Result};
use crate::fetch::{FetchMode, FetchOptions, Fetcher};
use crate::urls;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, warn};
use url::Url;

/// Traverse same-registered-domain links from `start_url`, static fetches
/// only, up to `max_depth` hops and `max_urls` successfully visited pages.
/// Failed fetches are excluded from the returned set.
pub async fn map(
    fetcher: &Fetcher,
    start_url: &str,
    max_depth: usize,
    max_urls: usize,
    path_filter: Option<&Regex>,
) -> Result<Vec<String>> {
    let start = urls::normalize(start_url)
        .ok_or_else(|| Error::invalid_input(format!("invalid start url '{}'", start_url)))?;
    let start_host = urls::host_of(&start)
        .ok_or_else(|| Error::invalid_input(format!("start url '{}' has no host", start_url)))?;

    let opts = FetchOptions {
        mode: FetchMode::Static,
        wait_for_selector: None,
        include_links: true,
        include_images: false,
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut discovered: Vec<String> = Vec::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();

    visited.insert(start.clone());
    queue.push_back((start, 0));

    while let Some((current, depth)) = queue.pop_front() {
        if discovered.len() >= max_urls {
            break;
        }
        debug!("Mapping [depth={}]: {}", depth, current);

        let result = match fetcher.fetch(&current, &opts).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Map fetch failed for {}: {}", current, e);
                continue;
            }
        };
        discovered.push(current);

        if depth >= max_depth {
            continue;
        }
        for link in &result.links {
            let Some(normalized) = urls::normalize(link) else {
                continue;
            };
            if visited.contains(&normalized) {
                continue;
            }
            let Some(link_host) = urls::host_of(&normalized) else {
                continue;
            };
            if !urls::same_registered_domain(&link_host, &start_host) {
                continue;
            }
            if urls::is_non_html_resource(&normalized) {
                continue;
            }
            if let Some(filter) = path_filter {
                let path = Url::parse(&normalized)
                    .map(|u| u.path().to_string())
                    .unwrap_or_default();
                if !filter.is_match(&path) {
                    continue;
                }
            }
            visited.insert(normalized.clone());
            queue.push_back((normalized, depth + 1));
        }
    }

    discovered.truncate(max_urls);
    Ok(discovered)
}
