//! URL normalization and host helpers shared by the fetcher, mapper, sitemap
//! resolver, and batch pipeline.

use url::Url;

/// Canonical form used for deduplication: parsed URL with the fragment
/// stripped. `Url` already lowercases the scheme and host and omits default
/// ports when rendering.
pub fn normalize(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    if !is_fetchable_scheme(&parsed) {
        return None;
    }
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

pub fn is_fetchable_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

pub fn host_of(raw: &str) -> Option<String> {
    Url::parse(raw).ok()?.host_str().map(|h| h.to_string())
}

/// Registered-domain comparison used by the link mapper: hosts match when
/// their last two labels agree (`docs.example.com` == `example.com`).
/// IP addresses and single-label hosts compare exactly.
pub fn same_registered_domain(a: &str, b: &str) -> bool {
    registrable_suffix(a) == registrable_suffix(b)
}

fn registrable_suffix(host: &str) -> String {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[labels.len() - 2..].join(".")
}

/// Links the mapper should not enqueue: binary and asset resources.
pub fn is_non_html_resource(url: &str) -> bool {
    let skip_extensions = [
        ".pdf", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".mp3", ".mp4", ".wav",
        ".avi", ".mov", ".zip", ".tar", ".gz", ".rar", ".doc", ".docx", ".xls", ".xlsx", ".ppt",
        ".pptx", ".css", ".js", ".json", ".xml", ".rss", ".atom",
    ];
    let path = Url::parse(url)
        .ok()
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|| url.to_lowercase());
    skip_extensions.iter().any(|ext| path.ends_with(ext))
}

/// Turn a bare domain or partial URL into a base origin for discovery.
pub fn domain_to_origin(domain: &str) -> Option<Url> {
    let trimmed = domain.trim();
    if trimmed.is_empty() {
        return None;
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    let parsed = Url::parse(&with_scheme).ok()?;
    if !is_fetchable_scheme(&parsed) || parsed.host_str().is_none() {
        return None;
    }
    // Keep only the origin part
    let origin = parsed.origin().ascii_serialization();
    Url::parse(&origin).ok()
}
