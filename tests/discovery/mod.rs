//! Sitemap resolver and link mapper tests against in-process fixtures.

use axum::{routing::get, Router};
use regex::Regex;
use std::time::Duration;
use websearch::error::ErrorKind;
use websearch::fetch::Fetcher;
use websearch::mapper;
use websearch::sitemap::{self, SitemapSource};

async fn spawn_with_base(build: impl FnOnce(String) -> Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = build(base.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

fn fetcher() -> Fetcher {
    Fetcher::new(Duration::from_secs(5), 0, 10).unwrap()
}

fn urlset(urls: &[String]) -> String {
    let entries: String = urls
        .iter()
        .map(|u| format!("<url><loc>{}</loc></url>", u))
        .collect();
    format!(
        "<?xml version=\"1.0\"?><urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">{}</urlset>",
        entries
    )
}

fn sitemapindex(children: &[String]) -> String {
    let entries: String = children
        .iter()
        .map(|u| format!("<sitemap><loc>{}</loc></sitemap>", u))
        .collect();
    format!(
        "<?xml version=\"1.0\"?><sitemapindex xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">{}</sitemapindex>",
        entries
    )
}

#[tokio::test]
async fn robots_directives_win_over_common_paths() {
    let base = spawn_with_base(|base| {
        let robots = format!("User-agent: *\nDisallow: /admin\nSitemap: {base}/maps/root.xml\n");
        let map = urlset(&[
            format!("{base}/docs/a"),
            format!("{base}/docs/b"),
            format!("{base}/blog/c"),
        ]);
        Router::new()
            .route("/robots.txt", get(move || async move { robots }))
            .route("/maps/root.xml", get(move || async move { map }))
    })
    .await;

    let fetcher = fetcher();
    let discovery = sitemap::discover(fetcher.client(), &base, 10, None)
        .await
        .unwrap();
    assert_eq!(discovery.source, SitemapSource::RobotsTxt);
    assert_eq!(discovery.discovered_urls.len(), 3);
    assert!(discovery.discovered_urls[0].ends_with("/docs/a"));
}

#[tokio::test]
async fn path_filter_and_max_urls_apply() {
    let base = spawn_with_base(|base| {
        let robots = format!("Sitemap: {base}/maps/root.xml\n");
        let map = urlset(&[
            format!("{base}/docs/a"),
            format!("{base}/blog/x"),
            format!("{base}/docs/b"),
            format!("{base}/docs/c"),
        ]);
        Router::new()
            .route("/robots.txt", get(move || async move { robots }))
            .route("/maps/root.xml", get(move || async move { map }))
    })
    .await;

    let fetcher = fetcher();
    let filter = Regex::new("^/docs").unwrap();
    let discovery = sitemap::discover(fetcher.client(), &base, 2, Some(&filter))
        .await
        .unwrap();
    assert_eq!(discovery.discovered_urls.len(), 2, "maxUrls truncates");
    assert!(discovery
        .discovered_urls
        .iter()
        .all(|u| u.contains("/docs/")));
}

#[tokio::test]
async fn common_path_probe_when_robots_is_silent() {
    let base = spawn_with_base(|base| {
        let map = urlset(&[format!("{base}/page/one")]);
        Router::new().route("/sitemap.xml", get(move || async move { map }))
    })
    .await;

    let fetcher = fetcher();
    let discovery = sitemap::discover(fetcher.client(), &base, 10, None)
        .await
        .unwrap();
    assert_eq!(discovery.source, SitemapSource::CommonPath);
    assert_eq!(discovery.discovered_urls.len(), 1);
}

#[tokio::test]
async fn sitemap_index_flattens_to_depth_two_and_caps_deeper() {
    let base = spawn_with_base(|base| {
        let root = sitemapindex(&[format!("{base}/level1.xml"), format!("{base}/cap1.xml")]);
        let level1 = sitemapindex(&[format!("{base}/leaf.xml")]);
        let leaf = urlset(&[format!("{base}/page/deep")]);
        let cap1 = sitemapindex(&[format!("{base}/cap2.xml")]);
        let cap2 = sitemapindex(&[format!("{base}/capleaf.xml")]);
        let capleaf = urlset(&[format!("{base}/page/too-deep")]);
        Router::new()
            .route("/sitemap.xml", get(move || async move { root }))
            .route("/level1.xml", get(move || async move { level1 }))
            .route("/leaf.xml", get(move || async move { leaf }))
            .route("/cap1.xml", get(move || async move { cap1 }))
            .route("/cap2.xml", get(move || async move { cap2 }))
            .route("/capleaf.xml", get(move || async move { capleaf }))
    })
    .await;

    let fetcher = fetcher();
    let discovery = sitemap::discover(fetcher.client(), &base, 10, None)
        .await
        .unwrap();
    let urls = &discovery.discovered_urls;
    assert!(
        urls.iter().any(|u| u.ends_with("/page/deep")),
        "urlset at index depth 2 must flatten: {:?}",
        urls
    );
    assert!(
        !urls.iter().any(|u| u.ends_with("/page/too-deep")),
        "index nesting beyond depth 2 must be capped: {:?}",
        urls
    );
}

#[tokio::test]
async fn missing_sitemaps_report_no_sitemap() {
    let base = spawn_with_base(|_| Router::new()).await;
    let fetcher = fetcher();
    let err = sitemap::discover(fetcher.client(), &base, 10, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.details.unwrap()["reason"], "no_sitemap");
}

fn linked_page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!("<a href=\"{}\">{}</a> ", href, href))
        .collect();
    format!(
        "<html><head><title>{title}</title></head><body>\
         <h1>{title}</h1><p>Some body text for {title} with enough words.</p>\
         {anchors}</body></html>"
    )
}

fn mapper_site() -> Router {
    Router::new()
        .route(
            "/",
            get(|| async {
                axum::response::Html(linked_page(
                    "root",
                    &[
                        "/a",
                        "/b",
                        "/report.pdf",
                        "http://elsewhere.example/off-site",
                        "/missing",
                    ],
                ))
            }),
        )
        .route(
            "/a",
            get(|| async { axum::response::Html(linked_page("a", &["/c"])) }),
        )
        .route(
            "/b",
            get(|| async { axum::response::Html(linked_page("b", &[])) }),
        )
        .route(
            "/c",
            get(|| async { axum::response::Html(linked_page("c", &[])) }),
        )
        .route("/missing", get(|| async { axum::http::StatusCode::NOT_FOUND }))
}

#[tokio::test]
async fn mapper_walks_breadth_first_within_the_domain() {
    let base = spawn_with_base(|_| mapper_site()).await;
    let fetcher = fetcher();

    let discovered = mapper::map(&fetcher, &format!("{base}/"), 1, 10, None)
        .await
        .unwrap();

    assert!(discovered.iter().any(|u| u.ends_with('/')));
    assert!(discovered.iter().any(|u| u.ends_with("/a")));
    assert!(discovered.iter().any(|u| u.ends_with("/b")));
    // Depth 1: links found on /a are not followed
    assert!(!discovered.iter().any(|u| u.ends_with("/c")));
    // Failures, assets, and off-site links stay out
    assert!(!discovered.iter().any(|u| u.ends_with("/missing")));
    assert!(!discovered.iter().any(|u| u.contains("report.pdf")));
    assert!(!discovered.iter().any(|u| u.contains("elsewhere.example")));
}

#[tokio::test]
async fn mapper_depth_two_reaches_grandchildren() {
    let base = spawn_with_base(|_| mapper_site()).await;
    let fetcher = fetcher();
    let discovered = mapper::map(&fetcher, &format!("{base}/"), 2, 10, None)
        .await
        .unwrap();
    assert!(discovered.iter().any(|u| u.ends_with("/c")));
}

#[tokio::test]
async fn mapper_respects_max_urls_and_path_filter() {
    let base = spawn_with_base(|_| mapper_site()).await;
    let fetcher = fetcher();

    let capped = mapper::map(&fetcher, &format!("{base}/"), 2, 2, None)
        .await
        .unwrap();
    assert_eq!(capped.len(), 2);

    let filter = Regex::new("^/a").unwrap();
    let filtered = mapper::map(&fetcher, &format!("{base}/"), 2, 10, Some(&filter))
        .await
        .unwrap();
    assert!(filtered.iter().any(|u| u.ends_with("/a")));
    assert!(!filtered.iter().any(|u| u.ends_with("/b")));
}
