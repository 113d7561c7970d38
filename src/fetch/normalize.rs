//! Content normalization: HTML to a markdown-like text representation, link
//! and image harvesting, SPA heuristics, and PDF text extraction.

use crate::error::{Error, Result};
use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct Extracted {
    pub title: Option<String>,
    pub markdown: String,
    pub links: Vec<String>,
    pub images: Vec<String>,
}

/// Normalize an HTML document. Scripts and styles are dropped, whitespace is
/// collapsed, and headings, lists, code, and link text survive as markdown.
pub fn extract(html: &str, base: &Url, include_links: bool, include_images: bool) -> Extracted {
    let doc = Html::parse_document(html);

    let title = select_first_text(&doc, "title");

    let mut writer = MarkdownWriter::new(base.clone());
    writer.walk(doc.tree.root());
    let markdown = writer.finish();

    let links = if include_links {
        collect_refs(&doc, base, "a[href]", "href")
    } else {
        Vec::new()
    };
    let images = if include_images {
        collect_refs(&doc, base, "img[src]", "src")
    } else {
        Vec::new()
    };

    Extracted {
        title,
        markdown,
        links,
        images,
    }
}

fn select_first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    let text: String = doc.select(&sel).next()?.text().collect::<String>();
    let trimmed = collapse_ws(&text);
    (!trimmed.is_empty()).then_some(trimmed)
}

fn collect_refs(doc: &Html, base: &Url, selector: &str, attr: &str) -> Vec<String> {
    let Ok(sel) = Selector::parse(selector) else {
        return Vec::new();
    };
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for el in doc.select(&sel) {
        let Some(raw) = el.value().attr(attr) else {
            continue;
        };
        let Ok(resolved) = base.join(raw) else {
            continue;
        };
        if !crate::urls::is_fetchable_scheme(&resolved) {
            continue;
        }
        let mut absolute = resolved;
        absolute.set_fragment(None);
        let s = absolute.to_string();
        if seen.insert(s.clone()) {
            out.push(s);
        }
    }
    out
}

/// Heuristic SPA signals: a body with (almost) no text plus a known client
/// mount node. Drives the auto-mode fallback to the dynamic fetcher.
pub fn looks_like_spa(html: &str) -> bool {
    let doc = Html::parse_document(html);
    let body_text = select_first_text(&doc, "body").unwrap_or_default();
    if body_text.len() >= 50 {
        return false;
    }
    for mount in ["#root", "#app", "#__next", "[data-reactroot]"] {
        if let Ok(sel) = Selector::parse(mount) {
            if doc.select(&sel).next().is_some() {
                return true;
            }
        }
    }
    body_text.is_empty()
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// PDF sniffing by content type or magic bytes.
pub fn is_pdf(content_type: Option<&str>, bytes: &[u8]) -> bool {
    if let Some(ct) = content_type {
        if ct.to_ascii_lowercase().contains("application/pdf") {
            return true;
        }
    }
    bytes.starts_with(b"%PDF-")
}

/// Extract text from PDF bytes, preserving paragraph breaks.
pub fn pdf_to_text(bytes: &[u8]) -> Result<String> {
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::parse(format!("pdf extraction failed: {}", e)))?;

    // Collapse intra-paragraph whitespace but keep blank lines as separators.
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in raw.lines() {
        let line = collapse_ws(line);
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    let text = paragraphs.join("\n\n");
    if text.is_empty() {
        return Err(Error::parse("pdf contained no extractable text"));
    }
    Ok(text)
}

/// Downgrade markdown to plain text for `outputFormat: "text"`.
pub fn markdown_to_text(markdown: &str) -> String {
    static LINK_RE: OnceLock<regex::Regex> = OnceLock::new();
    let link_re = LINK_RE.get_or_init(|| regex::Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());

    let mut out = String::with_capacity(markdown.len());
    for line in markdown.lines() {
        let line = line.trim_start_matches('#').trim_start();
        let line = line.strip_prefix("- ").unwrap_or(line);
        if line.trim() == "```" {
            continue;
        }
        out.push_str(&link_re.replace_all(line, "$1"));
        out.push('\n');
    }
    collapse_blank_runs(out.trim())
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_blank_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut blank_run = 0;
    for line in s.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(line);
            out.push('\n');
        }
    }
    out.trim_end().to_string()
}

struct MarkdownWriter {
    out: String,
    base: Url,
    in_pre: usize,
}

impl MarkdownWriter {
    fn new(base: Url) -> Self {
        Self {
            out: String::new(),
            base,
            in_pre: 0,
        }
    }

    fn finish(self) -> String {
        collapse_blank_runs(self.out.trim())
    }

    fn walk(&mut self, node: NodeRef<'_, Node>) {
        match node.value() {
            Node::Text(text) => self.push_text(&text),
            Node::Element(el) => {
                let name = el.name();
                match name {
                    "script" | "style" | "noscript" | "template" | "head" | "svg" | "iframe" => {}
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        let level = name.as_bytes()[1] - b'0';
                        self.break_block();
                        for _ in 0..level {
                            self.out.push('#');
                        }
                        self.out.push(' ');
                        self.walk_children(node);
                        self.break_block();
                    }
                    "p" | "blockquote" | "table" | "tr" | "section" | "article" | "main"
                    | "header" | "footer" | "aside" | "nav" | "div" | "ul" | "ol" => {
                        self.break_block();
                        self.walk_children(node);
                        self.break_block();
                    }
                    "li" => {
                        self.break_line();
                        self.out.push_str("- ");
                        self.walk_children(node);
                        self.break_line();
                    }
                    "br" => self.break_line(),
                    "pre" => {
                        self.break_block();
                        self.out.push_str("```\n");
                        self.in_pre += 1;
                        self.walk_children(node);
                        self.in_pre -= 1;
                        if !self.out.ends_with('\n') {
                            self.out.push('\n');
                        }
                        self.out.push_str("```");
                        self.break_block();
                    }
                    "code" if self.in_pre == 0 => {
                        self.out.push('`');
                        self.walk_children(node);
                        self.out.push('`');
                    }
                    "a" => {
                        let text = collapse_ws(&node_text(node));
                        if text.is_empty() {
                            return;
                        }
                        let href = el
                            .attr("href")
                            .and_then(|h| self.base.join(h).ok())
                            .filter(crate::urls::is_fetchable_scheme);
                        match href {
                            Some(url) => {
                                self.push_text(&format!("[{}]({})", text, url));
                            }
                            None => self.push_text(&text),
                        }
                    }
                    "img" => {
                        if let Some(alt) = el.attr("alt") {
                            let alt = collapse_ws(alt);
                            if !alt.is_empty() {
                                self.push_text(&alt);
                            }
                        }
                    }
                    _ => self.walk_children(node),
                }
            }
            _ => self.walk_children(node),
        }
    }

    fn walk_children(&mut self, node: NodeRef<'_, Node>) {
        for child in node.children() {
            self.walk(child);
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.in_pre > 0 {
            self.out.push_str(text);
            return;
        }
        let collapsed = collapse_ws(text);
        if collapsed.is_empty() {
            return;
        }
        if !self.out.is_empty() && !self.out.ends_with(char::is_whitespace) {
            self.out.push(' ');
        }
        self.out.push_str(&collapsed);
    }

    fn break_line(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn break_block(&mut self) {
        if self.out.is_empty() {
            return;
        }
        while self.out.ends_with(' ') {
            self.out.pop();
        }
        if !self.out.ends_with("\n\n") {
            if self.out.ends_with('\n') {
                self.out.push('\n');
            } else {
                self.out.push_str("\n\n");
            }
        }
    }
}

fn node_text(node: NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out
}

fn collect_text(node: NodeRef<'_, Node>, out: &mut String) {
    if let Node::Text(text) = node.value() {
        out.push_str(&text);
    }
    for child in node.children() {
        collect_text(child, out);
    }
}
