//! Change Detector (C8, §4.8). Polls each active source's listing pages, fingerprints
//! the content, extracts candidate documents, diffs them against what the store already
//! knows, and files novel documents as new orders. Grounded on `change_detector.py`'s
//! `ChangeDetector.check_source`/`check_all`.

use std::collections::HashSet;
use std::time::Duration;

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::{DiscoveredDocument, LogLevel, OrderType, RiskClass, Source, SourceType, Stage};
use crate::downloader::Downloader;
use crate::source_registry::SourceRegistry;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Unchanged,
    NewDocs,
    Changed,
    Error,
    Skipped,
}

pub struct CheckResult {
    pub source_code: String,
    pub status: CheckStatus,
    pub new_orders: usize,
    pub error: Option<String>,
}

static RE_SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</\1>").unwrap());
static RE_HTML_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static RE_VOLATILE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(csrf|nonce|token|session|timestamp)="[^"]*""#).unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_DIRECTIVE_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)распоряжение").unwrap());

/// Content fingerprint (§4.8 step 3): deterministic given identical HTML (§8
/// "change-detector determinism").
pub fn content_hash(html: &str) -> String {
    let stripped = RE_SCRIPT_STYLE.replace_all(html, "");
    let stripped = RE_HTML_COMMENT.replace_all(&stripped, "");
    let stripped = RE_VOLATILE_ATTR.replace_all(&stripped, "");
    let collapsed = RE_WHITESPACE.replace_all(stripped.trim(), " ");
    hex::encode(Sha256::digest(collapsed.as_bytes()))
}

pub struct ChangeDetector {
    registry: SourceRegistry,
    downloader: Downloader,
    store: std::sync::Arc<dyn Store>,
    max_pages_sleep: (f64, f64),
}

impl ChangeDetector {
    pub fn new(registry: SourceRegistry, downloader: Downloader, store: std::sync::Arc<dyn Store>) -> Self {
        Self { registry, downloader, store, max_pages_sleep: (1.5, 3.0) }
    }

    /// Runs `check_source` for every active source sequentially, with a 2-5s jitter
    /// between sources (§4.8 `check_all`). Errors from one source never abort the pass.
    pub async fn check_all(&self) -> Vec<CheckResult> {
        let codes: Vec<String> = self.registry.active().map(|s| s.code.clone()).collect();
        let mut results = Vec::with_capacity(codes.len());
        for (i, code) in codes.iter().enumerate() {
            if i > 0 {
                sleep_jitter(2.0, 5.0).await;
            }
            let result = self.check_source(code).await;
            results.push(result);
        }
        results
    }

    pub async fn check_source(&self, source_code: &str) -> CheckResult {
        match self.check_source_inner(source_code).await {
            Ok(result) => result,
            Err(e) => {
                self.store
                    .log_processing(None, Some(source_code), LogLevel::Error, Stage::ChangeDetection, &e.to_string(), None)
                    .await;
                CheckResult {
                    source_code: source_code.to_string(),
                    status: CheckStatus::Error,
                    new_orders: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn check_source_inner(&self, source_code: &str) -> anyhow::Result<CheckResult> {
        let source = self
            .registry
            .get(source_code)
            .ok_or_else(|| anyhow::anyhow!("unknown source: {source_code}"))?
            .clone();

        if matches!(source.risk_class, RiskClass::Red) {
            return Ok(CheckResult {
                source_code: source_code.to_string(),
                status: CheckStatus::Skipped,
                new_orders: 0,
                error: None,
            });
        }

        let mut combined_html = String::new();
        for listing_url in &source.listing_urls {
            let pages = self.fetch_listing_with_pagination(&source, listing_url).await?;
            for page in pages {
                combined_html.push_str(&page);
                combined_html.push('\n');
            }
        }

        let hash = content_hash(&combined_html);
        let previous_hash = self.store.last_content_hash(source_code).await?;
        let hash_changed = previous_hash.as_deref() != Some(hash.as_str());

        let discovered = self.extract_documents(&source, &combined_html)?;
        let deduped = dedupe_by_url(discovered);

        let known = self.store.known_order_urls(source_code).await?;
        let novel: Vec<DiscoveredDocument> = deduped
            .into_iter()
            .filter(|d| {
                let key = d.file_url.as_deref().unwrap_or(&d.url);
                !known.contains(key) && !known.contains(&d.url)
            })
            .collect();

        let mut new_orders = 0usize;
        for doc in &novel {
            let order_date = doc.order_date.as_deref().and_then(parse_ddmmyyyy);
            self.store
                .get_or_create_order(
                    source_code,
                    doc.order_number.as_deref().unwrap_or(""),
                    order_date,
                    doc.order_type.unwrap_or(OrderType::Order),
                    doc.title.as_deref(),
                    Some(&doc.url),
                    doc.file_url.as_deref(),
                )
                .await?;
            new_orders += 1;
        }

        self.store.update_source_checkpoint(source_code, &hash, None).await?;

        let status = if new_orders > 0 {
            CheckStatus::NewDocs
        } else if hash_changed {
            CheckStatus::Changed
        } else {
            CheckStatus::Unchanged
        };

        self.store
            .log_processing(
                None,
                Some(source_code),
                LogLevel::Info,
                Stage::ChangeDetection,
                &format!("checked source: {new_orders} new document(s)"),
                Some(serde_json::json!({"status": format!("{status:?}")})),
            )
            .await;

        Ok(CheckResult { source_code: source_code.to_string(), status, new_orders, error: None })
    }

    async fn fetch_listing_with_pagination(&self, source: &Source, listing_url: &str) -> anyhow::Result<Vec<String>> {
        let view = source.to_detect_view();
        let mut pages = Vec::new();
        let first = self
            .downloader
            .fetch_listing_html(listing_url, &source.code)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        pages.push(first);

        if let Some(template) = view.pagination_template {
            for page_num in 2..=view.max_pages.max(1) {
                sleep_jitter(self.max_pages_sleep.0, self.max_pages_sleep.1).await;
                let url = template.replace("{page}", &page_num.to_string());
                match self.downloader.fetch_listing_html(&url, &source.code).await {
                    Ok(html) => pages.push(html),
                    Err(e) => {
                        tracing::warn!(source = %source.code, page = page_num, error = %e, "pagination fetch failed, stopping");
                        break;
                    }
                }
            }
        }
        Ok(pages)
    }

    fn extract_documents(&self, source: &Source, html: &str) -> anyhow::Result<Vec<DiscoveredDocument>> {
        match source.source_type {
            SourceType::PdfPortal | SourceType::HtmlTable => extract_pdf_portal_documents(source, html),
            SourceType::JsonEmbed => extract_json_embed_documents(source, html),
        }
    }
}

/// Rounds a byte index down to the nearest UTF-8 char boundary at or before it.
fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Rounds a byte index up to the nearest UTF-8 char boundary at or after it.
fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn extract_pdf_portal_documents(source: &Source, html: &str) -> anyhow::Result<Vec<DiscoveredDocument>> {
    let Some(pattern) = source.link_regex.as_deref() else {
        return Ok(Vec::new());
    };
    let link_re = Regex::new(pattern)?;
    let title_re = source.title_regex.as_deref().map(Regex::new).transpose()?;
    let date_re = source.order_date_regex.as_deref().map(Regex::new).transpose()?;
    let number_re = source.order_number_regex.as_deref().map(Regex::new).transpose()?;

    let base = url::Url::parse(&source.base_url).ok();
    let mut docs = Vec::new();

    for caps in link_re.captures_iter(html) {
        // `link_regex` always carries one capturing group around the href/file URL
        // (§2 C1 "link … regexes"); matching `re.findall(link_regex, html)` in the
        // original, which returns the captured group, not the whole match.
        let Some(href_match) = caps.get(1) else { continue };
        let href = href_match.as_str();
        let resolved = base
            .as_ref()
            .and_then(|b| b.join(href).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| href.to_string());

        // Offsets are byte positions into `html`; clamp to the nearest char boundary
        // before slicing so a ±500-byte window landing mid-character (routine with
        // Cyrillic text) doesn't panic.
        let ctx_start = floor_char_boundary(html, href_match.start().saturating_sub(500));
        let ctx_end = ceil_char_boundary(html, (href_match.end() + 500).min(html.len()));
        let context = &html[ctx_start..ctx_end];

        let title = title_re.as_ref().and_then(|re| re.captures(context)).and_then(|c| c.get(1)).map(|g| g.as_str().to_string());
        let order_date = date_re.as_ref().and_then(|re| re.captures(context)).and_then(|c| c.get(1)).map(|g| g.as_str().to_string());
        let order_number = number_re.as_ref().and_then(|re| re.captures(context)).and_then(|c| c.get(1)).map(|g| g.as_str().to_string());
        let order_type = if RE_DIRECTIVE_WORD.is_match(context) { OrderType::Directive } else { OrderType::Order };

        docs.push(DiscoveredDocument {
            url: resolved.clone(),
            file_url: Some(resolved),
            title,
            order_number,
            order_date,
            order_type: Some(order_type),
        });
    }

    Ok(docs)
}

fn extract_json_embed_documents(source: &Source, html: &str) -> anyhow::Result<Vec<DiscoveredDocument>> {
    let Some(js_var) = source.js_var.as_deref() else {
        return Ok(Vec::new());
    };
    let pattern = format!(r"(?s)var\s+{}\s*=\s*(\{{.*?\}}|\[.*?\])\s*;", regex::escape(js_var));
    let re = Regex::new(&pattern)?;
    let Some(caps) = re.captures(html) else {
        return Ok(Vec::new());
    };
    let raw_json = &caps[1];
    let parsed: Value = serde_json::from_str(raw_json)
        .or_else(|_| serde_json::from_str(&format!("[{raw_json}]")))
        .map_err(|e| anyhow::anyhow!("failed to parse {js_var} payload: {e}"))?;

    let items: Vec<Value> = match parsed {
        Value::Array(items) => items,
        Value::Object(map) => map.into_values().collect(),
        other => vec![other],
    };

    let mut docs = Vec::new();
    for item in items {
        let url = item
            .get("url")
            .or_else(|| item.get("file_url"))
            .or_else(|| item.get("href"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(url) = url else { continue };
        docs.push(DiscoveredDocument {
            url: url.clone(),
            file_url: Some(url),
            title: item.get("title").and_then(Value::as_str).map(str::to_string),
            order_number: item.get("number").and_then(Value::as_str).map(str::to_string),
            order_date: item.get("date").and_then(Value::as_str).map(str::to_string),
            order_type: Some(source.order_type),
        });
    }
    Ok(docs)
}

fn dedupe_by_url(docs: Vec<DiscoveredDocument>) -> Vec<DiscoveredDocument> {
    let mut seen = HashSet::new();
    docs.into_iter()
        .filter(|d| {
            let key = d.file_url.clone().unwrap_or_else(|| d.url.clone());
            seen.insert(key)
        })
        .collect()
}

fn parse_ddmmyyyy(s: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%d.%m.%Y").ok()
}

async fn sleep_jitter(min_secs: f64, max_secs: f64) {
    let secs = rand::thread_rng().gen_range(min_secs..=max_secs);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic_and_ignores_volatile_attrs() {
        let a = r#"<div csrf="abc123">hello</div>"#;
        let b = r#"<div csrf="zzz999">hello</div>"#;
        assert_eq!(content_hash(a), content_hash(b));
    }

    #[test]
    fn content_hash_ignores_script_and_style_blocks() {
        let a = "<p>text</p><script>var x = Math.random();</script>";
        let b = "<p>text</p><script>var x = 42;</script>";
        assert_eq!(content_hash(a), content_hash(b));
    }

    #[test]
    fn content_hash_changes_when_visible_content_changes() {
        assert_ne!(content_hash("<p>one</p>"), content_hash("<p>two</p>"));
    }

    #[test]
    fn dedupe_by_url_prefers_file_url_as_key() {
        let docs = vec![
            DiscoveredDocument { url: "a".into(), file_url: Some("x.pdf".into()), ..Default::default() },
            DiscoveredDocument { url: "b".into(), file_url: Some("x.pdf".into()), ..Default::default() },
        ];
        assert_eq!(dedupe_by_url(docs).len(), 1);
    }

    #[test]
    fn extracts_pdf_links_with_context_enrichment() {
        let source = Source {
            code: "test".into(),
            name: "Test".into(),
            region: "Test".into(),
            issuing_body: "Test".into(),
            order_type: OrderType::Order,
            risk_class: RiskClass::Green,
            active: true,
            fetch_method: crate::domain::FetchMethod::Http,
            base_url: "https://example.test".into(),
            delay: crate::domain::DelayRange { min_secs: 0.0, max_secs: 0.0 },
            wait_selector: None,
            listing_urls: vec!["https://example.test/list".into()],
            link_regex: Some(r#"href="([^"]+\.pdf)""#.to_string()),
            title_regex: Some(r#">([^<]{5,100})</a>"#.to_string()),
            order_date_regex: Some(r"(\d{2}\.\d{2}\.\d{4})".to_string()),
            order_number_regex: Some(r"№\s*(\d+)".to_string()),
            pagination_template: None,
            max_pages: 1,
            source_type: SourceType::PdfPortal,
            js_var: None,
            official_basis: String::new(),
            last_content_hash: None,
            last_etag: None,
            last_checked_at: None,
        };
        let html = r#"<a href="/docs/order1.pdf">Приказ № 123 от 01.02.2024</a>"#;
        let docs = extract_pdf_portal_documents(&source, html).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].url, "https://example.test/docs/order1.pdf");
        assert_eq!(docs[0].order_number.as_deref(), Some("123"));
        assert_eq!(docs[0].order_date.as_deref(), Some("01.02.2024"));
    }

    #[test]
    fn context_window_does_not_panic_on_cyrillic_byte_offsets() {
        let source = {
            let mut s = minimal_source();
            s.link_regex = Some(r#"href="([^"]+\.pdf)""#.to_string());
            s.title_regex = Some(r#">([^<]{5,100})</a>"#.to_string());
            s
        };
        // Several hundred bytes of Cyrillic filler (2 bytes/char) on both sides of the
        // link so a naive ±500-byte window lands mid-character.
        let filler: String = "Приказ о присвоении спортивных разрядов судьям ".repeat(12);
        let html = format!(
            r#"<p>{filler}</p><a href="/docs/order1.pdf">Приказ № 123 от 01.02.2024</a><p>{filler}</p>"#
        );
        let docs = extract_pdf_portal_documents(&source, &html).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].url, "https://example.test/docs/order1.pdf");
    }

    #[test]
    fn directive_keyword_in_context_sets_order_type_directive() {
        let source_base = "https://example.test";
        let html = r#"<a href="/d.pdf">Распоряжение №5</a>"#;
        let source = {
            let mut s = minimal_source();
            s.base_url = source_base.into();
            s.link_regex = Some(r#"href="([^"]+\.pdf)""#.to_string());
            s
        };
        let docs = extract_pdf_portal_documents(&source, html).unwrap();
        assert_eq!(docs[0].order_type, Some(OrderType::Directive));
    }

    fn minimal_source() -> Source {
        Source {
            code: "x".into(),
            name: "x".into(),
            region: "x".into(),
            issuing_body: "x".into(),
            order_type: OrderType::Order,
            risk_class: RiskClass::Green,
            active: true,
            fetch_method: crate::domain::FetchMethod::Http,
            base_url: "https://example.test".into(),
            delay: crate::domain::DelayRange { min_secs: 0.0, max_secs: 0.0 },
            wait_selector: None,
            listing_urls: vec![],
            link_regex: None,
            title_regex: None,
            order_date_regex: None,
            order_number_regex: None,
            pagination_template: None,
            max_pages: 1,
            source_type: SourceType::PdfPortal,
            js_var: None,
            official_basis: String::new(),
            last_content_hash: None,
            last_etag: None,
            last_checked_at: None,
        }
    }
}
