//! Source Registry (C1, §4.1). The canonical in-process configuration: lookup by code,
//! iteration over active sources, and the egress allowlist (§6) — the union of hostnames
//! from every configured base/listing URL, plus any host registered at runtime.
//!
//! Grounded on the original's `source_registry.py`, which consolidates what used to be
//! three separate per-module configs (`pdf_downloader.SOURCE_CONFIG`,
//! `change_detector.SOURCE_PATTERNS`, `pipeline_orchestrator.SOURCE_METADATA`) into one
//! `SourceConfig` dataclass. We keep that shape as `Source` (domain.rs) plus accessor
//! views so each of C7/C8/C10 only sees the slice of config it needs.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use url::Url;

use crate::domain::{DelayRange, FetchMethod, OrderType, RiskClass, Source, SourceType};

/// View of a `Source` carrying only what the downloader (C7) needs.
pub struct DownloadView<'a> {
    pub method: FetchMethod,
    pub base_url: &'a str,
    pub delay: DelayRange,
    pub wait_selector: Option<&'a str>,
}

/// View of a `Source` carrying only what the change detector (C8) needs.
pub struct DetectView<'a> {
    pub listing_urls: &'a [String],
    pub link_regex: Option<&'a str>,
    pub title_regex: Option<&'a str>,
    pub order_date_regex: Option<&'a str>,
    pub order_number_regex: Option<&'a str>,
    pub source_type: SourceType,
    pub js_var: Option<&'a str>,
    pub pagination_template: Option<&'a str>,
    pub max_pages: u32,
    pub method: FetchMethod,
}

/// View of a `Source` carrying only what the orchestrator/extractor need for provenance.
pub struct MetaView<'a> {
    pub issuing_body: &'a str,
    pub order_type: OrderType,
    pub region: &'a str,
    pub official_basis: &'a str,
}

impl Source {
    pub fn to_download_view(&self) -> DownloadView<'_> {
        DownloadView {
            method: self.fetch_method,
            base_url: &self.base_url,
            delay: self.delay,
            wait_selector: self.wait_selector.as_deref(),
        }
    }

    pub fn to_detect_view(&self) -> DetectView<'_> {
        DetectView {
            listing_urls: &self.listing_urls,
            link_regex: self.link_regex.as_deref(),
            title_regex: self.title_regex.as_deref(),
            order_date_regex: self.order_date_regex.as_deref(),
            order_number_regex: self.order_number_regex.as_deref(),
            source_type: self.source_type,
            js_var: self.js_var.as_deref(),
            pagination_template: self.pagination_template.as_deref(),
            max_pages: self.max_pages,
            method: self.fetch_method,
        }
    }

    pub fn to_meta_view(&self) -> MetaView<'_> {
        MetaView {
            issuing_body: &self.issuing_body,
            order_type: self.order_type,
            region: &self.region,
            official_basis: &self.official_basis,
        }
    }
}

/// The registry itself. `register_host` appends to an in-process set guarded by a
/// `RwLock` — single-writer-many-reader, as §9 design notes call for — so a new host is
/// usable immediately without restart; removal (not supported) would require one.
#[derive(Clone)]
pub struct SourceRegistry {
    sources: Arc<Vec<Source>>,
    extra_hosts: Arc<RwLock<HashSet<String>>>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> anyhow::Result<Self> {
        for s in &sources {
            s.validate_active_invariant()?;
        }
        Ok(Self {
            sources: Arc::new(sources),
            extra_hosts: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub fn get(&self, code: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.code == code)
    }

    pub fn active(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(|s| s.active)
    }

    pub fn all(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    /// Adds a host to the egress allowlist immediately, without requiring a restart
    /// (§4.1, §9). Used when an operator creates a new source via the administrative
    /// interface (out of scope here, but the core must honor the effect).
    pub fn register_host(&self, host: impl Into<String>) {
        let mut guard = self.extra_hosts.write().expect("extra_hosts lock poisoned");
        guard.insert(host.into().to_lowercase());
    }

    /// The egress allowlist (§4.1, §6): union of hostnames derived from every
    /// configured base URL and listing URL, plus dynamically registered hosts.
    pub fn allowlisted_hosts(&self) -> HashSet<String> {
        let mut hosts: HashSet<String> = HashSet::new();
        for s in self.sources.iter() {
            if let Some(h) = host_of(&s.base_url) {
                hosts.insert(h);
            }
            for u in &s.listing_urls {
                if let Some(h) = host_of(u) {
                    hosts.insert(h);
                }
            }
        }
        hosts.extend(self.extra_hosts.read().expect("extra_hosts lock poisoned").iter().cloned());
        hosts
    }

    pub fn is_host_allowed(&self, host: &str) -> bool {
        self.allowlisted_hosts().contains(&host.to_lowercase())
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DelayRange;

    fn sample_source(code: &str, base_url: &str, listing: &str) -> Source {
        Source {
            code: code.into(),
            name: "Test source".into(),
            region: "Test region".into(),
            issuing_body: "Test body".into(),
            order_type: OrderType::Order,
            risk_class: RiskClass::Green,
            active: true,
            fetch_method: FetchMethod::Http,
            base_url: base_url.into(),
            delay: DelayRange { min_secs: 1.0, max_secs: 3.0 },
            wait_selector: None,
            listing_urls: vec![listing.into()],
            link_regex: Some(r#"href=["']([^"']*\.pdf)["']"#.into()),
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

    #[test]
    fn allowlist_unions_base_and_listing_hosts() {
        let reg = SourceRegistry::new(vec![sample_source(
            "spb_kfkis",
            "https://kfis.gov.spb.ru",
            "https://kfis.gov.spb.ru/list?page=1",
        )])
        .unwrap();
        let hosts = reg.allowlisted_hosts();
        assert!(hosts.contains("kfis.gov.spb.ru"));
        assert!(!reg.is_host_allowed("evil.example.com"));
    }

    #[test]
    fn register_host_is_effective_immediately() {
        let reg = SourceRegistry::new(vec![]).unwrap();
        assert!(!reg.is_host_allowed("new-portal.example.gov.ru"));
        reg.register_host("New-Portal.example.gov.ru");
        assert!(reg.is_host_allowed("new-portal.example.gov.ru"));
    }

    #[test]
    fn active_source_without_listing_urls_fails_validation() {
        let mut s = sample_source("x", "https://x.example", "https://x.example/list");
        s.listing_urls.clear();
        assert!(s.validate_active_invariant().is_err());
    }
}
