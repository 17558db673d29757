//! 🚀 ordex — the core library crate, the beating heart, the engine room
//! where government sports-rank orders stop hiding in PDF portals and start
//! showing up as rows in a database. 🦀
//!
//! 📦 This crate wires together the source registry, the change detector, the
//! downloader, the OCR pipeline, the two structured extractors, the
//! normalizers, and the store into one orchestrator (`orchestrator::Orchestrator`).
//! `run()` is the one-call bootstrap a binary crate needs.

#![allow(dead_code)]

pub mod change_detector;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod ocr;
pub mod orchestrator;
pub mod rank_normalizer;
pub mod source_registry;
pub mod sport_normalizer;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::downloader::Downloader;
use crate::extractor::llm::LlmExtractor;
use crate::extractor::rules::RuleExtractor;
use crate::extractor::{Extractor, FallbackExtractor};
use crate::ocr::OcrPipeline;
use crate::orchestrator::Orchestrator;
use crate::source_registry::SourceRegistry;
use crate::sport_normalizer::SportNormalizer;
use crate::store::{MemoryStore, Store};

/// Everything a caller (the CLI, a cron job, a test) needs to drive one process:
/// the orchestrator plus the pieces that have a life outside a single pipeline run
/// (the registry, for the change detector; the store, for ad-hoc queries).
pub struct App {
    pub orchestrator: Orchestrator,
    pub registry: SourceRegistry,
    pub store: Arc<dyn Store>,
    pub downloader: Arc<DownloaderHandle>,
}

/// A second handle to the downloader for the change detector, which needs its own
/// reference independent of the one the orchestrator owns (both are cheap: the
/// underlying `reqwest::Client` and browser pool are already `Clone`-free behind
/// `Arc`-backed internals, so we build two thin instances over the same registry).
pub struct DownloaderHandle(pub Downloader);

/// Bootstraps the whole application from config (teacher's `run(app_config)` shape,
/// generalized): builds the source registry, picks a store (Postgres if
/// `DATABASE_URL` is configured, an in-process `MemoryStore` otherwise — §4.9
/// "dry-run mode"), builds the downloader/OCR/extractor stack, and returns an `App`
/// ready to run change detection or process orders.
pub async fn bootstrap(app_config: AppConfig, sources: Vec<domain::Source>) -> Result<App> {
    info!(sources = sources.len(), "bootstrapping ordex");

    let registry = SourceRegistry::new(sources).context("invalid source registry")?;

    let store: Arc<dyn Store> = match &app_config.database.database_url {
        #[cfg(feature = "postgres-store")]
        Some(url) => {
            info!("connecting to postgres store");
            let pg = store::postgres::PostgresStore::connect(
                url,
                app_config.database.pool_min,
                app_config.database.pool_max,
            )
            .await
            .context("failed to connect to postgres")?;
            Arc::new(pg)
        }
        #[cfg(not(feature = "postgres-store"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL is set but postgres-store feature is disabled; using in-memory store");
            Arc::new(MemoryStore::default())
        }
        None => {
            info!("no DATABASE_URL configured, running in dry-run mode with an in-memory store");
            Arc::new(MemoryStore::default())
        }
    };

    let downloader = Downloader::new(registry.clone(), app_config.runtime.browser_permits, app_config.max_pdf_size)
        .context("failed to build downloader")?;
    // Cheap clone: `Downloader` is `Arc`-backed internally (http client, browser pool
    // semaphore), so the change detector's handle shares the same bounded browser pool
    // as the orchestrator's rather than standing up a second, independent one.
    let downloader_for_detector = downloader.clone();

    let ocr = OcrPipeline::new(app_config.ocr.clone(), app_config.anthropic_api_key.clone())
        .context("failed to build ocr pipeline")?;

    let sport_normalizer = SportNormalizer::default();
    if let Some(dir) = &app_config.golden_set_dir {
        load_sport_registry_if_present(&sport_normalizer, dir);
    }

    let extractor: Arc<dyn Extractor> = match &app_config.anthropic_api_key {
        Some(api_key) => {
            let llm = LlmExtractor::new(api_key.clone(), crate::extractor::llm::DEFAULT_EXTRACTION_MODEL);
            let rules = RuleExtractor::new(None);
            Arc::new(FallbackExtractor::new(llm, rules))
        }
        None => {
            info!("no ANTHROPIC_API_KEY configured, extraction will use the rule-based extractor only");
            Arc::new(RuleExtractor::new(None))
        }
    };

    let orchestrator = Orchestrator::new(downloader, ocr, extractor, sport_normalizer, store.clone(), registry.clone());

    Ok(App {
        orchestrator,
        registry,
        store,
        downloader: Arc::new(DownloaderHandle(downloader_for_detector)),
    })
}

fn load_sport_registry_if_present(normalizer: &SportNormalizer, golden_set_dir: &str) {
    let path = Path::new(golden_set_dir).join("sport_registry.xlsx");
    if !path.exists() {
        return;
    }
    match sport_normalizer::parse_registry_workbook(&path) {
        Ok(sports) => {
            let total = sports.len();
            normalizer.load_entries(sports);
            info!(total, "loaded sport registry workbook");
        }
        Err(e) => tracing::warn!(error = %e, "failed to load sport registry workbook"),
    }
}

/// Runs one change-detection pass over every active, non-red-risk source (§4.8
/// `check_all`).
pub async fn check_sources(app: &App) -> Vec<change_detector::CheckResult> {
    let detector = change_detector::ChangeDetector::new(app.registry.clone(), clone_downloader(app), app.store.clone());
    detector.check_all().await
}

/// Runs the change-detection loop forever, sleeping `interval_minutes` between passes
/// (§4.8, §5): a per-iteration error never stops the loop.
pub async fn run_change_detection_loop(app: &App, interval_minutes: u64) -> ! {
    let detector = change_detector::ChangeDetector::new(app.registry.clone(), clone_downloader(app), app.store.clone());
    loop {
        let results = detector.check_all().await;
        let new_docs: usize = results.iter().map(|r| r.new_orders).sum();
        info!(sources = results.len(), new_docs, "change detection pass complete");
        tokio::time::sleep(std::time::Duration::from_secs(interval_minutes * 60)).await;
    }
}

fn clone_downloader(app: &App) -> Downloader {
    // Cheap: `Downloader` is `Arc`-backed internally, so this shares the same bounded
    // browser pool as the handle stored on `App` rather than standing up a new one.
    app.downloader.0.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DelayRange, FetchMethod, OrderType, RiskClass, Source, SourceType};

    fn sample_source() -> domain::Source {
        Source {
            code: "test_src".into(),
            name: "Test".into(),
            region: "Test".into(),
            issuing_body: "Test Committee".into(),
            order_type: OrderType::Order,
            risk_class: RiskClass::Green,
            active: true,
            fetch_method: FetchMethod::Http,
            base_url: "https://example.test".into(),
            delay: DelayRange { min_secs: 0.0, max_secs: 0.0 },
            wait_selector: None,
            listing_urls: vec!["https://example.test/list".into()],
            link_regex: Some(r#"href="([^"]+\.pdf)""#.into()),
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

    #[tokio::test]
    async fn bootstrap_without_database_url_falls_back_to_memory_store() {
        let app_config = AppConfig::default();
        let app = bootstrap(app_config, vec![sample_source()]).await.unwrap();
        assert!(app.store.get_pending_orders(10).await.unwrap().is_empty());
    }
}
