//! Pipeline Orchestrator (C10, §4.10). Wires the other nine components into the single
//! per-order pipeline: download, OCR, extract, normalize, save. Grounded on
//! `pipeline_orchestrator.py`'s `PipelineOrchestrator.process_order`, split here into the
//! same five steps (`S0`..`S4`) the original names in its log messages.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{Assignment, LogLevel, Order, OrderStatus, OrderType, Stage, StepResult};
use crate::downloader::Downloader;
use crate::extractor::Extractor;
use crate::ocr::OcrPipeline;
use crate::source_registry::SourceRegistry;
use crate::rank_normalizer;
use crate::sport_normalizer::SportNormalizer;
use crate::store::Store;

fn sha_prefix(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Outcome of running the pipeline on one order (§4.10). Errors at any step are captured
/// here rather than propagated to the caller (§7: "never raise to caller, always populate
/// `error`/status") so a batch run can continue past a single bad order.
#[derive(Debug, Clone)]
pub struct ProcessingOutcome {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub assignments_saved: usize,
    pub error: Option<String>,
    pub steps: Vec<StepResult>,
}

impl ProcessingOutcome {
    fn failed(order_id: Uuid, error: impl Into<String>) -> Self {
        Self { order_id, status: OrderStatus::Failed, assignments_saved: 0, error: Some(error.into()), steps: Vec::new() }
    }

    fn failed_with_steps(order_id: Uuid, error: impl Into<String>, steps: Vec<StepResult>) -> Self {
        Self { order_id, status: OrderStatus::Failed, assignments_saved: 0, error: Some(error.into()), steps }
    }
}

pub struct Orchestrator {
    downloader: Downloader,
    ocr: OcrPipeline,
    extractor: Arc<dyn Extractor>,
    sport_normalizer: SportNormalizer,
    store: Arc<dyn Store>,
    registry: SourceRegistry,
}

impl Orchestrator {
    pub fn new(
        downloader: Downloader,
        ocr: OcrPipeline,
        extractor: Arc<dyn Extractor>,
        sport_normalizer: SportNormalizer,
        store: Arc<dyn Store>,
        registry: SourceRegistry,
    ) -> Self {
        Self { downloader, ocr, extractor, sport_normalizer, store, registry }
    }

    /// Processes a document already on disk (backfill / manual ingestion), bypassing `S0`.
    pub async fn process_file(
        &self,
        path: &std::path::Path,
        source_code: &str,
        order_number: &str,
        order_date: Option<chrono::NaiveDate>,
        title: Option<&str>,
    ) -> anyhow::Result<ProcessingOutcome> {
        let order_type = self.registry.get(source_code).map(|s| s.order_type).unwrap_or(OrderType::Order);
        let bytes = tokio::fs::read(path).await?;
        let order_id = self
            .store
            .get_or_create_order(source_code, order_number, order_date, order_type, title, None, None)
            .await?;
        Ok(self.run_pipeline(order_id, source_code, bytes, Vec::new()).await)
    }

    /// Downloads a document from a URL and runs the full pipeline, creating the order
    /// first if this URL hasn't been seen (§6 "process a URL directly").
    pub async fn process_url(&self, url: &str, source_code: &str) -> anyhow::Result<ProcessingOutcome> {
        let order_type = self.registry.get(source_code).map(|s| s.order_type).unwrap_or(OrderType::Order);
        let placeholder_number = format!("pending-{}", sha_prefix(url));
        let order_id = self
            .store
            .get_or_create_order(source_code, &placeholder_number, None, order_type, None, Some(url), Some(url))
            .await?;

        let started = std::time::Instant::now();
        let outcome = match self.downloader.download(url, source_code).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, None, None, None, Some(&e.to_string()))
                    .await
                    .ok();
                self.log(order_id, source_code, LogLevel::Error, Stage::Download, &e.to_string()).await;
                let steps = vec![StepResult::failed(Stage::Download, started.elapsed().as_millis() as u64, e.to_string())];
                return Ok(ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps));
            }
        };
        let download_step = StepResult::success(
            Stage::Download,
            started.elapsed().as_millis() as u64,
            format!("{} byte(s)", outcome.bytes.len()),
        );

        Ok(self.run_pipeline(order_id, source_code, outcome.bytes, vec![download_step]).await)
    }

    /// Pulls up to `limit` pending orders (oldest first, §4.10/§5: "no per-order
    /// parallelism required") and processes each sequentially.
    pub async fn process_pending(&self, limit: i64) -> anyhow::Result<Vec<ProcessingOutcome>> {
        let orders = self.store.get_pending_orders(limit).await?;
        let mut outcomes = Vec::with_capacity(orders.len());
        for order in orders {
            outcomes.push(self.process_existing_order(&order).await);
        }
        Ok(outcomes)
    }

    /// Re-runs the pipeline for a single order from scratch, re-downloading its source
    /// document (§6 "reprocess an order").
    pub async fn reprocess(&self, order_id: Uuid) -> anyhow::Result<ProcessingOutcome> {
        let order = self
            .store
            .get_order(order_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order {order_id} not found"))?;
        Ok(self.process_existing_order(&order).await)
    }

    async fn process_existing_order(&self, order: &Order) -> ProcessingOutcome {
        let Some(url) = order.file_url.as_deref().or(order.source_url.as_deref()) else {
            self.log(order.id, &order.source_code, LogLevel::Error, Stage::Download, "order has no file_url or source_url")
                .await;
            return ProcessingOutcome::failed(order.id, "order has no url to download");
        };

        let started = std::time::Instant::now();
        let outcome = match self.downloader.download(url, &order.source_code).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.store
                    .update_order_status(order.id, OrderStatus::Failed, None, None, None, None, Some(&e.to_string()))
                    .await
                    .ok();
                self.log(order.id, &order.source_code, LogLevel::Error, Stage::Download, &e.to_string()).await;
                let steps = vec![StepResult::failed(Stage::Download, started.elapsed().as_millis() as u64, e.to_string())];
                return ProcessingOutcome::failed_with_steps(order.id, e.to_string(), steps);
            }
        };
        let download_step = StepResult::success(
            Stage::Download,
            started.elapsed().as_millis() as u64,
            format!("{} byte(s)", outcome.bytes.len()),
        );

        self.run_pipeline(order.id, &order.source_code, outcome.bytes, vec![download_step]).await
    }

    /// `S1` OCR -> `S2` extract -> `S3` normalize -> `S4` save (§4.10). `S0` download has
    /// already happened by the time bytes reach here, whether from disk or the network.
    async fn run_pipeline(
        &self,
        order_id: Uuid,
        source_code: &str,
        bytes: Vec<u8>,
        initial_steps: Vec<StepResult>,
    ) -> ProcessingOutcome {
        let mut steps: Vec<StepResult> = initial_steps;
        let meta = self.registry.get(source_code).map(|s| s.to_meta_view());
        let issuing_body = meta.as_ref().map(|m| m.issuing_body).unwrap_or("").to_string();

        // Idempotency check (§4.10 S1, §8 "duplicate submission"): a SHA-256 over the raw
        // bytes is cheap relative to OCR, so we compute it before running the (possibly
        // expensive) OCR tier and short-circuit if this content has already been saved.
        let file_hash_preview = {
            use sha2::{Digest, Sha256};
            hex::encode(Sha256::digest(&bytes))
        };
        if let Ok(Some(existing)) = self.store.check_file_exists(&file_hash_preview).await {
            if existing != order_id {
                let message = format!("duplicate content: same file_hash as order {existing}");
                steps.push(StepResult::skipped(Stage::Ocr, message.clone()));
                self.log(order_id, source_code, LogLevel::Info, Stage::Ocr, &message).await;
                return ProcessingOutcome {
                    order_id: existing,
                    status: OrderStatus::Extracted,
                    assignments_saved: 0,
                    error: None,
                    steps,
                };
            }
        }

        // S1: OCR
        let started = std::time::Instant::now();
        let ocr_result = match self.ocr.process_bytes(&bytes).await {
            Ok(r) => r,
            Err(e) => {
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, None, None, None, Some(&e.to_string()))
                    .await
                    .ok();
                self.log(order_id, source_code, LogLevel::Error, Stage::Ocr, &e.to_string()).await;
                steps.push(StepResult::failed(Stage::Ocr, started.elapsed().as_millis() as u64, e.to_string()));
                return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps);
            }
        };
        steps.push(StepResult::success(
            Stage::Ocr,
            started.elapsed().as_millis() as u64,
            format!("{} page(s), method={}", ocr_result.page_count, ocr_result.method),
        ));

        if let Err(e) = self
            .store
            .update_order_status(
                order_id,
                OrderStatus::Downloaded,
                Some(&ocr_result.file_hash),
                Some(ocr_result.page_count as i32),
                Some(&ocr_result.method.to_string()),
                Some(ocr_result.confidence),
                None,
            )
            .await
        {
            return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps);
        }

        let order = match self.store.get_order(order_id).await {
            Ok(Some(o)) => o,
            Ok(None) => return ProcessingOutcome::failed_with_steps(order_id, "order vanished mid-pipeline", steps),
            Err(e) => return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps),
        };
        let order_date_str = order.order_date.map(|d| d.format("%d.%m.%Y").to_string()).unwrap_or_default();

        // S2: extract (LLM-primary, rule-fallback; see `FallbackExtractor`)
        let started = std::time::Instant::now();
        let rows = match self
            .extractor
            .extract(&ocr_result.text, &issuing_body, &order_date_str, &order.order_number, source_code)
            .await
        {
            Ok(rows) if rows.is_empty() => {
                let message = "extractor returned zero records".to_string();
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, None, None, None, Some(&message))
                    .await
                    .ok();
                self.log(order_id, source_code, LogLevel::Error, Stage::Extract, &message).await;
                steps.push(StepResult::failed(Stage::Extract, started.elapsed().as_millis() as u64, message.clone()));
                return ProcessingOutcome::failed_with_steps(order_id, message, steps);
            }
            Ok(rows) => rows,
            Err(e) => {
                self.store
                    .update_order_status(order_id, OrderStatus::Failed, None, None, None, None, Some(&e.to_string()))
                    .await
                    .ok();
                self.log(order_id, source_code, LogLevel::Error, Stage::Extract, &e.to_string()).await;
                steps.push(StepResult::failed(Stage::Extract, started.elapsed().as_millis() as u64, e.to_string()));
                return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps);
            }
        };
        steps.push(StepResult::success(
            Stage::Extract,
            started.elapsed().as_millis() as u64,
            format!("{} record(s)", rows.len()),
        ));

        // S3: normalize (rank + sport), tracking original values for audit (§3 Assignment)
        let normalize_started = std::time::Instant::now();
        let mut assignments = Vec::with_capacity(rows.len());
        for row in rows {
            let rank_category = rank_normalizer::normalize_rank(&row.rank_category);
            let rank_category_original =
                if rank_category != row.rank_category { Some(row.rank_category.clone()) } else { None };

            // The extractor may already flag `sport_original` (e.g. a garbled per-row
            // name replaced by the section header's sport); that earlier substitution
            // takes precedence over a diff against the normalizer's canonical name.
            let (sport, sport_id, sport_original) = match row.sport.as_deref() {
                Some(name) if !name.trim().is_empty() => {
                    let result = self.sport_normalizer.normalize(name);
                    let fallback_original = result.canonical_name.as_deref().filter(|c| *c != name).map(|_| name.to_string());
                    let original = row.sport_original.clone().or(fallback_original);
                    match result.canonical_name {
                        Some(canonical) => (Some(canonical), result.sport_id, original),
                        None => (None, None, original.or_else(|| Some(name.to_string()))),
                    }
                }
                _ => (None, None, row.sport_original.clone()),
            };

            let assignment = Assignment {
                id: Uuid::new_v4(),
                order_id,
                fio: row.fio,
                birth_date: row.birth_date,
                ias_id: row.ias_id,
                submission_number: row.submission_number,
                assignment_kind: row.assignment_kind,
                rank_category,
                rank_category_original,
                action: row.action,
                sport,
                sport_id,
                sport_original,
                confidence: row.confidence,
                extractor_tag: row.extractor_tag,
                extras: row.extra_fields,
            };
            if let Err(e) = assignment.validate() {
                tracing::warn!(order_id = %order_id, error = %e, "dropping invalid assignment row");
                continue;
            }
            assignments.push(assignment);
        }
        steps.push(StepResult::success(
            Stage::Normalize,
            normalize_started.elapsed().as_millis() as u64,
            format!("{} record(s) normalized", assignments.len()),
        ));

        // S4: save (transactional)
        let save_started = std::time::Instant::now();
        let saved = assignments.len();
        if let Err(e) = self.store.save_assignments(order_id, &assignments).await {
            self.store
                .update_order_status(order_id, OrderStatus::Failed, None, None, None, None, Some(&e.to_string()))
                .await
                .ok();
            self.log(order_id, source_code, LogLevel::Error, Stage::Save, &e.to_string()).await;
            steps.push(StepResult::failed(Stage::Save, save_started.elapsed().as_millis() as u64, e.to_string()));
            return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps);
        }

        if let Err(e) = self
            .store
            .update_order_status(order_id, OrderStatus::Extracted, None, None, None, None, None)
            .await
        {
            return ProcessingOutcome::failed_with_steps(order_id, e.to_string(), steps);
        }
        steps.push(StepResult::success(
            Stage::Save,
            save_started.elapsed().as_millis() as u64,
            format!("saved {saved} assignment(s)"),
        ));

        self.log(
            order_id,
            source_code,
            LogLevel::Info,
            Stage::Save,
            &format!("saved {saved} assignment(s)"),
        )
        .await;

        ProcessingOutcome { order_id, status: OrderStatus::Extracted, assignments_saved: saved, error: None, steps }
    }

    async fn log(&self, order_id: Uuid, source_code: &str, level: LogLevel, stage: Stage, message: &str) {
        self.store.log_processing(Some(order_id), Some(source_code), level, stage, message, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DelayRange, FetchMethod, RiskClass, Source, SourceType};
    use crate::extractor::rules::RuleExtractor;
    use crate::store::MemoryStore;

    fn test_registry() -> SourceRegistry {
        SourceRegistry::new(vec![Source {
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
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn process_file_on_unparseable_bytes_marks_order_failed() {
        let registry = test_registry();
        let downloader = Downloader::new(registry.clone(), 1, 10 * 1024 * 1024).unwrap();
        let ocr = OcrPipeline::new(crate::config::OcrConfig::default(), None).unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(RuleExtractor::new(None));
        let sport_normalizer = SportNormalizer::default();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());

        let orchestrator = Orchestrator::new(downloader, ocr, extractor, sport_normalizer, store.clone(), registry);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("ordex_test_{}.pdf", Uuid::new_v4()));
        tokio::fs::write(&path, b"not a pdf").await.unwrap();

        let outcome = orchestrator
            .process_file(&path, "test_src", "123", None, None)
            .await
            .unwrap();

        assert_eq!(outcome.status, OrderStatus::Failed);
        assert!(outcome.error.is_some());
        tokio::fs::remove_file(&path).await.ok();
    }

    /// §8 scenario 2 "duplicate submission": a second order whose file bytes hash to
    /// content already on record short-circuits before OCR and returns the original
    /// order id with an `extracted` status and a skipped `Ocr` step.
    #[tokio::test]
    async fn duplicate_file_hash_short_circuits_before_ocr() {
        use sha2::{Digest, Sha256};

        let registry = test_registry();
        let downloader = Downloader::new(registry.clone(), 1, 10 * 1024 * 1024).unwrap();
        let ocr = OcrPipeline::new(crate::config::OcrConfig::default(), None).unwrap();
        let extractor: Arc<dyn Extractor> = Arc::new(RuleExtractor::new(None));
        let sport_normalizer = SportNormalizer::default();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());

        let bytes = b"duplicate-content-bytes".to_vec();
        let file_hash = hex::encode(Sha256::digest(&bytes));

        let existing_id = store
            .get_or_create_order("test_src", "1", None, OrderType::Order, None, None, None)
            .await
            .unwrap();
        store
            .update_order_status(existing_id, OrderStatus::Extracted, Some(&file_hash), Some(1), Some("pypdf"), Some(1.0), None)
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(downloader, ocr, extractor, sport_normalizer, store.clone(), registry);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("ordex_test_{}.pdf", Uuid::new_v4()));
        tokio::fs::write(&path, &bytes).await.unwrap();

        let outcome = orchestrator
            .process_file(&path, "test_src", "2", None, None)
            .await
            .unwrap();

        assert_eq!(outcome.order_id, existing_id);
        assert_eq!(outcome.status, OrderStatus::Extracted);
        assert!(outcome.steps.iter().any(|s| s.stage == Stage::Ocr && s.status == crate::domain::StepStatus::Skipped));
        tokio::fs::remove_file(&path).await.ok();
    }
}
