//! Structured Extractor (C5 rule-based, C6 LLM). Both tiers share one output shape and
//! one trait so the orchestrator (C10) can compose them without knowing which produced a
//! given row (§9 "interface-driven extractor strategy").

pub mod llm;
pub mod rules;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Action, AssignmentKind};

/// One extracted award record, pre-normalization. Mirrors `domain::Assignment` minus the
/// fields only the store/normalizer can fill in (`id`, `order_id`, `sport_id`).
#[derive(Debug, Clone, Default)]
pub struct AssignmentRow {
    pub fio: String,
    pub birth_date: Option<String>,
    pub ias_id: Option<i64>,
    pub submission_number: Option<String>,
    pub assignment_kind: AssignmentKind,
    pub rank_category: String,
    pub sport: Option<String>,
    pub sport_original: Option<String>,
    pub action: Action,
    pub extra_fields: HashMap<String, Value>,
    pub confidence: f64,
    pub extractor_tag: String,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        issuing_body: &str,
        order_date: &str,
        order_number: &str,
        source_code: &str,
    ) -> anyhow::Result<Vec<AssignmentRow>>;
}

/// LLM-primary, rule-fallback composition (§4.6, §9): try the LLM extractor first: if it
/// errors, returns nothing, or every row fails validation, fall back to the rule
/// extractor rather than surfacing an order with zero assignments.
pub struct FallbackExtractor<P: Extractor, F: Extractor> {
    primary: P,
    fallback: F,
}

impl<P: Extractor, F: Extractor> FallbackExtractor<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: Extractor, F: Extractor> Extractor for FallbackExtractor<P, F> {
    async fn extract(
        &self,
        text: &str,
        issuing_body: &str,
        order_date: &str,
        order_number: &str,
        source_code: &str,
    ) -> anyhow::Result<Vec<AssignmentRow>> {
        match self.primary.extract(text, issuing_body, order_date, order_number, source_code).await {
            Ok(rows) if !rows.is_empty() => Ok(rows),
            Ok(_) => {
                tracing::warn!("primary extractor returned no rows, falling back");
                self.fallback.extract(text, issuing_body, order_date, order_number, source_code).await
            }
            Err(e) => {
                tracing::warn!(error = %e, "primary extractor failed, falling back");
                self.fallback.extract(text, issuing_body, order_date, order_number, source_code).await
            }
        }
    }
}
