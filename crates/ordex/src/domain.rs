//! The data model (§3). Tagged variants are closed Rust enums internally and are
//! string-serialized only at the store boundary (§9 "tagged variants, not stringly-typed
//! enums") — `Display`/`FromStr` impls below are that boundary.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Green,
    Amber,
    Red,
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskClass::Green => "green",
            RiskClass::Amber => "amber",
            RiskClass::Red => "red",
        };
        f.write_str(s)
    }
}

impl FromStr for RiskClass {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(RiskClass::Green),
            "amber" => Ok(RiskClass::Amber),
            "red" => Ok(RiskClass::Red),
            other => anyhow::bail!("unknown risk_class: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Http,
    Browser,
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchMethod::Http => "http",
            FetchMethod::Browser => "browser",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    PdfPortal,
    JsonEmbed,
    HtmlTable,
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceType::PdfPortal => "pdf_portal",
            SourceType::JsonEmbed => "json_embed",
            SourceType::HtmlTable => "html_table",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Order,
    Directive,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderType::Order => "order",
            OrderType::Directive => "directive",
        })
    }
}

/// Order status lifecycle (§3, §6): `new -> downloaded -> extracted -> {approved, rejected}`,
/// with `failed` reachable from any non-terminal state and `new` re-entry on reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Downloaded,
    Extracted,
    Approved,
    Rejected,
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::New => "new",
            OrderStatus::Downloaded => "downloaded",
            OrderStatus::Extracted => "extracted",
            OrderStatus::Approved => "approved",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "new" => OrderStatus::New,
            "downloaded" => OrderStatus::Downloaded,
            "extracted" => OrderStatus::Extracted,
            "approved" => OrderStatus::Approved,
            "rejected" => OrderStatus::Rejected,
            "failed" => OrderStatus::Failed,
            other => anyhow::bail!("unknown order status: {other}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    SportRank,
    JudgeCategory,
    SpecialistCategory,
    CoachCategory,
    HonoraryTitle,
}

impl fmt::Display for AssignmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssignmentKind::SportRank => "sport_rank",
            AssignmentKind::JudgeCategory => "judge_category",
            AssignmentKind::SpecialistCategory => "specialist_category",
            AssignmentKind::CoachCategory => "coach_category",
            AssignmentKind::HonoraryTitle => "honorary_title",
        };
        f.write_str(s)
    }
}

impl Default for AssignmentKind {
    fn default() -> Self {
        AssignmentKind::SportRank
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Assignment,
    Confirmation,
    Refusal,
    Revocation,
    Restoration,
}

impl Default for Action {
    fn default() -> Self {
        Action::Assignment
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Assignment => "assignment",
            Action::Confirmation => "confirmation",
            Action::Refusal => "refusal",
            Action::Revocation => "revocation",
            Action::Restoration => "restoration",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ChangeDetection,
    Download,
    Ocr,
    Extract,
    Normalize,
    Save,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::ChangeDetection => "change_detection",
            Stage::Download => "download",
            Stage::Ocr => "ocr",
            Stage::Extract => "extract",
            Stage::Normalize => "normalize",
            Stage::Save => "save",
        };
        f.write_str(s)
    }
}

/// Outcome of a single pipeline step (§4.10: "each step producing a `StepResult`").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One entry in a `ProcessingOutcome`'s step list: which stage ran, how it went, how
/// long it took and why (§4.10, §8 scenario 2 "step list contains a `dedup` step").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub stage: Stage,
    pub status: StepStatus,
    pub duration_ms: u64,
    pub message: String,
}

impl StepResult {
    pub fn success(stage: Stage, duration_ms: u64, message: impl Into<String>) -> Self {
        Self { stage, status: StepStatus::Success, duration_ms, message: message.into() }
    }

    pub fn skipped(stage: Stage, message: impl Into<String>) -> Self {
        Self { stage, status: StepStatus::Skipped, duration_ms: 0, message: message.into() }
    }

    pub fn failed(stage: Stage, duration_ms: u64, message: impl Into<String>) -> Self {
        Self { stage, status: StepStatus::Failed, duration_ms, message: message.into() }
    }
}

/// Method by which a sport name match was found (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Alias,
    CaseNormalized,
    Fuzzy,
    NotFound,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Alias => "alias",
            MatchMethod::CaseNormalized => "case_normalized",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::NotFound => "not_found",
        };
        f.write_str(s)
    }
}

/// A delay window in seconds, drawn from uniformly at random between calls to the
/// same host (§5 "Rate limit per source").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

/// Source (§3). Keyed by `code`. Mutable runtime fields (`last_content_hash`, `last_etag`,
/// `last_checked_at`) live in the store, not the in-process registry (§9 design notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub code: String,
    pub name: String,
    pub region: String,
    pub issuing_body: String,
    pub order_type: OrderType,
    pub risk_class: RiskClass,
    pub active: bool,
    pub fetch_method: FetchMethod,
    pub base_url: String,
    pub delay: DelayRange,
    pub wait_selector: Option<String>,
    pub listing_urls: Vec<String>,
    pub link_regex: Option<String>,
    pub title_regex: Option<String>,
    pub order_date_regex: Option<String>,
    pub order_number_regex: Option<String>,
    pub pagination_template: Option<String>,
    pub max_pages: u32,
    pub source_type: SourceType,
    pub js_var: Option<String>,
    pub official_basis: String,

    // Mutable runtime fields, persisted in the store; carried here only for
    // in-process convenience (e.g. dry-run / memory store).
    pub last_content_hash: Option<String>,
    pub last_etag: Option<String>,
    pub last_checked_at: Option<NaiveDateTime>,
}

impl Source {
    /// Invariant (§3): every active source has at least one listing URL and a
    /// non-empty `link_regex` (or, for json_embed, `js_var`).
    pub fn validate_active_invariant(&self) -> anyhow::Result<()> {
        if !self.active {
            return Ok(());
        }
        if self.listing_urls.is_empty() {
            anyhow::bail!("source {}: active source has no listing URLs", self.code);
        }
        match self.source_type {
            SourceType::JsonEmbed => {
                if self.js_var.is_none() {
                    anyhow::bail!("source {}: json_embed source has no js_var", self.code);
                }
            }
            _ => {
                if self.link_regex.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!("source {}: active source has empty link_regex", self.code);
                }
            }
        }
        Ok(())
    }
}

/// Order (§3). Identified by opaque UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub source_code: String,
    pub order_number: String,
    pub order_date: Option<NaiveDate>,
    pub order_type: OrderType,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub file_url: Option<String>,
    pub file_hash: Option<String>,
    pub status: OrderStatus,
    pub page_count: Option<i32>,
    pub ocr_method: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub extracted_at: Option<NaiveDateTime>,
}

/// Assignment (§3): a single per-person award record extracted from an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub fio: String,
    pub birth_date: Option<String>,
    pub ias_id: Option<i64>,
    pub submission_number: Option<String>,
    pub assignment_kind: AssignmentKind,
    pub rank_category: String,
    pub rank_category_original: Option<String>,
    pub action: Action,
    pub sport: Option<String>,
    pub sport_id: Option<Uuid>,
    pub sport_original: Option<String>,
    pub confidence: f64,
    pub extractor_tag: String,
    pub extras: HashMap<String, Value>,
}

impl Assignment {
    /// Invariant (§3): `fio` non-empty, `rank_category` non-empty;
    /// `sport_id` non-null => `sport` non-null.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fio.trim().is_empty() {
            anyhow::bail!("assignment has empty fio");
        }
        if self.rank_category.trim().is_empty() {
            anyhow::bail!("assignment has empty rank_category");
        }
        if self.sport_id.is_some() && self.sport.is_none() {
            anyhow::bail!("assignment has sport_id without sport");
        }
        Ok(())
    }
}

/// ProcessingLog (§3): append-only event trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: Uuid,
    pub source_code: Option<String>,
    pub order_id: Option<Uuid>,
    pub level: LogLevel,
    pub stage: Stage,
    pub message: String,
    pub details: Option<Value>,
    pub created_at: NaiveDateTime,
}

/// Maximum persisted message length (§4.9 `log_processing`).
pub const LOG_MESSAGE_MAX_LEN: usize = 2_000;

pub fn truncate_log_message(message: &str) -> String {
    if message.chars().count() <= LOG_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(LOG_MESSAGE_MAX_LEN).collect()
    }
}

/// A sport entry from the canonical registry (§3, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sport {
    pub id: Option<Uuid>,
    pub code_base: i64,
    pub code_full: String,
    pub section: u8,
    pub current_name: String,
    pub disciplines: Vec<String>,
}

/// A name (canonical or alias) a sport has carried, with an open-ended validity window
/// by default (§3 `SportName`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportName {
    pub sport_id: Uuid,
    pub name: String,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportDiscipline {
    pub sport_id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportRegistryVersion {
    pub id: Uuid,
    pub label: String,
    pub file_hash: String,
    pub sports_total: usize,
    pub disciplines_total: usize,
    pub imported_at: NaiveDateTime,
}

/// A transient candidate document, emitted by the change detector before it becomes an
/// `Order` (§3 `DiscoveredDocument`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscoveredDocument {
    pub url: String,
    pub file_url: Option<String>,
    pub title: Option<String>,
    pub order_number: Option<String>,
    pub order_date: Option<String>,
    pub order_type: Option<OrderType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_through_display_and_fromstr() {
        for s in [
            OrderStatus::New,
            OrderStatus::Downloaded,
            OrderStatus::Extracted,
            OrderStatus::Approved,
            OrderStatus::Rejected,
            OrderStatus::Failed,
        ] {
            let rendered = s.to_string();
            let parsed: OrderStatus = rendered.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn assignment_requires_non_empty_fio_and_rank() {
        let mut a = Assignment {
            id: Uuid::nil(),
            order_id: Uuid::nil(),
            fio: "".into(),
            birth_date: None,
            ias_id: None,
            submission_number: None,
            assignment_kind: AssignmentKind::SportRank,
            rank_category: "первый спортивный разряд".into(),
            rank_category_original: None,
            action: Action::Assignment,
            sport: None,
            sport_id: None,
            sport_original: None,
            confidence: 1.0,
            extractor_tag: "rule_extractor".into(),
            extras: HashMap::new(),
        };
        assert!(a.validate().is_err());
        a.fio = "Иванов Иван Иванович".into();
        assert!(a.validate().is_ok());
    }

    #[test]
    fn assignment_sport_id_requires_sport() {
        let a = Assignment {
            id: Uuid::nil(),
            order_id: Uuid::nil(),
            fio: "Иванов Иван Иванович".into(),
            birth_date: None,
            ias_id: None,
            submission_number: None,
            assignment_kind: AssignmentKind::SportRank,
            rank_category: "КМС".into(),
            rank_category_original: None,
            action: Action::Assignment,
            sport: None,
            sport_id: Some(Uuid::nil()),
            sport_original: None,
            confidence: 1.0,
            extractor_tag: "rule_extractor".into(),
            extras: HashMap::new(),
        };
        assert!(a.validate().is_err());
    }
}
