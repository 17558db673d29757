//! Typed error kinds for the module boundaries named in the error-handling design (§7):
//! `DownloaderError`, `OcrError`, `StoreError`. Callers that need to match on a specific
//! failure mode (egress block vs antibot vs transport) use these; everywhere else an
//! `anyhow::Error` carries the chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("url blocked by egress allowlist: {0}")]
    UrlBlocked(String),
    #[error("antibot interstitial detected at {0}")]
    AntibotDetected(String),
    #[error("download failed for {url}: {reason}")]
    DownloadError { url: String, reason: String },
    #[error("payload exceeded max size ({size} > {limit} bytes)")]
    TooLarge { size: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("pdf has no pages")]
    EmptyPdf,
    #[error("data does not look like a pdf (missing %PDF header)")]
    InvalidPdf,
    #[error("no page was successfully processed out of {0}")]
    AllPagesFailed(usize),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction failed: {0}")]
    Transaction(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}
