//! OCR Engine (C4, §4.4). Three tiers, tried in increasing cost order, per page:
//! embedded PDF text → Tesseract on a rasterized page → a remote vision model.
//! Grounded on `ocr_pipeline.py`'s `OcrPipeline.process_bytes`; `pypdf` becomes `lopdf`,
//! `pdf2image`/poppler stays poppler (shelled out to `pdftoppm`, same as the original
//! wraps it), `pytesseract` becomes the `tesseract` crate, and Claude Vision becomes a
//! plain `reqwest` call to the configured vision endpoint.

mod raster;
mod tesseract_tier;
mod vision;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::OcrConfig;
use crate::error::OcrError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    Pypdf,
    Tesseract,
    Vision,
}

impl std::fmt::Display for OcrMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OcrMethod::Pypdf => "pypdf",
            OcrMethod::Tesseract => "tesseract",
            OcrMethod::Vision => "vision",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PageResult {
    pub page_num: u32,
    pub text: String,
    pub method: OcrMethod,
    pub confidence: f64,
}

impl PageResult {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub text: String,
    pub method: OcrMethod,
    pub confidence: f64,
    pub page_count: u32,
    pub pages: Vec<PageResult>,
    pub file_hash: String,
    pub methods_used: HashMap<OcrMethod, u32>,
}

/// Handle to the optional tier-3 vision client. Absent unless `ocr.enable_vision` and an
/// API key are both configured (§4.4).
pub struct VisionClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

pub struct OcrPipeline {
    config: OcrConfig,
    vision: Option<VisionClient>,
}

impl OcrPipeline {
    pub fn new(config: OcrConfig, anthropic_api_key: Option<String>) -> anyhow::Result<Self> {
        let vision = if config.enable_vision {
            let api_key = anthropic_api_key
                .ok_or_else(|| anyhow::anyhow!("ocr.enable_vision requires an API key"))?;
            Some(VisionClient {
                api_key,
                model: vision::DEFAULT_VISION_MODEL.to_string(),
                http: reqwest::Client::new(),
            })
        } else {
            None
        };
        Ok(Self { config, vision })
    }

    pub async fn process_bytes(&self, pdf_bytes: &[u8]) -> anyhow::Result<PipelineResult> {
        if pdf_bytes.len() < 4 || &pdf_bytes[0..4] != b"%PDF" {
            return Err(OcrError::InvalidPdf.into());
        }

        let file_hash = hex::encode(Sha256::digest(pdf_bytes));
        let doc = lopdf::Document::load_mem(pdf_bytes)
            .map_err(|e| anyhow::anyhow!("failed to parse pdf: {e}"))?;
        let page_ids = doc.get_pages();
        let page_count = page_ids.len() as u32;

        if page_count == 0 {
            return Err(OcrError::EmptyPdf.into());
        }

        tracing::info!(page_count, bytes = pdf_bytes.len(), hash = %short(&file_hash), "pdf loaded");

        let mut page_results: Vec<PageResult> = Vec::new();
        let mut pages_needing_ocr: Vec<u32> = Vec::new();

        for &page_num in page_ids.keys() {
            let text = doc.extract_text(&[page_num]).unwrap_or_default();
            let text = text.trim().to_string();
            let clean_len = count_readable_chars(&text);

            if clean_len >= self.config.min_chars_per_page {
                let confidence = (clean_len as f64 / (self.config.min_chars_per_page as f64 * 3.0)).min(1.0);
                page_results.push(PageResult {
                    page_num,
                    text,
                    method: OcrMethod::Pypdf,
                    confidence: round3(confidence),
                });
            } else {
                pages_needing_ocr.push(page_num);
            }
        }

        let mut pages_needing_vision: Vec<u32> = Vec::new();

        if !pages_needing_ocr.is_empty() {
            tracing::info!(count = pages_needing_ocr.len(), "pages need rasterized ocr");

            let dpi = self.config.scan_dpi;
            let contrast = self.config.contrast_factor;
            let tess_results =
                tesseract_tier::run_batch(pdf_bytes, &pages_needing_ocr, dpi, contrast).await?;

            for (page_num, text, readable_ratio) in tess_results {
                if readable_ratio >= self.config.min_readable_ratio {
                    page_results.push(PageResult {
                        page_num,
                        text,
                        method: OcrMethod::Tesseract,
                        confidence: round3(readable_ratio * 0.9),
                    });
                } else {
                    pages_needing_vision.push(page_num);
                    if !text.trim().is_empty() {
                        page_results.push(PageResult {
                            page_num,
                            text,
                            method: OcrMethod::Tesseract,
                            confidence: round3(readable_ratio * 0.5),
                        });
                    }
                }
            }
        }

        if !pages_needing_vision.is_empty() {
            if let Some(client) = &self.vision {
                tracing::info!(count = pages_needing_vision.len(), "pages escalate to vision tier");
                for &page_num in &pages_needing_vision {
                    let image = raster::rasterize_page(pdf_bytes, page_num, self.config.scan_dpi).await?;
                    match vision::ocr_image(client, &image).await {
                        Ok(text) if !text.trim().is_empty() => {
                            page_results.retain(|p| p.page_num != page_num);
                            page_results.push(PageResult {
                                page_num,
                                text,
                                method: OcrMethod::Vision,
                                confidence: 0.85,
                            });
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(page_num, error = %e, "vision tier failed"),
                    }
                }
            } else {
                tracing::warn!(count = pages_needing_vision.len(), "pages need vision tier but it is disabled");
            }
        }

        if page_results.is_empty() {
            return Err(OcrError::AllPagesFailed(page_count as usize).into());
        }

        page_results.sort_by_key(|p| p.page_num);

        let text = page_results
            .iter()
            .filter(|p| !p.text.trim().is_empty())
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut methods_used: HashMap<OcrMethod, u32> = HashMap::new();
        for p in &page_results {
            *methods_used.entry(p.method).or_insert(0) += 1;
        }
        let dominant_method = *methods_used
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(method, _)| method)
            .expect("page_results is non-empty");

        let avg_confidence =
            round3(page_results.iter().map(|p| p.confidence).sum::<f64>() / page_results.len() as f64);

        tracing::info!(
            chars = text.chars().count(),
            method = %dominant_method,
            confidence = avg_confidence,
            "ocr pipeline complete"
        );

        Ok(PipelineResult {
            text,
            method: dominant_method,
            confidence: avg_confidence,
            page_count,
            pages: page_results,
            file_hash,
            methods_used,
        })
    }
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn is_readable_char(c: char) -> bool {
    c.is_alphanumeric()
        || c.is_whitespace()
        || matches!(c, '.' | ',' | ';' | ':' | '-' | '(' | ')' | '"' | '\'' | '«' | '»' | '№' | '/')
}

pub(crate) fn count_readable_chars(text: &str) -> usize {
    text.chars().filter(|c| is_readable_char(*c)).count()
}

pub(crate) fn readable_ratio(text: &str) -> f64 {
    if text.chars().count() < 10 {
        return 0.0;
    }
    count_readable_chars(text) as f64 / text.chars().count() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_ratio_counts_cyrillic_and_punctuation() {
        let ratio = readable_ratio("Иванов И.И., первый разряд 2024");
        assert!(ratio > 0.9);
    }

    #[test]
    fn readable_ratio_is_zero_below_minimum_length() {
        assert_eq!(readable_ratio("абв"), 0.0);
    }

    #[test]
    fn rejects_bytes_without_pdf_magic() {
        let config = OcrConfig {
            min_chars_per_page: 80,
            min_readable_ratio: 0.7,
            scan_dpi: 320,
            contrast_factor: 1.6,
            enable_vision: false,
        };
        let pipeline = OcrPipeline::new(config, None).unwrap();
        let err = tokio_test_block_on(pipeline.process_bytes(b"not a pdf"));
        assert!(err.is_err());
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }
}
