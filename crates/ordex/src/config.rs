//! Application configuration, loaded with `figment` the way the teacher's `app_config`
//! loads it: environment variables (`ORDEX_`-prefixed) merged over an optional TOML file,
//! TOML winning conflicts.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::domain::Source;

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// `DATABASE_URL` (§6). Absent => orchestrator runs in dry-run mode (§4.9).
    #[serde(alias = "DATABASE_URL")]
    pub database_url: Option<String>,
    #[serde(default = "default_pool_min")]
    pub pool_min: u32,
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,
}

fn default_pool_min() -> u32 {
    5
}
fn default_pool_max() -> u32 {
    15
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool_min: default_pool_min(),
            pool_max: default_pool_max(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// How many orders `process_pending` pulls per batch.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: i64,
    /// Browser-fetcher concurrency cap (§5: "at most two concurrent browser sessions").
    #[serde(default = "default_browser_permits")]
    pub browser_permits: usize,
}

fn default_batch_limit() -> i64 {
    50
}
fn default_browser_permits() -> usize {
    2
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            browser_permits: default_browser_permits(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,
    #[serde(default = "default_min_readable_ratio")]
    pub min_readable_ratio: f64,
    #[serde(default = "default_scan_dpi")]
    pub scan_dpi: u32,
    #[serde(default = "default_contrast_factor")]
    pub contrast_factor: f64,
    #[serde(default)]
    pub enable_vision: bool,
}

fn default_min_chars_per_page() -> usize {
    80
}
fn default_min_readable_ratio() -> f64 {
    0.70
}
fn default_scan_dpi() -> u32 {
    320
}
fn default_contrast_factor() -> f64 {
    1.6
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            min_chars_per_page: default_min_chars_per_page(),
            min_readable_ratio: default_min_readable_ratio(),
            scan_dpi: default_scan_dpi(),
            contrast_factor: default_contrast_factor(),
            enable_vision: false,
        }
    }
}

fn default_max_pdf_size() -> usize {
    50 * 1024 * 1024
}
fn default_max_pdf_pages() -> usize {
    500
}

/// One struct to rule the config (teacher's `AppConfig` pattern), extended with the
/// domain-specific knobs SPEC_FULL.md's ambient stack section calls for.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default = "default_max_pdf_size", alias = "MAX_PDF_SIZE")]
    pub max_pdf_size: usize,
    #[serde(default = "default_max_pdf_pages", alias = "MAX_PDF_PAGES")]
    pub max_pdf_pages: usize,
    #[serde(alias = "ANTHROPIC_API_KEY")]
    pub anthropic_api_key: Option<String>,
    #[serde(alias = "GOLDEN_SET_DIR")]
    pub golden_set_dir: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            runtime: RuntimeConfig::default(),
            ocr: OcrConfig::default(),
            max_pdf_size: default_max_pdf_size(),
            max_pdf_pages: default_max_pdf_pages(),
            anthropic_api_key: None,
            golden_set_dir: None,
            output_dir: None,
        }
    }
}

/// Loads config from `ORDEX_*` env vars merged with an optional TOML file (TOML wins).
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!("loading configuration: {:?}", config_file_name);

    let config = Figment::new()
        .merge(Env::prefixed("ORDEX_").split("__"))
        .join(Env::raw().only(&["DATABASE_URL", "ANTHROPIC_API_KEY", "MAX_PDF_SIZE", "MAX_PDF_PAGES", "GOLDEN_SET_DIR"]));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    config.extract().context("failed to parse configuration from environment and/or TOML file")
}

#[derive(Debug, Deserialize, Default)]
struct SourceList {
    #[serde(default)]
    source: Vec<Source>,
}

/// Loads the source registry from a `[[source]]` TOML array in the same config file
/// (§3 "created/updated via administrative interface"; the file takes that role here
/// since there is no admin UI in this core). An absent file yields an empty registry,
/// which is valid — `bootstrap` still runs, just with nothing to watch or process.
pub fn load_sources(config_file_name: Option<&Path>) -> anyhow::Result<Vec<Source>> {
    let Some(file_name) = config_file_name else {
        return Ok(Vec::new());
    };
    if !file_name.exists() {
        return Ok(Vec::new());
    }
    let list: SourceList = Figment::new()
        .merge(Toml::file(file_name))
        .extract()
        .context("failed to parse [[source]] entries from TOML file")?;
    Ok(list.source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_test_config(contents: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let path = std::env::temp_dir().join(format!("ordex_config_{nanos}.toml"));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_apply_when_only_database_url_given() {
        let path = write_test_config("database_url = \"postgres://localhost/ordex\"\n");
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.runtime.batch_limit, 50);
        assert_eq!(cfg.ocr.min_chars_per_page, 80);
        assert_eq!(cfg.max_pdf_size, 50 * 1024 * 1024);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn ocr_thresholds_override_from_toml() {
        let path = write_test_config(
            "[ocr]\nmin_chars_per_page = 40\nmin_readable_ratio = 0.5\n",
        );
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.ocr.min_chars_per_page, 40);
        assert!((cfg.ocr.min_readable_ratio - 0.5).abs() < 1e-9);
        fs::remove_file(path).unwrap();
    }
}
