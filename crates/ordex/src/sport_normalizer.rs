//! Sport Normalizer (C2, §4.2). Loads the canonical sport registry (ВРВС) from its
//! source spreadsheet and matches free-form sport names out of orders against it.
//!
//! Grounded on `sport_normalizer.py`: `VrvsXlsParser` → [`load_workbook`],
//! `SportNormalizer._do_normalize` → [`SportNormalizer::normalize`] (same four-tier
//! cascade: exact, alias, case-normalized, fuzzy), `_builtin_fuzzy` → [`builtin_fuzzy`]
//! (no `rapidfuzz` equivalent in this ecosystem, so the trigram/containment/length-ratio
//! fallback is the only implementation, not a fallback-of-a-fallback).

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use calamine::{open_workbook, Data, Reader, Xlsx};
use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::domain::{MatchMethod, Sport};

pub const AUTO_MATCH_THRESHOLD: f64 = 0.85;
pub const REVIEW_THRESHOLD: f64 = 0.70;

/// Registry sheet name → ВРВС section number, in the order sheets are read.
const SHEET_SECTIONS: &[(&str, u8)] = &[
    ("Признанные", 1),
    ("Общероссийские", 2),
    ("Национальные", 3),
    ("Прикладные", 4),
];

/// Hand-maintained renames and known OCR/order typos, carried over verbatim from the
/// source registry's alias table (§4.2 "known aliases"). Extend via [`SportNormalizer::add_alias`]
/// rather than editing call sites.
static KNOWN_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("Тайский бокс", "Муайтай"),
        ("Тай бокс", "Муайтай"),
        ("Водное поло", "Водное поло"),
        ("Кёрлинг", "Керлинг"),
        ("Спортиваня акробатика", "Спортивная акробатика"),
        ("Спортивнаяакробатика", "Спортивная акробатика"),
        ("Кёкусин", "Киокусинкай"),
        ("Лёгкая атлетика", "Легкая атлетика"),
        ("Художественая гимнастика", "Художественная гимнастика"),
        ("Спортивнаягимнастика", "Спортивная гимнастика"),
        ("Настольный тенис", "Настольный теннис"),
        ("Вольная борьба", "Спортивная борьба"),
        ("Греко-римская борьба", "Спортивная борьба"),
        ("ФМ", "Функциональное многоборье"),
    ])
});

#[derive(Debug, Clone, Default)]
pub struct NormalizationResult {
    pub input_name: String,
    pub canonical_name: Option<String>,
    pub sport_id: Option<Uuid>,
    pub confidence: f64,
    pub method: MatchMethod,
    /// Up to three runner-up candidates with their scores, populated only on fuzzy match.
    pub alternatives: Vec<(String, f64)>,
}

impl NormalizationResult {
    fn not_found(input_name: impl Into<String>) -> Self {
        Self {
            input_name: input_name.into(),
            method: MatchMethod::NotFound,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct ImportStats {
    pub version_label: String,
    pub file_hash: String,
    pub sports_total: usize,
    pub disciplines_total: usize,
}

/// Reads the registry workbook's four section sheets into `Sport` rows. A row starting
/// with a numeric first cell begins a new sport; a non-empty column-10 cell (index 9)
/// appends a discipline to whichever sport most recently started (§4.2, mirrors the
/// original column layout exactly — columns 3–9 build the dash-joined `code_full`).
pub fn parse_registry_workbook(path: &Path) -> anyhow::Result<Vec<Sport>> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .map_err(|e| anyhow::anyhow!("failed to open registry workbook {}: {e}", path.display()))?;

    let mut sports = Vec::new();

    for &(sheet_name, section) in SHEET_SECTIONS {
        let range = match workbook.worksheet_range(sheet_name) {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(sheet = sheet_name, "registry sheet not found, skipping");
                continue;
            }
        };

        let mut current: Option<usize> = None;
        for row in range.rows() {
            let first_is_number = row.first().map(is_numeric_cell).unwrap_or(false);
            let second_non_empty = row.get(1).map(|c| !cell_text(c).is_empty()).unwrap_or(false);

            if first_is_number && second_non_empty {
                let name = cell_text(&row[1]);
                let code_full = build_code(&row[2..row.len().min(9)]);
                let code_base = row.get(2).and_then(cell_as_i64).unwrap_or(0);
                sports.push(Sport {
                    id: None,
                    code_base,
                    code_full,
                    section,
                    current_name: name,
                    disciplines: Vec::new(),
                });
                current = Some(sports.len() - 1);
            }

            if let Some(cell) = row.get(9) {
                let disc = cell_text(cell);
                if !disc.is_empty() {
                    if let Some(idx) = current {
                        sports[idx].disciplines.push(disc);
                    }
                }
            }
        }
    }

    Ok(sports)
}

fn is_numeric_cell(cell: &Data) -> bool {
    matches!(cell, Data::Int(_) | Data::Float(_)) || cell_text(cell).trim().chars().all(|c| c.is_ascii_digit()) && !cell_text(cell).trim().is_empty()
}

fn cell_as_i64(cell: &Data) -> Option<i64> {
    match cell {
        Data::Int(i) => Some(*i),
        Data::Float(f) => Some(*f as i64),
        Data::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => {
            if f.fract() == 0.0 {
                (*f as i64).to_string()
            } else {
                f.to_string()
            }
        }
        other => other.to_string().trim().to_string(),
    }
}

/// Joins the numeric/code columns (`166-0-5-5-1-1-Я`) the way the source's `_build_code`
/// does: stop at the first empty cell, strip trailing `.0` from whole-number floats.
fn build_code(cells: &[Data]) -> String {
    let mut parts = Vec::new();
    for cell in cells {
        let text = cell_text(cell);
        if text.is_empty() {
            break;
        }
        parts.push(text);
    }
    parts.join("-")
}

struct Indexes {
    sports: Vec<Sport>,
    name_to_sport: HashMap<String, usize>,
    norm_to_sport: HashMap<String, usize>,
}

/// In-process sport registry and matcher. Loading replaces the whole registry snapshot
/// (versioned at the store boundary, not here); matching is cheap and memoized.
pub struct SportNormalizer {
    auto_threshold: f64,
    review_threshold: f64,
    aliases: RwLock<HashMap<String, String>>,
    indexes: RwLock<Indexes>,
    cache: RwLock<HashMap<String, NormalizationResult>>,
}

impl Default for SportNormalizer {
    fn default() -> Self {
        Self::new(AUTO_MATCH_THRESHOLD, REVIEW_THRESHOLD)
    }
}

impl SportNormalizer {
    pub fn new(auto_threshold: f64, review_threshold: f64) -> Self {
        let aliases = KNOWN_ALIASES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            auto_threshold,
            review_threshold,
            aliases: RwLock::new(aliases),
            indexes: RwLock::new(Indexes {
                sports: Vec::new(),
                name_to_sport: HashMap::new(),
                norm_to_sport: HashMap::new(),
            }),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn load_entries(&self, sports: Vec<Sport>) {
        let mut name_to_sport = HashMap::new();
        let mut norm_to_sport = HashMap::new();
        for (idx, sport) in sports.iter().enumerate() {
            name_to_sport.insert(sport.current_name.clone(), idx);
            norm_to_sport.insert(normalize_text(&sport.current_name), idx);
        }
        *self.indexes.write().expect("indexes lock poisoned") = Indexes {
            sports,
            name_to_sport,
            norm_to_sport,
        };
        self.cache.write().expect("cache lock poisoned").clear();
    }

    /// Adds or overrides a user-supplied alias, effective immediately (§4.2 `add_alias`).
    pub fn add_alias(&self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases
            .write()
            .expect("aliases lock poisoned")
            .insert(alias.into(), canonical.into());
        self.cache.write().expect("cache lock poisoned").clear();
    }

    /// Retires a name in favor of a new canonical one (§3 `SportName.valid_to`, §4.2
    /// `set_name_lifetime`). The `valid_to` bookkeeping itself lives at the store
    /// boundary; here it just registers the replacement alias so future matches resolve
    /// to the new name.
    pub fn set_name_lifetime(&self, old_name: impl Into<String>, new_name: impl Into<String>) {
        self.add_alias(old_name, new_name);
    }

    pub fn all_sports(&self) -> Vec<Sport> {
        self.indexes.read().expect("indexes lock poisoned").sports.clone()
    }

    pub fn normalize(&self, sport_name: &str) -> NormalizationResult {
        let name = sport_name.trim();
        if name.is_empty() {
            return NormalizationResult::not_found(sport_name);
        }

        if let Some(cached) = self.cache.read().expect("cache lock poisoned").get(name) {
            return cached.clone();
        }

        let result = self.do_normalize(name);
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(name.to_string(), result.clone());
        result
    }

    pub fn normalize_batch(&self, names: &[String]) -> Vec<NormalizationResult> {
        names.iter().map(|n| self.normalize(n)).collect()
    }

    fn do_normalize(&self, name: &str) -> NormalizationResult {
        let indexes = self.indexes.read().expect("indexes lock poisoned");

        if let Some(&idx) = indexes.name_to_sport.get(name) {
            let sport = &indexes.sports[idx];
            return NormalizationResult {
                input_name: name.to_string(),
                canonical_name: Some(sport.current_name.clone()),
                sport_id: sport.id,
                confidence: 1.0,
                method: MatchMethod::Exact,
                alternatives: Vec::new(),
            };
        }

        let aliases = self.aliases.read().expect("aliases lock poisoned");
        if let Some(canon) = aliases.get(name) {
            let sport = indexes.name_to_sport.get(canon).map(|&i| &indexes.sports[i]);
            return NormalizationResult {
                input_name: name.to_string(),
                canonical_name: Some(canon.clone()),
                sport_id: sport.and_then(|s| s.id),
                confidence: 0.98,
                method: MatchMethod::Alias,
                alternatives: Vec::new(),
            };
        }

        let norm = normalize_text(name);
        if let Some(&idx) = indexes.norm_to_sport.get(&norm) {
            let sport = &indexes.sports[idx];
            return NormalizationResult {
                input_name: name.to_string(),
                canonical_name: Some(sport.current_name.clone()),
                sport_id: sport.id,
                confidence: 0.95,
                method: MatchMethod::CaseNormalized,
                alternatives: Vec::new(),
            };
        }

        for (alias, canon) in aliases.iter() {
            if normalize_text(alias) == norm {
                let sport = indexes.name_to_sport.get(canon).map(|&i| &indexes.sports[i]);
                return NormalizationResult {
                    input_name: name.to_string(),
                    canonical_name: Some(canon.clone()),
                    sport_id: sport.and_then(|s| s.id),
                    confidence: 0.95,
                    method: MatchMethod::Alias,
                    alternatives: Vec::new(),
                };
            }
        }

        drop(aliases);
        self.fuzzy_match(name, &indexes)
    }

    fn fuzzy_match(&self, name: &str, indexes: &Indexes) -> NormalizationResult {
        let aliases = self.aliases.read().expect("aliases lock poisoned");
        let known_names: std::collections::HashSet<&str> =
            indexes.sports.iter().map(|s| s.current_name.as_str()).collect();

        let mut choices: Vec<(String, usize)> = indexes
            .sports
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.current_name.clone(), idx))
            .collect();
        for (alias, canon) in aliases.iter() {
            if known_names.contains(canon.as_str()) {
                if let Some(&idx) = indexes.name_to_sport.get(canon) {
                    choices.push((alias.clone(), idx));
                }
            }
        }

        if choices.is_empty() {
            return NormalizationResult::not_found(name);
        }

        let mut scored = builtin_fuzzy(name, &choices);
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(5);

        let Some((best_name, best_score, best_idx)) = scored.first().cloned() else {
            return NormalizationResult::not_found(name);
        };

        let canonical = aliases.get(&best_name).cloned().unwrap_or_else(|| best_name.clone());
        let canon_sport = indexes
            .name_to_sport
            .get(&canonical)
            .map(|&i| &indexes.sports[i])
            .or_else(|| indexes.sports.get(best_idx));

        let alternatives: Vec<(String, f64)> =
            scored.iter().skip(1).take(3).map(|(n, s, _)| (n.clone(), round3(*s))).collect();
        let confidence = round3(best_score);

        if confidence < self.review_threshold {
            return NormalizationResult {
                input_name: name.to_string(),
                method: MatchMethod::NotFound,
                alternatives,
                confidence,
                ..Default::default()
            };
        }

        NormalizationResult {
            input_name: name.to_string(),
            canonical_name: Some(canonical),
            sport_id: canon_sport.and_then(|s| s.id),
            confidence,
            method: MatchMethod::Fuzzy,
            alternatives,
        }
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// Upper-cases, collapses whitespace, folds ё→е, strips punctuation other than hyphens
/// (§4.2, mirrors `_normalize_text` exactly — this is the case-normalized matching tier,
/// distinct from the fuzzy tier below).
fn normalize_text(text: &str) -> String {
    let folded: String = text
        .trim()
        .chars()
        .map(|c| match c {
            'ё' => 'е',
            'Ё' => 'Е',
            other => other,
        })
        .collect::<String>()
        .to_uppercase();

    let stripped: String = folded
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn trigrams(s: &str) -> std::collections::HashSet<String> {
    let lower = s.to_lowercase();
    let padded = format!("  {} ", lower.trim());
    let chars: Vec<char> = padded.chars().collect();
    if chars.len() < 3 {
        return std::collections::HashSet::new();
    }
    (0..=chars.len() - 3)
        .map(|i| chars[i..i + 3].iter().collect::<String>())
        .collect()
}

fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// No `rapidfuzz` equivalent exists in this ecosystem, so this deterministic
/// trigram-Jaccard + substring-containment + length-ratio blend (§4.2, `_builtin_fuzzy`)
/// is the only fuzzy scorer, not a degraded fallback path.
fn combined_score(query: &str, candidate: &str) -> f64 {
    let tri = trigram_similarity(query, candidate);

    let ql = query.to_lowercase();
    let cl = candidate.to_lowercase();
    let contain_bonus = if ql.contains(&cl) || cl.contains(&ql) { 0.15 } else { 0.0 };

    let len_ratio = query.chars().count().min(candidate.chars().count()) as f64
        / query.chars().count().max(candidate.chars().count()).max(1) as f64;
    let len_bonus = len_ratio * 0.10;

    (tri + contain_bonus + len_bonus).min(1.0)
}

fn builtin_fuzzy(query: &str, choices: &[(String, usize)]) -> Vec<(String, f64, usize)> {
    choices
        .iter()
        .map(|(name, idx)| (name.clone(), combined_score(query, name), *idx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sports() -> Vec<Sport> {
        vec![
            Sport {
                id: Some(Uuid::from_u128(1)),
                code_base: 166,
                code_full: "166-0-5-5-1-1-Я".into(),
                section: 2,
                current_name: "Спортивная акробатика".into(),
                disciplines: vec![],
            },
            Sport {
                id: Some(Uuid::from_u128(2)),
                code_base: 152,
                code_full: "152-0-0-0-0-1-Я".into(),
                section: 2,
                current_name: "Муайтай".into(),
                disciplines: vec![],
            },
            Sport {
                id: Some(Uuid::from_u128(3)),
                code_base: 110,
                code_full: "110-0-0-0-0-1-Я".into(),
                section: 2,
                current_name: "Спортивная борьба".into(),
                disciplines: vec!["Вольная борьба".into(), "Греко-римская борьба".into()],
            },
        ]
    }

    #[test]
    fn exact_match_has_full_confidence() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        let r = n.normalize("Спортивная акробатика");
        assert_eq!(r.method, MatchMethod::Exact);
        assert_eq!(r.confidence, 1.0);
    }

    #[test]
    fn alias_resolves_renamed_sport() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        let r = n.normalize("Тайский бокс");
        assert_eq!(r.method, MatchMethod::Alias);
        assert_eq!(r.canonical_name.as_deref(), Some("Муайтай"));
    }

    #[test]
    fn case_normalized_tier_ignores_yo_and_case() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        let r = n.normalize("спортивная акробатика");
        assert_eq!(r.method, MatchMethod::CaseNormalized);
    }

    #[test]
    fn fuzzy_catches_ocr_typo_above_auto_threshold() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        let r = n.normalize("Спортиваня акробатика");
        assert_eq!(r.method, MatchMethod::Alias);
        assert_eq!(r.canonical_name.as_deref(), Some("Спортивная акробатика"));
    }

    #[test]
    fn unrelated_input_falls_below_review_threshold() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        let r = n.normalize("совершенно постороннее слово");
        assert_eq!(r.method, MatchMethod::NotFound);
    }

    #[test]
    fn added_alias_takes_effect_immediately() {
        let n = SportNormalizer::default();
        n.load_entries(sample_sports());
        n.add_alias("Борьба вольная", "Спортивная борьба");
        let r = n.normalize("Борьба вольная");
        assert_eq!(r.canonical_name.as_deref(), Some("Спортивная борьба"));
    }

    #[test]
    fn build_code_stops_at_first_empty_cell() {
        let cells = vec![Data::Float(166.0), Data::Empty, Data::String("5".into())];
        assert_eq!(build_code(&cells), "166");
    }
}
