//! Rule-based extractor (C5, §4.5). No LLM: three regex-driven parsers plus an
//! auto-selection heuristic, grounded on `rule_extractor.py` line for line. Serves as the
//! LLM extractor's fallback (§4.6) and works standalone when no API key is configured.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use super::{AssignmentRow, Extractor};
use crate::domain::{Action, AssignmentKind};
use crate::rank_normalizer::normalize_rank;
use crate::sport_normalizer::SportNormalizer;

static RE_FIO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([А-ЯЁA-Z][а-яёa-z]+(?:\s+[А-ЯЁA-Za-z][а-яёa-z]+){1,4})").unwrap());
static RE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2}\.\d{2}\.\d{4})").unwrap());
static RE_ROW_NUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d{1,4})\s+").unwrap());

static RE_DATA_ROW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*(\d{1,4})\s+([А-ЯЁ][а-яё]+(?:\s*[А-ЯЁа-яё][а-яё]+){1,4})\s+(\d{2}\.\d{2}\.\d{4})\s+(.+?)\s+(\d{2}\.\d{2}\.\d{4})",
    )
    .unwrap()
});
static RE_DATA_ROW_IAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^\s*(\d{1,4})\s+([А-ЯЁ][а-яё]+(?:\s*[А-ЯЁа-яё][а-яё]+){1,4})\s+(\d{2}\.\d{2}\.\d{4})\s+(\d{4,7})\s+(.+?)\s+(\d{2}\.\d{2}\.\d{4})",
    )
    .unwrap()
});

static RE_PAGE_FOOTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:Документ\s+зарегистрирован|Страница\s+\d+\s+из\s+\d+)").unwrap());
static RE_TABLE_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:№\s+ФИО|№\s+п/?п\s+ФИО|Фамилия.*Имя.*Отчество)").unwrap());
static RE_PAGE_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)Документ\s+зарегистрирован[^\n]*\n\s*Страница\s+\d+\s+из\s+\d+[^\n]*\n?").unwrap()
});
static RE_COLUMN_NUMS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d(\s+\d){2,}$").unwrap());
static RE_CATEGORY_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:судья|разряд|категори|КМС|МС|мастер|специалист|кандидат)").unwrap());
static RE_CATEGORY_GARBAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ГКУ|Москомспорт|___|Приложение|от\s+_|Список\s+лиц|зарегистрирован)").unwrap()
});
static RE_CATEGORY_CONTINUATION_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[Сс]портивный|^[Кк]андидат|^[Мм]астер").unwrap());
static RE_GLUED_FIO: Lazy<Regex> = Lazy::new(|| Regex::new(r"([а-яё])([А-ЯЁ])").unwrap());
static RE_FIO_GARBAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:Приложение|Список|Приказ|категори|разряд)").unwrap());

static ACTION_PATTERNS: Lazy<Vec<(Regex, Action)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"присвоить").unwrap(), Action::Assignment),
        (Regex::new(r"подтвердить|считать\s+подтвердив").unwrap(), Action::Confirmation),
        (Regex::new(r"отказать").unwrap(), Action::Refusal),
        (Regex::new(r"лишить").unwrap(), Action::Revocation),
        (Regex::new(r"восстановить").unwrap(), Action::Restoration),
    ]
});

static RE_FREE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?s)([А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+(?:\s+[А-ЯЁа-яё][а-яё]+){0,3})[,\s]+(\d{2}\.\d{2}\.\d{4})\s*(?:г\.?\s*р\.?)?[,\s—–-]+(.+?)(?:[А-ЯЁ][а-яё]+\s+[А-ЯЁ][а-яё]+(?:\s+[А-ЯЁа-яё][а-яё]+){0,3}[,\s]+\d{2}\.\d{2}\.\d{4}|\z)",
    )
    .unwrap()
});
static RE_FREE_WORD_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[А-ЯЁа-яё]+(?:\s+[а-яё]+){0,3}").unwrap());

static RE_WHITESPACE_NOT_NEWLINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\S\n]+").unwrap());

fn clean_text(text: &str) -> String {
    let collapsed = RE_WHITESPACE_NOT_NEWLINE.replace_all(text, " ");
    collapsed.replace('\u{feff}', "").replace('\u{200b}', "")
}

fn validate_date(date_str: &str) -> bool {
    match NaiveDate::parse_from_str(date_str, "%d.%m.%Y") {
        Ok(d) => (1930..=2030).contains(&d.format("%Y").to_string().parse::<i32>().unwrap_or(0)),
        Err(_) => false,
    }
}

fn validate_birth_date(birth_str: &str, order_date: &str) -> bool {
    if !validate_date(birth_str) {
        return false;
    }
    let Ok(bd) = NaiveDate::parse_from_str(birth_str, "%d.%m.%Y") else { return true };
    if order_date.is_empty() {
        return true;
    }
    let Ok(od) = NaiveDate::parse_from_str(order_date, "%d.%m.%Y") else { return true };
    let age_days = (od - bd).num_days() as f64;
    let age = age_days / 365.25;
    (5.0..=100.0).contains(&age)
}

pub fn detect_assignment_type(text: &str) -> AssignmentKind {
    let head: String = text.chars().take(3000).collect::<String>().to_lowercase();
    if head.contains("почетн") || head.contains("почётн") {
        return AssignmentKind::HonoraryTitle;
    }
    if head.contains("заслуженн") && (head.contains("мастер") || head.contains("тренер")) {
        return AssignmentKind::HonoraryTitle;
    }
    if head.contains("спортивный судья") || head.contains("судей") || head.contains("судьи") {
        return AssignmentKind::JudgeCategory;
    }
    if head.contains("специалист") {
        return AssignmentKind::SpecialistCategory;
    }
    if head.contains("тренер") || head.contains("зтр") {
        return AssignmentKind::CoachCategory;
    }
    AssignmentKind::SportRank
}

pub fn detect_action(text: &str) -> Action {
    let head: String = text.chars().take(3000).collect::<String>().to_lowercase();
    for (pattern, action) in ACTION_PATTERNS.iter() {
        if pattern.is_match(&head) {
            return *action;
        }
    }
    Action::Assignment
}

struct DataRow {
    fio: String,
    birth_date: String,
    ias_id: Option<i64>,
    sport: String,
    submission_date: String,
}

pub struct TabularParser;

impl TabularParser {
    pub fn parse(
        &self,
        text: &str,
        order_date: &str,
        default_type: AssignmentKind,
        default_action: Action,
        normalizer: Option<&SportNormalizer>,
    ) -> Vec<AssignmentRow> {
        let text = clean_text(text);
        let pages = self.split_pages(&text);
        let mut all_rows = Vec::new();
        for page in pages {
            all_rows.extend(self.parse_page(&page, order_date, default_type, default_action, normalizer));
        }
        tracing::info!(count = all_rows.len(), "tabular parser extracted rows");
        all_rows
    }

    fn split_pages(&self, text: &str) -> Vec<String> {
        RE_PAGE_SPLIT
            .split(text)
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    fn parse_page(
        &self,
        page_text: &str,
        order_date: &str,
        default_type: AssignmentKind,
        default_action: Action,
        normalizer: Option<&SportNormalizer>,
    ) -> Vec<AssignmentRow> {
        let mut data_rows: Vec<DataRow> = Vec::new();
        let mut in_data = false;
        let mut in_categories = false;
        let mut current_category_lines: Vec<String> = Vec::new();

        for line in page_text.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            if RE_TABLE_HEADER.is_match(stripped) {
                in_data = true;
                continue;
            }
            if RE_COLUMN_NUMS.is_match(stripped) {
                continue;
            }
            if RE_PAGE_FOOTER.is_match(stripped) {
                continue;
            }
            if stripped.starts_with("Приложение к") || stripped.starts_with("Список лиц") {
                in_data = true;
                continue;
            }

            if let Some(caps) = RE_DATA_ROW_IAS.captures(stripped) {
                data_rows.push(DataRow {
                    fio: caps[2].trim().to_string(),
                    birth_date: caps[3].to_string(),
                    ias_id: caps[4].parse().ok(),
                    sport: caps[5].trim().to_string(),
                    submission_date: caps[6].to_string(),
                });
                in_data = true;
                in_categories = false;
                continue;
            }
            if let Some(caps) = RE_DATA_ROW.captures(stripped) {
                data_rows.push(DataRow {
                    fio: caps[2].trim().to_string(),
                    birth_date: caps[3].to_string(),
                    ias_id: None,
                    sport: caps[4].trim().to_string(),
                    submission_date: caps[5].to_string(),
                });
                in_data = true;
                in_categories = false;
                continue;
            }

            if in_data && !in_categories && RE_CATEGORY_START.is_match(stripped) {
                in_categories = true;
            }
            if in_categories {
                current_category_lines.push(stripped.to_string());
            }
        }

        let categories = if !current_category_lines.is_empty() {
            self.parse_category_block(&current_category_lines.join("\n"))
        } else {
            Vec::new()
        };

        let mut rows = Vec::new();
        for (i, data) in data_rows.iter().enumerate() {
            let rank = categories.get(i).cloned().unwrap_or_default();

            let mut sport = data.sport.clone();
            let mut sport_original = None;
            if let Some(norm) = normalizer {
                let nr = norm.normalize(&sport);
                if let Some(canon) = nr.canonical_name {
                    if canon != sport {
                        sport_original = Some(sport.clone());
                    }
                    sport = canon;
                }
            }

            let confidence = calc_confidence(data, &rank);

            let mut extra = HashMap::new();
            extra.insert("parse_method".to_string(), json!("rule_based"));
            if !data.submission_date.is_empty() {
                extra.insert("submission_date".to_string(), json!(data.submission_date));
            }
            if !validate_birth_date(&data.birth_date, order_date) {
                extra.insert("birth_date_suspicious".to_string(), json!(true));
            }
            if confidence < 0.5 {
                extra.insert("needs_review".to_string(), json!(true));
            }

            rows.push(AssignmentRow {
                fio: data.fio.clone(),
                birth_date: Some(data.birth_date.clone()),
                ias_id: data.ias_id,
                submission_number: None,
                assignment_kind: default_type,
                rank_category: if rank.is_empty() { String::new() } else { normalize_rank(&rank) },
                sport: Some(sport),
                sport_original,
                action: default_action,
                extra_fields: extra,
                confidence,
                extractor_tag: "rule_extractor".to_string(),
            });
        }
        rows
    }

    /// A category block can span 1-2 lines per entry (pypdf wraps "категории" onto its
    /// own line); glue the continuation on only when it isn't itself the start of the
    /// next category.
    fn parse_category_block(&self, block: &str) -> Vec<String> {
        let lines: Vec<&str> = block.lines().collect();
        let mut categories = Vec::new();
        let mut i = 0;
        while i < lines.len() {
            let line = lines[i].trim();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if RE_CATEGORY_START.is_match(line) {
                if RE_CATEGORY_GARBAGE.is_match(line) {
                    i += 1;
                    continue;
                }
                let mut full = line.to_string();
                if i + 1 < lines.len() {
                    let next_line = lines[i + 1].trim();
                    if !next_line.is_empty()
                        && !next_line.starts_with(|c: char| c.is_ascii_digit())
                        && !RE_CATEGORY_CONTINUATION_START.is_match(next_line)
                    {
                        full.push(' ');
                        full.push_str(next_line);
                        i += 1;
                    }
                }
                categories.push(full);
            }
            i += 1;
        }
        categories
    }
}

fn calc_confidence(data: &DataRow, rank: &str) -> f64 {
    let mut score = 0.0;
    let mut total = 5.0;

    if data.fio.split_whitespace().count() >= 2 {
        score += 1.0;
    }
    if validate_date(&data.birth_date) {
        score += 1.0;
    }
    if data.sport.chars().count() > 2 {
        score += 1.0;
    }
    if rank.chars().count() > 3 {
        score += 1.0;
    }
    if data.ias_id.is_some() {
        score += 1.0;
    } else {
        total -= 0.5;
    }

    (((score / total).min(1.0)) * 100.0).round() / 100.0
}

pub struct SectionParser;

impl SectionParser {
    pub fn parse(
        &self,
        text: &str,
        _order_date: &str,
        default_type: AssignmentKind,
        default_action: Action,
        normalizer: Option<&SportNormalizer>,
    ) -> Vec<AssignmentRow> {
        let text = clean_text(text);
        let text = RE_PAGE_SPLIT.replace_all(&text, "");

        let mut rows = Vec::new();
        let mut current_sport: Option<String> = None;

        for line in text.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                continue;
            }
            if RE_TABLE_HEADER.is_match(stripped) {
                continue;
            }
            if RE_COLUMN_NUMS.is_match(stripped) {
                continue;
            }

            if let Some(norm) = normalizer {
                if !RE_ROW_NUM.is_match(stripped) {
                    let nr = norm.normalize(stripped);
                    if let Some(canon) = nr.canonical_name {
                        if nr.confidence >= 0.80 {
                            current_sport = Some(canon);
                            continue;
                        }
                    }
                }
            }

            let (fio, bd, sport, subdate) = if let Some(caps) = RE_DATA_ROW_IAS.captures(stripped) {
                (caps[2].trim().to_string(), caps[3].to_string(), caps[5].trim().to_string(), caps[6].to_string())
            } else if let Some(caps) = RE_DATA_ROW.captures(stripped) {
                (caps[2].trim().to_string(), caps[3].to_string(), caps[4].trim().to_string(), caps[5].to_string())
            } else {
                continue;
            };

            let use_sport = current_sport.clone().unwrap_or(sport);

            let mut extra = HashMap::new();
            extra.insert("parse_method".to_string(), json!("rule_based"));
            if !subdate.is_empty() {
                extra.insert("submission_date".to_string(), json!(subdate));
            }

            rows.push(AssignmentRow {
                fio,
                birth_date: Some(bd),
                ias_id: None,
                submission_number: None,
                assignment_kind: default_type,
                rank_category: String::new(),
                sport: Some(use_sport),
                sport_original: None,
                action: default_action,
                extra_fields: extra,
                confidence: 0.75,
                extractor_tag: "rule_extractor".to_string(),
            });
        }

        tracing::info!(count = rows.len(), "section parser extracted rows");
        rows
    }
}

pub struct FreeTextParser;

impl FreeTextParser {
    pub fn parse(
        &self,
        text: &str,
        _order_date: &str,
        default_type: AssignmentKind,
        default_action: Action,
        normalizer: Option<&SportNormalizer>,
    ) -> Vec<AssignmentRow> {
        let text = clean_text(text);
        let mut rows = Vec::new();

        let action = detect_action(&text);
        let action = if matches!(action, Action::Assignment) { default_action } else { action };
        let atype = detect_assignment_type(&text);

        for caps in RE_FREE.captures_iter(&text) {
            let fio = caps[1].trim().to_string();
            let bd = caps[2].to_string();
            let context = caps[3].trim();

            let mut rank = String::new();
            for (pattern, canonical) in crate::rank_normalizer::free_text_patterns() {
                if pattern.is_match(context) {
                    rank = canonical.unwrap_or_else(|| pattern.find(context).map(|m| m.as_str().to_string()).unwrap_or_default());
                    break;
                }
            }

            let mut sport = None;
            if let Some(norm) = normalizer {
                for word_match in RE_FREE_WORD_RUN.find_iter(context) {
                    let nr = norm.normalize(word_match.as_str().trim());
                    if let Some(canon) = nr.canonical_name {
                        if nr.confidence >= 0.80 {
                            sport = Some(canon);
                            break;
                        }
                    }
                }
            }

            let mut extra = HashMap::new();
            extra.insert("parse_method".to_string(), json!("rule_based_freetext"));
            if rank.is_empty() {
                extra.insert("needs_review".to_string(), json!(true));
            }

            rows.push(AssignmentRow {
                fio,
                birth_date: if validate_date(&bd) { Some(bd) } else { None },
                ias_id: None,
                submission_number: None,
                assignment_kind: atype,
                rank_category: if rank.is_empty() { String::new() } else { normalize_rank(&rank) },
                sport,
                sport_original: None,
                action,
                extra_fields: extra,
                confidence: if rank.is_empty() { 0.5 } else { 0.7 },
                extractor_tag: "rule_extractor".to_string(),
            });
        }

        tracing::info!(count = rows.len(), "freetext parser extracted rows");
        rows
    }
}

/// Drop-in replacement for the LLM extractor (§4.5, §4.6, §9): used when no API key is
/// configured, the LLM call fails, or the LLM produced zero usable rows.
pub struct RuleExtractor {
    pub normalizer: Option<std::sync::Arc<SportNormalizer>>,
    tabular: TabularParser,
    section: SectionParser,
    freetext: FreeTextParser,
}

impl RuleExtractor {
    pub fn new(normalizer: Option<std::sync::Arc<SportNormalizer>>) -> Self {
        Self {
            normalizer,
            tabular: TabularParser,
            section: SectionParser,
            freetext: FreeTextParser,
        }
    }

    fn auto_parse(
        &self,
        text: &str,
        order_date: &str,
        default_type: AssignmentKind,
        default_action: Action,
        source_code: &str,
    ) -> (&'static str, Vec<AssignmentRow>) {
        let normalizer = self.normalizer.as_deref();

        if matches!(source_code, "moskva_tstisk" | "moskva_moskumsport") {
            let rows = self.tabular.parse(text, order_date, default_type, default_action, normalizer);
            if !rows.is_empty() {
                return ("TabularParser", rows);
            }
        }

        let data_row_count = RE_DATA_ROW.find_iter(text).count();
        let data_row_ias_count = RE_DATA_ROW_IAS.find_iter(text).count();
        if data_row_count >= 3 || data_row_ias_count >= 3 {
            let rows = self.tabular.parse(text, order_date, default_type, default_action, normalizer);
            if !rows.is_empty() {
                return ("TabularParser", rows);
            }
        }

        if let Some(norm) = normalizer {
            let mut sport_headers = 0;
            for line in text.lines() {
                let line = line.trim();
                if !line.is_empty() && !RE_ROW_NUM.is_match(line) && line.chars().count() < 60 {
                    let nr = norm.normalize(line);
                    if nr.canonical_name.is_some() && nr.confidence >= 0.85 {
                        sport_headers += 1;
                    }
                }
            }
            if sport_headers >= 2 {
                let rows = self.section.parse(text, order_date, default_type, default_action, normalizer);
                if !rows.is_empty() {
                    return ("SectionParser", rows);
                }
            }
        }

        let fio_count = RE_FIO.find_iter(text).count();
        let date_count = RE_DATE.find_iter(text).count();
        if fio_count >= 3 && date_count >= 3 {
            let rows = self.freetext.parse(text, order_date, default_type, default_action, normalizer);
            if !rows.is_empty() {
                return ("FreeTextParser", rows);
            }
        }

        for (name, rows) in [
            ("TabularParser", self.tabular.parse(text, order_date, default_type, default_action, normalizer)),
            ("SectionParser", self.section.parse(text, order_date, default_type, default_action, normalizer)),
            ("FreeTextParser", self.freetext.parse(text, order_date, default_type, default_action, normalizer)),
        ] {
            if !rows.is_empty() {
                return (name, rows);
            }
        }

        ("None", Vec::new())
    }

    fn post_process(&self, rows: Vec<AssignmentRow>, order_date: &str) -> Vec<AssignmentRow> {
        let mut seen: HashSet<(String, Option<String>)> = HashSet::new();
        let mut result = Vec::with_capacity(rows.len());

        for mut row in rows {
            let key = (row.fio.clone(), row.birth_date.clone());
            if seen.contains(&key) {
                continue;
            }
            seen.insert(key);

            if row.fio.chars().count() < 3 {
                continue;
            }

            row.fio = RE_GLUED_FIO.replace_all(&row.fio, "$1 $2").to_string();

            if RE_FIO_GARBAGE.is_match(&row.fio) {
                continue;
            }

            if let Some(bd) = row.birth_date.clone() {
                if !validate_date(&bd) {
                    row.extra_fields.insert("birth_date_suspicious".to_string(), json!(true));
                    row.confidence = row.confidence.min(0.6);
                } else if !order_date.is_empty() && !validate_birth_date(&bd, order_date) {
                    row.extra_fields.insert("birth_date_suspicious".to_string(), json!(true));
                }
            }

            result.push(row);
        }

        result
    }
}

#[async_trait]
impl Extractor for RuleExtractor {
    async fn extract(
        &self,
        text: &str,
        _issuing_body: &str,
        order_date: &str,
        _order_number: &str,
        source_code: &str,
    ) -> anyhow::Result<Vec<AssignmentRow>> {
        if text.trim().chars().count() < 50 {
            tracing::warn!("rule extractor: text is empty or too short");
            return Ok(Vec::new());
        }

        let default_type = detect_assignment_type(text);
        let default_action = detect_action(text);

        let (parser_name, rows) = self.auto_parse(text, order_date, default_type, default_action, source_code);
        let rows = self.post_process(rows, order_date);

        let avg_confidence = if rows.is_empty() {
            0.0
        } else {
            rows.iter().map(|r| r.confidence).sum::<f64>() / rows.len() as f64
        };
        tracing::info!(parser = parser_name, count = rows.len(), avg_confidence, "rule extractor finished");

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_honorary_title_from_header() {
        let text = "Приказ о присвоении почетного звания \"Заслуженный тренер России\"".repeat(1);
        assert_eq!(detect_assignment_type(&text), AssignmentKind::HonoraryTitle);
    }

    #[test]
    fn detects_assignment_action_by_default() {
        assert_eq!(detect_action("О присвоении спортивных разрядов"), Action::Assignment);
    }

    #[test]
    fn detects_revocation_action() {
        assert_eq!(detect_action("лишить спортивного звания"), Action::Revocation);
    }

    #[test]
    fn tabular_parser_extracts_rows_with_matching_categories() {
        let text = "№ ФИО Дата рождения Вид спорта Дата представления\n\
             1 Иванов Иван Иванович 01.01.1990 Дзюдо 01.02.2024\n\
             2 Петров Петр Петрович 02.02.1991 Самбо 01.02.2024\n\
             Первый спортивный разряд\n\
             Второй спортивный разряд\n";
        let parser = TabularParser;
        let rows = parser.parse(text, "01.03.2024", AssignmentKind::SportRank, Action::Assignment, None);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fio, "Иванов Иван Иванович");
        assert_eq!(rows[0].rank_category, "первый спортивный разряд");
        assert_eq!(rows[1].rank_category, "второй спортивный разряд");
    }

    #[test]
    fn data_row_with_ias_id_is_recognized() {
        let text = "1 Сидоров Сергей Сергеевич 03.03.1992 123456 Бокс 05.05.2024\n\
             Кандидат в мастера спорта\n";
        let parser = TabularParser;
        let rows = parser.parse(text, "", AssignmentKind::SportRank, Action::Assignment, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ias_id, Some(123456));
    }

    #[test]
    fn post_process_deduplicates_by_fio_and_birth_date() {
        let extractor = RuleExtractor::new(None);
        let rows = vec![
            AssignmentRow { fio: "Иванов Иван Иванович".into(), birth_date: Some("01.01.1990".into()), ..Default::default() },
            AssignmentRow { fio: "Иванов Иван Иванович".into(), birth_date: Some("01.01.1990".into()), ..Default::default() },
        ];
        let result = extractor.post_process(rows, "");
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn post_process_glues_ocr_joined_fio() {
        let extractor = RuleExtractor::new(None);
        let rows = vec![AssignmentRow {
            fio: "ИвановИванИванович".into(),
            birth_date: Some("01.01.1990".into()),
            ..Default::default()
        }];
        let result = extractor.post_process(rows, "");
        assert_eq!(result[0].fio, "Иванов Иван Иванович");
    }
}
