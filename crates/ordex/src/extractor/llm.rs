//! LLM-backed structured extractor (C6, §4.6). Chunks order text, sends one fixed
//! Russian system/user prompt pair per chunk to a remote model, and validates each
//! returned record before handing it to the orchestrator. Grounded on
//! `llm_extractor.py`'s `LLMExtractor` — prompts and chunking thresholds carried over
//! verbatim since they encode hard-won formatting rules for this document corpus.

use std::collections::HashMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::{AssignmentRow, Extractor};
use crate::domain::{Action, AssignmentKind};

/// claude-haiku context is roughly 200k tokens (~150k chars); leave headroom for the
/// fixed prompt text and the model's own JSON output.
const CHUNK_SIZE_CHARS: usize = 120_000;

/// Default text-extraction model: larger than the vision-tier OCR model since this is
/// the primary extractor, not a fallback (§4.6).
pub const DEFAULT_EXTRACTION_MODEL: &str = "claude-sonnet-4-5-20250929";

const SYSTEM_PROMPT: &str = "Ты — парсер официальных российских приказов о присвоении \
спортивных разрядов и квалификационных категорий.

Твоя задача: извлечь ВСЕ записи из документа и вернуть JSON-массив.
Каждый элемент массива — одно присвоение, подтверждение, отказ или лишение.

ВАЖНО:
- Верни ТОЛЬКО валидный JSON-массив. Без markdown-блоков, без пояснений.
- Первый символ ответа должен быть '[', последний — ']'.
";

fn extraction_prompt(text: &str, issuing_body: &str, order_date: &str, order_number: &str) -> String {
    format!(
        r#"Документ (текст из PDF):
---
{text}
---

Метаданные документа:
  Орган: {issuing_body}
  Дата: {order_date}
  Номер: {order_number}

Извлеки все записи и верни JSON-массив. Каждый элемент:
{{
  "fio": "ФИО точно как в документе (может быть 2 или 4 слова)",
  "birth_date": "ДД.ММ.ГГГГ (убери 'г.' если есть) или null",
  "ias_id": число или null,
  "submission_number": "строка или null",
  "assignment_type": "sport_rank | judge_category | specialist_category | coach_category",
  "rank_category": "точное название категории/разряда",
  "sport": "нормализованное название вида спорта или null",
  "sport_original": "как в документе (если отличается от sport) или null",
  "action": "assignment | confirmation | refusal | revocation",
  "extra_fields": {{
    "submission_date": "ДД.ММ.ГГГГ",
    "coach_fio": ["Иванов И.И."],
    "municipality": "г. Краснодар",
    "department": "ОУ ФК и С МО",
    "organization": "МБОУ СШОР №1",
    "position": "заместитель директора",
    "rank_start_date": "ДД.ММ.ГГГГ",
    "refusal_reason": "текст причины"
  }}
}}

ПРАВИЛА:

1. ФИО:
   - Сохраняй точно, даже если нестандартное: «Крутая Ирина» (2 слова),
     «Муганлинский Руфат Тагир оглы» (4 слова)
   - Зачищай leading/trailing punctuation: «-Суликова» → «Суликова»
   - Если ФИО в дательном падеже (free-text документы) — переводи в именительный:
     «Лядащеву Роману Владимировичу» → «Лядащев Роман Владимирович»
   - Если ФИО явно разбито на 2-3 строки (OCR) — склей в одну строку

2. Вид спорта:
   - Вид спорта может быть в заголовке секции/приложения — применяй ко всем
     строкам этой секции
   - Нормализуй опечатки: «Спортиваня акробатика» → sport: «Спортивная акробатика»,
     sport_original: «Спортиваня акробатика»
   - «Киокушин» и «Киокусинкай» — один вид спорта, нормализуй к «Киокусинкай»
   - Если вид спорта не указан (специалисты, некоторые судьи) — sport: null

3. Разряд/категория:
   - Используй нормализованные названия:
     «II спортивный разряд», «III спортивный разряд»,
     «КМС», «1 разряд» / «первый спортивный разряд»,
     «судья первой категории», «судья второй категории», «судья третьей категории»,
     «специалист высшей квалификационной категории»,
     «специалист первой квалификационной категории»

4. assignment_type определяй по контексту:
   - «КМС», «МС», «МСМК», «1 разряд», «2 разряд», «3 разряд» → sport_rank
   - «спортивный судья» → judge_category
   - «специалист в области физической культуры и спорта» → specialist_category
   - «ЗТР», «Заслуженный тренер» → coach_category

5. action:
   - «присвоить» → assignment
   - «подтвердить», «считать подтвердившим» → confirmation
   - «отказать в присвоении» → refusal
   - «лишить» → revocation
   - Если в заголовке приложения указано «присвоение (подтверждение)» —
     определяй action по контексту каждой строки если возможно,
     иначе используй «assignment»

6. Знак -«- (или -"-, «то же») означает значение из строки выше — подставь его

7. Дата рождения близкая к дате приказа у спортсмена — подозрительно,
   добавь в extra_fields: "birth_date_suspicious": true

8. «Самоподготовка» в поле тренера — не ФИО, записывай строкой: ["Самоподготовка"]

9. Несколько тренеров в одной ячейке — всегда массив:
   «Иванов И.И., Петров П.П.» → ["Иванов И.И.", "Петров П.П."]

10. Игнорируй служебный текст: реквизиты документа, подписи должностных лиц,
    технические пометки, колонтитулы страниц

11. ias_id — числовой идентификатор лица в ИАС «Спорт» (Информационно-аналитическая
    система спортивной отрасли города Москвы). Присутствует в приказах ЦСТиСК/Москомспорта
    в виде числовой колонки (обычно 5–7 цифр). Если нет — null.

12. submission_number — регистрационный номер пакета документов на присвоение.
    Может быть числом или строкой с префиксом (напр. «Р-1234»).
    Присутствует не во всех типах приказов. Если нет — null.
"#
    )
}

static RE_FENCE_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```(?:json)?\s*").unwrap());
static RE_FENCE_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*```$").unwrap());
static RE_LEADING_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\-.,;:]+\s*").unwrap());
static RE_TRAILING_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[\-.,;:]+$").unwrap());
static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static RE_DATE_TRAILING_G: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*г\.$").unwrap());
static RE_DATE_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-/]").unwrap());
static RE_DATE_DMY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{2}\.\d{2}\.\d{4}$").unwrap());
static RE_DATE_YMD: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})\.(\d{2})\.(\d{2})$").unwrap());

pub struct LlmExtractor {
    api_key: String,
    model: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl LlmExtractor {
    pub fn new(api_key: String, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            max_tokens: 8192,
            http: reqwest::Client::new(),
        }
    }

    fn split_text(text: &str) -> Vec<&str> {
        if text.len() <= CHUNK_SIZE_CHARS {
            return vec![text];
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        let bytes = text.as_bytes();
        while start < bytes.len() {
            let end = (start + CHUNK_SIZE_CHARS).min(bytes.len());
            if end >= bytes.len() {
                chunks.push(&text[start..]);
                break;
            }

            let window = &text[start..end];
            let cut = window
                .rfind("\n\n")
                .or_else(|| window.rfind('\n'))
                .map(|c| start + c)
                .filter(|&c| c > start)
                .unwrap_or(end);

            chunks.push(&text[start..cut]);
            start = cut + 1;
        }
        chunks
    }

    async fn call_api(&self, chunk: &str, issuing_body: &str, order_date: &str, order_number: &str) -> anyhow::Result<String> {
        let user_content = extraction_prompt(chunk, issuing_body, order_date, order_number);

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": SYSTEM_PROMPT,
            "messages": [{"role": "user", "content": user_content}],
        });

        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: Value = resp.json().await?;
        let text = parsed["content"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("model response missing content[0].text"))?;
        Ok(text.to_string())
    }

    fn parse_response(raw: &str, order_date: &str) -> anyhow::Result<Vec<AssignmentRow>> {
        let cleaned = raw.trim();
        let cleaned = RE_FENCE_OPEN.replace(cleaned, "");
        let cleaned = RE_FENCE_CLOSE.replace(&cleaned, "");
        let cleaned = cleaned.trim();

        let start = cleaned.find('[');
        let end = cleaned.rfind(']');
        let (Some(start), Some(end)) = (start, end) else {
            anyhow::bail!(
                "model did not return a JSON array, first 200 chars: {}",
                raw.chars().take(200).collect::<String>()
            );
        };
        let json_str = &cleaned[start..=end];

        let items: Vec<Value> = serde_json::from_str(json_str)?;
        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            match item_to_row(item, order_date) {
                Ok(row) => rows.push(row),
                Err(e) => tracing::warn!(index = i, error = %e, "llm extractor skipped a record"),
            }
        }
        Ok(rows)
    }
}

fn clean_fio(fio: &str) -> String {
    let fio = fio.trim();
    let fio = RE_LEADING_PUNCT.replace(fio, "");
    let fio = RE_TRAILING_PUNCT.replace(&fio, "");
    RE_WHITESPACE.replace_all(fio.trim(), " ").to_string()
}

fn normalize_date(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let s = RE_DATE_TRAILING_G.replace(s.trim(), "").to_string();
    let s = RE_DATE_SEPARATOR.replace_all(&s, ".").to_string();

    if RE_DATE_DMY.is_match(&s) {
        return Some(s);
    }
    if let Some(caps) = RE_DATE_YMD.captures(&s) {
        return Some(format!("{}.{}.{}", &caps[3], &caps[2], &caps[1]));
    }
    None
}

fn item_to_row(item: Value, order_date: &str) -> anyhow::Result<AssignmentRow> {
    let fio = clean_fio(item.get("fio").and_then(Value::as_str).unwrap_or(""));
    if fio.is_empty() {
        anyhow::bail!("empty fio");
    }

    let rank_category = item.get("rank_category").and_then(Value::as_str).unwrap_or("").trim().to_string();
    if rank_category.is_empty() {
        anyhow::bail!("empty rank_category");
    }

    let assignment_kind = item
        .get("assignment_type")
        .cloned()
        .and_then(|v| serde_json::from_value::<AssignmentKind>(v).ok())
        .unwrap_or_default();

    let action = item
        .get("action")
        .cloned()
        .and_then(|v| serde_json::from_value::<Action>(v).ok())
        .unwrap_or_default();

    let birth_date = item.get("birth_date").filter(|v| !v.is_null()).and_then(normalize_date);

    let ias_id = item.get("ias_id").and_then(|v| {
        if v.is_null() {
            None
        } else {
            v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        }
    });

    let submission_number = item
        .get("submission_number")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let mut sport = item.get("sport").and_then(Value::as_str).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let mut sport_original = item
        .get("sport_original")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if sport_original.is_some() && sport_original == sport {
        sport_original = None;
    }
    if sport.is_none() {
        sport_original = None;
    }
    let _ = &mut sport;

    let mut extra: HashMap<String, Value> = item
        .get("extra_fields")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter(|(_, v)| !matches!(v, Value::Null) && *v != &Value::String(String::new()) && !matches!(v, Value::Array(a) if a.is_empty()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    if let Some(bd) = &birth_date {
        if let Some(caps) = regex::Regex::new(r"\d{2}\.\d{2}\.(\d{4})").unwrap().captures(bd) {
            if let (Ok(birth_year), Some(order_year)) = (
                caps[1].parse::<i32>(),
                regex::Regex::new(r"(\d{4})").unwrap().captures(order_date).and_then(|c| c[1].parse::<i32>().ok()),
            ) {
                if birth_year > order_year - 5 {
                    extra.insert("birth_date_suspicious".to_string(), Value::Bool(true));
                }
            }
        }
    }

    Ok(AssignmentRow {
        fio,
        birth_date,
        ias_id,
        submission_number,
        assignment_kind,
        rank_category,
        sport,
        sport_original,
        action,
        extra_fields: extra,
        confidence: 0.9,
        extractor_tag: "llm_extractor".to_string(),
    })
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(
        &self,
        text: &str,
        issuing_body: &str,
        order_date: &str,
        order_number: &str,
        _source_code: &str,
    ) -> anyhow::Result<Vec<AssignmentRow>> {
        let chunks = Self::split_text(text);
        let mut all_rows = Vec::new();
        for chunk in chunks {
            let raw = self.call_api(chunk, issuing_body, order_date, order_number).await?;
            all_rows.extend(Self::parse_response(&raw, order_date)?);
        }
        Ok(all_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_short_text_into_single_chunk() {
        let chunks = LlmExtractor::split_text("short text");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn splits_long_text_on_paragraph_boundary() {
        let para = "a".repeat(100);
        let text = format!("{}\n\n{}", para.repeat(1300), "b".repeat(50));
        let chunks = LlmExtractor::split_text(&text);
        assert!(chunks.len() >= 2);
    }

    #[test]
    fn parse_response_strips_markdown_fence() {
        let raw = "```json\n[{\"fio\": \"Иванов Иван Иванович\", \"rank_category\": \"КМС\"}]\n```";
        let rows = LlmExtractor::parse_response(raw, "01.01.2025").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fio, "Иванов Иван Иванович");
    }

    #[test]
    fn parse_response_skips_rows_with_empty_fio() {
        let raw = r#"[{"fio": "", "rank_category": "КМС"}, {"fio": "Петров Петр Петрович", "rank_category": "КМС"}]"#;
        let rows = LlmExtractor::parse_response(raw, "").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn parse_response_errors_when_no_json_array_present() {
        let result = LlmExtractor::parse_response("извините, не могу обработать документ", "");
        assert!(result.is_err());
    }

    #[test]
    fn clean_fio_strips_leading_dash_artifact() {
        assert_eq!(clean_fio("-Суликова Мария Петровна"), "Суликова Мария Петровна");
    }

    #[test]
    fn normalize_date_converts_ymd_to_dmy() {
        assert_eq!(normalize_date(&Value::String("2025.03.01".to_string())), Some("01.03.2025".to_string()));
    }

    #[test]
    fn normalize_date_strips_trailing_g() {
        assert_eq!(normalize_date(&Value::String("01.03.2025 г.".to_string())), Some("01.03.2025".to_string()));
    }

    #[test]
    fn assignment_type_falls_back_to_sport_rank_on_unknown_value() {
        let item = serde_json::json!({
            "fio": "Сидоров Сергей Сергеевич",
            "rank_category": "КМС",
            "assignment_type": "unknown_value",
        });
        let row = item_to_row(item, "").unwrap();
        assert_eq!(row.assignment_kind, AssignmentKind::SportRank);
    }
}
