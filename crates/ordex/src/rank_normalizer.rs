//! Rank Normalizer (C3, §4.3). A pure function mapping free-form rank/title strings to
//! the canonical EVSK vocabulary. Grounded on `rule_extractor.py`'s `RANK_PATTERNS` table
//! and `normalize_rank()` — carried over in full per SPEC_FULL.md's "supplemented
//! features" (titles, honorary titles under Order 856/2022, specialist categories under
//! Order 838, judge categories under Order 134/2017).
//!
//! Critical ordering rule (§4.3): more-specific patterns are tried before less-specific
//! ones — youth ranks before adult ranks, and Roman III/II before I, because "I" would
//! otherwise prefix-match inside "II". `RANK_PATTERNS` below preserves that order; do not
//! re-sort it.

use once_cell::sync::Lazy;
use regex::Regex;

/// `(pattern, canonical | None)`. `None` means "dynamic" — the specialist-category level
/// is substituted back from the match itself.
static RANK_PATTERNS: Lazy<Vec<(Regex, Option<&'static str>)>> = Lazy::new(|| {
    let specs: &[(&str, Option<&str>)] = &[
        // --- Спортивные звания (ЕВСК, Приказ №173 от 03.03.2025) ---
        (r"(?i)(?:заслуж\w*\s+мастер\s+спорта|ЗМС)\b", Some("заслуженный мастер спорта россии")),
        (r"(?i)(?:мастер\s+спорта\s+(?:России\s+)?международного\s+класса|МСМК)\b", Some("мастер спорта россии международного класса")),
        (r"(?i)(?:гроссмейстер(?:\s+России)?|ГМ|ГМР)\b", Some("гроссмейстер россии")),
        (r"(?i)(?:кандидат\s+в\s+мастера\s+спорта|КМС)\b", Some("кандидат в мастера спорта")),
        (r"(?i)(?:мастер\s+спорта(?:\s+России)?|МС)\b", Some("мастер спорта россии")),

        // --- Почётные спортивные звания (Приказ №856 от 24.10.2022) ---
        (r"(?i)(?:заслуж\w*\s+тренер\s+России|ЗТР)\b", Some("заслуженный тренер россии")),
        (r"(?i)почетн\w*\s+спортивн\w*\s+судь\w*\s+России", Some("почетный спортивный судья россии")),
        (r"(?i)почетн\w*\s+мастер\w*\s+спорта\s+России", Some("почетный мастер спорта россии")),
        (r"(?i)почетн\w*\s+тренер\w*\s+России", Some("почетный тренер россии")),

        // --- Юношеские спортивные разряды (III→I, long forms before short) ---
        (r"(?i)(?:третий|3)\s*(?:-й)?\s*(?:юношеский\s+)?(?:юношеский\s+)?(?:спортивный\s+)?разряд\s*\(?\s*юнош", Some("третий юношеский спортивный разряд")),
        (r"(?i)(?:второй|2)\s*(?:-й)?\s*(?:юношеский\s+)?(?:юношеский\s+)?(?:спортивный\s+)?разряд\s*\(?\s*юнош", Some("второй юношеский спортивный разряд")),
        (r"(?i)(?:первый|1)\s*(?:-й)?\s*(?:юношеский\s+)?(?:юношеский\s+)?(?:спортивный\s+)?разряд\s*\(?\s*юнош", Some("первый юношеский спортивный разряд")),
        (r"(?i)(?:третий|3)\s+юношеский\s+(?:спортивный\s+)?разряд", Some("третий юношеский спортивный разряд")),
        (r"(?i)(?:второй|2)\s+юношеский\s+(?:спортивный\s+)?разряд", Some("второй юношеский спортивный разряд")),
        (r"(?i)(?:первый|1)\s+юношеский\s+(?:спортивный\s+)?разряд", Some("первый юношеский спортивный разряд")),
        (r"(?i)\bIII\s+юнош", Some("третий юношеский спортивный разряд")),
        (r"(?i)\bII\s+юнош", Some("второй юношеский спортивный разряд")),
        (r"(?i)\bI\s+юнош", Some("первый юношеский спортивный разряд")),

        // --- Спортивные разряды: III/II перед I ---
        (r"(?i)(?:третий|3)\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("третий спортивный разряд")),
        (r"(?i)(?:второй|2)\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("второй спортивный разряд")),
        (r"(?i)(?:первый|1)\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("первый спортивный разряд")),
        (r"(?i)\bIII\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("третий спортивный разряд")),
        (r"(?i)\bII\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("второй спортивный разряд")),
        (r"(?i)\bI\s*(?:-й)?\s*(?:спортивный\s+)?разряд", Some("первый спортивный разряд")),

        // --- Квалификационные категории судей (Приказ №134 от 28.02.2017) ---
        (r#"(?i)[Сс]портивный\s+судья\s+всеросс\w*\s*\n?\s*категории"#, Some("спортивный судья всероссийской категории")),
        (r#"(?i)[Сс]портивный\s+судья\s+первой\s*\n?\s*категории"#, Some("спортивный судья первой категории")),
        (r#"(?i)[Сс]портивный\s+судья\s+второй\s*\n?\s*категории"#, Some("спортивный судья второй категории")),
        (r#"(?i)[Сс]портивный\s+судья\s+третьей\s*\n?\s*категории"#, Some("спортивный судья третьей категории")),
        (r"(?i)[Юю]ный\s+спортивный\s+судья", Some("юный спортивный судья")),

        // --- Категории специалистов (Приказ №838) — level substituted back ---
        (r#"(?i)[Сс]пециалист\s+(?:высшей|первой|второй)\s*\n?\s*квалификационной\s*\n?\s*категории"#, None),
    ];
    specs
        .iter()
        .map(|(pat, canon)| (Regex::new(pat).expect("static rank pattern must compile"), *canon))
        .collect()
});

static RE_SPECIALIST_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(высшей|первой|второй)\s*квалификационной\s*категории").unwrap()
});

static RE_MULTILINE_JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\n\s*").unwrap());

/// Exposes the ordered pattern table for callers that need to locate *where* a rank
/// mention sits in a larger block of text (the free-text parser) rather than just
/// normalize an already-isolated rank string.
pub fn free_text_patterns() -> &'static [(Regex, Option<&'static str>)] {
    &RANK_PATTERNS
}

/// Normalizes a free-form rank/category string to its EVSK canonical form. Returns the
/// (whitespace-joined) input unchanged if nothing in `RANK_PATTERNS` matches.
pub fn normalize_rank(rank_text: &str) -> String {
    let joined = RE_MULTILINE_JOIN.replace_all(rank_text, " ");
    let joined = joined.trim();

    for (pattern, canonical) in RANK_PATTERNS.iter() {
        if pattern.is_match(joined) {
            if let Some(canon) = canonical {
                return canon.to_string();
            }
            if let Some(caps) = RE_SPECIALIST_LEVEL.captures(joined) {
                return format!("специалист {} квалификационной категории", &caps[1].to_lowercase());
            }
        }
    }
    joined.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adult_ranks_do_not_let_i_prefix_match_ii_or_iii() {
        assert_eq!(normalize_rank("I разряд"), "первый спортивный разряд");
        assert_eq!(normalize_rank("II разряд"), "второй спортивный разряд");
        assert_eq!(normalize_rank("III разряд"), "третий спортивный разряд");
    }

    #[test]
    fn youth_rank_wins_over_adult_rank_pattern() {
        assert_eq!(
            normalize_rank("1 юношеский разряд"),
            "первый юношеский спортивный разряд"
        );
    }

    #[test]
    fn titles_normalize_from_abbreviation() {
        assert_eq!(normalize_rank("МСМК"), "мастер спорта россии международного класса");
        assert_eq!(normalize_rank("КМС"), "кандидат в мастера спорта");
        assert_eq!(normalize_rank("ЗМС"), "заслуженный мастер спорта россии");
    }

    #[test]
    fn judge_categories_tolerate_a_line_break_before_category() {
        assert_eq!(
            normalize_rank("Спортивный судья третьей\nкатегории"),
            "спортивный судья третьей категории"
        );
    }

    #[test]
    fn specialist_category_substitutes_level_back() {
        assert_eq!(
            normalize_rank("Специалист высшей квалификационной категории"),
            "специалист высшей квалификационной категории"
        );
        assert_eq!(
            normalize_rank("специалист первой\nквалификационной\nкатегории"),
            "специалист первой квалификационной категории"
        );
    }

    #[test]
    fn unrecognized_text_passes_through_trimmed() {
        assert_eq!(normalize_rank("  что-то неизвестное  "), "что-то неизвестное");
    }
}
