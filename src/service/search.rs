//! Text folding for searches over site URLs, tag names and album titles.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

const HIRAGANA_START: u32 = 0x3041;
const HIRAGANA_END: u32 = 0x3096;
const KANA_OFFSET: u32 = 0x60;

/// Case- and diacritic-insensitive form: NFKD, combining marks dropped, lowercased.
pub fn fold(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn shift_kana(text: &str, from: u32, offset: i64) -> String {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if (from..=from + (HIRAGANA_END - HIRAGANA_START)).contains(&code) {
                char::from_u32((code as i64 + offset) as u32).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}

pub fn hiragana_to_katakana(text: &str) -> String {
    shift_kana(text, HIRAGANA_START, KANA_OFFSET as i64)
}

pub fn katakana_to_hiragana(text: &str) -> String {
    shift_kana(text, HIRAGANA_START + KANA_OFFSET, -(KANA_OFFSET as i64))
}

/// Folded search forms: the text itself plus each kana transliteration that
/// differs from it.
pub fn variants(text: &str) -> Vec<String> {
    let mut forms = vec![fold(text)];
    for converted in [hiragana_to_katakana(text), katakana_to_hiragana(text)] {
        if converted != text {
            let folded = fold(&converted);
            if !forms.contains(&folded) {
                forms.push(folded);
            }
        }
    }
    forms
}

/// Matcher for a name search. An empty needle matches everything.
pub struct NameMatcher {
    forms: Vec<String>,
}

impl NameMatcher {
    pub fn new(text: &str) -> Self {
        Self {
            forms: variants(text.trim()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = fold(name);
        self.forms.iter().any(|form| name.contains(form.as_str()))
    }
}

/// Folded whitespace-separated tokens of a keyword search.
pub fn tokens(text: &str) -> Vec<String> {
    text.split_whitespace().map(fold).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_drops_case_and_diacritics() {
        assert_eq!(fold("Café RÉSUMÉ"), "cafe resume");
    }

    #[test]
    fn test_kana_conversion() {
        assert_eq!(hiragana_to_katakana("ねこ"), "ネコ");
        assert_eq!(katakana_to_hiragana("ネコ"), "ねこ");
        assert_eq!(hiragana_to_katakana("abc"), "abc");
    }

    #[test]
    fn test_variants_skip_unchanged_forms() {
        assert_eq!(variants("dog"), vec!["dog".to_string()]);
        assert_eq!(variants("ねこ").len(), 2);
    }

    #[test]
    fn test_name_matcher_crosses_kana_scripts() {
        let matcher = NameMatcher::new("ねこ");
        assert!(matcher.matches("かわいいネコ"));
        assert!(matcher.matches("ねこ写真"));
        assert!(!matcher.matches("いぬ"));
    }

    #[test]
    fn test_name_matcher_empty_matches_all() {
        assert!(NameMatcher::new("  ").matches("anything"));
    }

    #[test]
    fn test_tokens() {
        assert_eq!(tokens("  Foo  bàr "), vec!["foo".to_string(), "bar".to_string()]);
    }
}
