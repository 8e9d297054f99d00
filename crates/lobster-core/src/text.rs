//! Text validation and formatting helpers.

/// Returns true if `s` only contains printable ASCII characters.
///
/// Names shown in the panel and passed to providers must satisfy this.
pub fn is_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

/// Upper-case the first character of every whitespace separated word.
pub fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_accepts_plain_ascii() {
        assert!(is_printable("web-01 (staging)"));
        assert!(is_printable(""));
    }

    #[test]
    fn printable_rejects_control_and_unicode() {
        assert!(!is_printable("tab\there"));
        assert!(!is_printable("nul\0"));
        assert!(!is_printable("caf\u{e9}"));
    }

    #[test]
    fn title_case_words() {
        assert_eq!(title_case("provisioning"), "Provisioning");
        assert_eq!(title_case("error state"), "Error State");
        assert_eq!(title_case(""), "");
    }
}
