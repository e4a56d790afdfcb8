//! Filename slugging for classifier-assigned names.

use std::sync::OnceLock;

use regex::Regex;

const UMLAUTS: [(&str, &str); 7] = [
    ("ä", "ae"),
    ("ö", "oe"),
    ("ü", "ue"),
    ("Ä", "Ae"),
    ("Ö", "Oe"),
    ("Ü", "Ue"),
    ("ß", "ss"),
];

fn non_word() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_]+").expect("static regex"))
}

/// Convert free-form text into a safe filename component.
///
/// German umlauts map to their ASCII digraphs, any other run of
/// non-word characters collapses to a single underscore, and an empty
/// result becomes `unbekannt`.
pub fn slugify(text: &str) -> String {
    let mut text = text.to_string();
    for (umlaut, replacement) in UMLAUTS {
        text = text.replace(umlaut, replacement);
    }

    let slug = non_word().replace_all(&text, "_");
    let slug = slug.trim_matches('_');

    if slug.is_empty() {
        "unbekannt".to_string()
    } else {
        slug.to_string()
    }
}

/// Uppercase the first ASCII letter (`sach` -> `Sach`).
pub fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_umlaut_mapping() {
        assert_eq!(slugify("Münchener Rück"), "Muenchener_Rueck");
        assert_eq!(slugify("Straße"), "Strasse");
        assert_eq!(slugify("ÄÖÜ"), "AeOeUe");
    }

    #[test]
    fn test_special_chars_collapse() {
        assert_eq!(slugify("Hanse  Versicherung / AG"), "Hanse_Versicherung_AG");
        assert_eq!(slugify("__x__"), "x");
        assert_eq!(slugify("a---b...c"), "a_b_c");
    }

    #[test]
    fn test_empty_becomes_unbekannt() {
        assert_eq!(slugify(""), "unbekannt");
        assert_eq!(slugify("///"), "unbekannt");
        assert_eq!(slugify("___"), "unbekannt");
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("sach"), "Sach");
        assert_eq!(capitalize(""), "");
        assert_eq!(capitalize("Leben"), "Leben");
    }
}
