// Patient data masking (LGPD)
//
// Raw names and document numbers never leave the poller; only masked
// forms travel on the wire and into storage.

/// Mask a patient name down to initials: "Maria da Silva" -> "M. S."
///
/// Short connecting particles (da, de, dos, ...) are dropped.
pub fn mask_name(name: &str) -> String {
    let initials: Vec<String> = name
        .split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .filter_map(|w| w.chars().next())
        .map(|c| format!("{}.", c.to_uppercase()))
        .collect();

    if initials.is_empty() {
        "*".to_string()
    } else {
        initials.join(" ")
    }
}

/// Mask a document identifier, keeping only the last 3 characters visible.
pub fn mask_identifier(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 3 {
        return "*".repeat(chars.len().max(1));
    }
    let visible: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 3), visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_name_to_initials() {
        assert_eq!(mask_name("Maria da Silva"), "M. S.");
        assert_eq!(mask_name("Jose"), "J.");
        assert_eq!(mask_name(""), "*");
    }

    #[test]
    fn masks_identifier_keeping_last_three() {
        assert_eq!(mask_identifier("12345678901"), "********901");
        assert_eq!(mask_identifier("12"), "**");
        assert_eq!(mask_identifier(""), "*");
    }
}
