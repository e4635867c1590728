//! Fuzzy-text primitives shared by the matching engines.
//!
//! Ratios are 0-100 like the classic fuzz API so the threshold constants in
//! the engines read the same as the tuning notes they came from.

/// Lowercase, strip punctuation to spaces, and collapse whitespace.
pub fn normalize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_space = true;
    for ch in input.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Plain similarity ratio (0-100) on the normalized strings.
pub fn ratio(a: &str, b: &str) -> u32 {
    let a = normalize(a);
    let b = normalize(b);
    if a.is_empty() && b.is_empty() {
        return 100;
    }
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    (strsim::normalized_levenshtein(&a, &b) * 100.0).round() as u32
}

/// Token-sort ratio (0-100): tokens are sorted before comparison so word
/// order does not matter ("Corp Acme" ~ "Acme Corp").
pub fn token_sort_ratio(a: &str, b: &str) -> u32 {
    ratio(&token_sort(a), &token_sort(b))
}

fn token_sort(input: &str) -> String {
    let normalized = normalize(input);
    let mut tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// One reference contained in the other, case-insensitive, both at least
/// three characters long.
pub fn contained(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    a.len() >= 3 && b.len() >= 3 && (a.contains(&b) || b.contains(&a))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("INV/2026/0042"), "inv 2026 0042");
        assert_eq!(normalize("  Acme,  Corp. "), "acme corp");
    }

    #[test]
    fn identical_refs_score_100() {
        assert_eq!(token_sort_ratio("INV/2026/0042", "INV/2026/0042"), 100);
    }

    #[test]
    fn token_order_is_ignored() {
        assert_eq!(token_sort_ratio("Corp Acme", "Acme Corp"), 100);
    }

    #[test]
    fn token_sort_is_symmetric() {
        let a = "ACME Corporation Ltd";
        let b = "Acme Corp";
        assert_eq!(token_sort_ratio(a, b), token_sort_ratio(b, a));
    }

    #[test]
    fn containment_requires_min_length() {
        assert!(contained("INV/2026/0042 payment", "INV/2026/0042"));
        assert!(!contained("ab", "ab"));
        assert!(!contained("payment", "xyz"));
    }

    #[test]
    fn disjoint_strings_score_low() {
        assert!(token_sort_ratio("INV/2026/0042", "REF/9999/1111") < 70);
    }
}
