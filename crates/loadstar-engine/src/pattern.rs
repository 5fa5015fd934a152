//! `*` wildcard matching for stream names and discovery.

use regex::Regex;

use crate::config::types::normalize_name;

#[must_use]
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*')
}

fn wildcard_regex(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{body}$")).ok()
}

/// Case-normalized match of `name` against a pattern that may contain `*`.
#[must_use]
pub fn matches(pattern: &str, name: &str) -> bool {
    let pattern = normalize_name(pattern);
    let name = normalize_name(name);
    if !has_wildcard(&pattern) {
        return pattern == name;
    }
    wildcard_regex(&pattern).is_some_and(|re| re.is_match(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_names_match_case_insensitively() {
        assert!(matches("Public.Users", "public.users"));
        assert!(!matches("public.users", "public.users2"));
    }

    #[test]
    fn wildcards_span_any_characters() {
        assert!(matches("public.*", "PUBLIC.orders"));
        assert!(matches("*_2024.ndjson", "events_2024.ndjson"));
        assert!(!matches("public.*", "sales.orders"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a.b*", "a.bc"));
        assert!(!matches("a.b*", "axbc"));
        assert!(matches("x(1)*", "x(1)y"));
    }
}
