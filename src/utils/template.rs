//! `%key%` placeholder rendering for command templates.

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn placeholder_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"%([^%\s]+)%").expect("placeholder pattern is valid"))
}

/// Render all `%key%` tokens in one non-overlapping left-to-right pass.
///
/// Substituted values are never rescanned, so a value containing `%other%`
/// stays literal. Tokens without a value are left untouched.
pub fn render_map(template: &str, variables: &BTreeMap<String, String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Names of all placeholder tokens still present in `line`.
#[cfg(test)]
pub(crate) fn placeholders(line: &str) -> Vec<String> {
    placeholder_regex()
        .captures_iter(line)
        .map(|caps| caps[1].to_string())
        .collect()
}

pub fn has_placeholders(line: &str) -> bool {
    placeholder_regex().is_match(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_known_tokens() {
        let out = render_map(
            "cd %rootFolder% && git checkout %guest.branch%",
            &vars(&[("rootFolder", "/srv/app"), ("guest.branch", "main")]),
        );
        assert_eq!(out, "cd /srv/app && git checkout main");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let out = render_map("echo %a%", &vars(&[("a", "%b%"), ("b", "boom")]));
        assert_eq!(out, "echo %b%");
    }

    #[test]
    fn unknown_tokens_survive_and_are_reported() {
        let out = render_map("mkdir %missing%/x", &vars(&[]));
        assert_eq!(out, "mkdir %missing%/x");
        assert_eq!(placeholders(&out), vec!["missing"]);
        assert!(has_placeholders(&out));
    }

    #[test]
    fn lone_percent_signs_are_not_placeholders() {
        assert!(!has_placeholders("echo 100% done"));
        assert!(!has_placeholders("printf '%%'"));
    }
}
