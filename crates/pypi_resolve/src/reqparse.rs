//! Parsing of `requires_dist` strings produced upstream.
//!
//! PyPI metadata contains a small but persistent population of malformed requirement
//! strings, almost always a missing comma between two specifier clauses.

use once_cell::sync::Lazy;
use pep508_rs::{Pep508Error, Requirement};
use regex::Regex;
use std::str::FromStr;

static MISSING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)([<>=~^!])").unwrap());

/// Parse a requirement string, fixing unfortunately popular errors such as
/// `elasticsearch-dsl (>=7.2.0<8.0.0)` in django-elasticsearch-dsl 7.2.2 with a regex
/// heuristic.
///
/// `debug_source` identifies the package whose metadata carried the string; passing
/// `None` suppresses the warning so that re-parses of already-diagnosed strings stay
/// quiet.
pub fn parse_requirement_fixup(
    requirement: &str,
    debug_source: Option<&str>,
) -> Result<Requirement, Pep508Error> {
    match Requirement::from_str(requirement) {
        Ok(parsed) => Ok(parsed),
        Err(err) => {
            // Add the missing comma
            let fixed = MISSING_COMMA.replace_all(requirement, "$1,$2");
            match Requirement::from_str(&fixed) {
                Ok(parsed) => {
                    if let Some(source) = debug_source {
                        tracing::warn!(
                            "Requirement `{requirement}` for {source} is invalid (missing comma)"
                        );
                    }
                    Ok(parsed)
                }
                // Didn't work with the fixup either? Raise the error for the
                // original string.
                Err(_) => Err(err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_fixup_missing_comma() {
        let correct = parse_requirement_fixup(
            "elasticsearch-dsl (>=7.2.0,<8.0.0)",
            Some("django-elasticsearch-dsl 7.2.2"),
        )
        .unwrap();
        assert!(!logs_contain("is invalid"));

        let fixed = parse_requirement_fixup(
            "elasticsearch-dsl (>=7.2.0<8.0.0)",
            Some("django-elasticsearch-dsl 7.2.2"),
        )
        .unwrap();
        assert!(logs_contain(
            "Requirement `elasticsearch-dsl (>=7.2.0<8.0.0)` for django-elasticsearch-dsl 7.2.2 is invalid (missing comma)"
        ));

        assert_eq!(fixed.version_or_url, correct.version_or_url);
        assert_eq!(fixed.name, correct.name);
    }

    #[test]
    #[traced_test]
    fn test_fixup_silent_source() {
        parse_requirement_fixup("elasticsearch-dsl (>=7.2.0<8.0.0)", None).unwrap();
        assert!(!logs_contain("is invalid"));
    }

    #[test]
    fn test_fixup_unfixable() {
        assert!(parse_requirement_fixup("elasticsearch-dsl ((((", Some("nonsense 1.0")).is_err());
    }
}
