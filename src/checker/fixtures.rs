// src/checker/fixtures.rs
// =============================================================================
// Checks a service adapter against a list of known codes.
//
// Fixture file format, one code per line:
//
//   # comment
//   gmYZc|http://www.example.org/    the code must resolve to this URL
//   zzzzzz|notfound                  the service must say "no such code"
//   bvkke|blocked                    the service must say "code blocked"
//
// Blank lines and lines starting with '#' are skipped. Shorteners change
// behavior over time, so this is how we notice an adapter went stale.
// =============================================================================

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::services::{Service, ServiceError};

/// What a fixture line expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    Url(String),
    NotFound,
    Blocked,
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expectation::Url(url) => write!(f, "{}", url),
            Expectation::NotFound => write!(f, "notfound"),
            Expectation::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    pub code: String,
    pub expected: Expectation,
}

/// One checked fixture.
#[derive(Debug, Clone, Serialize)]
pub struct FixtureResult {
    pub code: String,
    pub short_url: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

/// Parses a fixture file.
pub fn parse_fixtures(text: &str) -> Result<Vec<Fixture>> {
    let mut fixtures = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((code, expected)) = line.split_once('|') else {
            bail!("Line {}: expected 'code|url', got {:?}", number + 1, line);
        };
        let expected = match expected {
            "notfound" => Expectation::NotFound,
            "blocked" => Expectation::Blocked,
            url => Expectation::Url(url.to_string()),
        };
        fixtures.push(Fixture {
            code: code.to_string(),
            expected,
        });
    }
    Ok(fixtures)
}

/// Fetches every fixture code in order with one service instance.
pub async fn check_fixtures(
    service: &mut dyn Service,
    fixtures: &[Fixture],
    timeout: Duration,
) -> Vec<FixtureResult> {
    let mut results = Vec::with_capacity(fixtures.len());
    for fixture in fixtures {
        let deadline = Instant::now() + timeout;
        let result = service.fetch(&fixture.code, deadline).await;

        let passed = matches!(
            (&fixture.expected, &result),
            (Expectation::Url(want), Ok(got)) if want == got
        ) || matches!(
            (&fixture.expected, &result),
            (Expectation::NotFound, Err(ServiceError::NoRedirect))
                | (Expectation::Blocked, Err(ServiceError::CodeBlocked))
        );

        let actual = match &result {
            Ok(url) => url.clone(),
            Err(ServiceError::NoRedirect) => "notfound".to_string(),
            Err(ServiceError::CodeBlocked) => "blocked".to_string(),
            Err(e) => format!("error: {}", e),
        };
        let short_url = service
            .url(&fixture.code)
            .unwrap_or_else(|_| fixture.code.clone());
        if passed {
            debug!(service = service.name(), "{}, expected: {}, result: {}", short_url, fixture.expected, actual);
        } else {
            warn!(service = service.name(), "{}, expected: {}, result: {}", short_url, fixture.expected, actual);
        }

        results.push(FixtureResult {
            code: fixture.code.clone(),
            short_url,
            expected: fixture.expected.to_string(),
            actual,
            passed,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::testing::{Reply, Script};

    #[test]
    fn test_parse_fixtures() {
        let text = "# tinyurl\n\nbvkke|blocked\r\nb|notfound\n4o8vk|http://www.example.org/?a=1|2\n";
        let fixtures = parse_fixtures(text).unwrap();
        assert_eq!(
            fixtures,
            vec![
                Fixture { code: "bvkke".into(), expected: Expectation::Blocked },
                Fixture { code: "b".into(), expected: Expectation::NotFound },
                Fixture {
                    code: "4o8vk".into(),
                    expected: Expectation::Url("http://www.example.org/?a=1|2".into())
                },
            ]
        );
    }

    #[test]
    fn test_parse_rejects_lines_without_separator() {
        let error = parse_fixtures("ok|notfound\nbroken\n").unwrap_err();
        assert!(error.to_string().contains("Line 2"));
    }

    #[tokio::test]
    async fn test_check_reports_mismatches() {
        let script = Script::new()
            .reply("a", [Reply::Url("http://a/")])
            .reply("b", [Reply::CodeBlocked])
            .reply("c", [Reply::Url("http://wrong/")])
            .reply("d", [Reply::Blocked]);
        let mut service = script.factory()();
        let fixtures = parse_fixtures("a|http://a/\nb|blocked\nc|http://c/\nd|notfound\ne|notfound\n").unwrap();

        let results = check_fixtures(service.as_mut(), &fixtures, Duration::from_secs(1)).await;
        let passed: Vec<(&str, bool)> = results.iter().map(|r| (r.code.as_str(), r.passed)).collect();
        assert_eq!(
            passed,
            vec![("a", true), ("b", true), ("c", false), ("d", false), ("e", true)]
        );
        assert_eq!(results[2].actual, "http://wrong/");
        assert_eq!(results[2].short_url, "http://short.example/c");
        assert!(results[3].actual.starts_with("error: "));
    }
}
