// src/services/html.rs
// =============================================================================
// Small helpers for pulling redirect targets out of HTML pages.
//
// We use the `scraper` crate which:
// - Parses HTML into a DOM (Document Object Model)
// - Supports CSS selectors for finding elements
// - Is built on html5ever, so it copes with the broken markup shorteners serve
//
// Note: scraper's Html is not Send. Adapters parse and extract inside a plain
// (non-async) function so the document never lives across an .await.
// =============================================================================

use scraper::{Html, Selector};

use super::ServiceError;

/// A parsed page.
pub struct Page {
    document: Html,
}

impl Page {
    pub fn parse(body: &str) -> Self {
        Self {
            document: Html::parse_document(body),
        }
    }

    /// Text of the page's <title>, trimmed.
    pub fn title(&self) -> Result<Option<String>, ServiceError> {
        self.nth_text("html > head > title", 0)
    }

    /// Text of the `n`th element matching `css` (0-based).
    pub fn nth_text(&self, css: &str, n: usize) -> Result<Option<String>, ServiceError> {
        let selector = selector(css)?;
        Ok(self
            .document
            .select(&selector)
            .nth(n)
            .map(|element| element.text().collect::<String>().trim().to_string()))
    }

    /// Text of the last element matching `css`, trimmed.
    pub fn last_text(&self, css: &str) -> Result<Option<String>, ServiceError> {
        let selector = selector(css)?;
        Ok(self
            .document
            .select(&selector)
            .last()
            .map(|element| element.text().collect::<String>().trim().to_string()))
    }

    /// Raw (untrimmed) text of the first element matching `css`.
    pub fn raw_text(&self, css: &str) -> Result<Option<String>, ServiceError> {
        let selector = selector(css)?;
        Ok(self
            .document
            .select(&selector)
            .next()
            .map(|element| element.text().collect::<String>()))
    }

    /// Value of `attr` on the first element matching `css`.
    pub fn attr(&self, css: &str, attr: &str) -> Result<Option<String>, ServiceError> {
        let selector = selector(css)?;
        Ok(self
            .document
            .select(&selector)
            .next()
            .and_then(|element| element.value().attr(attr))
            .map(str::to_string))
    }
}

// Our selectors are constants, but a typo should still surface as an error
// instead of a panic inside a fetch worker
fn selector(css: &str) -> Result<Selector, ServiceError> {
    Selector::parse(css)
        .map_err(|e| ServiceError::Unexpected(format!("invalid selector {:?}: {:?}", css, e)))
}
