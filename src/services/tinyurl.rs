// src/services/tinyurl.rs
// =============================================================================
// Adapter for tinyurl.com.
//
// Exchange (HTTP/1.0, one connection per request):
// - HEAD first; 301 carries a Location somewhere in the headers
// - a 301 *without* Location means this code was blocked
// - 302 means the whole service is blocking us
// - 200 means the target is only visible in the page body, so we GET it
//   and look for either the "Redirecting..." page or the
//   "TinyURL redirects to a TinyURL" error page
// =============================================================================

use async_trait::async_trait;
use tokio::time::Instant;

use super::html::Page;
use super::wire::{self, Connection, Target};
use super::{CodeSpace, Service, ServiceError};

pub const CODE_SPACE: CodeSpace = CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyz");

pub const HOSTS: &[&str] = &["tinyurl.com", "www.tinyurl.com"];

const MAX_CODE_LENGTH: usize = 49;

/// Codes are case insensitive letters and digits. Dashes are ignored and
/// everything after a slash is dropped.
///
/// Example: "--Te-St--/another" -> "test"
pub fn canonicalize(code: &str) -> Result<String, ServiceError> {
    let canonical: String = code
        .split('/')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| *c != '-')
        .collect::<String>()
        .to_ascii_lowercase();
    let valid = (1..=MAX_CODE_LENGTH).contains(&canonical.len())
        && canonical
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    if !valid {
        return Err(ServiceError::InvalidCode(code.to_string()));
    }
    Ok(canonical)
}

pub fn build(target: Target) -> Box<dyn Service> {
    Box::new(TinyUrl::new(target))
}

pub struct TinyUrl {
    target: Target,
}

// What a single request told us
enum Step {
    Found(String),
    RetryWithGet,
}

impl TinyUrl {
    pub fn new(target: Target) -> Self {
        Self { target }
    }

    async fn request(&self, code: &str, get: bool, deadline: Instant) -> Result<Step, ServiceError> {
        let method = if get { "GET" } else { "HEAD" };
        let mut conn = self.target.connect(deadline).await?;
        conn.send(
            &wire::request(
                &[&format!("{} /{} HTTP/1.0", method, code), "Host: tinyurl.com"],
                "\r\n",
            ),
            deadline,
        )
        .await?;

        let status = conn.read_line(deadline).await?;
        match status.as_deref() {
            Some("HTTP/1.0 301 Moved Permanently\r\n") => {
                scan_for_location(&mut conn, code, deadline).await.map(Step::Found)
            }
            Some("HTTP/1.0 404 Not Found\r\n") => Err(ServiceError::NoRedirect),
            Some("HTTP/1.0 200 OK\r\n") if get => {
                conn.read_until(b"\r\n\r\n", deadline).await?;
                let body = conn.read_to_end(deadline).await?;
                page_target(&String::from_utf8_lossy(&body), code).map(Step::Found)
            }
            Some("HTTP/1.0 200 OK\r\n") => Ok(Step::RetryWithGet),
            Some("HTTP/1.0 302 Found\r\n") => Err(ServiceError::ServiceBlocked),
            other => Err(ServiceError::Fetch(format!(
                "Expected 200/301/302/404, but received {:?} for code {:?}",
                other, code
            ))),
        }
    }
}

#[async_trait]
impl Service for TinyUrl {
    fn name(&self) -> &'static str {
        "tinyurl"
    }

    fn canonicalize(&self, code: &str) -> Result<String, ServiceError> {
        canonicalize(code)
    }

    fn url(&self, code: &str) -> Result<String, ServiceError> {
        Ok(format!("http://tinyurl.com/{}", canonicalize(code)?))
    }

    async fn fetch(&mut self, code: &str, deadline: Instant) -> Result<String, ServiceError> {
        let code = canonicalize(code)?;
        match self.request(&code, false, deadline).await? {
            Step::Found(url) => Ok(url),
            Step::RetryWithGet => match self.request(&code, true, deadline).await? {
                Step::Found(url) => Ok(url),
                Step::RetryWithGet => Err(ServiceError::Fetch(format!(
                    "GET for code {:?} asked for another GET",
                    code
                ))),
            },
        }
    }
}

// Walks the header lines of a 301 until we find the Location
async fn scan_for_location(
    conn: &mut Connection,
    code: &str,
    deadline: Instant,
) -> Result<String, ServiceError> {
    while let Some(line) = conn.read_line(deadline).await? {
        if line == "\r\n" {
            // End of headers and still no Location: the code is blocked
            return Err(ServiceError::CodeBlocked);
        }
        if let Some(url) = line.strip_suffix("\r\n").and_then(wire::location) {
            return Ok(url.to_string());
        }
        // X-tiny / X-Powered-By and friends are skipped
    }
    Err(ServiceError::Fetch(format!(
        "Expected Location, but the connection closed for code {:?}",
        code
    )))
}

const REDIRECT_LOOP_HEADING: &str = "Error: TinyURL redirects to a TinyURL.";

// Reads the target from one of the two pages tinyurl answers 200 with
fn page_target(html: &str, code: &str) -> Result<String, ServiceError> {
    let page = Page::parse(html);

    if page.title()?.as_deref() == Some("Redirecting...") {
        if let Some(text) = page.raw_text("html > body")? {
            let url = text.trim();
            if !url.is_empty() {
                return Ok(url.to_string());
            }
        }
    }

    if page.last_text("table td h1")?.as_deref() == Some(REDIRECT_LOOP_HEADING) {
        if let Some(href) = page.attr("p.intro a", "href")? {
            return Ok(href.trim_end_matches('\n').to_string());
        }
    }

    Err(ServiceError::Fetch(format!(
        "Could not parse URL for code {:?}",
        code
    )))
}
