// src/services/trim.rs
// =============================================================================
// Adapter for tr.im.
//
// tr.im answers a HEAD and closes the connection, so we just read until EOF.
// When its backend is down (or it wants us gone) it skips HTTP altogether
// and sends a bare "TR.IM NOT AVAILABLE" page.
// =============================================================================

use async_trait::async_trait;
use tokio::time::Instant;

use super::wire::{self, ResponseHead, Target};
use super::{CodeSpace, Service, ServiceError};

pub const CODE_SPACE: CodeSpace = CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyz_");

pub const HOST: &str = "tr.im";

const NOT_AVAILABLE: &str = "<!DOCTYPE html PUBLIC \"-//W3C//DTD XHTML 1.1//EN\" \"http://www.w3.org/TR/xhtml11/DTD/xhtml11.dtd\">\n<html>\n<head>\n  <title>TR.IM NOT AVAILABLE</title>\n</head>\n<body>\n  TR.IM SERVERS NOT AVAILABLE\n</body>\n</html>\n\n";

/// Codes are case insensitive; invalid characters are dropped and
/// everything after the first dot is ignored.
///
/// Example: "Te-St_.B&lA" -> "test_"
pub fn canonicalize(code: &str) -> Result<String, ServiceError> {
    let canonical: String = code
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<String>()
        .to_ascii_lowercase();
    if canonical.is_empty() {
        return Err(ServiceError::InvalidCode(code.to_string()));
    }
    Ok(canonical)
}

pub fn build(target: Target) -> Box<dyn Service> {
    Box::new(Trim::new(target))
}

pub struct Trim {
    target: Target,
}

impl Trim {
    pub fn new(target: Target) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Service for Trim {
    fn name(&self) -> &'static str {
        "trim"
    }

    fn canonicalize(&self, code: &str) -> Result<String, ServiceError> {
        canonicalize(code)
    }

    fn url(&self, code: &str) -> Result<String, ServiceError> {
        Ok(format!("http://tr.im/{}", canonicalize(code)?))
    }

    async fn fetch(&mut self, code: &str, deadline: Instant) -> Result<String, ServiceError> {
        let mut conn = self.target.connect(deadline).await?;
        conn.send(
            &wire::request(
                &[&format!("HEAD /{} HTTP/1.1", code), "Host: tr.im", "Cookie: _trim=0"],
                "\n",
            ),
            deadline,
        )
        .await?;
        let response = conn.read_to_end(deadline).await?;
        interpret(&response)
    }
}

fn interpret(response: &[u8]) -> Result<String, ServiceError> {
    if response.is_empty() {
        return Err(ServiceError::Fetch(
            "Service unexpectedly closed the connection".to_string(),
        ));
    }
    if response == NOT_AVAILABLE.as_bytes() {
        return Err(ServiceError::ServiceBlocked);
    }

    let head = ResponseHead::parse(response);
    match head.status() {
        "HTTP/1.1 301 Moved Permanently" => {
            let target = head
                .headers()
                .get(4)
                .and_then(|line| wire::location(line))
                .ok_or_else(|| {
                    ServiceError::Fetch(
                        "No Location found at the expected place in headers".to_string(),
                    )
                })?;
            // Unused codes bounce back to the home page
            if target == "http://tr.im" {
                return Err(ServiceError::NoRedirect);
            }
            Ok(target.to_string())
        }
        other => Err(ServiceError::Fetch(format!(
            "Expected 301, but received {:?}",
            other
        ))),
    }
}
