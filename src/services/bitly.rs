// src/services/bitly.rs
// =============================================================================
// Adapter for bit.ly (and its j.mp alias).
//
// Exchange:
// - Keep one connection open across fetches
// - Send a HEAD request with bare LF line endings
// - 301: the Location is always the third header line from the end
// - 302: the code is flagged; the Location points at a warning page whose
//        query string still carries the real target
// - 403: we are blocked, 404: unused code
// =============================================================================

use async_trait::async_trait;
use tokio::time::Instant;
use url::Url;

use super::wire::{self, Connection, ResponseHead, Target};
use super::{CodeSpace, Service, ServiceError};

pub const CODE_SPACE: CodeSpace =
    CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_");

pub const HOSTS: &[&str] = &["bit.ly", "www.bit.ly", "j.mp", "www.j.mp"];

// Paths bit.ly uses for its own pages
const KEYWORDS: &[&str] = &["api", "pro"];

/// Codes are case sensitive letters, digits, dashes and underscores.
pub fn canonicalize(code: &str) -> Result<String, ServiceError> {
    let valid = !code.is_empty()
        && code
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid || KEYWORDS.contains(&code) {
        return Err(ServiceError::InvalidCode(code.to_string()));
    }
    Ok(code.to_string())
}

pub fn build(target: Target) -> Box<dyn Service> {
    Box::new(Bitly::new(target))
}

pub struct Bitly {
    target: Target,
    connection: Option<Connection>,
}

impl Bitly {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            connection: None,
        }
    }
}

#[async_trait]
impl Service for Bitly {
    fn name(&self) -> &'static str {
        "bitly"
    }

    fn canonicalize(&self, code: &str) -> Result<String, ServiceError> {
        canonicalize(code)
    }

    fn url(&self, code: &str) -> Result<String, ServiceError> {
        Ok(format!("http://bit.ly/{}", canonicalize(code)?))
    }

    async fn fetch(&mut self, code: &str, deadline: Instant) -> Result<String, ServiceError> {
        let request = wire::request(
            &[&format!("HEAD /{} HTTP/1.1", code), "Host: j.mp", "Cookie: _bit=0"],
            "\n",
        );

        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.target.connect(deadline).await?,
        };
        if let Err(e) = conn.send(&request, deadline).await {
            // The server dropped our kept-alive connection; try once more
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
            conn = self.target.connect(deadline).await?;
            conn.send(&request, deadline).await?;
        }

        let head = conn.read_head(deadline).await?.ok_or_else(|| {
            ServiceError::Fetch("Service unexpectedly closed the connection".to_string())
        })?;
        if !head.wants_close() {
            self.connection = Some(conn);
        }
        interpret(code, &head)
    }
}

// Maps a response head to a long URL or an error
fn interpret(code: &str, head: &ResponseHead) -> Result<String, ServiceError> {
    match head.status() {
        "HTTP/1.1 301 Moved" => expected_location(head).map(str::to_string),
        "HTTP/1.1 302 Found" => warning_target(code, expected_location(head)?),
        "HTTP/1.1 403 Forbidden" => Err(ServiceError::ServiceBlocked),
        "HTTP/1.1 404 Not Found" => Err(ServiceError::NoRedirect),
        other => Err(ServiceError::Fetch(format!(
            "Expected 301/302/404, but received {:?}",
            other
        ))),
    }
}

fn expected_location(head: &ResponseHead) -> Result<&str, ServiceError> {
    head.header_from_end(3)
        .and_then(wire::location)
        .ok_or_else(|| {
            ServiceError::Fetch("No Location found at the expected place in headers".to_string())
        })
}

// A 302 points at http://bit.ly/a/warning?hash=<code>&url=<target>
fn warning_target(code: &str, location: &str) -> Result<String, ServiceError> {
    let target = Url::parse(location)
        .map_err(|e| ServiceError::Fetch(format!("Bad redirect URL {:?}: {}", location, e)))?;
    if target.scheme() != "http"
        || target.host_str() != Some("bit.ly")
        || target.path() != "/a/warning"
    {
        return Err(ServiceError::Fetch(
            "302 Found but unknown redirect URL".to_string(),
        ));
    }

    let param = |name: &str| {
        target
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };
    if param("hash").as_deref() != Some(code) {
        return Err(ServiceError::Fetch("Code mismatch on 302 Found".to_string()));
    }
    param("url")
        .map(|url| url.trim().to_string())
        .ok_or_else(|| ServiceError::Fetch("No URL given".to_string()))
}
