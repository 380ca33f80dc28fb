// src/services/isgd.rs
// =============================================================================
// Adapter for is.gd.
//
// Exchange:
// - Keep one connection to is.gd open across fetches
// - HEAD with bare LF line endings
// - 301: the Location is the last header line
// - 404: unused code, 502: the code was disabled without a target
// - 200: the code was disabled for spam; the target is printed inside the
//        "URL disabled" page, so we GET it (chunked) and read it from the HTML
// =============================================================================

use async_trait::async_trait;
use tokio::time::Instant;

use super::html::Page;
use super::wire::{self, Connection, ResponseHead, Target};
use super::{CodeSpace, Service, ServiceError};

pub const CODE_SPACE: CodeSpace =
    CodeSpace::new("0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_");

pub const HOST: &str = "is.gd";

const DISABLED_TITLE: &str = "is.gd - URL disabled";
const DISABLED_PREFIX: &str = "For reference and to help those fighting spam the original destination of this URL is given below (we strongly recommend you don't visit it since it may damage your PC): -";

/// Codes are case sensitive; everything after the first invalid character
/// is ignored.
pub fn canonicalize(code: &str) -> Result<String, ServiceError> {
    let end = code
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(code.len());
    let canonical = &code[..end];
    if canonical.is_empty() {
        return Err(ServiceError::InvalidCode(code.to_string()));
    }
    Ok(canonical.to_string())
}

pub fn build(target: Target) -> Box<dyn Service> {
    Box::new(Isgd::new(target))
}

pub struct Isgd {
    target: Target,
    connection: Option<Connection>,
}

impl Isgd {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            connection: None,
        }
    }

    // The 200 branch: fetch the "URL disabled" page and read the target
    async fn fetch_disabled_page(
        &mut self,
        mut conn: Connection,
        head: &ResponseHead,
        code: &str,
        deadline: Instant,
    ) -> Result<String, ServiceError> {
        if head.wants_close() {
            conn = self.target.connect(deadline).await?;
        }
        let request = wire::request(&[&format!("GET /{} HTTP/1.1", code), "Host: is.gd"], "\r\n");
        conn.send(&request, deadline).await?;

        let head = conn.read_head(deadline).await?.ok_or_else(closed)?;
        if head.status() != "HTTP/1.1 200 OK" {
            return Err(ServiceError::Fetch(format!(
                "Status suddenly changed from 200 to {}",
                head.status()
            )));
        }

        // Chunked body: a size line, then data up to the terminating chunk
        conn.read_line(deadline).await?.ok_or_else(closed)?;
        let mut body = conn
            .read_until(b"\r\n0\r\n\r\n", deadline)
            .await?
            .ok_or_else(closed)?;
        body.truncate(body.len().saturating_sub(7));

        if !head.wants_close() {
            self.connection = Some(conn);
        }
        disabled_target(&String::from_utf8_lossy(&body))
    }
}

#[async_trait]
impl Service for Isgd {
    fn name(&self) -> &'static str {
        "isgd"
    }

    fn canonicalize(&self, code: &str) -> Result<String, ServiceError> {
        canonicalize(code)
    }

    fn url(&self, code: &str) -> Result<String, ServiceError> {
        Ok(format!("http://is.gd/{}", canonicalize(code)?))
    }

    async fn fetch(&mut self, code: &str, deadline: Instant) -> Result<String, ServiceError> {
        let request = wire::request(&[&format!("HEAD /{} HTTP/1.1", code), "Host: is.gd"], "\n");

        let mut conn = match self.connection.take() {
            Some(conn) => conn,
            None => self.target.connect(deadline).await?,
        };
        if let Err(e) = conn.send(&request, deadline).await {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
            conn = self.target.connect(deadline).await?;
            conn.send(&request, deadline).await?;
        }

        let head = conn.read_head(deadline).await?.ok_or_else(closed)?;
        let result = match head.status() {
            "HTTP/1.1 301 Moved Permanently" => head
                .header_from_end(1)
                .and_then(wire::location)
                .map(str::to_string)
                .ok_or_else(|| {
                    ServiceError::Fetch(
                        "No Location found at the expected place in headers".to_string(),
                    )
                }),
            "HTTP/1.1 404 Not Found" => Err(ServiceError::NoRedirect),
            "HTTP/1.1 200 OK" => {
                return self.fetch_disabled_page(conn, &head, code, deadline).await;
            }
            "HTTP/1.1 502 Bad Gateway" => Err(ServiceError::CodeBlocked),
            other => Err(ServiceError::Fetch(format!(
                "Expected 200/301/404, but received {}",
                other
            ))),
        };

        if !head.wants_close() {
            self.connection = Some(conn);
        }
        result
    }
}

fn closed() -> ServiceError {
    ServiceError::Fetch("Service unexpectedly closed the connection".to_string())
}

// Finds the original destination on the "URL disabled" page
fn disabled_target(html: &str) -> Result<String, ServiceError> {
    let page = Page::parse(html);
    if page.title()?.as_deref() == Some(DISABLED_TITLE) {
        let notice = page.nth_text("div#disabled > p", 3)?;
        if let Some(url) = notice
            .as_deref()
            .and_then(|text| text.strip_prefix(DISABLED_PREFIX))
            .and_then(|rest| rest.lines().next())
        {
            return Ok(url.to_string());
        }
    }
    Err(ServiceError::Fetch("Could not parse URL from HTML".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::wire::testing;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn disabled_page(url: &str) -> String {
        format!(
            "<html><head><title>is.gd - URL disabled</title></head><body>\
             <div id=\"disabled\"><p>This URL has been disabled.</p><p>Why?</p><p>Spam.</p>\
             <p>{}{}</p></div></body></html>",
            DISABLED_PREFIX, url
        )
    }

    #[test]
    fn test_url() {
        let service = build(Target::Host(HOST.into()));
        assert_eq!(service.name(), "isgd");
        assert_eq!(service.url("test-suite").unwrap(), "http://is.gd/test");
        assert!(service.url("-abc").is_err());
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("TEsT").unwrap(), "TEsT");
        assert_eq!(canonicalize("test-suite").unwrap(), "test");
        assert!(canonicalize("").is_err());
        assert!(canonicalize("-abc").is_err());
        assert_eq!(canonicalize("01234567").unwrap(), "01234567");
    }

    #[test]
    fn test_wraparound_into_seven_characters() {
        let next = CODE_SPACE.advance(&canonicalize("______").unwrap()).unwrap();
        assert_eq!(next, "0000000");
        assert_eq!(canonicalize(&next).unwrap(), "0000000");
    }

    #[test]
    fn test_disabled_target() {
        let html = disabled_page("http://pocketexpress.com/assets/img/channels/icn-extras.jpg");
        assert_eq!(
            disabled_target(&html).unwrap(),
            "http://pocketexpress.com/assets/img/channels/icn-extras.jpg"
        );
        assert!(disabled_target("<html><head><title>is.gd</title></head></html>").is_err());
    }

    #[tokio::test]
    async fn test_fetch_statuses_on_one_connection() {
        let (addr, received) = testing::serve_keepalive(vec![
            b"HTTP/1.1 301 Moved Permanently\r\nServer: nginx\r\nLocation: http://www.example.org/\r\n\r\n".to_vec(),
            b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec(),
            b"HTTP/1.1 502 Bad Gateway\r\n\r\n".to_vec(),
        ])
        .await;
        let mut isgd = Isgd::new(Target::Fixed(addr));

        assert_eq!(isgd.fetch("gmYZc", soon()).await.unwrap(), "http://www.example.org/");
        assert!(matches!(isgd.fetch("zzzzzz", soon()).await, Err(ServiceError::NoRedirect)));
        assert!(matches!(isgd.fetch("bad", soon()).await, Err(ServiceError::CodeBlocked)));
        assert_eq!(
            received.lock().unwrap()[0],
            b"HEAD /gmYZc HTTP/1.1\nHost: is.gd\n\n".to_vec()
        );
    }

    #[tokio::test]
    async fn test_fetch_disabled_code_via_get() {
        let html = disabled_page("http://spam.example/");
        let chunked = format!(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n0\r\n\r\n",
            html.len(),
            html
        );
        let (addr, received) = testing::serve_keepalive(vec![
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n".to_vec(),
            chunked.into_bytes(),
        ])
        .await;
        let mut isgd = Isgd::new(Target::Fixed(addr));

        assert_eq!(isgd.fetch("mBAh", soon()).await.unwrap(), "http://spam.example/");
        assert_eq!(
            received.lock().unwrap()[1],
            b"GET /mBAh HTTP/1.1\r\nHost: is.gd\r\n\r\n".to_vec()
        );
    }
}
