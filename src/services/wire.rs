// src/services/wire.rs
// =============================================================================
// Raw request/response plumbing shared by the service adapters.
//
// The shorteners we talk to do not play nicely with a regular HTTP client:
// redirect targets hide in odd header positions, "blocked" is signalled by
// a particular HTML page, and some of them only answer requests with bare
// LF line endings. So instead of an HTTP library we speak bytes over a TCP
// socket and let every adapter decide what the response means.
//
// Key pieces:
// - Target: where to connect (hostname, fixed address, or rotating IPs)
// - Connection: a buffered TCP stream whose reads/writes all honor a deadline
// - ResponseHead: a status line plus the header lines, kept in wire order
// =============================================================================

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};

use super::{IpManager, ServiceError};

/// The HTTP port every shortener here answers on.
pub const HTTP_PORT: u16 = 80;

/// Where an adapter opens its connections.
#[derive(Debug, Clone)]
pub enum Target {
    /// Connect to a hostname on port 80 and let the system resolver pick
    Host(String),
    /// Always connect to this exact address (used by tests and debugging)
    Fixed(SocketAddr),
    /// Ask the IP manager for the next address on every connect
    Rotating(Arc<IpManager>),
}

impl Target {
    /// Opens a fresh connection, giving up when `deadline` passes.
    pub async fn connect(&self, deadline: Instant) -> Result<Connection, ServiceError> {
        let stream = match self {
            Target::Host(host) => {
                bounded(deadline, TcpStream::connect((host.as_str(), HTTP_PORT))).await?
            }
            Target::Fixed(addr) => bounded(deadline, TcpStream::connect(*addr)).await?,
            Target::Rotating(manager) => {
                let ip = manager.get_ip().await?;
                bounded(deadline, TcpStream::connect((ip, HTTP_PORT))).await?
            }
        };
        Ok(Connection {
            stream: BufReader::new(stream),
        })
    }
}

/// A buffered TCP connection. Every operation takes the fetch deadline.
#[derive(Debug)]
pub struct Connection {
    stream: BufReader<TcpStream>,
}

impl Connection {
    /// Writes the whole request.
    pub async fn send(&mut self, data: &[u8], deadline: Instant) -> io::Result<()> {
        bounded(deadline, self.stream.get_mut().write_all(data)).await
    }

    /// Reads up to and including `separator`.
    ///
    /// Returns Ok(None) when the peer closed the connection before sending
    /// anything. If the peer closes midway, whatever arrived is returned.
    pub async fn read_until(
        &mut self,
        separator: &[u8],
        deadline: Instant,
    ) -> io::Result<Option<Vec<u8>>> {
        let Some(&last) = separator.last() else {
            return Ok(Some(Vec::new()));
        };
        let mut buf = Vec::new();
        loop {
            let read = bounded(deadline, self.stream.read_until(last, &mut buf)).await?;
            if read == 0 {
                // EOF
                return Ok(if buf.is_empty() { None } else { Some(buf) });
            }
            if buf.ends_with(separator) {
                return Ok(Some(buf));
            }
        }
    }

    /// Reads one `\n`-terminated line, lossily decoded.
    pub async fn read_line(&mut self, deadline: Instant) -> io::Result<Option<String>> {
        Ok(self
            .read_until(b"\n", deadline)
            .await?
            .map(|line| String::from_utf8_lossy(&line).into_owned()))
    }

    /// Reads the response head (everything up to the blank line).
    pub async fn read_head(&mut self, deadline: Instant) -> io::Result<Option<ResponseHead>> {
        Ok(self
            .read_until(b"\r\n\r\n", deadline)
            .await?
            .map(|raw| ResponseHead::parse(&raw)))
    }

    /// Reads until the peer closes the connection.
    pub async fn read_to_end(&mut self, deadline: Instant) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        bounded(deadline, self.stream.read_to_end(&mut buf)).await?;
        Ok(buf)
    }
}

/// Status line and header lines of a response, in the order they arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    status: String,
    headers: Vec<String>,
}

impl ResponseHead {
    /// Splits a raw head on CRLF. Trailing empty lines are dropped.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut lines: Vec<String> = text.split("\r\n").map(str::to_string).collect();
        while lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }
        let status = if lines.is_empty() {
            String::new()
        } else {
            lines.remove(0)
        };
        Self {
            status,
            headers: lines,
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// The header line `n` positions from the end (1 = last line).
    pub fn header_from_end(&self, n: usize) -> Option<&str> {
        self.headers
            .len()
            .checked_sub(n)
            .and_then(|index| self.headers.get(index))
            .map(String::as_str)
    }

    /// True when the exact line `Connection: close` is present.
    pub fn wants_close(&self) -> bool {
        self.headers.iter().any(|line| line == "Connection: close")
    }
}

/// Extracts the target from a `Location: ...` header line.
pub fn location(line: &str) -> Option<&str> {
    line.strip_prefix("Location: ")
}

/// Builds a request from its lines, joined (and terminated) by `line_ending`.
///
/// Example: request(&["HEAD /abc HTTP/1.1", "Host: is.gd"], "\n")
///          -> "HEAD /abc HTTP/1.1\nHost: is.gd\n\n"
pub fn request(lines: &[&str], line_ending: &str) -> Vec<u8> {
    let mut data = lines.join(line_ending);
    data.push_str(line_ending);
    data.push_str(line_ending);
    data.into_bytes()
}

// Runs an I/O future, turning a missed deadline into a TimedOut error
async fn bounded<T, F>(deadline: Instant, future: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed")),
    }
}

// -----------------------------------------------------------------------------
// BEGINNER NOTES:
//
// 1. Why BufReader around the TcpStream?
//    - Reading "until \r\n\r\n" byte by byte from a socket would be one
//      system call per byte
//    - BufReader pulls bigger chunks and hands them out from memory
//    - get_mut() gives us the raw stream back for writing
//
// 2. What is timeout_at?
//    - It races a future against a point in time
//    - If the deadline passes first, the future is dropped and we get Err
//    - Dropping an async read is safe: nothing else is left half-done
//
// 3. Why keep the header lines in order?
//    - Some shorteners always put Location at a fixed position
//    - The adapters check exactly that position, like the services do
// -----------------------------------------------------------------------------
