// src/services/mod.rs
// =============================================================================
// This module contains everything that talks to a URL shortener.
//
// Submodules:
// - codes: the ordered alphabet of a shortener and the "advance" step
// - wire: raw TCP request/response plumbing with deadlines
// - html: pulls redirect targets out of HTML pages
// - ip_manager: rotates between all the IPs a shortener answers on
// - bitly, isgd, tinyurl, trim: one adapter per shortener
//
// Each adapter implements the Service trait. Adapters are stateful (they may
// keep a socket open between fetches), so every fetch worker owns its own
// instance, and a worker throws its instance away after a network hiccup.
// =============================================================================

mod bitly;
mod codes;
mod html;
mod ip_manager;
mod isgd;
mod tinyurl;
mod trim;
pub mod wire;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

pub use codes::CodeSpace;
pub use ip_manager::{DnsResolver, IpManager};
pub use wire::Target;

/// Everything a single fetch can end with, besides a long URL.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The code fails the service's canonical-form rules
    #[error("invalid code {0:?}")]
    InvalidCode(String),

    /// The service confirms the code is not in use
    #[error("code has no redirect")]
    NoRedirect,

    /// The service refuses to resolve this one code
    #[error("code is blocked by the service")]
    CodeBlocked,

    /// The service is throttling or blocking us as a whole
    #[error("service is blocking us")]
    ServiceBlocked,

    /// The response did not look like anything we expected
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Socket-level failure (reset, refused, deadline elapsed, ...)
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// Anything else; a worker treats this as fatal
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl ServiceError {
    /// True for failures that a fresh connection and a retry may fix.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Fetch(_) => true,
            ServiceError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// A client for one URL shortener.
#[async_trait]
pub trait Service: Send {
    /// Short lowercase name, as used on the command line.
    fn name(&self) -> &'static str;

    /// Normalizes a raw code or rejects it with InvalidCode.
    fn canonicalize(&self, code: &str) -> Result<String, ServiceError>;

    /// The public short URL for a code.
    fn url(&self, code: &str) -> Result<String, ServiceError>;

    /// Looks up the long URL behind `code`.
    ///
    /// Every socket operation gives up once `deadline` has passed.
    async fn fetch(&mut self, code: &str, deadline: Instant) -> Result<String, ServiceError>;
}

/// Builds fresh service instances for fetch workers.
pub type ServiceFactory = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// How a service reaches its servers by default.
#[derive(Debug, Clone, Copy)]
pub enum Endpoint {
    /// A single hostname
    Host(&'static str),
    /// Rotate between every address behind these hostnames
    Rotating(&'static [&'static str]),
}

/// A registry entry: everything needed to pick and build a service by name.
#[derive(Clone, Copy)]
pub struct ServiceDescriptor {
    /// Command-line name, e.g. "tinyurl"
    pub name: &'static str,
    /// Name used in output file names, e.g. "TinyURL"
    pub display_name: &'static str,
    pub code_space: CodeSpace,
    pub endpoint: Endpoint,
    pub canonicalize: fn(&str) -> Result<String, ServiceError>,
    build: fn(Target) -> Box<dyn Service>,
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("code_space", &self.code_space)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ServiceDescriptor {
    /// The connection target this service uses in production.
    ///
    /// Rotating services get their own IpManager here, shared by every
    /// instance the returned target builds.
    pub fn default_target(&self) -> Result<Target, ServiceError> {
        match self.endpoint {
            Endpoint::Host(host) => Ok(Target::Host(host.to_string())),
            Endpoint::Rotating(hosts) => {
                let resolver = DnsResolver::new()?;
                let hosts = hosts.iter().map(|h| h.to_string()).collect();
                Ok(Target::Rotating(Arc::new(IpManager::new(
                    hosts,
                    Arc::new(resolver),
                ))))
            }
        }
    }

    /// Builds one service instance.
    pub fn build(&self, target: Target) -> Box<dyn Service> {
        (self.build)(target)
    }

    /// A factory handing out fresh instances that all connect to `target`.
    pub fn factory(&self, target: Target) -> ServiceFactory {
        let build = self.build;
        Arc::new(move || build(target.clone()))
    }
}

/// All services this tool knows about.
pub fn registry() -> &'static [ServiceDescriptor] {
    static REGISTRY: [ServiceDescriptor; 4] = [
        ServiceDescriptor {
            name: "bitly",
            display_name: "Bitly",
            code_space: bitly::CODE_SPACE,
            endpoint: Endpoint::Rotating(bitly::HOSTS),
            canonicalize: bitly::canonicalize,
            build: bitly::build,
        },
        ServiceDescriptor {
            name: "isgd",
            display_name: "Isgd",
            code_space: isgd::CODE_SPACE,
            endpoint: Endpoint::Host(isgd::HOST),
            canonicalize: isgd::canonicalize,
            build: isgd::build,
        },
        ServiceDescriptor {
            name: "tinyurl",
            display_name: "TinyURL",
            code_space: tinyurl::CODE_SPACE,
            endpoint: Endpoint::Rotating(tinyurl::HOSTS),
            canonicalize: tinyurl::canonicalize,
            build: tinyurl::build,
        },
        ServiceDescriptor {
            name: "trim",
            display_name: "Trim",
            code_space: trim::CODE_SPACE,
            endpoint: Endpoint::Host(trim::HOST),
            canonicalize: trim::canonicalize,
            build: trim::build,
        },
    ];
    &REGISTRY
}

/// Finds a service by name (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static ServiceDescriptor> {
    registry()
        .iter()
        .find(|descriptor| descriptor.name.eq_ignore_ascii_case(name))
}
