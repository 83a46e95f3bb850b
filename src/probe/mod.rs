//! Probe module for proxy testing.
//!
//! Two probes run through a SOCKS5 tunnel: a connectivity probe measuring
//! latency and the tunnel's external IP, and a throughput probe timing a
//! reference file download.

mod connectivity;
mod socks;
mod throughput;

pub use connectivity::*;
pub use socks::*;
pub use throughput::*;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::config::ServerConfig;
use crate::db::ErrorKind;

/// User-Agent sent on every probe request.
pub const PROBE_USER_AGENT: &str = "ProxyTester/1.0";

/// Probe error types.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectError {
    /// Classification recorded on audit rows.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Timeout(_) => ErrorKind::Timeout,
            ConnectError::Refused(_) => ErrorKind::Refused,
            ConnectError::AuthRejected(_) => ErrorKind::AuthRejected,
            ConnectError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Probe configuration: destinations, deadlines, shared TLS client.
#[derive(Clone)]
pub struct ProbeSettings {
    pub connect_timeout: Duration,
    pub download_timeout: Duration,
    pub ip_echo_host: String,
    pub reference_host: String,
    pub reference_path: String,
    pub tls: TlsConnector,
}

impl ProbeSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            download_timeout: Duration::from_secs(config.download_timeout_secs),
            ip_echo_host: config.ip_echo_host.clone(),
            reference_host: config.reference_host.clone(),
            reference_path: config.reference_path.clone(),
            tls: tls_connector(),
        }
    }
}

/// TLS client backed by the bundled webpki root store.
pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Minimal HTTP/1.1 GET with a close-delimited response.
pub(crate) fn http_get_request(host: &str, path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        path, host, PROBE_USER_AGENT
    )
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Settings with short deadlines for probe tests against local listeners.
#[cfg(test)]
pub(crate) fn test_settings() -> ProbeSettings {
    ProbeSettings {
        connect_timeout: Duration::from_secs(2),
        download_timeout: Duration::from_secs(2),
        ip_echo_host: "ipv4.icanhazip.com".to_string(),
        reference_host: "proof.ovh.net".to_string(),
        reference_path: "/files/100Kb.dat".to_string(),
        tls: tls_connector(),
    }
}
