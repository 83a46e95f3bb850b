//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational status of a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Unknown,
    Active,
    Unreachable,
}

impl EndpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointStatus::Unknown => "unknown",
            EndpointStatus::Active => "active",
            EndpointStatus::Unreachable => "unreachable",
        }
    }

    /// Parse a stored status value. Unrecognized values fall back to Unknown.
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => EndpointStatus::Active,
            "unreachable" => EndpointStatus::Unreachable,
            _ => EndpointStatus::Unknown,
        }
    }
}

/// Classification of a test failure, stored alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Endpoint was never attempted (no usable SOCKS5 port, unknown id).
    Config,
    Timeout,
    Refused,
    AuthRejected,
    Protocol,
    /// Throughput measurement failed after a successful connectivity probe.
    Throughput,
    /// Unexpected fault captured from a test task.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Refused => "refused",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Throughput => "throughput",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config" => Some(ErrorKind::Config),
            "timeout" => Some(ErrorKind::Timeout),
            "refused" => Some(ErrorKind::Refused),
            "auth_rejected" => Some(ErrorKind::AuthRejected),
            "protocol" => Some(ErrorKind::Protocol),
            "throughput" => Some(ErrorKind::Throughput),
            "internal" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

/// A proxy endpoint under test.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub socks5_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub status: EndpointStatus,
    pub last_ip: Option<String>,
    pub last_latency_ms: Option<i64>,
    pub last_throughput_kbps: Option<i64>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub deleted: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            host: String::new(),
            socks5_port: None,
            username: None,
            password: None,
            status: EndpointStatus::Unknown,
            last_ip: None,
            last_latency_ms: None,
            last_throughput_kbps: None,
            last_tested_at: None,
            deleted: false,
        }
    }
}

impl Endpoint {
    /// Tunnel credentials, present only when both parts are configured.
    pub fn auth(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

/// One measurement outcome. Append-only; never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub endpoint_id: i64,
    pub host: String,
    pub port: Option<u16>,
    pub reachable: bool,
    pub latency_ms: Option<i64>,
    pub throughput_kbps: Option<i64>,
    pub external_ip: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub tested_at: DateTime<Utc>,
}

/// Write contract for updating an endpoint's live status.
///
/// Measurement fields are applied only for Active updates; any other status
/// leaves the stored measurements untouched.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub endpoint_id: i64,
    pub status: EndpointStatus,
    pub last_ip: Option<String>,
    pub last_latency_ms: Option<i64>,
    pub last_throughput_kbps: Option<i64>,
    pub tested_at: DateTime<Utc>,
}
