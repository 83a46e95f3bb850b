//! Configuration module for ProxyGauge.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "proxygauge.db")
    pub db_path: String,
    /// Number of endpoints tested concurrently per window (default: 5)
    pub window_size: usize,
    /// Deadline for the connectivity check, seconds (default: 30)
    pub connect_timeout_secs: u64,
    /// Deadline for the throughput download, seconds (default: 20)
    pub download_timeout_secs: u64,
    /// Host that echoes the caller's public IP over HTTPS (default: "ipv4.icanhazip.com")
    pub ip_echo_host: String,
    /// Host serving the throughput reference file (default: "proof.ovh.net")
    pub reference_host: String,
    /// Path of the throughput reference file (default: "/files/100Kb.dat")
    pub reference_path: String,
    /// Whether targeted runs may include soft-deleted endpoints (default: true)
    pub test_deleted_targets: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "proxygauge.db".to_string(),
            window_size: 5,
            connect_timeout_secs: 30,
            download_timeout_secs: 20,
            ip_echo_host: "ipv4.icanhazip.com".to_string(),
            reference_host: "proof.ovh.net".to_string(),
            reference_path: "/files/100Kb.dat".to_string(),
            test_deleted_targets: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PROXYGAUGE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `PROXYGAUGE_DB_PATH`: Database file path (default: "proxygauge.db")
    /// - `PROXYGAUGE_WINDOW_SIZE`: Concurrent tests per window (default: 5)
    /// - `PROXYGAUGE_CONNECT_TIMEOUT_SECS`: Connectivity deadline (default: 30)
    /// - `PROXYGAUGE_DOWNLOAD_TIMEOUT_SECS`: Throughput deadline (default: 20)
    /// - `PROXYGAUGE_IP_ECHO_HOST`: IP echo host (default: "ipv4.icanhazip.com")
    /// - `PROXYGAUGE_REFERENCE_HOST`: Reference file host (default: "proof.ovh.net")
    /// - `PROXYGAUGE_REFERENCE_PATH`: Reference file path (default: "/files/100Kb.dat")
    /// - `PROXYGAUGE_TEST_DELETED_TARGETS`: Include soft-deleted endpoints in
    ///   targeted runs, "true" or "false" (default: true)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("PROXYGAUGE_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("PROXYGAUGE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(window_str) = env::var("PROXYGAUGE_WINDOW_SIZE") {
            if let Ok(window) = window_str.parse::<usize>() {
                if window > 0 {
                    cfg.window_size = window;
                }
            }
        }

        if let Ok(secs_str) = env::var("PROXYGAUGE_CONNECT_TIMEOUT_SECS") {
            if let Ok(secs) = secs_str.parse::<u64>() {
                if secs > 0 {
                    cfg.connect_timeout_secs = secs;
                }
            }
        }

        if let Ok(secs_str) = env::var("PROXYGAUGE_DOWNLOAD_TIMEOUT_SECS") {
            if let Ok(secs) = secs_str.parse::<u64>() {
                if secs > 0 {
                    cfg.download_timeout_secs = secs;
                }
            }
        }

        if let Ok(host) = env::var("PROXYGAUGE_IP_ECHO_HOST") {
            cfg.ip_echo_host = host;
        }

        if let Ok(host) = env::var("PROXYGAUGE_REFERENCE_HOST") {
            cfg.reference_host = host;
        }

        if let Ok(path) = env::var("PROXYGAUGE_REFERENCE_PATH") {
            cfg.reference_path = path;
        }

        if let Ok(flag) = env::var("PROXYGAUGE_TEST_DELETED_TARGETS") {
            cfg.test_deleted_targets = flag == "1" || flag.eq_ignore_ascii_case("true");
        }

        cfg
    }
}
