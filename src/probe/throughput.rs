//! Throughput probe: timed reference download through the tunnel.

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

use super::{find_subsequence, http_get_request, open_tunnel, ConnectError, ProbeSettings};

/// Upper bound on the buffered header block of the reference response.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Download the reference file through the tunnel and compute effective kbps.
///
/// The clock starts before the tunnel opens, so the figure reflects the full
/// cost of moving the file through a fresh tunnel. A tunnel-open failure or
/// deadline expiry is an error; any failure after the tunnel is up counts as
/// an interrupted download and measures 0.
pub async fn measure_throughput(
    proxy_host: &str,
    proxy_port: u16,
    auth: Option<(&str, &str)>,
    settings: &ProbeSettings,
) -> Result<i64, ConnectError> {
    let deadline = settings.download_timeout;
    let started = Instant::now();

    let attempt = async {
        let stream = open_tunnel(
            proxy_host,
            proxy_port,
            auth,
            &settings.reference_host,
            443,
            deadline,
        )
        .await?;

        match download(stream, settings).await {
            Ok(bytes) => Ok(bytes),
            Err(reason) => {
                tracing::debug!("Throughput: download interrupted: {}", reason);
                Ok(0)
            }
        }
    };

    match timeout(deadline, attempt).await {
        Ok(Ok(bytes)) => Ok(compute_kbps(bytes, started.elapsed())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ConnectError::Timeout(deadline)),
    }
}

async fn download(stream: TcpStream, settings: &ProbeSettings) -> Result<u64, String> {
    let server_name = ServerName::try_from(settings.reference_host.clone())
        .map_err(|e| format!("invalid TLS server name: {}", e))?;
    let mut tls = settings
        .tls
        .connect(server_name, stream)
        .await
        .map_err(|e| format!("TLS handshake failed: {}", e))?;

    tls.write_all(http_get_request(&settings.reference_host, &settings.reference_path).as_bytes())
        .await
        .map_err(|e| format!("request write failed: {}", e))?;

    let mut counter = BodyCounter::new();
    let mut chunk = [0u8; 8192];
    loop {
        match tls.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => counter.feed(&chunk[..n])?,
            // Missing close_notify at end of a close-delimited response.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(format!("read failed: {}", e)),
        }
    }
    Ok(counter.body_bytes())
}

/// Counts response body bytes as raw segments arrive, skipping the header
/// block even when the terminator lands across a segment boundary. A header
/// block that passes `MAX_HEADER_BYTES` without terminating is rejected.
struct BodyCounter {
    in_body: bool,
    head: Vec<u8>,
    bytes: u64,
}

impl BodyCounter {
    fn new() -> Self {
        Self {
            in_body: false,
            head: Vec::new(),
            bytes: 0,
        }
    }

    fn feed(&mut self, segment: &[u8]) -> Result<(), String> {
        if self.in_body {
            self.bytes += segment.len() as u64;
            return Ok(());
        }
        self.head.extend_from_slice(segment);
        if let Some(pos) = find_subsequence(&self.head, b"\r\n\r\n") {
            self.in_body = true;
            self.bytes = (self.head.len() - pos - 4) as u64;
        } else if self.head.len() > MAX_HEADER_BYTES {
            return Err(format!("header block exceeded {} bytes", MAX_HEADER_BYTES));
        }
        Ok(())
    }

    fn body_bytes(&self) -> u64 {
        self.bytes
    }
}

/// kbps = (bytes * 8) / (elapsed seconds * 1024), rounded to nearest.
pub(crate) fn compute_kbps(bytes: u64, elapsed: Duration) -> i64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0;
    }
    ((bytes as f64 * 8.0) / (secs * 1024.0)).round() as i64
}
