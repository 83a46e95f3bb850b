//! Connectivity probe: latency and external IP through the tunnel.

use std::net::IpAddr;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;

use super::{find_subsequence, http_get_request, open_tunnel, ConnectError, ProbeSettings};

/// Upper bound on the buffered echo response; the expected body is one IP.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Outcome of a successful connectivity probe.
#[derive(Debug, Clone)]
pub struct ConnectivityReport {
    pub latency_ms: i64,
    pub external_ip: String,
}

/// Probe the tunnel by fetching the caller's public IP from the echo host.
///
/// Latency covers the tunnel open, the TLS handshake, and the full response
/// read, reported as one wall-clock number. The whole probe runs under the
/// connect deadline.
pub async fn check_connectivity(
    proxy_host: &str,
    proxy_port: u16,
    auth: Option<(&str, &str)>,
    settings: &ProbeSettings,
) -> Result<ConnectivityReport, ConnectError> {
    let deadline = settings.connect_timeout;
    let started = Instant::now();

    let attempt = async {
        let stream = open_tunnel(
            proxy_host,
            proxy_port,
            auth,
            &settings.ip_echo_host,
            443,
            deadline,
        )
        .await?;

        let server_name = ServerName::try_from(settings.ip_echo_host.clone())
            .map_err(|e| ConnectError::Protocol(format!("invalid TLS server name: {}", e)))?;
        let mut tls = settings
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| ConnectError::Protocol(format!("TLS handshake failed: {}", e)))?;

        tls.write_all(http_get_request(&settings.ip_echo_host, "/").as_bytes())
            .await
            .map_err(|e| ConnectError::Protocol(format!("request write failed: {}", e)))?;

        let mut response = Vec::new();
        read_to_end_lenient(&mut tls, &mut response).await?;

        let body = parse_http_response(&response)?;
        let ip = std::str::from_utf8(&body)
            .ok()
            .map(str::trim)
            .filter(|s| s.parse::<IpAddr>().is_ok())
            .ok_or_else(|| {
                ConnectError::Protocol("echo host response is not an IP address".to_string())
            })?
            .to_string();
        Ok(ip)
    };

    match timeout(deadline, attempt).await {
        Ok(Ok(external_ip)) => Ok(ConnectivityReport {
            latency_ms: started.elapsed().as_millis() as i64,
            external_ip,
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ConnectError::Timeout(deadline)),
    }
}

/// Read until EOF, refusing responses past `MAX_RESPONSE_BYTES`. Servers
/// often close without a TLS close_notify, so a truncated stream counts as
/// end of response.
async fn read_to_end_lenient<S>(stream: &mut S, buf: &mut Vec<u8>) -> Result<(), ConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => return Ok(()),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_RESPONSE_BYTES {
                    return Err(ConnectError::Protocol(format!(
                        "response exceeded {} bytes",
                        MAX_RESPONSE_BYTES
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(ConnectError::Protocol(format!("read failed: {}", e))),
        }
    }
}

/// Parse a close-delimited HTTP/1.1 response, returning the body bytes.
///
/// Requires a 200 status. Chunked transfer-encoding is decoded since the
/// echo host answers HTTP/1.1 requests chunked.
pub(crate) fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>, ConnectError> {
    let header_end = find_subsequence(raw, b"\r\n\r\n").ok_or_else(|| {
        ConnectError::Protocol("malformed HTTP response: no header terminator".to_string())
    })?;
    let head = std::str::from_utf8(&raw[..header_end]).map_err(|_| {
        ConnectError::Protocol("malformed HTTP response: non-UTF8 headers".to_string())
    })?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            ConnectError::Protocol(format!("malformed HTTP status line: {}", status_line))
        })?;
    if status != 200 {
        return Err(ConnectError::Protocol(format!(
            "unexpected HTTP status {}",
            status
        )));
    }

    let chunked = lines.any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("transfer-encoding:") && lower.contains("chunked")
    });

    let body = &raw[header_end + 4..];
    if chunked {
        decode_chunked(body)
    } else {
        Ok(body.to_vec())
    }
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>, ConnectError> {
    let mut decoded = Vec::new();
    loop {
        let line_end = find_subsequence(body, b"\r\n").ok_or_else(|| {
            ConnectError::Protocol("malformed chunked body: missing size line".to_string())
        })?;
        let size_token = std::str::from_utf8(&body[..line_end])
            .map_err(|_| ConnectError::Protocol("malformed chunk size".to_string()))?
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let size = usize::from_str_radix(&size_token, 16)
            .map_err(|_| ConnectError::Protocol(format!("malformed chunk size: {}", size_token)))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(decoded);
        }
        if body.len() < size {
            return Err(ConnectError::Protocol("truncated chunked body".to_string()));
        }
        decoded.extend_from_slice(&body[..size]);
        body = &body[size..];
        if body.starts_with(b"\r\n") {
            body = &body[2..];
        }
    }
}
