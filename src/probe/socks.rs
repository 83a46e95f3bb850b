//! SOCKS5 CONNECT tunnel establishment.
//!
//! Implements the RFC 1928 greeting/method/connect exchange with optional
//! RFC 1929 username/password sub-negotiation.

use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::ConnectError;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a SOCKS5 CONNECT tunnel through `proxy_host:proxy_port` to
/// `dest_host:dest_port`.
///
/// A single attempt with no retries. The TCP connect and the entire
/// handshake run under one deadline; on expiry the socket is dropped and
/// `ConnectError::Timeout` is returned. On success the stream is positioned
/// at the first relay byte.
pub async fn open_tunnel(
    proxy_host: &str,
    proxy_port: u16,
    auth: Option<(&str, &str)>,
    dest_host: &str,
    dest_port: u16,
    deadline: Duration,
) -> Result<TcpStream, ConnectError> {
    let attempt = async {
        let mut stream = TcpStream::connect((proxy_host, proxy_port))
            .await
            .map_err(classify_connect_error)?;
        handshake(&mut stream, auth, dest_host, dest_port).await?;
        Ok(stream)
    };

    match timeout(deadline, attempt).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::Timeout(deadline)),
    }
}

/// Run the SOCKS5 exchange on an established stream.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    auth: Option<(&str, &str)>,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&build_greeting(auth.is_some()))
        .await
        .map_err(io_protocol)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(io_protocol)?;
    if reply[0] != SOCKS_VERSION {
        return Err(ConnectError::Protocol(format!(
            "unexpected SOCKS version in method reply: {:#04x}",
            reply[0]
        )));
    }
    match reply[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let (user, pass) = auth.ok_or_else(|| {
                ConnectError::Protocol(
                    "server requires username/password but no credentials are configured"
                        .to_string(),
                )
            })?;
            authenticate(stream, user, pass).await?;
        }
        METHOD_NONE_ACCEPTABLE => {
            return Err(ConnectError::AuthRejected(
                "no acceptable authentication methods".to_string(),
            ));
        }
        other => {
            return Err(ConnectError::Protocol(format!(
                "server selected unsupported method {:#04x}",
                other
            )));
        }
    }

    let request = build_connect_request(dest_host, dest_port)?;
    stream.write_all(&request).await.map_err(io_protocol)?;
    read_connect_reply(stream).await
}

/// RFC 1929 username/password sub-negotiation.
async fn authenticate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_auth_request(user, pass)?;
    stream.write_all(&request).await.map_err(io_protocol)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(io_protocol)?;
    if reply[1] != 0x00 {
        return Err(ConnectError::AuthRejected(format!(
            "username/password rejected with status {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.map_err(io_protocol)?;
    if head[0] != SOCKS_VERSION {
        return Err(ConnectError::Protocol(format!(
            "unexpected SOCKS version in connect reply: {:#04x}",
            head[0]
        )));
    }
    match head[1] {
        0x00 => {}
        0x05 => {
            return Err(ConnectError::Refused(
                "destination host refused the tunnel".to_string(),
            ));
        }
        code => {
            return Err(ConnectError::Protocol(format!(
                "connect rejected: {}",
                describe_reply(code)
            )));
        }
    }

    // Drain the bind address so the stream is positioned at relay bytes.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_protocol)?;
            len[0] as usize
        }
        other => {
            return Err(ConnectError::Protocol(format!(
                "unknown address type in connect reply: {:#04x}",
                other
            )));
        }
    };
    let mut bind = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bind).await.map_err(io_protocol)?;

    Ok(())
}

/// Build the greeting, offering no-auth and optionally username/password.
pub(crate) fn build_greeting(offer_user_pass: bool) -> Vec<u8> {
    if offer_user_pass {
        vec![SOCKS_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        vec![SOCKS_VERSION, 0x01, METHOD_NO_AUTH]
    }
}

pub(crate) fn build_auth_request(user: &str, pass: &str) -> Result<Vec<u8>, ConnectError> {
    if user.len() > 255 || pass.len() > 255 {
        return Err(ConnectError::Protocol(
            "username or password longer than 255 bytes".to_string(),
        ));
    }
    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user.as_bytes());
    request.push(pass.len() as u8);
    request.extend_from_slice(pass.as_bytes());
    Ok(request)
}

/// Build the CONNECT request for an IP literal or a domain name.
pub(crate) fn build_connect_request(
    dest_host: &str,
    dest_port: u16,
) -> Result<Vec<u8>, ConnectError> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match dest_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if dest_host.len() > 255 {
                return Err(ConnectError::Protocol(format!(
                    "destination host too long: {} bytes",
                    dest_host.len()
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(dest_host.len() as u8);
            request.extend_from_slice(dest_host.as_bytes());
        }
    }
    request.extend_from_slice(&dest_port.to_be_bytes());
    Ok(request)
}

/// RFC 1928 reply code text.
pub(crate) fn describe_reply(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

fn classify_connect_error(e: io::Error) -> ConnectError {
    if e.kind() == io::ErrorKind::ConnectionRefused {
        ConnectError::Refused(e.to_string())
    } else {
        ConnectError::Protocol(format!("connect failed: {}", e))
    }
}

fn io_protocol(e: io::Error) -> ConnectError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ConnectError::Protocol("connection closed during handshake".to_string())
    } else {
        ConnectError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_greeting_bytes() {
        assert_eq!(build_greeting(false), vec![0x05, 0x01, 0x00]);
        assert_eq!(build_greeting(true), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn test_auth_request_bytes() {
        let req = build_auth_request("user", "pw").unwrap();
        assert_eq!(req[0], 0x01);
        assert_eq!(req[1], 4);
        assert_eq!(&req[2..6], b"user");
        assert_eq!(req[6], 2);
        assert_eq!(&req[7..9], b"pw");

        assert!(build_auth_request(&"x".repeat(256), "pw").is_err());
    }

    #[test]
    fn test_connect_request_domain() {
        let req = build_connect_request("example.com", 443).unwrap();
        assert_eq!(&req[..3], &[0x05, 0x01, 0x00]);
        assert_eq!(req[3], 0x03);
        assert_eq!(req[4], 11);
        assert_eq!(&req[5..16], b"example.com");
        assert_eq!(&req[16..], &[0x01, 0xBB]);

        assert!(build_connect_request(&"a".repeat(256), 443).is_err());
    }

    #[test]
    fn test_connect_request_ip_literals() {
        let req = build_connect_request("192.0.2.7", 1080).unwrap();
        assert_eq!(req[3], 0x01);
        assert_eq!(&req[4..8], &[192, 0, 2, 7]);
        assert_eq!(&req[8..], &[0x04, 0x38]);

        let req = build_connect_request("2001:db8::1", 443).unwrap();
        assert_eq!(req[3], 0x04);
        assert_eq!(req.len(), 4 + 16 + 2);
    }

    #[tokio::test]
    async fn test_handshake_no_auth() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&build_connect_request("example.com", 443).unwrap())
            .read(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x10, 0x10])
            .build();
        handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_with_credentials() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&build_auth_request("user", "pw").unwrap())
            .read(&[0x01, 0x00])
            .write(&build_connect_request("example.com", 443).unwrap())
            .read(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50])
            .build();
        handshake(&mut stream, Some(("user", "pw")), "example.com", 443)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_rejected() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x02, 0x00, 0x02])
            .read(&[0x05, 0x02])
            .write(&build_auth_request("user", "bad").unwrap())
            .read(&[0x01, 0x01])
            .build();
        let err = handshake(&mut stream, Some(("user", "bad")), "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_handshake_no_acceptable_method() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0xFF])
            .build();
        let err = handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::AuthRejected(_)));
    }

    #[tokio::test]
    async fn test_handshake_method_without_credentials() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x02])
            .build();
        let err = handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_handshake_destination_refused() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&build_connect_request("example.com", 443).unwrap())
            .read(&[0x05, 0x05, 0x00, 0x01])
            .build();
        let err = handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Refused(_)));
    }

    #[tokio::test]
    async fn test_handshake_host_unreachable_reply() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&build_connect_request("example.com", 443).unwrap())
            .read(&[0x05, 0x04, 0x00, 0x01])
            .build();
        let err = handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Protocol(_)));
        assert!(err.to_string().contains("host unreachable"));
    }

    #[tokio::test]
    async fn test_handshake_drains_domain_bind_address() {
        let mut reply = vec![0x05, 0x00, 0x00, 0x03, 0x04];
        reply.extend_from_slice(b"gate");
        reply.extend_from_slice(&[0x04, 0x38]);
        // The mock stream panics on drop if the bind address goes unread.
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x05, 0x01, 0x00])
            .read(&[0x05, 0x00])
            .write(&build_connect_request("example.com", 443).unwrap())
            .read(&reply)
            .build();
        handshake(&mut stream, None, "example.com", 443)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_tunnel_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            socket.write_all(&[0x05, 0x00]).await.unwrap();
            let mut request = [0u8; 18];
            socket.read_exact(&mut request).await.unwrap();
            socket
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();
        });

        open_tunnel(
            "127.0.0.1",
            addr.port(),
            None,
            "example.com",
            443,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_open_tunnel_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = open_tunnel(
            "127.0.0.1",
            addr.port(),
            None,
            "example.com",
            443,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectError::Refused(_)));
    }

    #[tokio::test]
    async fn test_open_tunnel_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = open_tunnel(
            "127.0.0.1",
            addr.port(),
            None,
            "example.com",
            443,
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectError::Timeout(_)));
        assert!(err.to_string().contains("timeout"));
        silent.abort();
    }
}
