//! Reachability probe for a single proxy endpoint.
//!
//! A probe opens a TCP connection and performs the smallest handshake an
//! HTTP proxy must understand: a `CONNECT` request. Anything that answers with
//! an HTTP status line is considered alive, even a 407 or 403, since those
//! still prove a proxy is listening.

use crate::types::{ProxyEndpoint, VerificationResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Target used in the `CONNECT` handshake.
const PROBE_TARGET: &str = "users.roblox.com:443";

/// Probe `endpoint`, giving the whole exchange `timeout` to complete.
pub async fn probe_endpoint(endpoint: &ProxyEndpoint, timeout: Duration) -> VerificationResult {
    let success = matches!(
        tokio::time::timeout(timeout, handshake(endpoint)).await,
        Ok(Ok(true))
    );

    tracing::trace!(proxy = %endpoint, success, "probe finished");

    VerificationResult {
        host: endpoint.host.clone(),
        port: endpoint.port,
        success,
    }
}

async fn handshake(endpoint: &ProxyEndpoint) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;

    let request = format!(
        "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n",
        target = PROBE_TARGET
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 16];
    let mut read = 0;
    while read < 5 {
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }

    Ok(buf[..read].starts_with(b"HTTP/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener_replying(reply: &'static [u8]) -> ProxyEndpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(reply).await;
            }
        });
        ProxyEndpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_http_status_line_counts_as_alive() {
        let endpoint = listener_replying(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let result = probe_endpoint(&endpoint, Duration::from_secs(2)).await;
        assert!(result.success);
        assert_eq!(result.endpoint(), endpoint);
    }

    #[tokio::test]
    async fn test_non_http_reply_fails() {
        let endpoint = listener_replying(b"SSH-2.0-OpenSSH\r\n").await;
        let result = probe_endpoint(&endpoint, Duration::from_secs(2)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = ProxyEndpoint::new("127.0.0.1", port);
        let result = probe_endpoint(&endpoint, Duration::from_secs(2)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_silent_listener_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let result = probe_endpoint(
            &ProxyEndpoint::new("127.0.0.1", port),
            Duration::from_millis(200),
        )
        .await;
        assert!(!result.success);
    }
}
