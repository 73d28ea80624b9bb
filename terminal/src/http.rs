//! # HTTP Transport
//!
//! A deliberately minimal HTTP/1.1 JSON client over `tokio::net::TcpStream`
//! implementing [`SyncTransport`]. The terminal makes exactly two kinds of
//! request to exactly one server; a full HTTP client crate buys nothing
//! here except dependency weight on a device that ships by the thousand.
//!
//! Every request is one connection: connect, write, read to EOF
//! (`Connection: close`), parse. The whole exchange sits under a single
//! hard timeout, after which the call reports [`TransportError::Timeout`]
//! and the sync engine drops to offline.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use farebox_core::sync::engine::{SyncTransport, TransportError};
use farebox_core::sync::wire::{
    HeartbeatRequest, HeartbeatResponse, SyncRequest, SyncResponse,
};

/// HTTP transport for one terminal talking to one server.
pub struct HttpTransport {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HttpTransport {
    /// Parses a base URL of the form `http://host:port` (path ignored).
    ///
    /// Rejects anything else up front — better to fail at startup than to
    /// quietly heartbeat into the void.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, String> {
        let rest = server_url
            .strip_prefix("http://")
            .ok_or_else(|| format!("server url must start with http://: {server_url}"))?;
        let authority = rest.split('/').next().unwrap_or(rest);

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|e| format!("bad port in server url: {e}"))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), 80),
        };
        if host.is_empty() {
            return Err(format!("missing host in server url: {server_url}"));
        }

        Ok(Self {
            host,
            port,
            timeout,
        })
    }

    /// One POST round-trip: JSON in, JSON out, bounded by the timeout.
    async fn post_json<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, TransportError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| TransportError::Network(e.to_string()))?;

        let raw = tokio::time::timeout(self.timeout, self.exchange(path, &payload))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (status, body) = parse_response(&raw)?;
        if status != 200 {
            return Err(TransportError::Network(format!(
                "server returned HTTP {status} for {path}"
            )));
        }
        serde_json::from_slice(body).map_err(|e| {
            TransportError::Network(format!("malformed response body for {path}: {e}"))
        })
    }

    /// Connect, send the request, read the full response.
    async fn exchange(&self, path: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransportError::Network(format!("connect {addr}: {e}")))?;

        let request = format!(
            "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            self.host,
            payload.len(),
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        stream
            .write_all(payload)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(response)
    }
}

/// Splits a raw HTTP/1.1 response into (status code, body bytes).
fn parse_response(raw: &[u8]) -> Result<(u16, &[u8]), TransportError> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| TransportError::Network("truncated HTTP response".into()))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| TransportError::Network("non-UTF8 response headers".into()))?;

    // Status line: "HTTP/1.1 200 OK"
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| TransportError::Network(format!("bad status line: {head}")))?;

    Ok((status, &raw[header_end + 4..]))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn heartbeat(
        &self,
        req: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError> {
        self.post_json("/heartbeat", &req).await
    }

    async fn submit(&self, req: SyncRequest) -> Result<SyncResponse, TransportError> {
        self.post_json("/sync", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let t = HttpTransport::new("http://10.0.0.5:8443", Duration::from_secs(5)).unwrap();
        assert_eq!(t.host, "10.0.0.5");
        assert_eq!(t.port, 8443);
    }

    #[test]
    fn default_port_and_trailing_path() {
        let t = HttpTransport::new("http://fares.example/api", Duration::from_secs(5)).unwrap();
        assert_eq!(t.host, "fares.example");
        assert_eq!(t.port, 80);
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(HttpTransport::new("https://secure:443", Duration::from_secs(5)).is_err());
        assert!(HttpTransport::new("10.0.0.5:8443", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn parse_response_extracts_status_and_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\"ok\":true}";
        let (status, body) = parse_response(raw).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, b"{\"ok\":true}");
    }

    #[test]
    fn parse_response_rejects_truncation() {
        assert!(parse_response(b"HTTP/1.1 200 OK\r\nConten").is_err());
    }

    #[tokio::test]
    async fn connection_refused_is_a_network_error() {
        // Port 9 on localhost (discard) is almost certainly closed; a
        // refused connection must come back as Network, not a panic.
        let t = HttpTransport::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let result = t
            .heartbeat(HeartbeatRequest {
                terminal_id: "bus-42".into(),
                timestamp: chrono::Utc::now(),
            })
            .await;
        assert!(matches!(
            result,
            Err(TransportError::Network(_)) | Err(TransportError::Timeout)
        ));
    }
}
