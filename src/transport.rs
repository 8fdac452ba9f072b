//! Signaling transport facade.
//!
//! `SipTransport` is the narrow seam the state machines talk through: one
//! client round-trip per candidate (`transact` streams responses until the
//! final one, `request` keeps only the final), plus one-shot `send` for
//! ACK, BYE and responses to inbound requests. `NetTransport` implements
//! the seam over UDP, TCP and TLS; tests may substitute their own.
//!
//! Transport-level trouble (bind, connect, send, response timeout) is
//! reported as `Error::Transport`, which the registration machine treats
//! as "advance to the next candidate". SIP-level rejections come back as
//! parsed responses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::core::{Error, Result, TransportConfig, TransportKind};
use crate::message::SipMessage;
use crate::resolver::Candidate;

#[async_trait]
pub trait SipTransport: Send + Sync {
    /// Send a request and stream back the responses it elicits. The
    /// channel closes after the final response or the response timeout.
    async fn transact(
        &self,
        cand: &Candidate,
        msg: &SipMessage,
    ) -> Result<mpsc::Receiver<SipMessage>>;

    /// One-shot send with no response expected.
    async fn send(&self, cand: &Candidate, msg: &SipMessage) -> Result<()>;

    /// Send a request and wait for its final response, skipping
    /// provisionals.
    async fn request(&self, cand: &Candidate, msg: &SipMessage) -> Result<SipMessage> {
        let mut rx = self.transact(cand, msg).await?;
        while let Some(resp) = rx.recv().await {
            match resp.status() {
                Some(status) if status < 200 => continue,
                Some(_) => return Ok(resp),
                None => continue,
            }
        }
        Err(Error::Transport("no final response".into()))
    }
}

/// Network client transport.
pub struct NetTransport {
    response_timeout: Duration,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl NetTransport {
    pub fn new(config: &TransportConfig) -> Self {
        NetTransport {
            response_timeout: config.response_timeout,
            tls: config.tls.clone(),
        }
    }

    async fn udp_socket_for(cand: &Candidate) -> Result<UdpSocket> {
        let bind = if cand.addr.is_ipv6() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        UdpSocket::bind(bind)
            .await
            .map_err(|e| Error::Transport(format!("udp bind: {}", e)))
    }

    async fn tcp_connect(&self, cand: &Candidate) -> Result<TcpStream> {
        timeout(self.response_timeout, TcpStream::connect(cand.addr))
            .await
            .map_err(|_| Error::Transport(format!("connect {}: timed out", cand.addr)))?
            .map_err(|e| Error::Transport(format!("connect {}: {}", cand.addr, e)))
    }

    async fn udp_transact(
        &self,
        cand: &Candidate,
        data: Vec<u8>,
    ) -> Result<mpsc::Receiver<SipMessage>> {
        let socket = Self::udp_socket_for(cand).await?;
        socket
            .connect(cand.addr)
            .await
            .map_err(|e| Error::Transport(format!("udp connect {}: {}", cand.addr, e)))?;
        socket
            .send(&data)
            .await
            .map_err(|e| Error::Transport(format!("udp send {}: {}", cand.addr, e)))?;

        let (tx, rx) = mpsc::channel(8);
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            // A provisional response keeps the transaction alive; the
            // deadline restarts on every message.
            let mut deadline = Instant::now() + timeout;
            loop {
                let n = match timeout_at(deadline, socket.recv(&mut buf)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) | Err(_) => break,
                };
                deadline = Instant::now() + timeout;
                match SipMessage::parse(&buf[..n]) {
                    Ok(resp) if resp.is_response() => {
                        let is_final = resp.status().is_some_and(|s| s >= 200);
                        if tx.send(resp).await.is_err() || is_final {
                            break;
                        }
                    }
                    Ok(_) => trace!("ignoring request on client socket"),
                    Err(e) => debug!("dropping unparseable datagram: {}", e),
                }
            }
        });
        Ok(rx)
    }

    async fn stream_transact<S>(
        &self,
        mut stream: S,
        data: Vec<u8>,
    ) -> Result<mpsc::Receiver<SipMessage>>
    where
        S: AsyncReadExt + AsyncWriteExt + Unpin + Send + 'static,
    {
        stream
            .write_all(&data)
            .await
            .map_err(|e| Error::Transport(format!("stream send: {}", e)))?;

        let (tx, rx) = mpsc::channel(8);
        let timeout = self.response_timeout;
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = vec![0u8; 16384];
            let mut deadline = Instant::now() + timeout;
            loop {
                while let Some(parsed) = extract_message(&mut buf) {
                    deadline = Instant::now() + timeout;
                    match parsed {
                        Ok(resp) if resp.is_response() => {
                            let is_final = resp.status().is_some_and(|s| s >= 200);
                            if tx.send(resp).await.is_err() || is_final {
                                return;
                            }
                        }
                        Ok(_) => trace!("ignoring request on client stream"),
                        Err(e) => {
                            debug!("dropping unparseable stream data: {}", e);
                            return;
                        }
                    }
                }
                let n = match timeout_at(deadline, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return,
                    Ok(Ok(n)) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
            }
        });
        Ok(rx)
    }

    async fn tls_stream(
        &self,
        cand: &Candidate,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let config = self
            .tls
            .clone()
            .ok_or_else(|| Error::Transport("tls client not configured".into()))?;
        let tcp = self.tcp_connect(cand).await?;
        let name = ServerName::try_from(cand.host.clone())
            .map_err(|_| Error::Transport(format!("bad tls server name: {}", cand.host)))?;
        TlsConnector::from(config)
            .connect(name, tcp)
            .await
            .map_err(|e| Error::Transport(format!("tls handshake {}: {}", cand.addr, e)))
    }
}

#[async_trait]
impl SipTransport for NetTransport {
    async fn transact(
        &self,
        cand: &Candidate,
        msg: &SipMessage,
    ) -> Result<mpsc::Receiver<SipMessage>> {
        let data = msg.to_bytes();
        trace!(candidate = %cand, bytes = data.len(), "transact");
        match cand.kind {
            TransportKind::Udp => self.udp_transact(cand, data).await,
            TransportKind::Tcp => {
                let stream = self.tcp_connect(cand).await?;
                self.stream_transact(stream, data).await
            }
            TransportKind::Tls => {
                let stream = self.tls_stream(cand).await?;
                self.stream_transact(stream, data).await
            }
        }
    }

    async fn send(&self, cand: &Candidate, msg: &SipMessage) -> Result<()> {
        let data = msg.to_bytes();
        match cand.kind {
            TransportKind::Udp => {
                let socket = Self::udp_socket_for(cand).await?;
                socket
                    .send_to(&data, cand.addr)
                    .await
                    .map_err(|e| Error::Transport(format!("udp send {}: {}", cand.addr, e)))?;
            }
            TransportKind::Tcp => {
                let mut stream = self.tcp_connect(cand).await?;
                stream
                    .write_all(&data)
                    .await
                    .map_err(|e| Error::Transport(format!("tcp send: {}", e)))?;
            }
            TransportKind::Tls => {
                let mut stream = self.tls_stream(cand).await?;
                stream
                    .write_all(&data)
                    .await
                    .map_err(|e| Error::Transport(format!("tls send: {}", e)))?;
            }
        }
        Ok(())
    }
}

/// Pull one complete SIP message off the front of a stream buffer.
/// Returns `None` until the head section and declared body are complete.
fn extract_message(buf: &mut Vec<u8>) -> Option<Result<SipMessage>> {
    let head_end = find_subslice(buf, b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let content_length: usize = head
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);
    let total = head_end + content_length;
    if buf.len() < total {
        return None;
    }
    let parsed = SipMessage::parse(&buf[..total]);
    buf.drain(..total);
    Some(parsed)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;

    fn response_bytes(status: u16, body: &[u8]) -> Vec<u8> {
        let mut resp = SipMessage::response(status, "OK");
        resp.set_header("CSeq", "1 REGISTER");
        if !body.is_empty() {
            resp.set_body("application/sdp", body.to_vec());
        }
        resp.to_bytes()
    }

    #[test]
    fn extract_handles_partial_and_pipelined_messages() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"SIP/2.0 200 OK\r\nCSeq: 1 REG");
        assert!(extract_message(&mut buf).is_none());

        buf.clear();
        buf.extend_from_slice(&response_bytes(100, b""));
        buf.extend_from_slice(&response_bytes(200, b"v=0\r\n"));
        let first = extract_message(&mut buf).unwrap().unwrap();
        assert_eq!(first.status(), Some(100));
        let second = extract_message(&mut buf).unwrap().unwrap();
        assert_eq!(second.status(), Some(200));
        assert_eq!(second.body(), b"v=0\r\n");
        assert!(extract_message(&mut buf).is_none());
    }

    #[test]
    fn extract_waits_for_declared_body() {
        let mut full = response_bytes(200, b"0123456789");
        let cut = full.len() - 4;
        let mut buf = full[..cut].to_vec();
        assert!(extract_message(&mut buf).is_none());
        buf.extend_from_slice(&full.split_off(cut));
        assert!(extract_message(&mut buf).unwrap().is_ok());
    }

    #[tokio::test]
    async fn udp_round_trip_against_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            server
                .send_to(&response_bytes(200, b""), from)
                .await
                .unwrap();
        });

        let transport = NetTransport::new(&TransportConfig {
            response_timeout: Duration::from_secs(2),
            ..TransportConfig::default()
        });
        let cand = Candidate {
            kind: TransportKind::Udp,
            addr: server_addr,
            host: "127.0.0.1".into(),
        };
        let req = SipMessage::request(SipMethod::Register, "sip:127.0.0.1");
        let resp = transport.request(&cand, &req).await.unwrap();
        assert_eq!(resp.status(), Some(200));
    }

    #[tokio::test]
    async fn refused_tcp_candidate_is_a_transport_error() {
        let transport = NetTransport::new(&TransportConfig {
            response_timeout: Duration::from_millis(500),
            ..TransportConfig::default()
        });
        // Bind and drop to get a port nothing listens on.
        let unused = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let cand = Candidate {
            kind: TransportKind::Tcp,
            addr: unused,
            host: "127.0.0.1".into(),
        };
        let req = SipMessage::request(SipMethod::Register, "sip:127.0.0.1");
        let err = transport.request(&cand, &req).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn tls_without_client_config_is_a_transport_error() {
        let transport = NetTransport::new(&TransportConfig::default());
        let cand = Candidate {
            kind: TransportKind::Tls,
            addr: "127.0.0.1:5061".parse().unwrap(),
            host: "example.com".into(),
        };
        let req = SipMessage::request(SipMethod::Register, "sips:example.com");
        let err = transport.request(&cand, &req).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
