//! Test fixtures: a loopback SIP registrar, an in-memory DNS record
//! table and a recording transport.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sipua::auth::{digest_response, parse_auth_params};
use sipua::prelude::*;

/// Opt-in test logging: `RUST_LOG=sipua=trace cargo test`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct AuthConfig {
    username: String,
    password: String,
    realm: String,
    nonce: String,
}

/// Shared server-side state, visible to event handlers.
pub struct ServerState {
    n_register: AtomicU32,
    last_transport: Mutex<Option<TransportKind>>,
    auth: Option<AuthConfig>,
    terminated: AtomicBool,
}

impl ServerState {
    pub fn n_register(&self) -> u32 {
        self.n_register.load(Ordering::SeqCst)
    }

    pub fn last_transport(&self) -> Option<TransportKind> {
        *self.last_transport.lock().unwrap()
    }

    /// Stop answering; in-flight sockets stay bound.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn handle(&self, req: &SipMessage, transport: TransportKind) -> Option<SipMessage> {
        if self.terminated.load(Ordering::SeqCst) {
            return None;
        }
        if req.method() != Some(SipMethod::Register) {
            return Some(SipMessage::reply_to(req, 501, "Not Implemented"));
        }
        self.n_register.fetch_add(1, Ordering::SeqCst);
        *self.last_transport.lock().unwrap() = Some(transport);

        if let Some(auth) = &self.auth {
            let authorized = req
                .header("Authorization")
                .map(|value| self.verify(auth, value, req))
                .unwrap_or(false);
            if !authorized {
                let mut resp = SipMessage::reply_to(req, 401, "Unauthorized");
                resp.set_header(
                    "WWW-Authenticate",
                    format!(
                        "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
                        auth.realm, auth.nonce
                    ),
                );
                return Some(resp);
            }
        }

        let mut resp = SipMessage::reply_to(req, 200, "OK");
        resp.set_header("Expires", req.expires().unwrap_or(60).to_string());
        if let Some(contact) = req.header("Contact") {
            resp.set_header("Contact", contact);
        }
        Some(resp)
    }

    fn verify(&self, auth: &AuthConfig, header: &str, req: &SipMessage) -> bool {
        let Some(rest) = header.trim().strip_prefix("Digest") else {
            return false;
        };
        let params = parse_auth_params(rest);
        let (Some(username), Some(uri), Some(response)) = (
            params.get("username"),
            params.get("uri"),
            params.get("response"),
        ) else {
            return false;
        };
        if username != &auth.username || params.get("nonce") != Some(&auth.nonce) {
            return false;
        }
        let method = req.method().map(|m| m.as_str()).unwrap_or("REGISTER");
        let expected = digest_response(
            &auth.username,
            &auth.realm,
            &auth.password,
            method,
            uri,
            &auth.nonce,
            None,
            None,
            None,
        );
        response == &expected
    }
}

/// Loopback SIP registrar answering REGISTER over UDP and TCP, with an
/// optional digest challenge round.
pub struct SipServer {
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    state: Arc<ServerState>,
    tasks: Vec<JoinHandle<()>>,
}

impl SipServer {
    pub async fn start() -> SipServer {
        Self::spawn(None).await
    }

    pub async fn start_auth(username: &str, password: &str, realm: &str) -> SipServer {
        Self::spawn(Some(AuthConfig {
            username: username.to_string(),
            password: password.to_string(),
            realm: realm.to_string(),
            nonce: "f00dface".to_string(),
        }))
        .await
    }

    async fn spawn(auth: Option<AuthConfig>) -> SipServer {
        let state = Arc::new(ServerState {
            n_register: AtomicU32::new(0),
            last_transport: Mutex::new(None),
            auth,
            terminated: AtomicBool::new(false),
        });

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = tcp.local_addr().unwrap();

        let udp_state = state.clone();
        let udp_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let Ok((n, from)) = udp.recv_from(&mut buf).await else {
                    break;
                };
                let Ok(req) = SipMessage::parse(&buf[..n]) else {
                    continue;
                };
                if let Some(resp) = udp_state.handle(&req, TransportKind::Udp) {
                    let _ = udp.send_to(&resp.to_bytes(), from).await;
                }
            }
        });

        let tcp_state = state.clone();
        let tcp_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = tcp.accept().await else {
                    break;
                };
                let state = tcp_state.clone();
                tokio::spawn(async move {
                    serve_tcp_connection(stream, state).await;
                });
            }
        });

        SipServer {
            udp_addr,
            tcp_addr,
            state,
            tasks: vec![udp_task, tcp_task],
        }
    }

    /// Address spec pointing straight at this server's socket; the
    /// numeric host keeps DNS out of the flow.
    pub fn aor(&self, transport: TransportKind) -> String {
        format!(
            "<sip:user:pass@{};transport={}>",
            self.addr(transport),
            transport.name()
        )
    }

    pub fn addr(&self, transport: TransportKind) -> SocketAddr {
        match transport {
            TransportKind::Tcp => self.tcp_addr,
            _ => self.udp_addr,
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }
}

impl Drop for SipServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_tcp_connection(mut stream: tokio::net::TcpStream, state: Arc<ServerState>) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 16384];
    loop {
        while let Some(total) = complete_message_len(&buf) {
            let Ok(req) = SipMessage::parse(&buf[..total]) else {
                return;
            };
            buf.drain(..total);
            if let Some(resp) = state.handle(&req, TransportKind::Tcp) {
                if stream.write_all(&resp.to_bytes()).await.is_err() {
                    return;
                }
            }
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn complete_message_len(buf: &[u8]) -> Option<usize> {
    let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&buf[..head_end]).ok()?;
    let content_length: usize = head
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);
    let total = head_end + content_length;
    (buf.len() >= total).then_some(total)
}

/// In-memory DNS record table: SRV rows per service name, A rows per
/// host.
pub struct FakeDns {
    srv: Mutex<HashMap<String, Vec<SrvRecord>>>,
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl FakeDns {
    pub fn new() -> FakeDns {
        FakeDns {
            srv: Mutex::new(HashMap::new()),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_srv(&self, service: &str, priority: u16, weight: u16, port: u16, target: &str) {
        self.srv
            .lock()
            .unwrap()
            .entry(service.to_string())
            .or_default()
            .push(SrvRecord {
                priority,
                weight,
                port,
                target: target.to_string(),
            });
    }

    pub fn add_a(&self, host: &str, ip: IpAddr) {
        self.hosts
            .lock()
            .unwrap()
            .entry(host.to_string())
            .or_default()
            .push(ip);
    }
}

#[async_trait]
impl DnsClient for FakeDns {
    async fn srv(&self, service: &str) -> sipua::Result<Vec<SrvRecord>> {
        Ok(self
            .srv
            .lock()
            .unwrap()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }

    async fn host(&self, name: &str) -> sipua::Result<Vec<IpAddr>> {
        Ok(self
            .hosts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Transport double for call tests: records everything, answers
/// `transact` from a scripted reply queue.
pub struct MockTransport {
    pub sent: Mutex<Vec<(Candidate, SipMessage)>>,
    replies: Mutex<VecDeque<SipMessage>>,
}

impl MockTransport {
    pub fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport {
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push_reply(&self, resp: SipMessage) {
        self.replies.lock().unwrap().push_back(resp);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Status/method summary of everything sent, oldest first.
    pub fn sent_summary(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, msg)| match (msg.method(), msg.status()) {
                (Some(m), _) => m.as_str().to_string(),
                (_, Some(s)) => s.to_string(),
                _ => "?".to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl SipTransport for MockTransport {
    async fn transact(
        &self,
        cand: &Candidate,
        msg: &SipMessage,
    ) -> sipua::Result<mpsc::Receiver<SipMessage>> {
        self.sent.lock().unwrap().push((cand.clone(), msg.clone()));
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(resp) => {
                let (tx, rx) = mpsc::channel(1);
                tx.send(resp).await.ok();
                Ok(rx)
            }
            None => Err(Error::Transport("no scripted reply".into())),
        }
    }

    async fn send(&self, cand: &Candidate, msg: &SipMessage) -> sipua::Result<()> {
        self.sent.lock().unwrap().push((cand.clone(), msg.clone()));
        Ok(())
    }
}

pub fn udp_candidate(addr: SocketAddr) -> Candidate {
    Candidate {
        kind: TransportKind::Udp,
        addr,
        host: addr.ip().to_string(),
    }
}
