//! The endpoint: UA registry lifecycle, event bus wiring and inbound
//! signaling routing.
//!
//! `Endpoint` composes the two process-wide services (registry, event
//! bus) with the resolver and transport facade and injects them into
//! every UA it allocates. `init` is the builder; `shutdown` asserts the
//! registry is empty, so callers destroy their UAs (or `stop_all`) first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::addr_uri;
use crate::core::{Aor, EndpointConfig, Error, Result, TransportKind};
use crate::event_system::EventBus;
use crate::message::{SipMessage, SipMethod};
use crate::resolver::{Candidate, DnsResolver};
use crate::transport::{NetTransport, SipTransport};
use crate::ua::{Ua, UaId, UaRegistry};

/// Monotonic handle allocator shared by the endpoint's components.
pub(crate) struct IdGen {
    ua: AtomicU64,
    call: AtomicU64,
}

impl IdGen {
    pub fn new() -> Self {
        IdGen {
            ua: AtomicU64::new(1),
            call: AtomicU64::new(1),
        }
    }

    pub fn next_ua(&self) -> u64 {
        self.ua.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_call(&self) -> u64 {
        self.call.fetch_add(1, Ordering::SeqCst)
    }
}

/// Shared service handles injected into UAs and calls.
#[derive(Clone)]
pub(crate) struct Services {
    pub bus: Arc<EventBus>,
    pub resolver: Arc<DnsResolver>,
    pub transport: Arc<dyn SipTransport>,
    pub config: Arc<EndpointConfig>,
    pub ids: Arc<IdGen>,
}

pub struct EndpointBuilder {
    config: EndpointConfig,
    resolver: Option<Arc<DnsResolver>>,
    transport: Option<Arc<dyn SipTransport>>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            config: EndpointConfig::default(),
            resolver: None,
            transport: None,
        }
    }

    pub fn user_agent(mut self, value: &str) -> Self {
        self.config.user_agent = value.to_string();
        self
    }

    pub fn reg_interval(mut self, seconds: u32) -> Self {
        self.config.reg_interval = seconds;
        self
    }

    pub fn reresolve_after(mut self, after: std::time::Duration) -> Self {
        self.config.reresolve_after = after;
        self
    }

    pub fn response_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.transport.response_timeout = timeout;
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.transport.listen_port = Some(port);
        self
    }

    pub fn media_addrs(mut self, addrs: Vec<std::net::IpAddr>) -> Self {
        self.config.media.local_addrs = addrs;
        self
    }

    pub fn tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.config.transport.tls = Some(config);
        self
    }

    /// Substitute the resolver, e.g. one pointed at a test DNS server.
    pub fn resolver(mut self, resolver: DnsResolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Substitute the signaling transport facade.
    pub fn transport(mut self, transport: Arc<dyn SipTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Arc<Endpoint>> {
        let config = Arc::new(self.config);
        let resolver = match self.resolver {
            Some(r) => r,
            None => Arc::new(DnsResolver::system()?),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(NetTransport::new(&config.transport)));
        let services = Services {
            bus: Arc::new(EventBus::new()),
            resolver,
            transport,
            config,
            ids: Arc::new(IdGen::new()),
        };
        Ok(Arc::new(Endpoint {
            services,
            registry: UaRegistry::new(),
            listener: Mutex::new(None),
        }))
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Endpoint {
    services: Services,
    registry: UaRegistry,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    /// Allocate a UA from an address spec.
    ///
    /// Parse failures (`MalformedAor`, `UnsupportedScheme`) are returned
    /// here and no UA comes into existence. On success the UA is
    /// appended to the registry and, unless `regint=0`, registration
    /// starts immediately.
    pub fn allocate(self: &Arc<Self>, aor_spec: &str) -> Result<Arc<Ua>> {
        let aor = Aor::parse(aor_spec)?;
        let interval = aor.regint().unwrap_or(self.services.config.reg_interval);
        let ua = Ua::new(
            UaId(self.services.ids.next_ua()),
            aor,
            self.services.clone(),
        );
        self.registry.insert(ua.clone());
        info!(ua = %ua.id(), aor = %ua.aor(), "allocated");
        if interval != 0 {
            ua.register(interval);
        }
        Ok(ua)
    }

    /// Destroy a UA: remove it from the registry first, cancel its
    /// registration attempt, terminate its calls (one call-closed event
    /// each), release. Safe to call from an event handler that is
    /// reacting to this UA's own event, and against double destruction.
    pub fn destroy(&self, ua: &Arc<Ua>) {
        // Remove first so lookups never see a UA mid-teardown; a second
        // destroy finds nothing to remove and teardown no-ops.
        let _ = self.registry.remove(ua.id());
        ua.teardown();
        info!(ua = %ua.id(), aor = %ua.aor(), "destroyed");
    }

    /// Exact-string match on the canonical AOR.
    pub fn find_by_aor(&self, canonical: &str) -> Option<Arc<Ua>> {
        self.registry.find_by_aor(canonical)
    }

    /// First UA in registry order whose parameter set carries `key`
    /// (and, when given, exactly `value`).
    pub fn find_by_param(&self, key: &str, value: Option<&str>) -> Option<Arc<Ua>> {
        self.registry.find_by_param(key, value)
    }

    /// Snapshot of the registry in insertion order.
    pub fn all(&self) -> Vec<Arc<Ua>> {
        self.registry.all()
    }

    pub fn count(&self) -> usize {
        self.registry.len()
    }

    /// Stop every UA. Graceful mode first runs one unregister round-trip
    /// per registered UA; forced mode cancels everything immediately.
    /// UAs stay allocated either way.
    pub async fn stop_all(&self, force: bool) {
        let uas = self.registry.all();
        if force {
            for ua in &uas {
                ua.cancel_registration();
            }
            return;
        }
        join_all(uas.iter().map(|ua| ua.unregister())).await;
    }

    /// Bind the inbound UDP listener when one is configured.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(port) = self.services.config.transport.listen_port else {
            return Ok(());
        };
        let addr = std::net::SocketAddr::new(self.services.config.transport.bind_addr, port);
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("listen {}: {}", addr, e)))?;
        info!(addr = %socket.local_addr().unwrap_or(addr), "listening");

        let endpoint = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                let (n, from) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("listener receive failed: {}", e);
                        break;
                    }
                };
                let Some(endpoint) = endpoint.upgrade() else { break };
                match SipMessage::parse(&buf[..n]) {
                    Ok(msg) if msg.is_request() => {
                        let source = Candidate {
                            kind: TransportKind::Udp,
                            addr: from,
                            host: from.ip().to_string(),
                        };
                        if let Err(e) = endpoint.route_incoming(msg, source).await {
                            debug!("inbound request dropped: {}", e);
                        }
                    }
                    Ok(_) => debug!("unmatched response from {}", from),
                    Err(e) => debug!("unparseable datagram from {}: {}", from, e),
                }
            }
        });
        *self.listener.lock().unwrap() = Some(task);
        Ok(())
    }

    /// Route one inbound request to the owning UA or call.
    pub async fn route_incoming(
        self: &Arc<Self>,
        req: SipMessage,
        source: Candidate,
    ) -> Result<()> {
        match req.method() {
            Some(SipMethod::Invite) => {
                let to = req
                    .header("To")
                    .ok_or_else(|| Error::Parse("INVITE without To".into()))?;
                let target = Aor::parse_uri(&addr_uri(to))?;
                match self.registry.find_by_aor(&target.canonical()) {
                    Some(ua) => {
                        ua.handle_invite(req, source).await?;
                        Ok(())
                    }
                    None => {
                        let resp = SipMessage::reply_to(&req, 404, "Not Found");
                        self.services.transport.send(&source, &resp).await
                    }
                }
            }
            Some(SipMethod::Bye) => match self.find_call_for(&req) {
                Some(call) => {
                    call.on_remote_bye(&req, &source).await;
                    Ok(())
                }
                None => {
                    let resp = SipMessage::reply_to(&req, 481, "Call Does Not Exist");
                    self.services.transport.send(&source, &resp).await
                }
            },
            Some(SipMethod::Cancel) => match self.find_call_for(&req) {
                Some(call) => {
                    call.on_remote_cancel(&req, &source).await;
                    Ok(())
                }
                None => {
                    let resp = SipMessage::reply_to(&req, 481, "Call Does Not Exist");
                    self.services.transport.send(&source, &resp).await
                }
            },
            Some(SipMethod::Ack) => Ok(()),
            _ => {
                let resp = SipMessage::reply_to(&req, 501, "Not Implemented");
                self.services.transport.send(&source, &resp).await
            }
        }
    }

    fn find_call_for(&self, req: &SipMessage) -> Option<Arc<crate::call::Call>> {
        let call_id = req.call_id()?;
        self.registry
            .all()
            .into_iter()
            .find_map(|ua| ua.find_call(call_id))
    }

    /// Tear the endpoint down. All UAs must have been destroyed.
    pub fn shutdown(&self) {
        if let Some(task) = self.listener.lock().unwrap().take() {
            task.abort();
        }
        debug_assert!(
            self.registry.is_empty(),
            "endpoint shut down with {} live UA(s)",
            self.registry.len()
        );
        if !self.registry.is_empty() {
            warn!(count = self.registry.len(), "shutdown with live UAs");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(task) = self.listener.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_errors_are_synchronous() {
        let endpoint = Endpoint::builder().build().unwrap();
        assert!(matches!(
            endpoint.allocate("no brackets no scheme"),
            Err(Error::MalformedAor(_))
        ));
        assert!(matches!(
            endpoint.allocate("mailto:user@example.com"),
            Err(Error::UnsupportedScheme(_))
        ));
        assert_eq!(endpoint.count(), 0);
        endpoint.shutdown();
    }

    #[tokio::test]
    async fn regint_zero_skips_registration() {
        let endpoint = Endpoint::builder().build().unwrap();
        let ua = endpoint
            .allocate("<sip:user:pass@127.0.0.1>;regint=0")
            .unwrap();
        assert!(!ua.is_registered());
        assert_eq!(ua.reg_state(), crate::ua::RegState::Idle);
        endpoint.destroy(&ua);
        endpoint.shutdown();
    }
}
