//! User agents and their registration state machine.
//!
//! A UA is bound to one address-of-record and owns its calls and at most
//! one running registration attempt. The registry is an ordered, owned
//! collection: a UA is never visible to lookups before it is fully built
//! and never stays visible once destruction has begun.
//!
//! Registration walks `Idle → Resolving → Sending → (AuthChallenged →
//! Sending) → Registered | Failed`, advancing through the ranked
//! candidate list on transport-level failures only. `Registered` re-enters
//! `Sending` from the refresh timer at half the granted expiry, reusing
//! the last successful candidate first and re-resolving once the list is
//! older than the configured staleness policy.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auth;
use crate::call::Call;
use crate::core::{
    AddressFamily, Aor, Credentials, Error, Result, generate_call_id, generate_branch,
    generate_tag,
};
use crate::endpoint::Services;
use crate::event_system::{EventKind, UaEvent};
use crate::message::{SipMessage, SipMethod};
use crate::resolver::Candidate;

/// Opaque UA handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UaId(pub u64);

impl std::fmt::Display for UaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ua-{}", self.0)
    }
}

/// Opaque call handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    Idle,
    Resolving,
    Sending,
    AuthChallenged,
    Registered,
    Failed,
}

#[derive(Default)]
struct RegCache {
    candidates: Vec<Candidate>,
    resolved_at: Option<Instant>,
    last_good: Option<usize>,
}

pub struct Ua {
    id: UaId,
    aor: Aor,
    canonical: String,
    creds: Option<Credentials>,
    reg_call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    media_af: Mutex<Option<AddressFamily>>,
    reg_state: Mutex<RegState>,
    reg_task: Mutex<Option<JoinHandle<()>>>,
    reg_cache: Mutex<RegCache>,
    calls: Mutex<Vec<Arc<Call>>>,
    gone: AtomicBool,
    services: Services,
}

impl Ua {
    pub(crate) fn new(id: UaId, aor: Aor, services: Services) -> Arc<Ua> {
        let canonical = aor.canonical();
        let creds = aor.credentials();
        let reg_call_id = generate_call_id(&aor.host);
        Arc::new(Ua {
            id,
            aor,
            canonical,
            creds,
            reg_call_id,
            from_tag: generate_tag(),
            cseq: AtomicU32::new(1),
            media_af: Mutex::new(None),
            reg_state: Mutex::new(RegState::Idle),
            reg_task: Mutex::new(None),
            reg_cache: Mutex::new(RegCache::default()),
            calls: Mutex::new(Vec::new()),
            gone: AtomicBool::new(false),
            services,
        })
    }

    pub fn id(&self) -> UaId {
        self.id
    }

    /// Canonical AOR: scheme, user, host and port, parameters stripped.
    pub fn aor(&self) -> &str {
        &self.canonical
    }

    pub fn aor_spec(&self) -> &Aor {
        &self.aor
    }

    pub fn is_registered(&self) -> bool {
        *self.reg_state.lock().unwrap() == RegState::Registered
    }

    pub fn reg_state(&self) -> RegState {
        *self.reg_state.lock().unwrap()
    }

    /// Restrict outgoing offers to one address family.
    pub fn set_media_af(&self, af: Option<AddressFamily>) {
        *self.media_af.lock().unwrap() = af;
    }

    pub fn media_af(&self) -> Option<AddressFamily> {
        *self.media_af.lock().unwrap()
    }

    pub(crate) fn services(&self) -> &Services {
        &self.services
    }

    pub(crate) fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn gone(&self) -> bool {
        self.gone.load(Ordering::SeqCst)
    }

    // -- calls -------------------------------------------------------

    /// Start an outgoing call towards `target`.
    ///
    /// Target parse errors are synchronous; everything after the call
    /// exists is surfaced as events. A local address-family mismatch
    /// returns an already-terminated call having emitted its close event.
    pub fn connect(self: &Arc<Self>, target: &str) -> Result<Arc<Call>> {
        let peer = Aor::parse(target)?;
        Ok(Call::outgoing(self, peer))
    }

    /// Route an inbound session offer to this UA.
    pub async fn handle_invite(
        self: &Arc<Self>,
        req: SipMessage,
        source: Candidate,
    ) -> Result<Arc<Call>> {
        Call::incoming(self, req, source).await
    }

    pub(crate) fn add_call(&self, call: Arc<Call>) {
        self.calls.lock().unwrap().push(call);
    }

    /// Oldest live call, if any. Terminated calls are pruned here; a
    /// terminated call is never returned.
    pub fn current_call(&self) -> Option<Arc<Call>> {
        let mut calls = self.calls.lock().unwrap();
        calls.retain(|c| !c.is_terminated());
        calls.first().cloned()
    }

    /// Snapshot of live calls, pruning terminated ones.
    pub fn calls(&self) -> Vec<Arc<Call>> {
        let mut calls = self.calls.lock().unwrap();
        calls.retain(|c| !c.is_terminated());
        calls.clone()
    }

    pub(crate) fn find_call(&self, sip_call_id: &str) -> Option<Arc<Call>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.sip_call_id() == sip_call_id)
            .cloned()
    }

    // -- registration ------------------------------------------------

    /// Start (or restart) the registration state machine. After a
    /// terminal failure the machine is inert until this is called again.
    pub fn register(self: &Arc<Self>, interval: u32) {
        if self.gone() {
            return;
        }
        let mut slot = self.reg_task.lock().unwrap();
        if let Some(task) = slot.take() {
            task.abort();
        }
        let ua = self.clone();
        *slot = Some(tokio::spawn(async move {
            ua.registration_loop(interval).await;
        }));
    }

    /// Graceful unregistration: one REGISTER with expiry 0 on the last
    /// good candidate, bounded by the transport response timeout.
    pub async fn unregister(&self) {
        if let Some(task) = self.reg_task.lock().unwrap().take() {
            task.abort();
        }
        if !self.is_registered() {
            *self.reg_state.lock().unwrap() = RegState::Idle;
            return;
        }
        self.emit(EventKind::Unregistering, None, None);
        let cand = {
            let cache = self.reg_cache.lock().unwrap();
            cache
                .last_good
                .and_then(|i| cache.candidates.get(i).cloned())
                .or_else(|| cache.candidates.first().cloned())
        };
        if let Some(cand) = cand {
            if let Err(e) = self.register_once(&cand, 0).await {
                debug!(ua = %self.id, "unregister failed: {}", e);
            }
        }
        *self.reg_state.lock().unwrap() = RegState::Idle;
    }

    /// Cancel any in-flight registration without a round trip.
    pub(crate) fn cancel_registration(&self) {
        if let Some(task) = self.reg_task.lock().unwrap().take() {
            task.abort();
        }
        *self.reg_state.lock().unwrap() = RegState::Idle;
    }

    /// Destruction path. Removes are done by the registry before this
    /// runs; re-entrant calls are no-ops.
    pub(crate) fn teardown(&self) {
        if self.gone.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reg_task.lock().unwrap().take() {
            task.abort();
        }
        *self.reg_state.lock().unwrap() = RegState::Idle;
        let calls: Vec<Arc<Call>> = self.calls.lock().unwrap().drain(..).collect();
        for call in calls {
            call.close_for_teardown();
        }
    }

    pub(crate) fn emit(&self, kind: EventKind, call: Option<CallId>, param: Option<String>) {
        if self.gone() {
            return;
        }
        self.services.bus.publish(&UaEvent {
            kind,
            ua: self.id,
            aor: self.canonical.clone(),
            call,
            param,
        });
    }

    async fn registration_loop(self: Arc<Self>, interval: u32) {
        loop {
            if self.gone() {
                return;
            }

            let stale = {
                let cache = self.reg_cache.lock().unwrap();
                cache.candidates.is_empty()
                    || cache
                        .resolved_at
                        .is_none_or(|t| t.elapsed() >= self.services.config.reresolve_after)
            };
            if stale {
                *self.reg_state.lock().unwrap() = RegState::Resolving;
                match self.services.resolver.resolve(&self.aor).await {
                    Ok(candidates) => {
                        let mut cache = self.reg_cache.lock().unwrap();
                        cache.candidates = candidates;
                        cache.resolved_at = Some(Instant::now());
                        cache.last_good = None;
                    }
                    Err(e) => {
                        self.fail_registration(e);
                        return;
                    }
                }
            }

            let (candidates, start) = {
                let cache = self.reg_cache.lock().unwrap();
                (cache.candidates.clone(), cache.last_good.unwrap_or(0))
            };

            match self.register_walk(&candidates, start, interval).await {
                Ok((idx, granted)) => {
                    self.reg_cache.lock().unwrap().last_good = Some(idx);
                    *self.reg_state.lock().unwrap() = RegState::Registered;
                    info!(ua = %self.id, aor = %self.canonical, expiry = granted, "registered");
                    self.emit(EventKind::RegisterOk, None, None);
                    if self.gone() {
                        return;
                    }
                    // Refresh at half the granted expiry.
                    let refresh = Duration::from_secs(u64::from(granted / 2).max(1));
                    tokio::time::sleep(refresh).await;
                }
                Err(e) => {
                    self.fail_registration(e);
                    return;
                }
            }
        }
    }

    fn fail_registration(&self, err: Error) {
        if self.gone() {
            return;
        }
        *self.reg_state.lock().unwrap() = RegState::Failed;
        info!(ua = %self.id, aor = %self.canonical, "registration failed: {}", err);
        self.emit(EventKind::RegisterFail, None, Some(err.to_string()));
    }

    /// Walk the candidate list from `start`. Transport-level failures
    /// advance; SIP-level outcomes are terminal.
    async fn register_walk(
        &self,
        candidates: &[Candidate],
        start: usize,
        expires: u32,
    ) -> Result<(usize, u32)> {
        if candidates.is_empty() {
            return Err(Error::AllCandidatesExhausted);
        }
        self.emit(EventKind::Registering, None, None);
        let n = candidates.len();
        for step in 0..n {
            if self.gone() {
                return Err(Error::Transport("cancelled".into()));
            }
            let idx = (start + step) % n;
            let cand = &candidates[idx];
            match self.register_once(cand, expires).await {
                Ok(granted) => return Ok((idx, granted)),
                Err(Error::Transport(e)) => {
                    debug!(ua = %self.id, candidate = %cand, "candidate failed: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::AllCandidatesExhausted)
    }

    /// One REGISTER on one candidate, answering at most one digest
    /// challenge. A second challenge, or one without credentials to
    /// answer it, fails authentication.
    async fn register_once(&self, cand: &Candidate, expires: u32) -> Result<u32> {
        *self.reg_state.lock().unwrap() = RegState::Sending;
        let req = self.build_register(cand, expires);
        let resp = self.services.transport.request(cand, &req).await?;

        let status = match resp.status() {
            Some(s) => s,
            None => return Err(Error::Transport("request answered with a request".into())),
        };
        match status {
            200..=299 => Ok(resp.expires().unwrap_or(expires)),
            401 | 407 => {
                *self.reg_state.lock().unwrap() = RegState::AuthChallenged;
                let creds = self.creds.clone().ok_or(Error::AuthenticationFailed)?;
                let header = if status == 401 {
                    "WWW-Authenticate"
                } else {
                    "Proxy-Authenticate"
                };
                let challenge_value =
                    resp.header(header).ok_or(Error::AuthenticationFailed)?;
                let challenge = auth::parse_challenge(challenge_value)
                    .map_err(|_| Error::AuthenticationFailed)?;

                let mut retry = self.build_register(cand, expires);
                let uri = retry.uri().unwrap_or_default().to_string();
                let auth_header = if status == 401 {
                    "Authorization"
                } else {
                    "Proxy-Authorization"
                };
                retry.set_header(
                    auth_header,
                    auth::authorization(&creds, &challenge, SipMethod::Register, &uri),
                );
                *self.reg_state.lock().unwrap() = RegState::Sending;
                let resp = self.services.transport.request(cand, &retry).await?;
                match resp.status() {
                    Some(s) if (200..300).contains(&s) => Ok(resp.expires().unwrap_or(expires)),
                    Some(401) | Some(407) => Err(Error::AuthenticationFailed),
                    Some(s) => Err(Error::Rejected(format!(
                        "{} {}",
                        s,
                        resp.reason().unwrap_or_default()
                    ))),
                    None => Err(Error::Transport("request answered with a request".into())),
                }
            }
            s => Err(Error::Rejected(format!(
                "{} {}",
                s,
                resp.reason().unwrap_or_default()
            ))),
        }
    }

    fn build_register(&self, cand: &Candidate, expires: u32) -> SipMessage {
        let mut uri = format!("{}:{}", self.aor.scheme, self.aor.host);
        if let Some(port) = self.aor.port {
            uri.push_str(&format!(":{}", port));
        }
        let mut req = SipMessage::request(SipMethod::Register, &uri);
        req.set_header(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={};rport",
                cand.kind.via_name(),
                self.services.config.contact_host,
                generate_branch()
            ),
        );
        req.set_header("Max-Forwards", "70");
        req.set_header(
            "From",
            format!("<{}>;tag={}", self.canonical, self.from_tag),
        );
        req.set_header("To", format!("<{}>", self.canonical));
        req.set_header("Call-ID", self.reg_call_id.clone());
        req.set_header("CSeq", format!("{} REGISTER", self.next_cseq()));
        req.set_header(
            "Contact",
            format!(
                "<sip:{}@{}>",
                self.aor.user.as_deref().unwrap_or("anonymous"),
                self.services.config.contact_host
            ),
        );
        req.set_header("Expires", expires.to_string());
        req.set_header("User-Agent", self.services.config.user_agent.clone());
        req
    }
}

impl std::fmt::Debug for Ua {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ua")
            .field("id", &self.id)
            .field("aor", &self.canonical)
            .field("reg_state", &self.reg_state())
            .finish()
    }
}

/// Process-wide ordered UA collection. Insertion order is lookup order.
pub(crate) struct UaRegistry {
    uas: Mutex<Vec<Arc<Ua>>>,
}

impl UaRegistry {
    pub fn new() -> Self {
        UaRegistry {
            uas: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, ua: Arc<Ua>) {
        self.uas.lock().unwrap().push(ua);
    }

    pub fn remove(&self, id: UaId) -> Option<Arc<Ua>> {
        let mut uas = self.uas.lock().unwrap();
        let pos = uas.iter().position(|ua| ua.id() == id)?;
        Some(uas.remove(pos))
    }

    pub fn find_by_aor(&self, canonical: &str) -> Option<Arc<Ua>> {
        self.uas
            .lock()
            .unwrap()
            .iter()
            .find(|ua| ua.aor() == canonical)
            .cloned()
    }

    /// First UA, in insertion order, carrying `key`. With a value the
    /// stored value must match exactly; a key stored without a value
    /// never matches a valued query.
    pub fn find_by_param(&self, key: &str, value: Option<&str>) -> Option<Arc<Ua>> {
        self.uas
            .lock()
            .unwrap()
            .iter()
            .find(|ua| match (ua.aor_spec().param(key), value) {
                (Some(_), None) => true,
                (Some(Some(stored)), Some(wanted)) => stored == wanted,
                _ => false,
            })
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Ua>> {
        self.uas.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.uas.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.uas.lock().unwrap().is_empty()
    }
}
