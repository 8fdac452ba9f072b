//! Call session state machine.
//!
//! `Idle → (OutgoingInvite | IncomingOffered) → Early → Established →
//! Terminated`, with a direct edge to `Terminated` for reject and cancel.
//! A call is owned by exactly one UA and never outlives it; termination
//! emits exactly one call-closed event no matter how many paths race to
//! it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{AddressFamily, Aor, Error, Result, generate_branch, generate_call_id, generate_tag};
use crate::endpoint::Services;
use crate::event_system::{EventKind, UaEvent};
use crate::media::{MediaOffer, sdp_address_family};
use crate::message::{SipMessage, SipMethod};
use crate::resolver::Candidate;
use crate::ua::{CallId, Ua, UaId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingInvite,
    IncomingOffered,
    Early,
    Established,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Header values pinned once a dialog exists, used for in-dialog BYE.
#[derive(Debug, Clone)]
struct Dialog {
    local: String,
    remote: String,
}

pub struct Call {
    id: CallId,
    dir: CallDirection,
    ua_id: UaId,
    ua_aor: String,
    peer: String,
    sip_call_id: String,
    local_tag: String,
    state: Mutex<CallState>,
    af: Mutex<Option<AddressFamily>>,
    remote: Mutex<Option<Candidate>>,
    invite: Mutex<Option<SipMessage>>,
    dialog: Mutex<Option<Dialog>>,
    cseq: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    services: Services,
}

impl Call {
    fn new(
        ua: &Arc<Ua>,
        dir: CallDirection,
        peer: String,
        sip_call_id: String,
    ) -> Arc<Call> {
        let services = ua.services().clone();
        Arc::new(Call {
            id: CallId(services.ids.next_call()),
            dir,
            ua_id: ua.id(),
            ua_aor: ua.aor().to_string(),
            peer,
            sip_call_id,
            local_tag: generate_tag(),
            state: Mutex::new(CallState::Idle),
            af: Mutex::new(None),
            remote: Mutex::new(None),
            invite: Mutex::new(None),
            dialog: Mutex::new(None),
            cseq: AtomicU32::new(ua.next_cseq()),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
            services,
        })
    }

    /// Create an outgoing call towards `peer`.
    ///
    /// The local media offer is negotiated first; an address family no
    /// local address can serve terminates the call immediately, without
    /// touching the network.
    pub(crate) fn outgoing(ua: &Arc<Ua>, peer: Aor) -> Arc<Call> {
        let call = Call::new(
            ua,
            CallDirection::Outgoing,
            peer.canonical(),
            generate_call_id(&peer.host),
        );
        ua.add_call(call.clone());

        let offer = match MediaOffer::negotiate_local(&call.services.config.media, ua.media_af())
        {
            Ok(offer) => offer,
            Err(err) => {
                debug!(peer = %call.peer, "offer failed: {}", err);
                call.close_with(Some(&err.to_string()));
                return call;
            }
        };
        *call.af.lock().unwrap() = Some(offer.af());
        call.set_state(CallState::OutgoingInvite);

        let driver = call.clone();
        let task = tokio::spawn(async move {
            driver.run_outgoing(peer, offer).await;
        });
        *call.task.lock().unwrap() = Some(task);
        call
    }

    /// Create a call from an inbound session offer. Replies 180 and emits
    /// the incoming-call event; the application decides what happens next.
    pub(crate) async fn incoming(
        ua: &Arc<Ua>,
        req: SipMessage,
        source: Candidate,
    ) -> Result<Arc<Call>> {
        let from = req
            .header("From")
            .ok_or_else(|| Error::Parse("INVITE without From".into()))?
            .to_string();
        let sip_call_id = req
            .call_id()
            .ok_or_else(|| Error::Parse("INVITE without Call-ID".into()))?
            .to_string();

        let call = Call::new(ua, CallDirection::Incoming, addr_uri(&from), sip_call_id);
        if let Ok(body) = std::str::from_utf8(req.body()) {
            *call.af.lock().unwrap() = sdp_address_family(body);
        }
        *call.remote.lock().unwrap() = Some(source.clone());

        let ringing = SipMessage::reply_to(&req, 180, "Ringing");
        *call.invite.lock().unwrap() = Some(req);
        call.set_state(CallState::IncomingOffered);
        ua.add_call(call.clone());

        if let Err(e) = call.services.transport.send(&source, &ringing).await {
            debug!(call = %call.id, "180 send failed: {}", e);
        }
        call.emit(EventKind::CallIncoming, Some(call.peer.clone()));
        Ok(call)
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn direction(&self) -> CallDirection {
        self.dir
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> CallState {
        *self.state.lock().unwrap()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == CallState::Terminated
    }

    /// Attempted media address family, once known.
    pub fn address_family(&self) -> Option<AddressFamily> {
        *self.af.lock().unwrap()
    }

    pub(crate) fn sip_call_id(&self) -> &str {
        &self.sip_call_id
    }

    /// Accept an offered call. Valid only in `IncomingOffered`.
    pub async fn answer(&self) -> Result<()> {
        if self.state() != CallState::IncomingOffered {
            return Err(Error::InvalidState(format!(
                "answer in {:?}",
                self.state()
            )));
        }
        let invite = self
            .invite
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidState("no stored offer".into()))?;
        let remote = self.require_remote()?;

        let offer =
            MediaOffer::negotiate_local(&self.services.config.media, self.address_family())
                .or_else(|_| MediaOffer::negotiate_local(&self.services.config.media, None))?;

        let mut ok = SipMessage::reply_to(&invite, 200, "OK");
        let to = invite.header("To").unwrap_or(self.ua_aor.as_str());
        ok.set_header("To", format!("{};tag={}", to, self.local_tag));
        ok.set_header(
            "Contact",
            format!("<sip:{}>", self.services.config.contact_host),
        );
        ok.set_body("application/sdp", offer.to_sdp(&self.local_tag).into_bytes());
        self.services.transport.send(&remote, &ok).await?;

        *self.dialog.lock().unwrap() = Some(Dialog {
            local: ok.header("To").unwrap_or_default().to_string(),
            remote: invite.header("From").unwrap_or_default().to_string(),
        });
        self.set_state(CallState::Established);
        self.emit(EventKind::CallEstablished, None);
        Ok(())
    }

    /// Decline an offered call or cancel an outgoing one.
    pub async fn reject(&self) -> Result<()> {
        match self.state() {
            CallState::Terminated => Ok(()),
            CallState::IncomingOffered => {
                self.decline_offer(486, "Busy Here").await;
                self.close_with(Some("rejected"));
                Ok(())
            }
            CallState::OutgoingInvite | CallState::Early => {
                self.cancel_outgoing().await;
                self.close_with(Some("rejected"));
                Ok(())
            }
            other => Err(Error::InvalidState(format!("reject in {:?}", other))),
        }
    }

    /// Terminate from any non-terminal state; the same operation for
    /// either party. A second hangup is a no-op.
    pub async fn hangup(&self) -> Result<()> {
        match self.state() {
            CallState::Terminated => Ok(()),
            CallState::Established => {
                self.send_bye().await;
                self.close_with(Some("hangup"));
                Ok(())
            }
            CallState::IncomingOffered => {
                self.decline_offer(486, "Busy Here").await;
                self.close_with(Some("hangup"));
                Ok(())
            }
            CallState::OutgoingInvite | CallState::Early => {
                self.cancel_outgoing().await;
                self.close_with(Some("hangup"));
                Ok(())
            }
            CallState::Idle => {
                self.close_with(Some("hangup"));
                Ok(())
            }
        }
    }

    /// Remote BYE: acknowledge and close.
    pub(crate) async fn on_remote_bye(&self, req: &SipMessage, source: &Candidate) {
        let ok = SipMessage::reply_to(req, 200, "OK");
        if let Err(e) = self.services.transport.send(source, &ok).await {
            debug!(call = %self.id, "BYE reply failed: {}", e);
        }
        self.close_with(Some("hangup"));
    }

    /// Remote CANCEL of a still-offered call.
    pub(crate) async fn on_remote_cancel(&self, req: &SipMessage, source: &Candidate) {
        let ok = SipMessage::reply_to(req, 200, "OK");
        if let Err(e) = self.services.transport.send(source, &ok).await {
            debug!(call = %self.id, "CANCEL reply failed: {}", e);
        }
        if self.state() == CallState::IncomingOffered {
            self.decline_offer(487, "Request Terminated").await;
        }
        self.close_with(Some("rejected"));
    }

    /// UA teardown path: cancel pending work and close without further
    /// signaling. Emits the closing event if none was emitted yet.
    pub(crate) fn close_for_teardown(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.close_with(None);
    }

    // Exactly-one-close guard: every termination path funnels through
    // here.
    fn close_with(&self, reason: Option<&str>) {
        *self.state.lock().unwrap() = CallState::Terminated;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.emit(EventKind::CallClosed, reason.map(str::to_string));
    }

    fn emit(&self, kind: EventKind, param: Option<String>) {
        self.services.bus.publish(&UaEvent {
            kind,
            ua: self.ua_id,
            aor: self.ua_aor.clone(),
            call: Some(self.id),
            param,
        });
    }

    fn set_state(&self, next: CallState) {
        *self.state.lock().unwrap() = next;
    }

    fn require_remote(&self) -> Result<Candidate> {
        self.remote
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidState("no remote candidate".into()))
    }

    async fn run_outgoing(self: Arc<Self>, peer: Aor, offer: MediaOffer) {
        let candidates = match self.services.resolver.resolve(&peer).await {
            Ok(c) => c,
            Err(e) => {
                self.close_with(Some(&e.to_string()));
                return;
            }
        };

        let invite = self.build_invite(&offer);
        for cand in &candidates {
            let mut rx = match self.services.transport.transact(cand, &invite).await {
                Ok(rx) => rx,
                Err(e) => {
                    debug!(candidate = %cand, "INVITE send failed: {}", e);
                    continue;
                }
            };
            *self.remote.lock().unwrap() = Some(cand.clone());

            while let Some(resp) = rx.recv().await {
                match resp.status() {
                    Some(s) if s < 200 => {
                        if self.state() == CallState::OutgoingInvite {
                            self.set_state(CallState::Early);
                        }
                        let kind = if s == 183 {
                            EventKind::CallProgress
                        } else {
                            EventKind::CallRinging
                        };
                        self.emit(kind, None);
                    }
                    Some(s) if (200..300).contains(&s) => {
                        self.establish_outgoing(&invite, &resp, cand).await;
                        return;
                    }
                    Some(s) => {
                        let reason = format!(
                            "rejected: {} {}",
                            s,
                            resp.reason().unwrap_or_default()
                        );
                        self.close_with(Some(&reason));
                        return;
                    }
                    None => {}
                }
            }
            // Channel closed without a final response: next candidate.
        }
        self.close_with(Some(&Error::AllCandidatesExhausted.to_string()));
    }

    async fn establish_outgoing(&self, invite: &SipMessage, resp: &SipMessage, cand: &Candidate) {
        let local = invite.header("From").unwrap_or_default().to_string();
        let remote = resp
            .header("To")
            .unwrap_or_else(|| invite.header("To").unwrap_or_default())
            .to_string();
        *self.dialog.lock().unwrap() = Some(Dialog {
            local,
            remote: remote.clone(),
        });

        // ACK the final response.
        let mut ack = SipMessage::request(SipMethod::Ack, &self.peer);
        ack.set_header(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={}",
                cand.kind.via_name(),
                self.services.config.contact_host,
                generate_branch()
            ),
        );
        ack.set_header("From", invite.header("From").unwrap_or_default());
        ack.set_header("To", remote);
        ack.set_header("Call-ID", self.sip_call_id.clone());
        let cseq = invite.cseq().map(|(n, _)| n).unwrap_or(1);
        ack.set_header("CSeq", format!("{} ACK", cseq));
        ack.set_header("Max-Forwards", "70");
        if let Err(e) = self.services.transport.send(cand, &ack).await {
            warn!(call = %self.id, "ACK failed: {}", e);
        }

        self.set_state(CallState::Established);
        self.emit(EventKind::CallEstablished, None);
    }

    fn build_invite(&self, offer: &MediaOffer) -> SipMessage {
        let mut req = SipMessage::request(SipMethod::Invite, &self.peer);
        req.set_header(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={};rport",
                self.services.config.contact_host,
                generate_branch()
            ),
        );
        req.set_header("Max-Forwards", "70");
        req.set_header("From", format!("<{}>;tag={}", self.ua_aor, self.local_tag));
        req.set_header("To", format!("<{}>", self.peer));
        req.set_header("Call-ID", self.sip_call_id.clone());
        req.set_header(
            "CSeq",
            format!("{} INVITE", self.cseq.fetch_add(1, Ordering::SeqCst)),
        );
        req.set_header(
            "Contact",
            format!("<sip:{}>", self.services.config.contact_host),
        );
        req.set_header("User-Agent", self.services.config.user_agent.clone());
        req.set_body("application/sdp", offer.to_sdp(&self.local_tag).into_bytes());
        req
    }

    async fn decline_offer(&self, status: u16, reason: &str) {
        let invite = self.invite.lock().unwrap().clone();
        let remote = self.remote.lock().unwrap().clone();
        if let (Some(invite), Some(remote)) = (invite, remote) {
            let resp = SipMessage::reply_to(&invite, status, reason);
            if let Err(e) = self.services.transport.send(&remote, &resp).await {
                debug!(call = %self.id, "decline send failed: {}", e);
            }
        }
    }

    async fn cancel_outgoing(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        let remote = self.remote.lock().unwrap().clone();
        if let Some(cand) = remote {
            let mut cancel = SipMessage::request(SipMethod::Cancel, &self.peer);
            cancel.set_header(
                "Via",
                format!(
                    "SIP/2.0/{} {};branch={}",
                    cand.kind.via_name(),
                    self.services.config.contact_host,
                    generate_branch()
                ),
            );
            cancel.set_header("From", format!("<{}>;tag={}", self.ua_aor, self.local_tag));
            cancel.set_header("To", format!("<{}>", self.peer));
            cancel.set_header("Call-ID", self.sip_call_id.clone());
            cancel.set_header(
                "CSeq",
                format!("{} CANCEL", self.cseq.load(Ordering::SeqCst).saturating_sub(1)),
            );
            cancel.set_header("Max-Forwards", "70");
            if let Err(e) = self.services.transport.send(&cand, &cancel).await {
                debug!(call = %self.id, "CANCEL send failed: {}", e);
            }
        }
    }

    async fn send_bye(&self) {
        let remote = self.remote.lock().unwrap().clone();
        let dialog = self.dialog.lock().unwrap().clone();
        let Some(cand) = remote else { return };

        let mut bye = SipMessage::request(SipMethod::Bye, &self.peer);
        bye.set_header(
            "Via",
            format!(
                "SIP/2.0/{} {};branch={}",
                cand.kind.via_name(),
                self.services.config.contact_host,
                generate_branch()
            ),
        );
        match dialog {
            Some(d) => {
                bye.set_header("From", d.local);
                bye.set_header("To", d.remote);
            }
            None => {
                bye.set_header("From", format!("<{}>;tag={}", self.ua_aor, self.local_tag));
                bye.set_header("To", format!("<{}>", self.peer));
            }
        }
        bye.set_header("Call-ID", self.sip_call_id.clone());
        bye.set_header(
            "CSeq",
            format!("{} BYE", self.cseq.fetch_add(1, Ordering::SeqCst)),
        );
        bye.set_header("Max-Forwards", "70");
        if let Err(e) = self.services.transport.send(&cand, &bye).await {
            debug!(call = %self.id, "BYE send failed: {}", e);
        }
    }
}

/// URI inside the angle brackets of an address header value, or the bare
/// value before any parameters.
pub(crate) fn addr_uri(value: &str) -> String {
    if let (Some(lt), Some(gt)) = (value.find('<'), value.find('>')) {
        if lt < gt {
            return value[lt + 1..gt].to_string();
        }
    }
    value
        .split(';')
        .next()
        .unwrap_or(value)
        .trim()
        .to_string()
}
