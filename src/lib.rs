//! sipua — the signaling core of a SIP endpoint.
//!
//! Manages user agents bound to addresses-of-record, drives their
//! registration lifecycle (transport selection, SRV-based server
//! discovery, digest authentication, refresh) and the state machine of
//! individual call sessions, and decouples both from observers through a
//! synchronous, ordered event bus.
//!
//! Media transport, codec negotiation and process bootstrap are external
//! collaborators behind the narrow seams in [`transport`] and [`media`].

mod call;
mod core;
mod endpoint;
mod media;
mod message;
mod ua;

pub mod auth;
pub mod event_system;
pub mod resolver;
pub mod transport;

pub use crate::call::{Call, CallDirection, CallState};
pub use crate::core::{
    AddressFamily, Aor, Credentials, EndpointConfig, Error, MediaConfig, Result, TransportConfig,
    TransportKind,
};
pub use crate::endpoint::{Endpoint, EndpointBuilder};
pub use crate::media::MediaOffer;
pub use crate::message::{SipMessage, SipMethod};
pub use crate::ua::{CallId, RegState, Ua, UaId};

// Convenient imports for applications and tests.
pub mod prelude {
    pub use crate::{
        AddressFamily,
        Aor,
        Call,
        CallDirection,
        CallId,
        CallState,
        Endpoint,
        EndpointBuilder,
        EndpointConfig,
        Error,
        RegState,
        Result,
        SipMessage,
        SipMethod,
        TransportKind,
        Ua,
        UaId,
    };
    pub use crate::event_system::{EventArg, EventBus, EventKind, UaEvent};
    pub use crate::resolver::{Candidate, DnsClient, DnsResolver, SrvRecord};
    pub use crate::transport::SipTransport;
}

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
