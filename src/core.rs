// Core types: error taxonomy, address-of-record model, transports,
// configuration and token generation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Errors produced by the signaling core.
///
/// `MalformedAor` and `UnsupportedScheme` are returned synchronously from
/// allocation. Everything that can happen after a UA exists is surfaced as
/// a registration-fail or call-closed event instead of a return value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("malformed address-of-record: {0}")]
    MalformedAor(String),
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),
    #[error("all candidates exhausted")]
    AllCandidatesExhausted,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("address family mismatch")]
    AddressFamilyMismatch,
    #[error("timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Signaling transport protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn name(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Uppercase token used in Via headers.
    pub fn via_name(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// DNS SRV service prefix for server discovery.
    pub fn srv_service(&self) -> &'static str {
        match self {
            TransportKind::Udp => "_sip._udp",
            TransportKind::Tcp => "_sip._tcp",
            TransportKind::Tls => "_sips._tcp",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Username/password pair extracted from the userinfo part of an AOR.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub type ParamList = Vec<(String, Option<String>)>;

/// Address-of-record: a SIP/SIPS URI plus its parameter sets.
///
/// Parameters inside the angle brackets belong to the URI (`uri_params`),
/// parameters after the closing bracket belong to the address
/// (`addr_params`). Without brackets all trailing parameters are address
/// parameters, which is why `;transport=` requires the bracketed form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aor {
    pub display_name: Option<String>,
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub uri_params: ParamList,
    pub addr_params: ParamList,
}

impl Aor {
    /// Parse an address spec:
    /// `["Name "] "<"? scheme ":" [user [":" password] "@"] host [":" port] ">"? *(";" param ["=" value])`
    pub fn parse(spec: &str) -> Result<Self> {
        let s = spec.trim();
        if s.is_empty() {
            return Err(Error::MalformedAor(spec.into()));
        }

        // Optional display name, quoted or bare, before '<'.
        let (display_name, rest) = if let Some(stripped) = s.strip_prefix('"') {
            let end = stripped
                .find('"')
                .ok_or_else(|| Error::MalformedAor(spec.into()))?;
            let name = stripped[..end].to_string();
            (Some(name), stripped[end + 1..].trim_start())
        } else if let Some(lt) = s.find('<') {
            let name = s[..lt].trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            };
            (name, &s[lt..])
        } else {
            (None, s)
        };

        let (uri_part, trailing) = if let Some(stripped) = rest.strip_prefix('<') {
            let gt = stripped
                .find('>')
                .ok_or_else(|| Error::MalformedAor(spec.into()))?;
            (&stripped[..gt], &stripped[gt + 1..])
        } else {
            // Bracketless: the URI ends at the first ';'.
            match rest.find(';') {
                Some(sc) => (&rest[..sc], &rest[sc..]),
                None => (rest, ""),
            }
        };

        let mut aor = Self::parse_uri(uri_part).map_err(|e| match e {
            Error::UnsupportedScheme(_) => e,
            _ => Error::MalformedAor(spec.into()),
        })?;
        aor.display_name = display_name;
        aor.addr_params = parse_params(trailing)?;
        Ok(aor)
    }

    /// Parse a bare URI; trailing `;param` items become URI parameters.
    pub fn parse_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        let colon = uri
            .find(':')
            .ok_or_else(|| Error::MalformedAor(uri.into()))?;
        let scheme = uri[..colon].to_ascii_lowercase();
        if scheme != "sip" && scheme != "sips" {
            return Err(Error::UnsupportedScheme(scheme));
        }

        let rest = &uri[colon + 1..];
        let (core, params) = match rest.find(';') {
            Some(sc) => (&rest[..sc], parse_params(&rest[sc..])?),
            None => (rest, Vec::new()),
        };

        let (user, password, host_part) = match core.find('@') {
            Some(at) => {
                let userinfo = &core[..at];
                let (user, password) = match userinfo.find(':') {
                    Some(c) => (
                        userinfo[..c].to_string(),
                        Some(userinfo[c + 1..].to_string()),
                    ),
                    None => (userinfo.to_string(), None),
                };
                if user.is_empty() {
                    return Err(Error::MalformedAor(uri.into()));
                }
                (Some(user), password, &core[at + 1..])
            }
            None => (None, None, core),
        };

        let (host, port) =
            split_host_port(host_part).ok_or_else(|| Error::MalformedAor(uri.into()))?;
        if host.is_empty() {
            return Err(Error::MalformedAor(uri.into()));
        }

        Ok(Aor {
            display_name: None,
            scheme,
            user,
            password,
            host,
            port,
            uri_params: params,
            addr_params: Vec::new(),
        })
    }

    /// Canonical form: scheme, user, host and port only. Display name,
    /// password and parameters are stripped.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}:", self.scheme);
        if let Some(ref user) = self.user {
            out.push_str(user);
            out.push('@');
        }
        if self.host.contains(':') {
            out.push('[');
            out.push_str(&self.host);
            out.push(']');
        } else {
            out.push_str(&self.host);
        }
        if let Some(port) = self.port {
            out.push(':');
            out.push_str(&port.to_string());
        }
        out
    }

    /// Look up a parameter by exact key, URI parameters first.
    /// `Some(None)` means the key is present without a value.
    pub fn param(&self, key: &str) -> Option<Option<&str>> {
        self.uri_params
            .iter()
            .chain(self.addr_params.iter())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password) {
            (Some(u), Some(p)) => Some(Credentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => None,
        }
    }

    /// Registration interval from the `regint` parameter, when present.
    pub fn regint(&self) -> Option<u32> {
        self.param("regint").flatten().and_then(|v| v.parse().ok())
    }

    /// Transport forced by a `;transport=` URI parameter.
    pub fn transport(&self) -> Option<TransportKind> {
        self.uri_params
            .iter()
            .find(|(k, _)| k == "transport")
            .and_then(|(_, v)| v.as_deref())
            .and_then(TransportKind::from_name)
    }

    /// Explicit outbound proxy URI, bypassing server discovery.
    pub fn outbound(&self) -> Option<&str> {
        self.param("outbound").flatten()
    }

    pub fn secure(&self) -> bool {
        self.scheme == "sips"
    }
}

impl std::fmt::Display for Aor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn split_host_port(s: &str) -> Option<(String, Option<u16>)> {
    if let Some(stripped) = s.strip_prefix('[') {
        // IPv6 literal
        let end = stripped.find(']')?;
        let host = stripped[..end].to_string();
        let rest = &stripped[end + 1..];
        if rest.is_empty() {
            Some((host, None))
        } else {
            let port = rest.strip_prefix(':')?.parse().ok()?;
            Some((host, Some(port)))
        }
    } else {
        match s.find(':') {
            Some(c) => {
                let port = s[c + 1..].parse().ok()?;
                Some((s[..c].to_string(), Some(port)))
            }
            None => Some((s.to_string(), None)),
        }
    }
}

/// Split `;a=1;b;c="x;y"` into ordered pairs, honoring quoted values.
fn parse_params(s: &str) -> Result<ParamList> {
    let mut out = Vec::new();
    let mut rest = s.trim();
    while let Some(stripped) = rest.strip_prefix(';') {
        let mut end = stripped.len();
        let mut in_quotes = false;
        for (i, c) in stripped.char_indices() {
            match c {
                '"' => in_quotes = !in_quotes,
                ';' if !in_quotes => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let item = stripped[..end].trim();
        if !item.is_empty() {
            match item.find('=') {
                Some(eq) => {
                    let key = item[..eq].trim().to_string();
                    let val = item[eq + 1..].trim().trim_matches('"').to_string();
                    out.push((key, Some(val)));
                }
                None => out.push((item.to_string(), None)),
            }
        }
        rest = &stripped[end..];
    }
    Ok(out)
}

// Token generation. Branches carry the RFC 3261 magic cookie.

pub fn generate_tag() -> String {
    let bytes: [u8; 6] = rand::random();
    hex::encode(bytes)
}

pub fn generate_branch() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("z9hG4bK{}", hex::encode(bytes))
}

pub fn generate_call_id(host: &str) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}@{}", hex::encode(bytes), host)
}

pub fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

// Configuration

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub user_agent: String,
    /// Default registration interval in seconds when the AOR carries no
    /// `regint` parameter.
    pub reg_interval: u32,
    /// Candidate lists older than this are re-resolved before a refresh
    /// walks them again.
    pub reresolve_after: Duration,
    /// Host placed in Via and Contact headers.
    pub contact_host: String,
    pub media: MediaConfig,
    pub transport: TransportConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            user_agent: "sipua/0.1".to_string(),
            reg_interval: 3600,
            reresolve_after: Duration::from_secs(600),
            contact_host: "127.0.0.1".to_string(),
            media: MediaConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Local addresses usable for media; their families decide whether an
    /// offer can be satisfied at all.
    pub local_addrs: Vec<IpAddr>,
    /// Base port advertised in offers.
    pub port: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            local_addrs: vec![IpAddr::from([127, 0, 0, 1])],
            port: 4000,
        }
    }
}

#[derive(Clone)]
pub struct TransportConfig {
    /// How long a candidate may take to produce a final response before
    /// the walk advances to the next one.
    pub response_timeout: Duration,
    /// Local UDP port for inbound signaling; `None` disables the listener.
    pub listen_port: Option<u16>,
    pub bind_addr: IpAddr,
    /// Client TLS configuration. TLS candidates fail as transport errors
    /// when absent.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            response_timeout: Duration::from_secs(4),
            listen_port: None,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            tls: None,
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("response_timeout", &self.response_timeout)
            .field("listen_port", &self.listen_port)
            .field("bind_addr", &self.bind_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
