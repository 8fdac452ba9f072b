//! Minimal SIP message model.
//!
//! Covers exactly what the registration and call state machines produce and
//! consume: request/response construction, serialization and a tolerant
//! parser for the header set the core reads. This is not a full SIP
//! grammar.

use crate::core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_token(s: &str) -> Option<Self> {
        match s {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl std::fmt::Display for SipMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
enum StartLine {
    Request { method: SipMethod, uri: String },
    Response { status: u16, reason: String },
}

/// One SIP message with an ordered header list and an opaque body.
#[derive(Debug, Clone)]
pub struct SipMessage {
    start: StartLine,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl SipMessage {
    pub fn request(method: SipMethod, uri: &str) -> Self {
        SipMessage {
            start: StartLine::Request {
                method,
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn response(status: u16, reason: &str) -> Self {
        SipMessage {
            start: StartLine::Response {
                status,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Response skeleton for a request: mirrors Via, From, To, Call-ID and
    /// CSeq. Final responses get a To tag when the request carried none.
    pub fn reply_to(req: &SipMessage, status: u16, reason: &str) -> Self {
        let mut resp = SipMessage::response(status, reason);
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(v) = req.header(name) {
                let v = if name == "To" && status >= 200 && !v.contains("tag=") {
                    format!("{};tag={}", v, crate::core::generate_tag())
                } else {
                    v.to_string()
                };
                resp.headers.push((name.to_string(), v));
            }
        }
        resp
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    pub fn method(&self) -> Option<SipMethod> {
        match &self.start {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { status, .. } => Some(*status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// First header with the given name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first occurrence or append.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        let v = self.header("CSeq")?;
        let mut it = v.split_whitespace();
        let seq = it.next()?.parse().ok()?;
        let method = it.next()?.to_string();
        Some((seq, method))
    }

    /// Granted expiry: the Expires header, else an `expires` parameter on
    /// the Contact header.
    pub fn expires(&self) -> Option<u32> {
        if let Some(v) = self.header("Expires") {
            if let Ok(n) = v.trim().parse() {
                return Some(n);
            }
        }
        let contact = self.header("Contact")?;
        contact
            .split(';')
            .skip(1)
            .filter_map(|p| p.trim().split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("expires"))
            .and_then(|(_, v)| v.trim().parse().ok())
    }

    /// Tag parameter of an address header value (From/To).
    pub fn header_tag(&self, name: &str) -> Option<&str> {
        let v = self.header(name)?;
        v.split(';')
            .skip(1)
            .filter_map(|p| p.trim().split_once('='))
            .find(|(k, _)| k.trim() == "tag")
            .map(|(_, v)| v.trim())
    }

    pub fn set_body(&mut self, content_type: &str, body: Vec<u8>) {
        self.set_header("Content-Type", content_type);
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(method.as_str());
                out.push(' ');
                out.push_str(uri);
                out.push_str(" SIP/2.0\r\n");
            }
            StartLine::Response { status, reason } => {
                out.push_str(&format!("SIP/2.0 {} {}\r\n", status, reason));
            }
        }
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n\r\n", self.body.len()));
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    pub fn parse(data: &[u8]) -> Result<SipMessage> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Parse("message is not valid UTF-8".into()))?;
        let (head, body_text) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => (text, ""),
        };
        let mut lines = head.split("\r\n").map(|l| l.trim_end_matches('\r'));
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Parse("empty message".into()))?;

        let start = if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
            let mut it = rest.splitn(2, ' ');
            let status = it
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Parse("bad status line".into()))?;
            let reason = it.next().unwrap_or("").to_string();
            StartLine::Response { status, reason }
        } else {
            let mut it = start_line.split_whitespace();
            let method = it
                .next()
                .and_then(SipMethod::from_token)
                .ok_or_else(|| Error::Parse(format!("bad request line: {}", start_line)))?;
            let uri = it
                .next()
                .ok_or_else(|| Error::Parse("request line without URI".into()))?
                .to_string();
            if it.next() != Some("SIP/2.0") {
                return Err(Error::Parse("missing SIP version".into()));
            }
            StartLine::Request { method, uri }
        };

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("bad header line: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut msg = SipMessage {
            start,
            headers,
            body: Vec::new(),
        };
        let content_length: usize = msg
            .header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(body_text.len());
        let body = body_text.as_bytes();
        msg.body = body[..content_length.min(body.len())].to_vec();
        Ok(msg)
    }
}
