//! Digest authentication for REGISTER and request retries.
//!
//! Challenge parsing plus RFC 2617 response computation, with and without
//! `qop`. One challenge yields exactly one retry; a second challenge for
//! the same request means the credentials are wrong.

use std::collections::HashMap;

use crate::core::{Credentials, Error, Result, generate_nonce};
use crate::message::SipMethod;

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// First supported qop directive, `auth` preferred.
    pub qop: Option<String>,
    pub stale: bool,
}

/// Parse a Digest challenge header value.
pub fn parse_challenge(header: &str) -> Result<DigestChallenge> {
    let rest = header
        .trim()
        .strip_prefix("Digest")
        .ok_or_else(|| Error::Parse("not a Digest challenge".into()))?;
    let params = parse_auth_params(rest);

    let realm = params
        .get("realm")
        .cloned()
        .ok_or_else(|| Error::Parse("challenge without realm".into()))?;
    let nonce = params
        .get("nonce")
        .cloned()
        .ok_or_else(|| Error::Parse("challenge without nonce".into()))?;

    let qop = params.get("qop").and_then(|v| {
        let opts: Vec<&str> = v.split(',').map(str::trim).collect();
        if opts.contains(&"auth") {
            Some("auth".to_string())
        } else {
            opts.first().map(|s| s.to_string())
        }
    });

    Ok(DigestChallenge {
        realm,
        nonce,
        opaque: params.get("opaque").cloned(),
        algorithm: params.get("algorithm").cloned(),
        qop,
        stale: params
            .get("stale")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

/// Split a comma-separated auth parameter list, honoring quoted values.
pub fn parse_auth_params(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let mut end = rest.len();
        let mut in_quotes = false;
        for (i, c) in rest.char_indices() {
            match c {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => {
                    end = i;
                    break;
                }
                _ => {}
            }
        }
        let item = rest[..end].trim();
        if let Some((key, value)) = item.split_once('=') {
            out.insert(
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
        rest = rest[end..].trim_start_matches(',').trim_start();
    }
    out
}

/// MD5 digest response per RFC 2617.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&str>,
    nc: Option<&str>,
    cnonce: Option<&str>,
) -> String {
    let ha1 = {
        let digest = md5::compute(format!("{}:{}:{}", username, realm, password));
        format!("{:x}", digest)
    };
    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };
    if let Some(qop) = qop {
        let nc = nc.unwrap_or("00000001");
        let cnonce = cnonce.unwrap_or("");
        let digest = md5::compute(format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        ));
        format!("{:x}", digest)
    } else {
        let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
        format!("{:x}", digest)
    }
}

/// Authorization header value answering `challenge` for one request.
pub fn authorization(
    creds: &Credentials,
    challenge: &DigestChallenge,
    method: SipMethod,
    uri: &str,
) -> String {
    let cnonce = challenge.qop.as_ref().map(|_| generate_nonce());
    let nc = challenge.qop.as_ref().map(|_| "00000001");
    let response = digest_response(
        &creds.username,
        &challenge.realm,
        &creds.password,
        method.as_str(),
        uri,
        &challenge.nonce,
        challenge.qop.as_deref(),
        nc,
        cnonce.as_deref(),
    );

    let mut out = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
        creds.username, challenge.realm, challenge.nonce, uri, response
    );
    out.push_str(&format!(
        ", algorithm={}",
        challenge.algorithm.as_deref().unwrap_or("MD5")
    ));
    if let Some(ref qop) = challenge.qop {
        out.push_str(&format!(
            ", qop={}, nc={}, cnonce=\"{}\"",
            qop,
            nc.unwrap_or("00000001"),
            cnonce.as_deref().unwrap_or("")
        ));
    }
    if let Some(ref opaque) = challenge.opaque {
        out.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    out
}
