//! Local media offer handling.
//!
//! Media transport and codec negotiation live outside this crate; the core
//! only decides whether an offer's address family can be satisfied by a
//! usable local address, and produces/reads the minimal session
//! description the signaling needs.

use std::net::IpAddr;

use crate::core::{AddressFamily, Error, MediaConfig, Result};

/// Local end of an offered session.
#[derive(Debug, Clone)]
pub struct MediaOffer {
    pub addr: IpAddr,
    pub port: u16,
}

impl MediaOffer {
    pub fn af(&self) -> AddressFamily {
        AddressFamily::of(&self.addr)
    }

    /// Build the local offer for `want`, or the first usable local address
    /// when no family is forced.
    ///
    /// This is a pure local precondition: a family no local address can
    /// serve fails with `AddressFamilyMismatch` before anything reaches
    /// the network.
    pub fn negotiate_local(
        config: &MediaConfig,
        want: Option<AddressFamily>,
    ) -> Result<MediaOffer> {
        let addr = match want {
            Some(af) => config
                .local_addrs
                .iter()
                .copied()
                .find(|a| AddressFamily::of(a) == af),
            None => config.local_addrs.first().copied(),
        };
        let addr = addr.ok_or(Error::AddressFamilyMismatch)?;
        Ok(MediaOffer {
            addr,
            port: config.port,
        })
    }

    /// Minimal SDP body: origin, connection and one audio line.
    pub fn to_sdp(&self, session_id: &str) -> String {
        let af = match self.af() {
            AddressFamily::V4 => "IP4",
            AddressFamily::V6 => "IP6",
        };
        format!(
            "v=0\r\n\
             o=- {sid} {sid} IN {af} {addr}\r\n\
             s=-\r\n\
             c=IN {af} {addr}\r\n\
             t=0 0\r\n\
             m=audio {port} RTP/AVP 0 8\r\n",
            sid = session_id,
            af = af,
            addr = self.addr,
            port = self.port,
        )
    }
}

/// Address family of an SDP body's connection line.
pub fn sdp_address_family(sdp: &str) -> Option<AddressFamily> {
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("c=") {
            let mut it = rest.split_whitespace();
            let _net = it.next()?;
            return match it.next()? {
                "IP4" => Some(AddressFamily::V4),
                "IP6" => Some(AddressFamily::V6),
                _ => None,
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4only() -> MediaConfig {
        MediaConfig {
            local_addrs: vec![IpAddr::from([127, 0, 0, 1])],
            port: 4000,
        }
    }

    #[test]
    fn negotiates_default_family() {
        let offer = MediaOffer::negotiate_local(&v4only(), None).unwrap();
        assert_eq!(offer.af(), AddressFamily::V4);
    }

    #[test]
    fn unsatisfiable_family_fails_fast() {
        let err = MediaOffer::negotiate_local(&v4only(), Some(AddressFamily::V6)).unwrap_err();
        assert!(matches!(err, Error::AddressFamilyMismatch));
    }

    #[test]
    fn sdp_round_trip_family() {
        let offer = MediaOffer::negotiate_local(&v4only(), Some(AddressFamily::V4)).unwrap();
        let sdp = offer.to_sdp("1234");
        assert_eq!(sdp_address_family(&sdp), Some(AddressFamily::V4));
        assert!(sdp.contains("m=audio 4000"));
    }
}
