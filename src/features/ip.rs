//! IP address encoder.
//!
//! Every address becomes exactly [`IP_FEATURE_SIZE`] values in `[0, 1]`,
//! whatever its family, so node feature width never depends on the address:
//!
//! - IPv4 parts are base-10, divided by 255;
//! - IPv6 parts are base-16, divided by 65535;
//! - both are zero-padded on the right up to eight parts.

use std::net::Ipv6Addr;

use super::EncodeError;

/// Width of the encoded address vector.
pub const IP_FEATURE_SIZE: usize = 8;

/// How to treat a string that is not a recognisable address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpMode {
    /// Fail with [`EncodeError::InvalidAddressFormat`].
    #[default]
    Strict,
    /// Return eight zeros.
    Lenient,
}

/// Encode `addr` into eight normalized parts.
pub fn encode_ip(addr: &str, mode: IpMode) -> Result<[f32; IP_FEATURE_SIZE], EncodeError> {
    let addr = addr.trim();
    let parsed = if addr.contains(':') {
        encode_v6(addr)
    } else if addr.contains('.') {
        encode_v4(addr)
    } else {
        None
    };

    match (parsed, mode) {
        (Some(parts), _) => Ok(parts),
        (None, IpMode::Lenient) => Ok([0.0; IP_FEATURE_SIZE]),
        (None, IpMode::Strict) => Err(EncodeError::InvalidAddressFormat(addr.to_string())),
    }
}

fn encode_v4(addr: &str) -> Option<[f32; IP_FEATURE_SIZE]> {
    let mut out = [0.0; IP_FEATURE_SIZE];
    for (i, part) in addr.split('.').enumerate() {
        if i >= IP_FEATURE_SIZE {
            return None;
        }
        let octet: u8 = part.parse().ok()?;
        out[i] = f32::from(octet) / 255.0;
    }
    Some(out)
}

fn encode_v6(addr: &str) -> Option<[f32; IP_FEATURE_SIZE]> {
    split_v6(addr).or_else(|| {
        // Forms the plain split can't handle ("1:2:3:4:5:6:7::", "::ffff:10.0.0.1")
        // are still valid addresses; use their expanded segments.
        let parsed: Ipv6Addr = addr.parse().ok()?;
        let mut out = [0.0; IP_FEATURE_SIZE];
        for (slot, segment) in out.iter_mut().zip(parsed.segments()) {
            *slot = f32::from(segment) / 65535.0;
        }
        Some(out)
    })
}

fn split_v6(addr: &str) -> Option<[f32; IP_FEATURE_SIZE]> {
    let mut out = [0.0; IP_FEATURE_SIZE];
    for (i, part) in addr.split(':').enumerate() {
        if i >= IP_FEATURE_SIZE {
            return None;
        }
        let group = if part.is_empty() {
            0
        } else {
            u16::from_str_radix(part, 16).ok()?
        };
        out[i] = f32::from(group) / 65535.0;
    }
    Some(out)
}
