//! Epoch timing and the one-time-address derivation oracle.
//!
//! `spec.md` treats the address hash as an external, pure-function
//! collaborator (the original links against virtualsquare's `libiothaddr`,
//! which isn't available outside that stack). What follows is our own
//! stand-in with the same contract: deterministic, keyed by
//! `(base, name, secret, epoch)`, and confined to the low 64 bits of the
//! address so the caller can keep the base's /64 prefix.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::net::Ipv6Addr;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// The integer index of an OTIP validity window.
pub type Epoch = u64;

/// `epoch = floor((now + preactive) / period)`, per `spec.md` §3.
pub fn current_epoch(period_secs: u64, preactive_secs: u64, now: SystemTime) -> Epoch {
    let unix = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (unix + preactive_secs) / period_secs.max(1)
}

/// The wall-clock validity window of an epoch: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    pub start_unix: u64,
    pub end_unix: u64,
}

impl EpochWindow {
    pub fn for_epoch(epoch: Epoch, period_secs: u64, preactive_secs: u64, postactive_secs: u64) -> Self {
        let nominal_start = epoch.saturating_mul(period_secs);
        Self {
            start_unix: nominal_start.saturating_sub(preactive_secs),
            end_unix: nominal_start
                .saturating_add(period_secs)
                .saturating_add(postactive_secs),
        }
    }

    pub fn contains(&self, unix: u64) -> bool {
        unix >= self.start_unix && unix < self.end_unix
    }

    pub fn remaining(&self, unix: u64) -> u64 {
        self.end_unix.saturating_sub(unix)
    }
}

/// Derives the epoch's address: keeps `base`'s high 64 bits (the /64
/// prefix) and replaces the low 64 bits with `HMAC-SHA256(secret, name ||
/// epoch)`, truncated to 8 bytes.
///
/// This is a pure function, as `spec.md` §2 requires of the oracle.
pub fn derive_address(base: Ipv6Addr, name: &str, secret: &[u8], epoch: Epoch) -> Ipv6Addr {
    let digest = hmac_tag(name, secret, epoch);

    let mut octets = base.octets();
    octets[8..16].copy_from_slice(&digest[..8]);
    Ipv6Addr::from(octets)
}

fn hmac_tag(name: &str, secret: &[u8], epoch: Epoch) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(name.as_bytes());
    mac.update(b"\0");
    mac.update(&epoch.to_be_bytes());
    mac.finalize().into_bytes().into()
}

/// A short hex fingerprint of the epoch's derivation tag, safe to log
/// alongside the epoch number to correlate rotations without exposing the
/// full digest or the secret that produced it.
pub fn epoch_fingerprint(name: &str, secret: &[u8], epoch: Epoch) -> String {
    hex::encode(&hmac_tag(name, secret, epoch)[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_stable_within_period() {
        let base = current_epoch(32, 8, UNIX_EPOCH + std::time::Duration::from_secs(1_000_000));
        for skew in 0..31 {
            let e = current_epoch(
                32,
                8,
                UNIX_EPOCH + std::time::Duration::from_secs(1_000_000 + skew),
            );
            assert_eq!(base, e, "epoch moved within the same 32s period at +{skew}s");
        }
    }

    #[test]
    fn epoch_advances_across_period_boundary() {
        let a = current_epoch(32, 8, UNIX_EPOCH + std::time::Duration::from_secs(1_000_000));
        let b = current_epoch(32, 8, UNIX_EPOCH + std::time::Duration::from_secs(1_000_032));
        assert_eq!(b, a + 1);
    }

    #[test]
    fn window_covers_preactive_and_postactive() {
        let w = EpochWindow::for_epoch(10, 32, 8, 8);
        assert_eq!(w.start_unix, 10 * 32 - 8);
        assert_eq!(w.end_unix, 11 * 32 + 8);
        assert!(w.contains(10 * 32));
        assert!(w.contains(w.start_unix));
        assert!(!w.contains(w.end_unix));
    }

    #[test]
    fn derivation_is_deterministic_and_prefix_preserving() {
        let base: Ipv6Addr = "2001:db8::".parse().unwrap();
        let a = derive_address(base, "host.example.com", b"secret", 42);
        let b = derive_address(base, "host.example.com", b"secret", 42);
        assert_eq!(a, b);
        assert_eq!(&a.octets()[..8], &base.octets()[..8]);
    }

    #[test]
    fn derivation_changes_with_epoch() {
        let base: Ipv6Addr = "2001:db8::".parse().unwrap();
        let a = derive_address(base, "host.example.com", b"secret", 42);
        let b = derive_address(base, "host.example.com", b"secret", 43);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_deterministic_and_short() {
        let a = epoch_fingerprint("host.example.com", b"secret", 42);
        let b = epoch_fingerprint("host.example.com", b"secret", 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8); // 4 bytes, hex-encoded
    }
}
