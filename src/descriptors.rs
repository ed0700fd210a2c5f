//! Parsing for the two cached directory documents the scanner reads:
//! `cached-consensus` and `cached-descriptors`.
//!
//! Both documents use Tor's generic "keyword line" meta-format (dir-spec.txt
//! §1.2): a sequence of lines, each starting with a keyword, optionally
//! followed by whitespace-separated arguments, with base64 "objects"
//! (PGP-armor-style blocks) in between that we skip. The shape mirrors
//! `examples/mroth-tordesc/src/document.rs`'s grammar comment, implemented
//! here as a straightforward line-oriented scan rather than a parser
//! combinator: `tordesc`'s own `nom` grammar is from an API generation that
//! no longer exists, and the keyword-line format is simple enough to walk by
//! hand (the same judgment this crate makes for `exit_policy.rs`).
//!
//! We only extract the fields `relay_selector.rs` needs: fingerprint, flags,
//! address, nickname, version, and exit policy. Fields we don't consume
//! (bandwidth lines, onion keys, signatures, ...) are skipped; per dir-spec,
//! parsers MUST ignore keyword lines they don't recognize.

use crate::exit_policy::ExitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub type Fingerprint = String;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet(pub Vec<String>);

impl FlagSet {
    pub fn has(&self, flag: &str) -> bool {
        self.0.iter().any(|f| f == flag)
    }
}

/// One relay's entry in the network consensus (a `r`/`s` line pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusEntry {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub address: Ipv4Addr,
    pub flags: FlagSet,
}

/// A relay's full server descriptor, as published by the relay itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub address: Ipv4Addr,
    pub tor_version: String,
    pub exit_policy: ExitPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("malformed fingerprint on line {0:?}")]
    MalformedFingerprint(String),
    #[error("malformed address on line {0:?}")]
    MalformedAddress(String),
    #[error(transparent)]
    Policy(#[from] crate::exit_policy::ParseError),
}

/// Parse a `cached-consensus` document into fingerprint-keyed entries.
///
/// Consensus `r` lines look like:
/// `r nickname identity digest YYYY-MM-DD HH:MM:SS address ORPort DirPort`
/// where `identity` is the base64 (no padding) relay identity; we decode it
/// to the 40-character hex fingerprint relay selector callers expect, the
/// same representation `stem`'s `RouterStatusEntry.fingerprint` exposes.
/// The following `s` line carries the space-separated flag list.
pub fn parse_consensus(text: &str) -> Result<HashMap<Fingerprint, ConsensusEntry>, DocumentError> {
    let mut entries = HashMap::new();
    let mut pending: Option<(Fingerprint, String, Ipv4Addr)> = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("r ") {
            // nickname identity digest date time address orport dirport
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 6 {
                continue;
            }
            let nickname = fields[0].to_string();
            let identity_b64 = fields[1];
            let address: Ipv4Addr = fields[5]
                .parse()
                .map_err(|_| DocumentError::MalformedAddress(line.to_string()))?;
            let fingerprint = identity_to_fingerprint(identity_b64)
                .ok_or_else(|| DocumentError::MalformedFingerprint(line.to_string()))?;
            pending = Some((fingerprint, nickname, address));
        } else if let Some(rest) = line.strip_prefix("s") {
            if let Some((fingerprint, nickname, address)) = pending.take() {
                let flags = rest.split_whitespace().map(str::to_string).collect();
                entries.insert(
                    fingerprint.clone(),
                    ConsensusEntry {
                        fingerprint,
                        nickname,
                        address,
                        flags: FlagSet(flags),
                    },
                );
            }
        }
    }

    Ok(entries)
}

/// Base64-decode (no padding) a consensus `identity` field into the
/// upper-case hex fingerprint used everywhere else in this crate.
fn identity_to_fingerprint(identity_b64: &str) -> Option<Fingerprint> {
    let bytes = base64_decode_unpadded(identity_b64)?;
    if bytes.len() != 20 {
        return None;
    }
    Some(bytes.iter().map(|b| format!("{b:02X}")).collect())
}

const B64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_decode_unpadded(input: &str) -> Option<Vec<u8>> {
    let mut table = [255u8; 256];
    for (i, &c) in B64_ALPHABET.iter().enumerate() {
        table[c as usize] = i as u8;
    }

    let mut bits: u32 = 0;
    let mut n_bits = 0u32;
    let mut out = Vec::new();
    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        let val = table[c as usize];
        if val == 255 {
            return None;
        }
        bits = (bits << 6) | val as u32;
        n_bits += 6;
        if n_bits >= 8 {
            n_bits -= 8;
            out.push((bits >> n_bits) as u8);
        }
    }
    Some(out)
}

/// Parse a `cached-descriptors` document into fingerprint-keyed full
/// descriptors. A descriptor is one `router` item followed by its
/// `fingerprint`, `platform`, and `accept`/`reject` keyword lines, up to the
/// next `router` line or end of document.
pub fn parse_descriptors(
    text: &str,
) -> Result<HashMap<Fingerprint, ServerDescriptor>, DocumentError> {
    let mut out = HashMap::new();

    let mut nickname = String::new();
    let mut address = None;
    let mut fingerprint: Option<Fingerprint> = None;
    let mut tor_version = String::new();
    let mut policy = ExitPolicy::default();

    let flush = |out: &mut HashMap<Fingerprint, ServerDescriptor>,
                 fingerprint: &mut Option<Fingerprint>,
                 nickname: &mut String,
                 address: &mut Option<Ipv4Addr>,
                 tor_version: &mut String,
                 policy: &mut ExitPolicy| {
        if let (Some(fpr), Some(addr)) = (fingerprint.take(), address.take()) {
            out.insert(
                fpr.clone(),
                ServerDescriptor {
                    fingerprint: fpr,
                    nickname: std::mem::take(nickname),
                    address: addr,
                    tor_version: std::mem::take(tor_version),
                    exit_policy: std::mem::replace(policy, ExitPolicy::default()),
                },
            );
        } else {
            *nickname = String::new();
            *tor_version = String::new();
            *policy = ExitPolicy::default();
        }
    };

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("router ") {
            flush(
                &mut out,
                &mut fingerprint,
                &mut nickname,
                &mut address,
                &mut tor_version,
                &mut policy,
            );
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if let Some(&n) = fields.first() {
                nickname = n.to_string();
            }
            if let Some(&a) = fields.get(1) {
                address = a.parse().ok();
            }
        } else if let Some(rest) = line.strip_prefix("fingerprint ") {
            let hex: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
            fingerprint = Some(hex.to_uppercase());
        } else if let Some(rest) = line.strip_prefix("platform Tor ") {
            tor_version = rest.split_whitespace().next().unwrap_or("").to_string();
        } else if let Some(rest) = line.strip_prefix("accept ") {
            policy.push_line("accept", rest)?;
        } else if let Some(rest) = line.strip_prefix("reject ") {
            policy.push_line("reject", rest)?;
        } else if let Some(rest) = line.strip_prefix("accept6 ") {
            policy.push_line("accept6", rest)?;
        } else if let Some(rest) = line.strip_prefix("reject6 ") {
            policy.push_line("reject6", rest)?;
        }
    }
    flush(
        &mut out,
        &mut fingerprint,
        &mut nickname,
        &mut address,
        &mut tor_version,
        &mut policy,
    );

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSENSUS_FIXTURE: &str = "\
r example AAAAAAAAAAAAAAAAAAAAAAAAAAA= AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-01-01 00:00:00 1.2.3.4 9001 0
s Exit Fast Running Stable V2Dir Valid
r badexample AAAAAAAAAAAAAAAAAAAAAAAAAAB= AAAAAAAAAAAAAAAAAAAAAAAAAAA 2024-01-01 00:00:00 5.6.7.8 9001 0
s BadExit Exit Fast Running Stable Valid
";

    #[test]
    fn parses_consensus_flags() {
        let entries = parse_consensus(CONSENSUS_FIXTURE).unwrap();
        assert_eq!(entries.len(), 2);
        let good = entries.values().find(|e| e.nickname == "example").unwrap();
        assert!(good.flags.has("Exit"));
        assert!(!good.flags.has("BadExit"));
        let bad = entries.values().find(|e| e.nickname == "badexample").unwrap();
        assert!(bad.flags.has("BadExit"));
    }

    const DESCRIPTOR_FIXTURE: &str = "\
router example 1.2.3.4 9001 0 0
platform Tor 0.4.8.10 on Linux
fingerprint AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA
accept *:443
reject *:*
router other 9.9.9.9 9001 0 0
platform Tor 0.4.7.0 on Linux
fingerprint BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB
reject *:*
";

    #[test]
    fn parses_multiple_descriptors() {
        let descs = parse_descriptors(DESCRIPTOR_FIXTURE).unwrap();
        assert_eq!(descs.len(), 2);
        let example = descs
            .values()
            .find(|d| d.nickname == "example")
            .expect("example descriptor present");
        assert_eq!(example.tor_version, "0.4.8.10");
        assert!(example.exit_policy.is_exiting_allowed());
        assert!(example.exit_policy.can_exit_to(Ipv4Addr::new(1, 2, 3, 4), 443));

        let other = descs.values().find(|d| d.nickname == "other").unwrap();
        assert!(!other.exit_policy.is_exiting_allowed());
    }
}
