//! Exit relay selection: turn the cached consensus and descriptor documents
//! into the set of exits a scan should run against.
//!
//! Grounded on `examples/original_source/src/relayselector.py`'s `get_exits`:
//! the same cheapest-to-most-expensive filter ordering (exit flag presence,
//! good/bad exit, address/nickname/version/fingerprint allowlist, country
//! code, then destination reachability) is kept, just expressed as an
//! iterator chain instead of a sequence of list comprehensions.

use crate::descriptors::{self, ConsensusEntry, Fingerprint, ServerDescriptor};
use crate::error::SelectionError;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;

/// Both cached directory documents, loaded and parsed from `tor_dir`. Mirrors
/// `relayselector.py`'s `_get_router_list`/`_get_consensus`: both files are
/// read from the same data directory Tor itself maintains.
pub struct CachedDocuments {
    pub consensus: HashMap<Fingerprint, ConsensusEntry>,
    pub descriptors: HashMap<Fingerprint, ServerDescriptor>,
}

/// Read and parse `cached-consensus` and `cached-descriptors` out of `tor_dir`.
/// Either file being missing or unparseable is fatal to the whole scan: every
/// module invocation needs both, so this runs once at startup rather than per
/// module (spec.md §7: "unreadable descriptor files" is one of the few
/// top-level fatal conditions).
pub fn load_cached_documents(tor_dir: &Path) -> Result<CachedDocuments, SelectionError> {
    let consensus_path = tor_dir.join("cached-consensus");
    let descriptors_path = tor_dir.join("cached-descriptors");

    let consensus_text = std::fs::read_to_string(&consensus_path).map_err(|source| SelectionError::Unreadable {
        path: consensus_path.display().to_string(),
        source,
    })?;
    let descriptors_text = std::fs::read_to_string(&descriptors_path).map_err(|source| SelectionError::Unreadable {
        path: descriptors_path.display().to_string(),
        source,
    })?;

    let consensus = descriptors::parse_consensus(&consensus_text).map_err(|err| SelectionError::Malformed {
        path: consensus_path.display().to_string(),
        reason: err.to_string(),
    })?;
    let descriptors = descriptors::parse_descriptors(&descriptors_text).map_err(|err| SelectionError::Malformed {
        path: descriptors_path.display().to_string(),
        reason: err.to_string(),
    })?;

    Ok(CachedDocuments { consensus, descriptors })
}

/// One relay known to satisfy every selection filter, paired with the
/// destinations (if any were requested) it is willing to carry traffic to.
#[derive(Debug, Clone)]
pub struct ExitCandidate {
    pub fingerprint: Fingerprint,
    pub nickname: String,
    pub address: Ipv4Addr,
    pub tor_version: String,
    pub reachable: Reachable,
}

/// Mirrors the Python module's `UniversalSet` trick: when the caller didn't
/// ask for particular destinations, every exit is trivially "reachable" to
/// anything, without needing to materialize an actual set of pairs.
#[derive(Debug, Clone)]
pub enum Reachable {
    Any,
    Only(HashSet<(Ipv4Addr, u16)>),
}

impl Reachable {
    pub fn allows(&self, dest: (Ipv4Addr, u16)) -> bool {
        match self {
            Reachable::Any => true,
            Reachable::Only(set) => set.contains(&dest),
        }
    }
}

/// Which exit-flag relays to include. At least one of the two must be set;
/// requesting neither always yields zero exits (the Python version warns
/// about this being "probably a programming error" and returns `{}`).
#[derive(Debug, Clone, Copy)]
pub struct ExitKind {
    pub good: bool,
    pub bad: bool,
}

impl Default for ExitKind {
    fn default() -> Self {
        Self { good: true, bad: false }
    }
}

/// Selection criteria, each skipped when `None`.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    pub kind: ExitKind,
    pub country_code: Option<String>,
    pub version: Option<String>,
    pub nickname: Option<String>,
    pub address: Option<String>,
    pub requested_fingerprints: Option<HashSet<Fingerprint>>,
    pub destinations: Option<HashSet<(Ipv4Addr, u16)>>,
}

/// Resolves a two-letter country code to the fingerprints of relays located
/// there. Implemented by `country.rs` against onionoo; kept as a trait here
/// so selection logic doesn't depend on the HTTP client directly and stays
/// unit-testable.
pub trait CountryLookup {
    fn relays_in_country(&self, country_code: &str) -> Result<HashSet<Fingerprint>, SelectionError>;
}

/// Validates a user-supplied first-hop fingerprint against the cached
/// consensus before any circuit is attempted (spec.md §8 scenario 6): a
/// first hop that Tor doesn't currently know about would fail every single
/// circuit build, so this is checked once up front rather than left to
/// surface as N per-exit failures.
pub fn relay_in_consensus(
    consensus: &HashMap<Fingerprint, ConsensusEntry>,
    fingerprint: &str,
) -> Result<(), SelectionError> {
    if consensus.contains_key(fingerprint) {
        Ok(())
    } else {
        Err(SelectionError::UnknownFirstHop(fingerprint.to_string()))
    }
}

pub fn select_exits(
    consensus: &HashMap<Fingerprint, ConsensusEntry>,
    descriptors: &HashMap<Fingerprint, ServerDescriptor>,
    filter: &SelectionFilter,
    country_lookup: Option<&dyn CountryLookup>,
) -> Result<Vec<ExitCandidate>, SelectionError> {
    // have_exit_policy: descriptors whose policy allows exiting somewhere.
    let have_exit_policy: HashMap<&Fingerprint, &ServerDescriptor> = descriptors
        .iter()
        .filter(|(_, desc)| desc.exit_policy.is_exiting_allowed())
        .map(|(fpr, desc)| (fpr, desc))
        .collect();

    // Drop relays with a non-empty exit policy but no Exit flag, or no
    // consensus entry at all.
    let mut candidates: Vec<&ServerDescriptor> = have_exit_policy
        .iter()
        .filter(|(fpr, _)| {
            consensus
                .get(fpr.as_str())
                .map(|entry| entry.flags.has("Exit"))
                .unwrap_or(false)
        })
        .map(|(_, desc)| **desc)
        .collect();

    tracing::info!(
        "{} relays have an exit flag and non-empty exit policy, out of {} with a non-empty policy.",
        candidates.len(),
        have_exit_policy.len(),
    );

    if candidates.is_empty() {
        tracing::warn!(
            "no relays have both a non-empty exit policy and an exit flag; the cached consensus may be stale"
        );
        return Ok(Vec::new());
    }

    if filter.kind.bad && filter.kind.good {
        // no-op: every candidate already qualifies.
    } else if filter.kind.bad {
        candidates.retain(|desc| {
            consensus
                .get(&desc.fingerprint)
                .map(|e| e.flags.has("BadExit"))
                .unwrap_or(false)
        });
        if candidates.is_empty() {
            tracing::warn!("there are no bad exits in the current consensus");
            return Ok(Vec::new());
        }
    } else if filter.kind.good {
        candidates.retain(|desc| {
            consensus
                .get(&desc.fingerprint)
                .map(|e| !e.flags.has("BadExit"))
                .unwrap_or(false)
        });
        if candidates.is_empty() {
            tracing::warn!("there are no good exits in the current consensus");
            return Ok(Vec::new());
        }
    } else {
        tracing::warn!("selection filter requests neither good nor bad exits; returning zero exits");
        return Ok(Vec::new());
    }

    if filter.address.is_some()
        || filter.nickname.is_some()
        || filter.version.is_some()
        || filter.requested_fingerprints.is_some()
    {
        candidates.retain(|desc| {
            filter
                .address
                .as_deref()
                .map(|needle| desc.address.to_string().contains(needle))
                .unwrap_or(true)
                && filter
                    .nickname
                    .as_deref()
                    .map(|needle| desc.nickname.contains(needle))
                    .unwrap_or(true)
                && filter
                    .version
                    .as_deref()
                    .map(|v| v == desc.tor_version)
                    .unwrap_or(true)
                && filter
                    .requested_fingerprints
                    .as_ref()
                    .map(|set| set.contains(&desc.fingerprint))
                    .unwrap_or(true)
        });
        if candidates.is_empty() {
            tracing::warn!("no exit relays meet basic filter conditions");
            return Ok(Vec::new());
        }
    }

    if let Some(code) = &filter.country_code {
        let fprs = match country_lookup {
            Some(lookup) => lookup.relays_in_country(code).unwrap_or_else(|err| {
                tracing::warn!("country lookup failed: {err}");
                HashSet::new()
            }),
            None => HashSet::new(),
        };
        candidates.retain(|desc| fprs.contains(&desc.fingerprint));
        if candidates.is_empty() {
            tracing::warn!("no exit relays meet the country-code filter condition");
            return Ok(Vec::new());
        }
    }

    let total_with_policy = have_exit_policy.len();
    let result: Vec<ExitCandidate> = match &filter.destinations {
        None => candidates
            .into_iter()
            .map(|desc| ExitCandidate {
                fingerprint: desc.fingerprint.clone(),
                nickname: desc.nickname.clone(),
                address: desc.address,
                tor_version: desc.tor_version.clone(),
                reachable: Reachable::Any,
            })
            .collect(),
        Some(destinations) => candidates
            .into_iter()
            .filter_map(|desc| {
                let ok: HashSet<(Ipv4Addr, u16)> = destinations
                    .iter()
                    .copied()
                    .filter(|(host, port)| desc.exit_policy.can_exit_to(*host, *port))
                    .collect();
                if ok.is_empty() {
                    None
                } else {
                    Some(ExitCandidate {
                        fingerprint: desc.fingerprint.clone(),
                        nickname: desc.nickname.clone(),
                        address: desc.address,
                        tor_version: desc.tor_version.clone(),
                        reachable: Reachable::Only(ok),
                    })
                }
            })
            .collect(),
    };

    tracing::info!(
        "{} out of {} exit relays meet all filter conditions.",
        result.len(),
        total_with_policy
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_policy::ExitPolicy;

    fn consensus_entry(fpr: &str, flags: &[&str]) -> ConsensusEntry {
        ConsensusEntry {
            fingerprint: fpr.to_string(),
            nickname: format!("relay-{fpr}"),
            address: Ipv4Addr::new(1, 2, 3, 4),
            flags: crate::descriptors::FlagSet(flags.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn descriptor(fpr: &str, policy: ExitPolicy, version: &str) -> ServerDescriptor {
        ServerDescriptor {
            fingerprint: fpr.to_string(),
            nickname: format!("relay-{fpr}"),
            address: Ipv4Addr::new(1, 2, 3, 4),
            tor_version: version.to_string(),
            exit_policy: policy,
        }
    }

    #[test]
    fn scenario_from_spec() {
        let mut e1_policy = ExitPolicy::default();
        e1_policy.push_line("accept", "*:443").unwrap();
        let mut e2_policy = ExitPolicy::default();
        e2_policy.push_line("reject", "*:*").unwrap();
        let mut e3_policy = ExitPolicy::default();
        e3_policy.push_line("accept", "1.2.3.4:*").unwrap();

        let mut consensus = HashMap::new();
        consensus.insert("E1".to_string(), consensus_entry("E1", &["Exit", "Running"]));
        consensus.insert("E2".to_string(), consensus_entry("E2", &["Exit", "Running"]));
        consensus.insert("E3".to_string(), consensus_entry("E3", &["Exit", "Running"]));

        let mut descriptors = HashMap::new();
        descriptors.insert("E1".to_string(), descriptor("E1", e1_policy, "0.4.8.0"));
        descriptors.insert("E2".to_string(), descriptor("E2", e2_policy, "0.4.8.0"));
        descriptors.insert("E3".to_string(), descriptor("E3", e3_policy, "0.4.8.0"));

        let mut destinations = HashSet::new();
        destinations.insert((Ipv4Addr::new(1, 2, 3, 4), 443u16));

        let filter = SelectionFilter {
            destinations: Some(destinations),
            ..Default::default()
        };

        let exits = select_exits(&consensus, &descriptors, &filter, None).unwrap();
        let fprs: HashSet<&str> = exits.iter().map(|e| e.fingerprint.as_str()).collect();
        // E2 rejects everything and drops out entirely (empty exit policy
        // means it never even enters have_exit_policy).
        assert_eq!(fprs, HashSet::from(["E1", "E3"]));
    }

    #[test]
    fn missing_exit_flag_is_excluded() {
        let mut policy = ExitPolicy::default();
        policy.push_line("accept", "*:443").unwrap();

        let mut consensus = HashMap::new();
        consensus.insert("F1".to_string(), consensus_entry("F1", &["Running"]));
        let mut descriptors = HashMap::new();
        descriptors.insert("F1".to_string(), descriptor("F1", policy, "0.4.8.0"));

        let exits = select_exits(&consensus, &descriptors, &SelectionFilter::default(), None).unwrap();
        assert!(exits.is_empty());
    }

    #[test]
    fn unknown_first_hop_is_rejected() {
        let mut consensus = HashMap::new();
        consensus.insert("F1".to_string(), consensus_entry("F1", &["Running"]));
        assert!(relay_in_consensus(&consensus, "F1").is_ok());
        assert!(matches!(
            relay_in_consensus(&consensus, "UNKNOWN"),
            Err(SelectionError::UnknownFirstHop(fpr)) if fpr == "UNKNOWN"
        ));
    }

    #[test]
    fn bad_exit_filter_selects_only_flagged_relays() {
        let mut policy = ExitPolicy::default();
        policy.push_line("accept", "*:443").unwrap();

        let mut consensus = HashMap::new();
        consensus.insert("G1".to_string(), consensus_entry("G1", &["Exit"]));
        consensus.insert("B1".to_string(), consensus_entry("B1", &["Exit", "BadExit"]));
        let mut descriptors = HashMap::new();
        descriptors.insert("G1".to_string(), descriptor("G1", policy.clone(), "0.4.8.0"));
        descriptors.insert("B1".to_string(), descriptor("B1", policy, "0.4.8.0"));

        let filter = SelectionFilter {
            kind: ExitKind { good: false, bad: true },
            ..Default::default()
        };
        let exits = select_exits(&consensus, &descriptors, &filter, None).unwrap();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].fingerprint, "B1");
    }
}
