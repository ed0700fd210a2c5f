//! Country-code relay lookup.
//!
//! The primary path queries the Tor Project's onionoo directory metadata
//! service over HTTPS (`examples/original_source/src/ip2loc.py::country`),
//! returning the fingerprints of relays onionoo currently lists for a given
//! two-letter country code. `reqwest` is the ambient HTTP client the rest of
//! this crate already pulls in for directory-style requests.
//!
//! `ip2loc.py` also ships an offline mode: a sorted table of IP ranges to
//! country codes, searched with a recursive binary search. That table isn't
//! needed for the primary onionoo path, but the search routine itself is
//! kept as a standalone utility (e.g. for callers who already have a local
//! GeoIP range table and want to avoid a network round-trip), rewritten
//! iteratively per the redesign guidance against recursion for what is, at
//! its core, a loop.

use crate::descriptors::Fingerprint;
use crate::error::CountryLookupError;
use crate::relay_selector::CountryLookup;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;

const ONIONOO_DETAILS_URL: &str = "https://onionoo.torproject.org/details";

#[derive(Debug, Deserialize)]
struct OnionooResponse {
    relays: Vec<OnionooRelay>,
}

#[derive(Debug, Deserialize)]
struct OnionooRelay {
    fingerprint: String,
}

/// Looks up relay fingerprints by country via onionoo.
pub struct OnionooCountryLookup {
    client: reqwest::blocking::Client,
}

impl OnionooCountryLookup {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for OnionooCountryLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl CountryLookup for OnionooCountryLookup {
    fn relays_in_country(&self, country_code: &str) -> Result<HashSet<Fingerprint>, crate::error::SelectionError> {
        fetch_country(&self.client, country_code).map_err(|err| crate::error::SelectionError::Malformed {
            path: format!("{ONIONOO_DETAILS_URL}?country={country_code}"),
            reason: err.to_string(),
        })
    }
}

fn fetch_country(
    client: &reqwest::blocking::Client,
    country_code: &str,
) -> Result<HashSet<Fingerprint>, CountryLookupError> {
    let country_code = country_code.to_lowercase();
    tracing::info!("fetching relays with country code \"{country_code}\" from onionoo");

    let response = client
        .get(ONIONOO_DETAILS_URL)
        .query(&[("country", &country_code)])
        .send()
        .map_err(|err| CountryLookupError::Request(err.to_string()))?
        .error_for_status()
        .map_err(|err| CountryLookupError::Request(err.to_string()))?;

    let parsed: OnionooResponse = response
        .json()
        .map_err(|err| CountryLookupError::Malformed(err.to_string()))?;

    Ok(parsed.relays.into_iter().map(|r| r.fingerprint.to_uppercase()).collect())
}

/// One row of a sorted-by-range-start offline GeoIP table: `[start, end]`
/// inclusive IPv4 range mapped to a two-letter country code.
#[derive(Debug, Clone)]
pub struct GeoRange {
    pub start: u32,
    pub end: u32,
    pub country_code: String,
}

/// Iterative binary search over a table sorted by `start`, returning the
/// country code of the range containing `ip`, or `None` if no range
/// contains it. `table` must be sorted ascending by `start` and ranges must
/// not overlap, as produced by any standard GeoIP range dump.
pub fn lookup_offline(table: &[GeoRange], ip: Ipv4Addr) -> Option<&str> {
    let needle = u32::from(ip);
    let mut lo = 0usize;
    let mut hi = table.len();

    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let range = &table[mid];
        if needle < range.start {
            hi = mid;
        } else if needle > range.end {
            lo = mid + 1;
        } else {
            return Some(&range.country_code);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<GeoRange> {
        vec![
            GeoRange { start: 0, end: 99, country_code: "aa".into() },
            GeoRange { start: 100, end: 199, country_code: "bb".into() },
            GeoRange { start: 200, end: 299, country_code: "cc".into() },
        ]
    }

    #[test]
    fn finds_containing_range() {
        let t = table();
        assert_eq!(lookup_offline(&t, Ipv4Addr::from(150)), Some("bb"));
        assert_eq!(lookup_offline(&t, Ipv4Addr::from(0)), Some("aa"));
        assert_eq!(lookup_offline(&t, Ipv4Addr::from(299)), Some("cc"));
    }

    #[test]
    fn returns_none_outside_any_range() {
        let t = table();
        assert_eq!(lookup_offline(&t, Ipv4Addr::from(300)), None);
    }

    #[test]
    fn empty_table_returns_none() {
        assert_eq!(lookup_offline(&[], Ipv4Addr::from(5)), None);
    }
}
