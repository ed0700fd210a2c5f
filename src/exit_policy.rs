//! Exit policy types and parser.
//!
//! A relay's exit policy is an ordered list of accept/reject rules over
//! address ranges and port ranges, taken verbatim from its server
//! descriptor's `accept`/`reject` lines. The grammar follows dir-spec.txt
//! section 2.1.3; the shape of these types is grounded on
//! `examples/mroth-tordesc/src/server_descriptor/exit_policy.rs`, rewritten
//! against today's `std` (no external parser combinator crate; the grammar
//! is small enough to walk by hand, the same call `mroth-tordesc`'s author
//! made with `nom`).

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rule {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrSpec {
    Wildcard,
    /// A single address, equivalent to a /32.
    Addr(Ipv4Addr),
    Cidr { addr: Ipv4Addr, prefix: u8 },
}

impl AddrSpec {
    fn contains(&self, ip: Ipv4Addr) -> bool {
        match self {
            AddrSpec::Wildcard => true,
            AddrSpec::Addr(addr) => *addr == ip,
            AddrSpec::Cidr { addr, prefix } => {
                let prefix = (*prefix).min(32);
                if prefix == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - prefix);
                (u32::from(*addr) & mask) == (u32::from(ip) & mask)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortSpec {
    Wildcard,
    Port(u16),
    Range(u16, u16),
}

impl PortSpec {
    fn contains(&self, port: u16) -> bool {
        match self {
            PortSpec::Wildcard => true,
            PortSpec::Port(p) => *p == port,
            PortSpec::Range(lo, hi) => (*lo..=*hi).contains(&port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPattern {
    pub rule: Rule,
    pub addr: AddrSpec,
    pub port: PortSpec,
}

/// An ordered, order-sensitive collection of exit patterns.
///
/// The first pattern that matches an address/port wins; an empty policy
/// rejects everything (Tor's implicit final rule).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPolicy(pub Vec<ExitPattern>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty exit policy line")]
    Empty,
    #[error("unknown rule {0:?}, expected accept/reject")]
    UnknownRule(String),
    #[error("malformed addrspec:portspec {0:?}")]
    MalformedPattern(String),
    #[error("malformed address {0:?}")]
    MalformedAddr(String),
    #[error("malformed port {0:?}")]
    MalformedPort(String),
}

impl ExitPolicy {
    /// Parse one `accept`/`reject` line (without the leading keyword), e.g.
    /// `"accept *:443"` or `"reject 127.0.0.0/8:*"` split on the first space
    /// by the caller (`descriptors.rs` hands us `rule` and `pattern`
    /// separately).
    pub fn push_line(&mut self, rule: &str, pattern: &str) -> Result<(), ParseError> {
        let rule = match rule {
            "accept" | "accept6" => Rule::Accept,
            "reject" | "reject6" => Rule::Reject,
            other => return Err(ParseError::UnknownRule(other.to_string())),
        };
        let (addr, port) = parse_exit_pattern(pattern)?;
        self.0.push(ExitPattern { rule, addr, port });
        Ok(())
    }

    /// Whether this policy permits exiting to `(host, port)`, per dir-spec:
    /// the first matching rule decides, default is reject.
    pub fn can_exit_to(&self, host: Ipv4Addr, port: u16) -> bool {
        for pattern in &self.0 {
            if pattern.addr.contains(host) && pattern.port.contains(port) {
                return matches!(pattern.rule, Rule::Accept);
            }
        }
        false
    }

    /// Whether this policy allows exiting to *anything*, i.e. has at least
    /// one accept rule: the `is_exiting_allowed()` check from
    /// `relayselector.py`'s `get_exit_policies`.
    pub fn is_exiting_allowed(&self) -> bool {
        self.0.iter().any(|p| matches!(p.rule, Rule::Accept))
    }
}

fn parse_exit_pattern(pattern: &str) -> Result<(AddrSpec, PortSpec), ParseError> {
    let (addr_str, port_str) = pattern
        .rsplit_once(':')
        .ok_or_else(|| ParseError::MalformedPattern(pattern.to_string()))?;
    let addr = parse_addr_spec(addr_str)?;
    let port = parse_port_spec(port_str)?;
    Ok((addr, port))
}

fn parse_addr_spec(s: &str) -> Result<AddrSpec, ParseError> {
    if s == "*" {
        return Ok(AddrSpec::Wildcard);
    }
    if let Some((addr, prefix)) = s.split_once('/') {
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ParseError::MalformedAddr(s.to_string()))?;
        // Masks expressed as dotted quads (e.g. "/255.255.0.0") reduce to a
        // prefix length exactly like a CIDR suffix.
        let prefix = if let Ok(mask) = prefix.parse::<Ipv4Addr>() {
            u32::from(mask).count_ones() as u8
        } else {
            prefix
                .parse()
                .map_err(|_| ParseError::MalformedAddr(s.to_string()))?
        };
        return Ok(AddrSpec::Cidr { addr, prefix });
    }
    let addr: Ipv4Addr = s
        .parse()
        .map_err(|_| ParseError::MalformedAddr(s.to_string()))?;
    Ok(AddrSpec::Addr(addr))
}

fn parse_port_spec(s: &str) -> Result<PortSpec, ParseError> {
    if s == "*" {
        return Ok(PortSpec::Wildcard);
    }
    if let Some((lo, hi)) = s.split_once('-') {
        let lo: u16 = lo.parse().map_err(|_| ParseError::MalformedPort(s.to_string()))?;
        let hi: u16 = hi.parse().map_err(|_| ParseError::MalformedPort(s.to_string()))?;
        return Ok(PortSpec::Range(lo, hi));
    }
    let port: u16 = s.parse().map_err(|_| ParseError::MalformedPort(s.to_string()))?;
    Ok(PortSpec::Port(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_port() {
        let (addr, port) = parse_exit_pattern("0.0.0.0/8:*").unwrap();
        assert_eq!(addr, AddrSpec::Cidr { addr: Ipv4Addr::new(0, 0, 0, 0), prefix: 8 });
        assert_eq!(port, PortSpec::Wildcard);
    }

    #[test]
    fn parses_port_range() {
        let (addr, port) = parse_exit_pattern("*:6660-6697").unwrap();
        assert_eq!(addr, AddrSpec::Wildcard);
        assert_eq!(port, PortSpec::Range(6660, 6697));
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut policy = ExitPolicy::default();
        policy.push_line("reject", "127.0.0.0/8:*").unwrap();
        policy.push_line("accept", "*:443").unwrap();
        assert!(!policy.can_exit_to(Ipv4Addr::new(127, 0, 0, 1), 443));
        assert!(policy.can_exit_to(Ipv4Addr::new(1, 2, 3, 4), 443));
        assert!(!policy.can_exit_to(Ipv4Addr::new(1, 2, 3, 4), 80));
    }

    #[test]
    fn default_is_reject() {
        let policy = ExitPolicy::default();
        assert!(!policy.can_exit_to(Ipv4Addr::new(1, 2, 3, 4), 443));
        assert!(!policy.is_exiting_allowed());
    }

    #[test]
    fn reject_all_has_no_exiting_allowed() {
        let mut policy = ExitPolicy::default();
        policy.push_line("reject", "*:*").unwrap();
        assert!(!policy.is_exiting_allowed());
    }

    #[test]
    fn scenario_exits_from_spec() {
        // spec.md §8 scenario 1: E1 accepts *:443, E2 rejects everything,
        // E3 accepts 1.2.3.4:*.
        let mut e1 = ExitPolicy::default();
        e1.push_line("accept", "*:443").unwrap();

        let mut e2 = ExitPolicy::default();
        e2.push_line("reject", "*:*").unwrap();

        let mut e3 = ExitPolicy::default();
        e3.push_line("accept", "1.2.3.4:*").unwrap();

        let dest = (Ipv4Addr::new(1, 2, 3, 4), 443u16);
        assert!(e1.can_exit_to(dest.0, dest.1));
        assert!(!e2.can_exit_to(dest.0, dest.1));
        assert!(e3.can_exit_to(dest.0, dest.1));
    }
}
