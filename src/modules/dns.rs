//! Detects malfunctioning or hijacked DNS resolution at an exit relay.
//!
//! Ported from `examples/original_source/src/modules/dns.py`: resolve a
//! fixed list of domains over Tor's SOCKS RESOLVE extension and flag any
//! exit whose answer falls outside the known-good whitelist.

use crate::descriptors::ServerDescriptor;
use crate::task::{NetworkContext, Task};
use futures::future::BoxFuture;
use std::net::Ipv4Addr;

/// `domain -> known-good IPv4 addresses`, carried over verbatim from the
/// Python source's `probe()` table.
const DOMAINS: &[(&str, &[&str])] = &[
    ("www.youporn.com", &["31.192.116.24"]),
    ("youporn.com", &["31.192.116.24"]),
    (
        "www.torproject.org",
        &["38.229.72.14", "93.95.227.222", "86.59.30.40", "38.229.72.16", "82.195.75.101", "154.35.132.70"],
    ),
    (
        "www.wikileaks.org",
        &[
            "95.211.113.131",
            "95.211.113.154",
            "91.218.114.210",
            "91.218.244.152",
            "195.35.109.53",
            "195.35.109.44",
            "91.218.244.151",
        ],
    ),
    ("www.i2p2.de", &["91.143.92.136"]),
    ("thepiratebay.se", &["141.101.118.194"]),
    ("torrentfreak.com", &["162.159.245.23", "162.159.246.23"]),
    ("github.com", &["192.30.252.128", "192.30.252.129", "192.30.252.131", "192.30.252.130"]),
    ("blockchain.info", &["141.101.112.196", "190.93.243.195"]),
];

pub struct DnsTask;

impl Task for DnsTask {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn probe<'a>(
        &'a self,
        ctx: &'a mut NetworkContext,
        exit: &'a ServerDescriptor,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            for (domain, whitelist) in DOMAINS {
                resolve_and_check(ctx, &exit.fingerprint, domain, whitelist).await;
            }
            Ok(())
        })
    }
}

async fn resolve_and_check(ctx: &mut NetworkContext, exit_fpr: &str, domain: &str, whitelist: &[&str]) {
    let resolved = match ctx.resolve(domain).await {
        Ok(ip) => ip,
        Err(err) => {
            tracing::debug!("exit {exit_fpr} could not resolve \"{domain}\": {err}");
            return;
        }
    };

    let expected: Vec<Ipv4Addr> = whitelist.iter().filter_map(|s| s.parse().ok()).collect();
    if expected.contains(&resolved) {
        tracing::debug!("IPv4 address of {domain} as expected for exit {exit_fpr}");
    } else {
        tracing::error!("exit {exit_fpr} returned unexpected address {resolved} for domain {domain}");
    }
}
