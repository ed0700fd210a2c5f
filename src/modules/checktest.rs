//! Detects false negatives from <https://check.torproject.org>: fetches its
//! `/api/ip` endpoint over the exit being probed and flags any exit the
//! service doesn't recognize as Tor traffic.
//!
//! Ported from `examples/original_source/src/modules/checktest.py`'s
//! `fetch_page`. The original relies on the process-wide monkey-patched
//! socket so that `urllib2`'s usual HTTPS client is transparently routed
//! through Tor; here `ctx.dial` gives us a raw `TcpStream` already carrying
//! the exit's circuit tag, and we drive TLS over it ourselves with
//! `tokio-rustls` (the crate `reqwest`'s own `rustls-tls` feature already
//! pulls into this workspace, so reusing it directly for a bare stream
//! avoids a second TLS stack).

use crate::descriptors::ServerDescriptor;
use crate::task::{NetworkContext, Task};
use futures::future::BoxFuture;
use rustls_pki_types::ServerName;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

const CHECK_HOST: &str = "check.torproject.org";
/// check.torproject.org's address at the time this module was ported; the
/// destination filter only needs *an* address this host resolves to so the
/// selector can consult exit policies against it.
const CHECK_ADDR: Ipv4Addr = Ipv4Addr::new(195, 154, 164, 243);
const CHECK_PORT: u16 = 443;

pub struct CheckTestTask;

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(rename = "IsTor")]
    is_tor: bool,
    #[serde(rename = "IP")]
    ip: String,
}

impl Task for CheckTestTask {
    fn name(&self) -> &'static str {
        "checktest"
    }

    fn destinations(&self) -> Option<HashSet<(Ipv4Addr, u16)>> {
        Some(HashSet::from([(CHECK_ADDR, CHECK_PORT)]))
    }

    fn probe<'a>(
        &'a self,
        ctx: &'a mut NetworkContext,
        exit: &'a ServerDescriptor,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if let Err(err) = fetch_and_check(ctx, &exit.fingerprint).await {
                tracing::debug!("check.torproject.org fetch over exit {} failed: {err}", exit.fingerprint);
            }
            Ok(())
        })
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn fetch_and_check(ctx: &mut NetworkContext, exit_fpr: &str) -> anyhow::Result<()> {
    let tcp = ctx.dial(CHECK_ADDR, CHECK_PORT).await?;
    let connector = tls_connector();
    let server_name = ServerName::try_from(CHECK_HOST)?.to_owned();
    let mut tls = connector.connect(server_name, tcp).await?;

    let request = format!(
        "GET /api/ip HTTP/1.1\r\nHost: {CHECK_HOST}\r\nConnection: close\r\nAccept: application/json\r\n\r\n"
    );
    tls.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    tls.read_to_end(&mut response).await?;
    let response = String::from_utf8_lossy(&response);

    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or(&response);
    let parsed: CheckResponse = serde_json::from_str(body.trim())?;

    if parsed.is_tor {
        tracing::debug!("exit {exit_fpr} passed the check test");
    } else {
        tracing::error!(
            "check.torproject.org thinks exit {exit_fpr} isn't Tor; it saw address {}",
            parsed.ip.trim()
        );
    }
    Ok(())
}
