//! The probing task contract and an explicit module registry.
//!
//! Grounded on `examples/original_source/src/exitmap.py`'s module loading
//! (`imp.load_source` over `modules/*.py`, looking for optional `setup`,
//! `teardown`, `destinations`, and a required `probe`) and on spec.md §4.7.
//! Per the redesign note in spec.md §9 ("Module discovery via directory
//! import"), there is no dynamic loading here: every task registers itself
//! in `registry()` by name, and the driver looks it up in that table.

use crate::descriptors::ServerDescriptor;
use crate::error::SocksError;
use crate::ipc::{self, IpcMsg};
use crate::socks_client::SocksClient;
use crate::tor_control::CircuitId;
use futures::future::BoxFuture;
use std::net::Ipv4Addr;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;

/// The network handle a task uses to reach its exit. Every connection made
/// through it is forced over the scanner's local Tor SOCKS port and tagged
/// with the owning circuit id on the IPC channel, replacing the source's
/// process-wide socket monkey-patch with an explicit, scoped object (the
/// redesign spec.md §9 calls for). There is no ambient global state: once
/// this value is dropped, nothing about how the process creates sockets has
/// changed.
pub struct NetworkContext {
    socks: SocksClient,
    circuit: CircuitId,
    ipc: UnixStream,
    analysis_dir: Option<PathBuf>,
}

impl NetworkContext {
    pub fn new(socks: SocksClient, circuit: CircuitId, ipc: UnixStream, analysis_dir: Option<PathBuf>) -> Self {
        Self { socks, circuit, ipc, analysis_dir }
    }

    /// Where this task invocation may deposit artifacts, if `-a/--analysis-dir`
    /// was given (spec.md §6); already namespaced per module run (see
    /// `driver.rs`'s caller in `main.rs`), so tasks don't need to do their own
    /// de-duplication against other modules or scan runs.
    pub fn analysis_dir(&self) -> Option<&Path> {
        self.analysis_dir.as_deref()
    }

    pub async fn dial(&mut self, host: Ipv4Addr, port: u16) -> Result<tokio::net::TcpStream, SocksError> {
        self.socks.connect(host, port, self.circuit, &mut self.ipc).await
    }

    pub async fn resolve(&mut self, domain: &str) -> Result<Ipv4Addr, SocksError> {
        self.socks.resolve(domain, self.circuit, &mut self.ipc).await
    }

    /// Tell the engine this task invocation is done. Every task must call
    /// this exactly once before returning, even on failure; see
    /// `worker.rs`'s panic-hook guard, which enforces it unconditionally.
    pub async fn report_done(&mut self) {
        if let Err(err) = ipc::send(&mut self.ipc, &IpcMsg::TaskDone { circuit: self.circuit }).await {
            tracing::warn!("failed to report task completion over IPC: {err}");
        }
    }
}

/// A pluggable probing routine run once per exit relay.
pub trait Task: Send + Sync {
    /// The name tasks are registered and selected by on the CLI.
    fn name(&self) -> &'static str;

    /// Destinations this task needs exit policies to permit. `None` means
    /// no filtering: every selected exit is probed regardless of policy.
    fn destinations(&self) -> Option<HashSet<(Ipv4Addr, u16)>> {
        None
    }

    /// Runs once before any circuit is built.
    fn setup(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs once after the scan is judged finished.
    fn teardown(&self) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Runs once per built circuit, inside the task worker subprocess.
    fn probe<'a>(
        &'a self,
        ctx: &'a mut NetworkContext,
        exit: &'a ServerDescriptor,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Resolve a task name to its implementation. No dynamic loading: adding a
/// task means adding a match arm here and a module under `modules/`.
pub fn lookup(name: &str) -> Option<Box<dyn Task>> {
    match name {
        "dns" => Some(Box::new(crate::modules::dns::DnsTask)),
        "checktest" => Some(Box::new(crate::modules::checktest::CheckTestTask)),
        _ => None,
    }
}

pub fn registered_names() -> &'static [&'static str] {
    &["dns", "checktest"]
}
