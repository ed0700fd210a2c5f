//! Entry point for a task invocation running in its own OS process.
//!
//! The engine spawns the scanner's own binary with `--task-worker` once per
//! built circuit, mirroring `multiprocessing.Process(target=module_closure(...))`
//! in `examples/original_source/src/eventhandler.py::new_circuit`; the
//! process-per-exit isolation the source gets from `multiprocessing` is
//! reproduced here by re-exec rather than fork, since Rust has no portable
//! fork-with-continued-async-runtime story. Arguments travel as a JSON blob
//! on stdin rather than argv, keeping fingerprints and serialized
//! descriptors off the process list.
//!
//! The baseline "finished" contract (spec.md §9, Open Questions, option
//! (b)) requires a `TaskDone` IPC message even when the task panics or
//! returns an error. Once the IPC connection is up, `run` never again
//! returns without first calling `ctx.report_done()`: the lookup-and-probe
//! work happens in `run_probe`, whose `Result` (including an unknown task
//! name or a caught panic) is inspected only after the report has gone out.

use crate::attacher::CircuitId;
use crate::descriptors::ServerDescriptor;
use crate::socks_client::SocksClient;
use crate::task::{self, NetworkContext};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use tokio::net::UnixStream;

/// The JSON blob an engine hands its worker subprocess on stdin.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerArgs {
    pub task_name: String,
    pub circuit: CircuitId,
    pub exit: ServerDescriptor,
    pub socks_addr: SocketAddr,
    pub ipc_socket_path: String,
}

/// Runs inside the re-exec'd subprocess: reads `WorkerArgs` from stdin,
/// connects to the engine's IPC socket, runs the named task's `probe`, and
/// unconditionally reports completion before exiting.
///
/// Failure to read stdin, parse it, or connect to the IPC socket happens
/// before the circuit's IPC channel even exists, so there is no channel to
/// report completion on; that's an inherent limit of the IPC being the only
/// bridge back to the engine. Every failure mode reachable after the
/// connection is up (an unknown task name, a `probe` that returns `Err`, or
/// a `probe` that panics) reports `TaskDone` before `run` returns.
pub async fn run() -> anyhow::Result<()> {
    let mut stdin = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut stdin)?;
    let args: WorkerArgs = serde_json::from_str(&stdin)?;

    let ipc = UnixStream::connect(&args.ipc_socket_path).await?;
    let socks = SocksClient::new(args.socks_addr);
    let analysis_dir = std::env::var_os("TORSCAN_ANALYSIS_DIR").map(std::path::PathBuf::from);
    let mut ctx = NetworkContext::new(socks, args.circuit, ipc, analysis_dir);

    let result = run_probe(&mut ctx, &args).await;
    ctx.report_done().await;
    result
}

/// The lookup-and-probe work proper, isolated from `run` so that every path
/// through it, including one that never finds the named task, produces a
/// plain `Result` for `run` to report `TaskDone` against, instead of a `?`
/// that would skip straight past the report.
async fn run_probe(ctx: &mut NetworkContext, args: &WorkerArgs) -> anyhow::Result<()> {
    let task = task::lookup(&args.task_name)
        .ok_or_else(|| anyhow::anyhow!("unknown task {:?}", args.task_name))?;

    // Catch panics so the caller's TaskDone report always runs; a task that
    // panics still must not leave its circuit slot stuck open forever.
    let result = AssertUnwindSafe(task.probe(ctx, &args.exit)).catch_unwind().await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err),
        Err(panic) => Err(anyhow::anyhow!("task {:?} panicked: {}", args.task_name, panic_message(&panic))),
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
