//! Launches and configures the embedded Tor instance this scanner drives.
//!
//! Grounded on `examples/other_examples/4ed96971_tari-project-tari__common-src-tor.rs.rs`'s
//! `Tor::run`, which is the only file in this corpus that actually drives
//! `libtor::Tor` end to end (random data dir, `SocksPort`/`ControlPort`
//! flags, `start_background`). Configuration values themselves, the
//! `__LeaveStreamsUnattached`/`__DisablePredictedCircuits` torrc overrides,
//! cookie authentication, and disabling server-descriptor refetching, come
//! from spec.md §6's "Controller protocol (consumed)" section and
//! `examples/original_source/src/exitmap.py`'s `bootstrap_tor`.

use libtor::{LogDestination, LogLevel, TorFlag};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::error::ControllerError;
use crate::tor_control::Controller;

/// A running embedded Tor instance plus the bits callers need to drive it:
/// a connected control-port client and the SOCKS listener address.
pub struct TorProcess {
    pub controller: Controller,
    pub socks_addr: SocketAddr,
    _background: JoinHandle<Result<u8, libtor::Error>>,
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("could not create data directory {0:?}: {1}")]
    DataDir(PathBuf, std::io::Error),
    #[error("could not read Tor's log to discover its listener ports: {0}")]
    LogUnreadable(std::io::Error),
    #[error("timed out waiting for Tor to report its SOCKS/control ports")]
    PortDiscoveryTimeout,
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("could not read cookie authentication file {0:?}: {1}")]
    CookieUnreadable(PathBuf, std::io::Error),
}

/// Boot an embedded Tor process rooted at `data_dir`, configured the way
/// the scanner needs: streams left unattached so the engine can attach them
/// itself, no predicted (speculative) circuits, and server descriptors
/// served from the local cache rather than refetched mid-scan.
pub async fn bootstrap(data_dir: &Path) -> Result<TorProcess, LaunchError> {
    std::fs::create_dir_all(data_dir).map_err(|e| LaunchError::DataDir(data_dir.to_path_buf(), e))?;

    let log_path = data_dir.join("tor.log");
    let cookie_path = data_dir.join("control_auth_cookie");

    let mut tor = libtor::Tor::new();
    tor.flag(TorFlag::DataDirectory(data_dir.to_string_lossy().to_string()))
        .flag(TorFlag::SocksPortAuto)
        .flag(TorFlag::ControlPortAuto)
        .flag(TorFlag::CookieAuthentication(true.into()))
        .flag(TorFlag::LogTo(LogLevel::Notice, LogDestination::File(log_path.to_string_lossy().to_string())))
        .flag(TorFlag::Custom("__LeaveStreamsUnattached 1".into()))
        .flag(TorFlag::Custom("__DisablePredictedCircuits 1".into()))
        .flag(TorFlag::Custom("FetchServerDescriptors 0".into()));

    let background = tor.start_background();

    let (socks_port, control_port) = discover_ports(&log_path, Duration::from_secs(30)).await?;
    let socks_addr: SocketAddr = ([127, 0, 0, 1], socks_port).into();
    let control_addr: SocketAddr = ([127, 0, 0, 1], control_port).into();

    let controller = Controller::connect(control_addr).await?;
    let cookie = tokio::fs::read(&cookie_path)
        .await
        .map_err(|e| LaunchError::CookieUnreadable(cookie_path.clone(), e))?;
    controller.authenticate_cookie(&cookie).await?;
    controller.set_conf("Log", "err file /dev/null").await?;
    controller.set_conf("FetchServerDescriptors", "0").await?;
    controller.set_events(&["CIRC", "STREAM"]).await?;

    Ok(TorProcess { controller, socks_addr, _background: background })
}

/// Tail Tor's startup log until both listener lines have appeared, or the
/// timeout elapses. Tor logs lines of the form:
/// `Socks listener listening on port 9050.`
/// `Control listener listening on port 9051.`
async fn discover_ports(log_path: &Path, timeout: Duration) -> Result<(u16, u16), LaunchError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut socks_port = None;
    let mut control_port = None;

    loop {
        if let Ok(file) = tokio::fs::File::open(log_path).await {
            let mut lines = BufReader::new(file).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(port) = extract_listener_port(&line, "Socks listener listening on port ") {
                    socks_port = Some(port);
                }
                if let Some(port) = extract_listener_port(&line, "Control listener listening on port ") {
                    control_port = Some(port);
                }
            }
        }

        if let (Some(s), Some(c)) = (socks_port, control_port) {
            return Ok((s, c));
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(LaunchError::PortDiscoveryTimeout);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn extract_listener_port(line: &str, prefix: &str) -> Option<u16> {
    let rest = line.split(prefix).nth(1)?;
    rest.trim_end_matches('.').trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_socks_port() {
        let line = "Jul 28 10:00:00.000 [notice] Socks listener listening on port 9050.";
        assert_eq!(extract_listener_port(line, "Socks listener listening on port "), Some(9050));
    }

    #[test]
    fn extracts_control_port() {
        let line = "Jul 28 10:00:00.000 [notice] Control listener listening on port 9051.";
        assert_eq!(extract_listener_port(line, "Control listener listening on port "), Some(9051));
    }

    #[test]
    fn unrelated_line_yields_none() {
        let line = "Jul 28 10:00:00.000 [notice] Bootstrapped 100% (done): Done";
        assert_eq!(extract_listener_port(line, "Socks listener listening on port "), None);
    }
}
