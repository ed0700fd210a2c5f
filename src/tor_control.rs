//! Async client for Tor's text-based control-port protocol (control-spec.txt).
//!
//! Grounded on the command surface `examples/original_source/src/eventhandler.py`
//! and `src/command.py` drive through the `stem` library: `AUTHENTICATE`,
//! `SETCONF`, `EXTENDCIRCUIT`, `ATTACHSTREAM`, `CLOSECIRCUIT`,
//! `GETINFO desc/id/<fpr>`, and `SETEVENTS CIRC STREAM`. `stem` hides the
//! line-oriented reply/event demultiplexing behind its `Controller` class;
//! here that demultiplexing is an explicit background task over a split
//! `TcpStream`, since Rust has no equivalent of `stem`'s background event
//! thread to reuse.

use crate::error::ControllerError;
use std::collections::VecDeque;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

pub type CircuitId = u64;
pub type StreamId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Extended,
    Built,
    Failed,
    Closed,
    Unknown(String),
}

impl CircuitStatus {
    fn parse(s: &str) -> Self {
        match s {
            "LAUNCHED" => Self::Launched,
            "EXTENDED" => Self::Extended,
            "BUILT" => Self::Built,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    NewResolve,
    SentConnect,
    SentResolve,
    Succeeded,
    Failed,
    Closed,
    Detached,
    Unknown(String),
}

impl StreamStatus {
    fn parse(s: &str) -> Self {
        match s {
            "NEW" => Self::New,
            "NEWRESOLVE" => Self::NewResolve,
            "SENTCONNECT" => Self::SentConnect,
            "SENTRESOLVE" => Self::SentResolve,
            "SUCCEEDED" => Self::Succeeded,
            "FAILED" => Self::Failed,
            "CLOSED" => Self::Closed,
            "DETACHED" => Self::Detached,
            other => Self::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub id: CircuitId,
    pub status: CircuitStatus,
    /// Relay fingerprints along the path, in order; the last is the exit.
    pub path: Vec<String>,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub id: StreamId,
    pub status: StreamStatus,
    pub raw: String,
}

#[derive(Debug, Clone)]
pub enum ControlEvent {
    Circuit(CircuitEvent),
    Stream(StreamEvent),
    Other(String),
}

fn parse_event(line: &str) -> ControlEvent {
    let body = line.trim_start_matches("650").trim_start();
    let mut fields = body.split_whitespace();
    match fields.next() {
        Some("CIRC") => {
            let Some(id_str) = fields.next() else {
                return ControlEvent::Other(line.to_string());
            };
            let Ok(id) = id_str.parse() else {
                return ControlEvent::Other(line.to_string());
            };
            let status = fields.next().map(CircuitStatus::parse).unwrap_or(CircuitStatus::Unknown(String::new()));
            let path = fields
                .next()
                .map(|p| p.split(',').map(|hop| hop.split('~').next().unwrap_or(hop).trim_start_matches('$').to_string()).collect())
                .unwrap_or_default();
            ControlEvent::Circuit(CircuitEvent { id, status, path, raw: line.to_string() })
        }
        Some("STREAM") => {
            let Some(id_str) = fields.next() else {
                return ControlEvent::Other(line.to_string());
            };
            let Ok(id) = id_str.parse() else {
                return ControlEvent::Other(line.to_string());
            };
            let status = fields.next().map(StreamStatus::parse).unwrap_or(StreamStatus::Unknown(String::new()));
            ControlEvent::Stream(StreamEvent { id, status, raw: line.to_string() })
        }
        _ => ControlEvent::Other(line.to_string()),
    }
}

/// A completed control-port reply: status code plus the lines of its body
/// (without the status-code prefix).
#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn ok(&self) -> bool {
        self.code == 250
    }
}

struct PendingCommand {
    line: String,
    reply_tx: oneshot::Sender<Reply>,
}

/// Handle to a live control-port connection.
///
/// Commands are serialized through an internal queue to a background task
/// that owns the socket; that task also classifies unsolicited `650` lines
/// as events and republishes them on a broadcast channel, mirroring how
/// `stem.Controller` dispatches to registered event listeners.
#[derive(Clone)]
pub struct Controller {
    cmd_tx: mpsc::Sender<PendingCommand>,
    events: broadcast::Sender<ControlEvent>,
}

impl Controller {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self, ControllerError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (events, _) = broadcast::channel(256);

        tokio::spawn(run_connection(read_half, write_half, cmd_rx, events.clone()));

        Ok(Self { cmd_tx, events })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    async fn command(&self, line: String) -> Result<Reply, ControllerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(PendingCommand { line, reply_tx })
            .await
            .map_err(|_| ControllerError::Closed)?;
        reply_rx.await.map_err(|_| ControllerError::Closed)
    }

    pub async fn authenticate(&self, password: Option<&str>) -> Result<(), ControllerError> {
        let arg = match password {
            Some(p) => format!("\"{}\"", p.replace('"', "\\\"")),
            None => String::new(),
        };
        let reply = self.command(format!("AUTHENTICATE {arg}")).await?;
        require_ok(&reply)
    }

    /// Authenticate using the contents of Tor's `CookieAuthentication` cookie
    /// file, hex-encoded per control-spec.txt §3.5.
    pub async fn authenticate_cookie(&self, cookie: &[u8]) -> Result<(), ControllerError> {
        let hex: String = cookie.iter().map(|b| format!("{b:02x}")).collect();
        let reply = self.command(format!("AUTHENTICATE {hex}")).await?;
        require_ok(&reply)
    }

    pub async fn set_conf(&self, key: &str, value: &str) -> Result<(), ControllerError> {
        let reply = self.command(format!("SETCONF {key}=\"{value}\"")).await?;
        require_ok(&reply)
    }

    pub async fn set_events(&self, events: &[&str]) -> Result<(), ControllerError> {
        let reply = self.command(format!("SETEVENTS {}", events.join(" "))).await?;
        require_ok(&reply)
    }

    /// `EXTENDCIRCUIT 0 <fpr1>,<fpr2>,...`: builds a new circuit over the
    /// given path and returns the circuit id Tor assigned.
    pub async fn new_circuit(&self, path: &[String]) -> Result<CircuitId, ControllerError> {
        let reply = self
            .command(format!("EXTENDCIRCUIT 0 {}", path.join(",")))
            .await?;
        if !reply.ok() {
            return Err(ControllerError::OperationFailed(reply.lines.join("; ")));
        }
        reply
            .lines
            .first()
            .and_then(|l| l.strip_prefix("EXTENDED "))
            .and_then(|id| id.trim().parse().ok())
            .ok_or_else(|| ControllerError::Protocol(format!("unexpected EXTENDCIRCUIT reply: {:?}", reply.lines)))
    }

    pub async fn attach_stream(&self, stream: StreamId, circuit: CircuitId) -> Result<(), ControllerError> {
        let reply = self.command(format!("ATTACHSTREAM {stream} {circuit}")).await?;
        require_ok(&reply)
    }

    pub async fn close_circuit(&self, circuit: CircuitId) -> Result<(), ControllerError> {
        let reply = self.command(format!("CLOSECIRCUIT {circuit}")).await?;
        require_ok(&reply)
    }

    /// `GETINFO desc/id/<fpr>`: the relay's full server descriptor text, or
    /// `DescriptorUnavailable` if Tor doesn't have it cached.
    pub async fn get_server_descriptor(&self, fingerprint: &str) -> Result<String, ControllerError> {
        let reply = self.command(format!("GETINFO desc/id/{fingerprint}")).await?;
        if !reply.ok() {
            return Err(ControllerError::DescriptorUnavailable(fingerprint.to_string()));
        }
        let body = reply.lines.join("\n");
        if body.trim().is_empty() {
            return Err(ControllerError::DescriptorUnavailable(fingerprint.to_string()));
        }
        Ok(body)
    }
}

fn require_ok(reply: &Reply) -> Result<(), ControllerError> {
    if reply.ok() {
        Ok(())
    } else {
        Err(ControllerError::OperationFailed(reply.lines.join("; ")))
    }
}

async fn run_connection(
    read_half: tokio::net::tcp::OwnedReadHalf,
    write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::Receiver<PendingCommand>,
    events: broadcast::Sender<ControlEvent>,
) {
    let write_half = Mutex::new(write_half);
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: VecDeque<oneshot::Sender<Reply>> = VecDeque::new();
    let mut in_progress: Option<Reply> = None;
    // Set while consuming a `250+keyword=` data reply (control-spec.txt
    // §3.3), e.g. `GETINFO desc/id/<fpr>`'s descriptor body: every line up
    // to a lone "." is raw payload, not a status line, and must not go
    // through the `line[0..3].parse::<u16>()` status-code check below.
    let mut data_block: Option<Vec<String>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let mut w = write_half.lock().await;
                if w.write_all(format!("{}\r\n", cmd.line).as_bytes()).await.is_err() {
                    break;
                }
                pending.push_back(cmd.reply_tx);
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };

                if let Some(mut buf) = data_block.take() {
                    if line == "." {
                        if let Some(reply) = in_progress.as_mut() {
                            reply.lines.push(buf.join("\n"));
                        }
                    } else {
                        // Dot-stuffing (control-spec.txt §2): a line in the
                        // data that itself starts with "." arrives prefixed
                        // with an extra one, to distinguish it from the
                        // terminator.
                        buf.push(line.strip_prefix("..").map(|rest| format!(".{rest}")).unwrap_or(line));
                        data_block = Some(buf);
                    }
                    continue;
                }

                if line.starts_with("650") {
                    let _ = events.send(parse_event(&line));
                    continue;
                }
                if line.len() < 4 {
                    continue;
                }
                let Ok(code) = line[0..3].parse::<u16>() else { continue };
                let sep = line.as_bytes()[3];
                let body = line[4..].to_string();
                let reply = in_progress.get_or_insert_with(|| Reply { code, lines: Vec::new() });
                reply.lines.push(body);
                match sep {
                    b'+' => {
                        data_block = Some(Vec::new());
                    }
                    b' ' => {
                        if let Some(reply) = in_progress.take() {
                            if let Some(tx) = pending.pop_front() {
                                let _ = tx.send(reply);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_circuit_built_event() {
        let line = "650 CIRC 14 BUILT $AAAA~relay1,$BBBB~relay2 BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL";
        match parse_event(line) {
            ControlEvent::Circuit(ev) => {
                assert_eq!(ev.id, 14);
                assert_eq!(ev.status, CircuitStatus::Built);
                assert_eq!(ev.path, vec!["AAAA".to_string(), "BBBB".to_string()]);
            }
            other => panic!("expected circuit event, got {other:?}"),
        }
    }

    #[test]
    fn parses_stream_new_event() {
        let line = "650 STREAM 14 NEW 0 1.2.3.4:443 SOURCE_ADDR=127.0.0.1:40001 PURPOSE=USER";
        match parse_event(line) {
            ControlEvent::Stream(ev) => {
                assert_eq!(ev.id, 14);
                assert_eq!(ev.status, StreamStatus::New);
            }
            other => panic!("expected stream event, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_event_kind_is_other() {
        let line = "650 ORCONN $AAAA CONNECTED";
        assert!(matches!(parse_event(line), ControlEvent::Other(_)));
    }

    // get_server_descriptor's reply is a `250+...=` data block, not a plain
    // status line; exercise the real connection loop end to end over a
    // loopback socket rather than just the pure `parse_event` helper above.
    #[tokio::test]
    async fn get_server_descriptor_reads_a_data_reply() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = sock.into_split();
            let mut lines = BufReader::new(read_half).lines();

            // drain the GETINFO request line
            lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(b"250+desc/id/AAAA=\r\nrouter example 1.2.3.4 9001 0 0\r\naccept *:443\r\n.\r\n250 OK\r\n")
                .await
                .unwrap();
        });

        let controller = Controller::connect(addr).await.unwrap();
        let body = controller.get_server_descriptor("AAAA").await.unwrap();
        assert!(body.contains("router example 1.2.3.4 9001 0 0"));
        assert!(body.contains("accept *:443"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn data_reply_unescapes_dot_stuffed_lines() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = sock.into_split();
            let mut lines = BufReader::new(read_half).lines();
            lines.next_line().await.unwrap().unwrap();
            write_half
                .write_all(b"250+desc/id/BBBB=\r\n..still data\r\n.\r\n250 OK\r\n")
                .await
                .unwrap();
        });

        let controller = Controller::connect(addr).await.unwrap();
        let body = controller.get_server_descriptor("BBBB").await.unwrap();
        assert!(body.contains(".still data"));
        server.await.unwrap();
    }
}
