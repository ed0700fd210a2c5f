//! Joins circuit events and stream events that arrive out of order and
//! asynchronously, keyed on TCP source port, and issues the controller
//! directive that pins a stream to its circuit.
//!
//! Grounded on `examples/original_source/src/eventhandler.py`'s attacher
//! class, restructured per the variant-type redesign: instead of storing a
//! partially-applied closure per port, each pending entry is an explicit
//! `PendingAttach` of which side arrived first.

use crate::error::ControllerError;
use std::collections::HashMap;

pub type CircuitId = u64;
pub type StreamId = u64;

/// One side of a join still waiting for its other half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAttach {
    WaitingForStream { circuit: CircuitId },
    WaitingForCircuit { stream: StreamId },
}

/// Anything that can attach a stream to a circuit on the controller
/// connection. Implemented by `tor_control::Controller`; kept as a trait so
/// the join logic can be unit-tested without a live control port.
pub trait StreamAttacher {
    fn attach_stream(&self, stream: StreamId, circuit: CircuitId) -> Result<(), ControllerError>;
}

/// Port-keyed table of half-completed attaches.
///
/// Invariant: a given source port appears at most once in the table at any
/// time. Whichever event arrives second for a port completes the join,
/// issues the attach, and removes the entry; attach is never retried.
#[derive(Debug, Default)]
pub struct Attacher {
    pending: HashMap<u16, PendingAttach>,
}

impl Attacher {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record that `circuit` opened a SOCKS connection from `port` (a task's
    /// IPC report). If a stream is already waiting on this port, attach
    /// immediately; otherwise park the circuit side.
    pub fn prepare_circuit(&mut self, controller: &dyn StreamAttacher, port: u16, circuit: CircuitId) {
        match self.pending.remove(&port) {
            Some(PendingAttach::WaitingForCircuit { stream }) => {
                self.issue_attach(controller, stream, circuit);
            }
            Some(PendingAttach::WaitingForStream { .. }) | None => {
                self.pending.insert(port, PendingAttach::WaitingForStream { circuit });
            }
        }
    }

    /// Record that `stream` is a NEW or NEWRESOLVE stream event originating
    /// from `port`. If a circuit is already waiting on this port, attach
    /// immediately; otherwise park the stream side.
    pub fn prepare_stream(&mut self, controller: &dyn StreamAttacher, port: u16, stream: StreamId) {
        match self.pending.remove(&port) {
            Some(PendingAttach::WaitingForStream { circuit }) => {
                self.issue_attach(controller, stream, circuit);
            }
            Some(PendingAttach::WaitingForCircuit { .. }) | None => {
                self.pending.insert(port, PendingAttach::WaitingForCircuit { stream });
            }
        }
    }

    fn issue_attach(&self, controller: &dyn StreamAttacher, stream: StreamId, circuit: CircuitId) {
        if let Err(err) = controller.attach_stream(stream, circuit) {
            // The circuit may have already collapsed; log and move on, per
            // the "attach is never retried" invariant.
            tracing::warn!("attach_stream({stream}, {circuit}) failed: {err}");
        }
    }
}

/// Extract the TCP source port from a stream event's textual form, e.g.
/// `"STREAM 14 NEW 0 1.2.3.4:443 SOURCE_ADDR=127.0.0.1:40001 PURPOSE=USER"`.
pub fn extract_source_port(event_line: &str) -> Result<u16, crate::error::NoSourcePort> {
    event_line
        .split_whitespace()
        .find_map(|field| field.strip_prefix("SOURCE_ADDR="))
        .and_then(|addr| addr.rsplit_once(':'))
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| crate::error::NoSourcePort(event_line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingController {
        calls: RefCell<Vec<(StreamId, CircuitId)>>,
        fail_next: RefCell<bool>,
    }

    impl StreamAttacher for RecordingController {
        fn attach_stream(&self, stream: StreamId, circuit: CircuitId) -> Result<(), ControllerError> {
            if *self.fail_next.borrow() {
                return Err(ControllerError::OperationFailed("circuit gone".into()));
            }
            self.calls.borrow_mut().push((stream, circuit));
            Ok(())
        }
    }

    #[test]
    fn circuit_then_stream_attaches() {
        let controller = RecordingController::default();
        let mut attacher = Attacher::new();
        attacher.prepare_circuit(&controller, 40001, 5);
        assert_eq!(attacher.len(), 1);
        attacher.prepare_stream(&controller, 40001, 14);
        assert!(attacher.is_empty());
        assert_eq!(*controller.calls.borrow(), vec![(14, 5)]);
    }

    #[test]
    fn stream_then_circuit_attaches() {
        let controller = RecordingController::default();
        let mut attacher = Attacher::new();
        attacher.prepare_stream(&controller, 40002, 99);
        attacher.prepare_circuit(&controller, 40002, 7);
        assert!(attacher.is_empty());
        assert_eq!(*controller.calls.borrow(), vec![(99, 7)]);
    }

    #[test]
    fn distinct_ports_stay_independent() {
        let controller = RecordingController::default();
        let mut attacher = Attacher::new();
        attacher.prepare_circuit(&controller, 1, 1);
        attacher.prepare_circuit(&controller, 2, 2);
        assert_eq!(attacher.len(), 2);
        attacher.prepare_stream(&controller, 1, 10);
        assert_eq!(attacher.len(), 1);
        assert_eq!(*controller.calls.borrow(), vec![(10, 1)]);
    }

    #[test]
    fn attach_failure_still_clears_entry_and_does_not_panic() {
        let controller = RecordingController::default();
        *controller.fail_next.borrow_mut() = true;
        let mut attacher = Attacher::new();
        attacher.prepare_circuit(&controller, 5, 1);
        attacher.prepare_stream(&controller, 5, 2);
        assert!(attacher.is_empty());
        assert!(controller.calls.borrow().is_empty());
    }

    #[test]
    fn extracts_source_port_from_stream_event() {
        let line = "STREAM 14 NEW 0 1.2.3.4:443 SOURCE_ADDR=127.0.0.1:40001 PURPOSE=USER";
        assert_eq!(extract_source_port(line).unwrap(), 40001);
    }

    #[test]
    fn missing_source_addr_is_an_error() {
        let line = "STREAM 14 NEW 0 1.2.3.4:443 PURPOSE=USER";
        assert!(extract_source_port(line).is_err());
    }
}
