//! Error kinds shared across the scanner's subsystems.

use thiserror::Error;

/// Failure while selecting the set of exit relays to scan.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("could not read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {path}: {reason}")]
    Malformed { path: String, reason: String },
    #[error("exit selection yielded {count} exits but need at least one")]
    Empty { count: usize },
    #[error("first hop {0} not found in cached consensus")]
    UnknownFirstHop(String),
}

/// Transient failure talking to the Tor controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("I/O error on control connection: {0}")]
    Io(#[from] std::io::Error),
    #[error("control connection closed unexpectedly")]
    Closed,
    #[error("controller rejected command: {0}")]
    OperationFailed(String),
    #[error("could not authenticate to controller: {0}")]
    AuthFailed(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("descriptor for {0} not available")]
    DescriptorUnavailable(String),
    #[error("malformed reply: {0}")]
    Protocol(String),
}

/// Failure negotiating or using the SOCKSv5 protocol.
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server replied with unsupported SOCKS version {0:#x}")]
    BadVersion(u8),
    #[error("server rejected authentication method negotiation")]
    NoAcceptableAuth,
    #[error("domain name is longer than 255 bytes")]
    DomainTooLong,
    #[error("resolve failed: {0:?}")]
    ResolveFailed(ReplyCode),
    #[error("connect failed: {0:?}")]
    ConnectFailed(ReplyCode),
    #[error("address family not supported over SOCKS")]
    AddressFamilyNotSupported,
}

/// SOCKSv5 server reply codes, mapped to roughly their errno equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Unknown(u8),
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ReplyCode::Succeeded,
            0x01 => ReplyCode::GeneralFailure,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            other => ReplyCode::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ReplyCode::Succeeded)
    }
}

/// Top-level error returned by the scan driver for one module invocation.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("unknown module {0:?}")]
    UnknownModule(String),
}

/// Errors produced while resolving a relay's country from directory metadata.
#[derive(Debug, Error)]
pub enum CountryLookupError {
    #[error("network request failed: {0}")]
    Request(String),
    #[error("could not parse onionoo response: {0}")]
    Malformed(String),
}

/// A stream event's textual representation did not contain a parseable source port.
#[derive(Debug, Error)]
#[error("could not extract source port from stream event: {0}")]
pub struct NoSourcePort(pub String);
