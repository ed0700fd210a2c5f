//! Tor-flavored SOCKSv5 client, used inside task workers to reach the local
//! Tor SOCKS port.
//!
//! Grounded on `examples/original_source/src/torsocks.py`'s `_Torsocket`:
//! the same two operations (`connect`, Tor's extended `resolve`), the same
//! "report our local endpoint onto the IPC channel right after the TCP
//! handshake with the proxy" ordering (`ourneg`/`send_queue` there, here
//! the `ipc::send(NewConn)` call between `negotiate` and the CONNECT/RESOLVE
//! request). Rewritten against owned `tokio::net::TcpStream`s rather than
//! monkey-patching `socket.socket`, per spec.md §9's "explicit network
//! context" redesign note: the scope is `socks_client::connect`/`resolve`
//! themselves rather than a process-wide patch.

use crate::attacher::CircuitId;
use crate::error::{ReplyCode, SocksError};
use crate::ipc::{self, IpcMsg};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const CMD_RESOLVE: u8 = 0xF0;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

/// A client bound to one local Tor SOCKS listener.
#[derive(Debug, Clone, Copy)]
pub struct SocksClient {
    proxy: SocketAddr,
}

impl SocksClient {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }

    /// Open a TCP connection to `(host, port)` through the proxy, reporting
    /// our local source port on `ipc_channel` tagged with `circuit` as soon
    /// as the TCP handshake with the proxy completes, since this is the only
    /// bridge the engine has between a task's network activity and its
    /// circuit, so the report must happen even if the CONNECT itself later
    /// fails downstream of it.
    pub async fn connect(
        &self,
        host: Ipv4Addr,
        port: u16,
        circuit: CircuitId,
        ipc_channel: &mut UnixStream,
    ) -> Result<TcpStream, SocksError> {
        let mut sock = TcpStream::connect(self.proxy).await?;
        negotiate(&mut sock).await?;
        report_local_endpoint(ipc_channel, circuit, &sock).await;

        let mut req = Vec::with_capacity(10);
        req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4]);
        req.extend_from_slice(&host.octets());
        req.extend_from_slice(&port.to_be_bytes());
        sock.write_all(&req).await?;

        let (reply, _bound) = read_reply(&mut sock).await?;
        if reply.is_success() {
            Ok(sock)
        } else {
            Err(SocksError::ConnectFailed(reply))
        }
    }

    /// Tor's extended resolve command: `05 F0 00 03 <len> <domain> 00 00`,
    /// expecting `05 00 00 01 <4-byte ipv4> <2-byte port>` back.
    pub async fn resolve(
        &self,
        domain: &str,
        circuit: CircuitId,
        ipc_channel: &mut UnixStream,
    ) -> Result<Ipv4Addr, SocksError> {
        if domain.len() > 255 {
            return Err(SocksError::DomainTooLong);
        }

        let mut sock = TcpStream::connect(self.proxy).await?;
        negotiate(&mut sock).await?;
        report_local_endpoint(ipc_channel, circuit, &sock).await;

        let mut req = Vec::with_capacity(6 + domain.len());
        req.extend_from_slice(&[SOCKS_VERSION, CMD_RESOLVE, 0x00, ATYP_DOMAIN]);
        req.push(domain.len() as u8);
        req.extend_from_slice(domain.as_bytes());
        req.extend_from_slice(&0u16.to_be_bytes());
        sock.write_all(&req).await?;

        let (reply, bound) = read_reply(&mut sock).await?;
        if !reply.is_success() {
            return Err(SocksError::ResolveFailed(reply));
        }
        let addr: [u8; 4] = bound
            .get(0..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(SocksError::AddressFamilyNotSupported)?;
        Ok(Ipv4Addr::from(addr))
    }
}

/// SOCKSv5 "no authentication required" method negotiation.
async fn negotiate(sock: &mut TcpStream) -> Result<(), SocksError> {
    sock.write_all(&[SOCKS_VERSION, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    sock.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(reply[0]));
    }
    if reply[1] != 0x00 {
        return Err(SocksError::NoAcceptableAuth);
    }
    Ok(())
}

async fn report_local_endpoint(ipc_channel: &mut UnixStream, circuit: CircuitId, sock: &TcpStream) {
    let Ok(local) = sock.local_addr() else { return };
    let msg = IpcMsg::NewConn { circuit, port: local.port() };
    if let Err(err) = ipc::send(ipc_channel, &msg).await {
        tracing::warn!("failed to report local endpoint over IPC: {err}");
    }
}

/// Reads a SOCKSv5 reply header (`VER REP RSV ATYP ...BND.ADDR BND.PORT`),
/// decodes the status byte as a `ReplyCode`, and returns the bound-address
/// payload (BND.ADDR followed by BND.PORT) it drained so callers like
/// `resolve` that need the address don't read the stream a second time.
async fn read_reply(sock: &mut TcpStream) -> Result<(ReplyCode, Vec<u8>), SocksError> {
    let mut header = [0u8; 4];
    sock.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(SocksError::BadVersion(header[0]));
    }
    let status = ReplyCode::from_byte(header[1]);

    let bound = match header[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            sock.read_exact(&mut rest).await?;
            rest.to_vec()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            sock.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            sock.read_exact(&mut rest).await?;
            rest
        }
        0x04 => {
            let mut rest = [0u8; 18];
            sock.read_exact(&mut rest).await?;
            rest.to_vec()
        }
        _ => return Err(SocksError::AddressFamilyNotSupported),
    };

    Ok((status, bound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn fake_proxy(
        listener: TcpListener,
        reply: Vec<u8>,
    ) {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut method_req = [0u8; 3];
        sock.read_exact(&mut method_req).await.unwrap();
        sock.write_all(&[SOCKS_VERSION, 0x00]).await.unwrap();

        // drain the CONNECT/RESOLVE request (fixed 10 bytes for our tests'
        // IPv4 CONNECT case; resolve test drains based on its own length).
        let mut cmd_hdr = [0u8; 4];
        sock.read_exact(&mut cmd_hdr).await.unwrap();
        match cmd_hdr[3] {
            ATYP_IPV4 => {
                let mut rest = [0u8; 6];
                sock.read_exact(&mut rest).await.unwrap();
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                sock.read_exact(&mut len).await.unwrap();
                let mut rest = vec![0u8; len[0] as usize + 2];
                sock.read_exact(&mut rest).await.unwrap();
            }
            _ => {}
        }

        sock.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_decodes_server_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        // 05 00 00 01 5D B8 D8 22 00 00 from spec.md scenario 4.
        let reply = vec![0x05, 0x00, 0x00, 0x01, 0x5D, 0xB8, 0xD8, 0x22, 0x00, 0x00];
        let server = tokio::spawn(fake_proxy(listener, reply));

        let (mut ipc_a, _ipc_b) = UnixStream::pair().unwrap();
        let client = SocksClient::new(proxy_addr);
        let ip = client.resolve("www.example.test", 1, &mut ipc_a).await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(93, 184, 216, 34));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_reports_local_port_over_ipc() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let reply = vec![0x05, 0x00, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        let server = tokio::spawn(fake_proxy(listener, reply));

        let (mut ipc_a, mut ipc_b) = UnixStream::pair().unwrap();
        let client = SocksClient::new(proxy_addr);
        let sock = client
            .connect(Ipv4Addr::new(1, 2, 3, 4), 443, 99, &mut ipc_a)
            .await
            .unwrap();
        let local_port = sock.local_addr().unwrap().port();

        let msg = ipc::recv(&mut ipc_b).await.unwrap();
        assert_eq!(msg, IpcMsg::NewConn { circuit: 99, port: local_port });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn domain_over_255_bytes_fails_locally() {
        let long_domain = "a".repeat(256);
        let (mut ipc_a, _ipc_b) = UnixStream::pair().unwrap();
        let client = SocksClient::new("127.0.0.1:1".parse().unwrap());
        let err = client.resolve(&long_domain, 1, &mut ipc_a).await.unwrap_err();
        assert!(matches!(err, SocksError::DomainTooLong));
    }
}
