//! Socket table
//!
//! Sockets live on the chip; the host keeps a small table mirroring them.
//! Every time a slot is handed out it gets a fresh session ID, which is
//! sent with each operation and echoed back in the chip's replies. A reply
//! whose session does not match the slot's current one belongs to an
//! earlier user of the slot and is dropped.

use crate::{
    frame::{group, DATA_PKT_FLAG},
    winc::{Handler, Winc, WincCfg},
    DrvError, Error, HifBus,
};

/// Number of stream sockets
pub const TCP_SOCK_MAX: usize = 7;
/// Number of datagram sockets
pub const UDP_SOCK_MAX: usize = 4;
/// Total number of sockets
pub const MAX_SOCKET: usize = TCP_SOCK_MAX + UDP_SOCK_MAX;

/// Socket opcodes within [`group::IP`]
pub mod op {
    /// Bind to a local address
    pub const BIND: u8 = 0x41;
    /// Listen for connections
    pub const LISTEN: u8 = 0x42;
    /// Connection accepted
    pub const ACCEPT: u8 = 0x43;
    /// Connect to a peer
    pub const CONNECT: u8 = 0x44;
    /// Send on a connected socket
    pub const SEND: u8 = 0x45;
    /// Receive on a connected socket
    pub const RECV: u8 = 0x46;
    /// Send a datagram
    pub const SENDTO: u8 = 0x47;
    /// Receive a datagram
    pub const RECVFROM: u8 = 0x48;
    /// Close a socket
    pub const CLOSE: u8 = 0x49;
    /// Connect with TLS
    pub const SSL_CONNECT: u8 = 0x4B;
    /// Send with TLS
    pub const SSL_SEND: u8 = 0x4C;
    /// Receive with TLS
    pub const SSL_RECV: u8 = 0x4D;
    /// Close a TLS socket
    pub const SSL_CLOSE: u8 = 0x4E;
    /// Upgrade a connected socket to TLS
    pub const SECURE: u8 = 0x56;
    /// Raw socket options
    pub const RAW_SOCK_OPT: u8 = 0x57;
}

/// Set in a socket's flags once TLS is active
pub const SSL_FLAGS_ACTIVE: u8 = 0x01;

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// TCP
    Stream,
    /// UDP
    Datagram,
}

/// A socket slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketId(u8);

impl SocketId {
    /// Slot index in the table
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Socket activity, reported through [`Handler::socket`]
#[derive(Debug, PartialEq)]
pub enum SocketEvent<'a> {
    /// A listening socket accepted a connection
    Accept {
        /// The new socket, `None` if the chip could not allocate one
        sock: Option<SocketId>,
        /// Peer address
        addr: [u8; 4],
        /// Peer port
        port: u16,
    },
    /// A connect finished; negative on failure
    Connect {
        /// Zero or a negative error code
        error: i8,
    },
    /// A receive finished
    Recv {
        /// Bytes received, or a negative error code
        status: i16,
        /// The received bytes
        data: &'a [u8],
        /// Peer address and port
        from: ([u8; 4], u16),
    },
    /// A send finished
    Send {
        /// Bytes sent, or a negative error code
        sent: i16,
    },
}

#[derive(Debug, Clone, Copy)]
struct SocketEntry {
    in_use: bool,
    session: u16,
    ssl_flags: u8,
    recv_pending: bool,
    data_offset: u16,
    err_source: u8,
    err_code: u8,
}

impl SocketEntry {
    const EMPTY: Self = Self {
        in_use: false,
        session: 0,
        ssl_flags: 0,
        recv_pending: false,
        data_offset: 0,
        err_source: 0,
        err_code: 0,
    };
}

pub(crate) struct SocketTable {
    entries: [SocketEntry; MAX_SOCKET],
    session: u16,
    next_tcp: u8,
    next_udp: u8,
}

impl SocketTable {
    pub const fn new() -> Self {
        Self {
            entries: [SocketEntry::EMPTY; MAX_SOCKET],
            session: 0,
            next_tcp: 0,
            next_udp: 0,
        }
    }

    fn next_session(&mut self) -> u16 {
        self.session = self.session.wrapping_add(1);
        if self.session == 0 {
            self.session = 1;
        }
        self.session
    }

    fn claim(&mut self, idx: usize) -> SocketId {
        let session = self.next_session();
        self.entries[idx] = SocketEntry {
            in_use: true,
            session,
            ..SocketEntry::EMPTY
        };
        SocketId(idx as u8)
    }

    fn open(&mut self, kind: SocketKind) -> Option<SocketId> {
        let (base, count, next) = match kind {
            SocketKind::Stream => (0, TCP_SOCK_MAX, &mut self.next_tcp),
            SocketKind::Datagram => (TCP_SOCK_MAX, UDP_SOCK_MAX, &mut self.next_udp),
        };
        let start = *next as usize;
        let free = (0..count)
            .map(|i| (start + i) % count)
            .find(|i| !self.entries[base + i].in_use)?;
        *next = ((free + 1) % count) as u8;
        Some(self.claim(base + free))
    }

    fn entry(&self, sock: SocketId) -> Result<&SocketEntry, DrvError> {
        self.entries
            .get(sock.index())
            .filter(|e| e.in_use)
            .ok_or(DrvError::InvalidArg)
    }

    /// The live entry for a reply, if its session is current
    fn current(&mut self, sock: u8, session: u16) -> Option<&mut SocketEntry> {
        match self.entries.get_mut(sock as usize) {
            Some(e) if e.in_use && e.session == session => Some(e),
            _ => {
                nut_debug!("dropping reply for socket {} session {}", sock, session);
                None
            }
        }
    }

    pub fn handle_reply<H: Handler>(&mut self, opcode: u8, payload: &[u8], handler: &mut H) {
        match opcode {
            op::ACCEPT => {
                let Some(p) = payload.get(..8) else {
                    return short(opcode);
                };
                let listen = p[0];
                let port = u16::from_le_bytes([p[2], p[3]]);
                let addr = [p[4], p[5], p[6], p[7]];
                let sock = match p[1] as usize {
                    idx if idx < MAX_SOCKET => Some(self.claim(idx)),
                    _ => None,
                };
                handler.socket(SocketId(listen), SocketEvent::Accept { sock, addr, port });
            }
            op::CONNECT | op::SSL_CONNECT => {
                let Some(p) = payload.get(..6) else {
                    return short(opcode);
                };
                let error = p[1] as i8;
                let Some(entry) = self.entries.get_mut(p[0] as usize).filter(|e| e.in_use) else {
                    nut_debug!("connect reply for closed socket {}", p[0]);
                    return;
                };
                if error >= 0 {
                    entry.data_offset = u16::from_le_bytes([p[2], p[3]]);
                } else {
                    entry.err_source = p[4];
                    entry.err_code = p[5];
                }
                handler.socket(SocketId(p[0]), SocketEvent::Connect { error });
            }
            op::RECV | op::RECVFROM | op::SSL_RECV => {
                let Some(p) = payload.get(..14) else {
                    return short(opcode);
                };
                let session = u16::from_le_bytes([p[2], p[3]]);
                let status = i16::from_le_bytes([p[4], p[5]]);
                let offset = u16::from_le_bytes([p[6], p[7]]) as usize;
                let port = u16::from_le_bytes([p[8], p[9]]);
                let addr = [p[10], p[11], p[12], p[13]];
                let data = if status > 0 {
                    let Some(data) = payload.get(offset..offset + status as usize) else {
                        nut_error!("receive data out of bounds on socket {}", p[0]);
                        return;
                    };
                    data
                } else {
                    &[]
                };
                let Some(entry) = self.current(p[0], session) else {
                    return;
                };
                entry.recv_pending = false;
                handler.socket(
                    SocketId(p[0]),
                    SocketEvent::Recv {
                        status,
                        data,
                        from: (addr, port),
                    },
                );
            }
            op::SEND | op::SENDTO | op::SSL_SEND => {
                let Some(p) = payload.get(..6) else {
                    return short(opcode);
                };
                let session = u16::from_le_bytes([p[2], p[3]]);
                let sent = i16::from_le_bytes([p[4], p[5]]);
                if self.current(p[0], session).is_none() {
                    return;
                }
                handler.socket(SocketId(p[0]), SocketEvent::Send { sent });
            }
            other => nut_debug!("unhandled socket reply {}", other),
        }
    }
}

fn short(opcode: u8) {
    nut_error!("short socket reply {}", opcode);
}

/// Socket operations
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Allocate a socket slot
    ///
    /// Nothing is sent to the chip until the socket is used.
    pub fn socket_open(&mut self, kind: SocketKind) -> Result<SocketId, DrvError> {
        self.ensure_started()?;
        self.sockets.open(kind).ok_or(DrvError::NoSpace)
    }

    /// The session ID a socket is currently using
    pub fn socket_session(&self, sock: SocketId) -> Option<u16> {
        self.sockets.entry(sock).ok().map(|e| e.session)
    }

    /// Where application data starts in a connected socket's receive buffer
    pub fn socket_data_offset(&self, sock: SocketId) -> Option<u16> {
        self.sockets.entry(sock).ok().map(|e| e.data_offset)
    }

    /// Error source and code from the last failed connect
    pub fn socket_error(&self, sock: SocketId) -> Option<(u8, u8)> {
        self.sockets.entry(sock).ok().map(|e| (e.err_source, e.err_code))
    }

    /// Connect a stream socket to `addr:port`
    pub async fn socket_connect<B: HifBus>(
        &mut self,
        bus: &mut B,
        sock: SocketId,
        addr: [u8; 4],
        port: u16,
    ) -> Result<(), Error<B::BusError>> {
        let entry = *self.sockets.entry(sock)?;
        let mut cmd = [0u8; 10];
        cmd[0..4].copy_from_slice(&addr);
        cmd[4..6].copy_from_slice(&port.to_be_bytes());
        cmd[6] = sock.0;
        cmd[7] = entry.ssl_flags;
        cmd[8..10].copy_from_slice(&entry.session.to_le_bytes());
        let opcode = if entry.ssl_flags & SSL_FLAGS_ACTIVE != 0 {
            op::SSL_CONNECT
        } else {
            op::CONNECT
        };
        self.send_raw(bus, group::IP, opcode, &[&cmd]).await
    }

    /// Send `data` on a connected socket
    ///
    /// The outcome is reported as [`SocketEvent::Send`].
    pub async fn socket_send<B: HifBus>(
        &mut self,
        bus: &mut B,
        sock: SocketId,
        data: &[u8],
    ) -> Result<(), Error<B::BusError>> {
        let entry = *self.sockets.entry(sock)?;
        let len = u16::try_from(data.len()).map_err(|_| DrvError::InvalidArg)?;
        if len == 0 {
            return Err(DrvError::InvalidArg.into());
        }
        let mut cmd = [0u8; 8];
        cmd[0] = sock.0;
        cmd[2..4].copy_from_slice(&len.to_le_bytes());
        cmd[4..6].copy_from_slice(&entry.session.to_le_bytes());
        let opcode = if entry.ssl_flags & SSL_FLAGS_ACTIVE != 0 {
            op::SSL_SEND
        } else {
            op::SEND
        };
        self.send_raw(bus, group::IP, opcode | DATA_PKT_FLAG, &[&cmd, data])
            .await
    }

    /// Ask for up to `len` bytes; a `timeout_ms` of zero waits forever
    ///
    /// Only one receive may be pending per socket. The data is reported as
    /// [`SocketEvent::Recv`].
    pub async fn socket_recv<B: HifBus>(
        &mut self,
        bus: &mut B,
        sock: SocketId,
        len: u16,
        timeout_ms: u32,
    ) -> Result<(), Error<B::BusError>> {
        let entry = *self.sockets.entry(sock)?;
        if len == 0 {
            return Err(DrvError::InvalidArg.into());
        }
        if entry.recv_pending {
            return Err(DrvError::Busy.into());
        }
        let timeout = if timeout_ms == 0 { u32::MAX } else { timeout_ms };
        let mut cmd = [0u8; 12];
        cmd[0..4].copy_from_slice(&timeout.to_le_bytes());
        cmd[4] = sock.0;
        cmd[6..8].copy_from_slice(&entry.session.to_le_bytes());
        cmd[8..10].copy_from_slice(&len.to_le_bytes());
        let opcode = if entry.ssl_flags & SSL_FLAGS_ACTIVE != 0 {
            op::SSL_RECV
        } else {
            op::RECV
        };

        self.sockets.entries[sock.index()].recv_pending = true;
        let res = self.send_raw(bus, group::IP, opcode, &[&cmd]).await;
        if res.is_err() {
            self.sockets.entries[sock.index()].recv_pending = false;
        }
        res
    }

    /// Switch a connected stream socket to TLS
    ///
    /// Later sends, receives and the close use the TLS opcodes.
    pub async fn socket_secure<B: HifBus>(&mut self, bus: &mut B, sock: SocketId) -> Result<(), Error<B::BusError>> {
        let entry = *self.sockets.entry(sock)?;
        if sock.index() >= TCP_SOCK_MAX {
            return Err(DrvError::InvalidArg.into());
        }
        let flags = entry.ssl_flags | SSL_FLAGS_ACTIVE;
        let mut cmd = [0u8; 4];
        cmd[0] = sock.0;
        cmd[1] = flags;
        cmd[2..4].copy_from_slice(&entry.session.to_le_bytes());
        self.send_raw(bus, group::IP, op::SECURE, &[&cmd]).await?;
        self.sockets.entries[sock.index()].ssl_flags = flags;
        Ok(())
    }

    /// Close a socket and release its slot
    ///
    /// The slot is released even if the close could not be sent.
    pub async fn socket_close<B: HifBus>(&mut self, bus: &mut B, sock: SocketId) -> Result<(), Error<B::BusError>> {
        let entry = *self.sockets.entry(sock)?;
        let mut cmd = [0u8; 4];
        cmd[0] = sock.0;
        cmd[2..4].copy_from_slice(&entry.session.to_le_bytes());
        let opcode = if entry.ssl_flags & SSL_FLAGS_ACTIVE != 0 {
            op::SSL_CLOSE
        } else {
            op::CLOSE
        };
        let res = self.send_raw(bus, group::IP, opcode, &[&cmd]).await;
        self.sockets.entries[sock.index()] = SocketEntry::EMPTY;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{raw_frame, started, Ev, MockBus, Recorder};
    use futures::executor::block_on;
    use std::vec::Vec;

    fn recv_reply(sock: SocketId, session: u16, data: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.push(sock.0);
        p.push(0);
        p.extend_from_slice(&session.to_le_bytes());
        p.extend_from_slice(&(data.len() as i16).to_le_bytes());
        p.extend_from_slice(&16u16.to_le_bytes());
        p.extend_from_slice(&80u16.to_le_bytes());
        p.extend_from_slice(&[10, 0, 0, 2]);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(data);
        raw_frame(group::IP, op::RECV, &p)
    }

    #[test]
    fn slots_round_robin_with_fresh_sessions() {
        let mut bus = MockBus::new();
        let mut winc = started(&mut bus);
        let a = winc.socket_open(SocketKind::Stream).unwrap();
        let b = winc.socket_open(SocketKind::Stream).unwrap();
        let u = winc.socket_open(SocketKind::Datagram).unwrap();
        assert_eq!((a.index(), b.index(), u.index()), (0, 1, TCP_SOCK_MAX));
        assert_eq!(winc.socket_session(a), Some(1));
        assert_eq!(winc.socket_session(b), Some(2));
        assert_eq!(winc.socket_session(u), Some(3));

        block_on(winc.socket_close(&mut bus, a)).unwrap();
        assert_eq!(winc.socket_session(a), None);
        let c = winc.socket_open(SocketKind::Stream).unwrap();
        assert_eq!(c.index(), 2);
    }

    #[test]
    fn table_exhaustion() {
        let mut bus = MockBus::new();
        let mut winc = started(&mut bus);
        for _ in 0..UDP_SOCK_MAX {
            winc.socket_open(SocketKind::Datagram).unwrap();
        }
        assert_eq!(winc.socket_open(SocketKind::Datagram), Err(DrvError::NoSpace));
        assert!(winc.socket_open(SocketKind::Stream).is_ok());
    }

    #[test]
    fn session_wraps_past_zero() {
        let mut table = SocketTable::new();
        table.session = u16::MAX;
        assert_eq!(table.next_session(), 1);
    }

    #[test]
    fn stale_replies_after_reuse_are_dropped() {
        let mut bus = MockBus::new();
        let mut rec = Recorder::default();
        let mut winc = started(&mut bus);

        let mut socks = Vec::new();
        for _ in 0..TCP_SOCK_MAX {
            socks.push(winc.socket_open(SocketKind::Stream).unwrap());
        }
        let old = socks[0];
        let old_session = winc.socket_session(old).unwrap();
        block_on(winc.socket_close(&mut bus, old)).unwrap();

        let reused = winc.socket_open(SocketKind::Stream).unwrap();
        assert_eq!(reused, old);
        let session = winc.socket_session(reused).unwrap();
        assert_ne!(session, old_session);

        block_on(winc.socket_recv(&mut bus, reused, 64, 0)).unwrap();
        bus.push_inbound(recv_reply(old, old_session, b"stale"));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        assert!(rec.events.is_empty());
        assert_eq!(
            block_on(winc.socket_recv(&mut bus, reused, 64, 0)),
            Err(Error::Driver(DrvError::Busy))
        );

        bus.push_inbound(recv_reply(reused, session, b"fresh"));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        assert_eq!(
            rec.events,
            [Ev::Recv {
                sock: reused,
                status: 5,
                data: b"fresh".to_vec()
            }]
        );
        assert!(block_on(winc.socket_recv(&mut bus, reused, 64, 0)).is_ok());
    }

    #[test]
    fn command_layouts() {
        let mut bus = MockBus::new();
        let mut winc = started(&mut bus);
        let sock = winc.socket_open(SocketKind::Stream).unwrap();

        block_on(winc.socket_connect(&mut bus, sock, [192, 168, 1, 9], 443)).unwrap();
        block_on(winc.socket_send(&mut bus, sock, b"hello")).unwrap();
        block_on(winc.socket_recv(&mut bus, sock, 512, 0)).unwrap();
        block_on(winc.socket_close(&mut bus, sock)).unwrap();

        let sent = bus.sent_raw();
        let (hdr, connect) = &sent[0];
        assert_eq!(hdr.opcode, op::CONNECT);
        assert_eq!(connect, &[192, 168, 1, 9, 0x01, 0xBB, 0, 0, 1, 0]);

        let (hdr, send) = &sent[1];
        assert_eq!(hdr.opcode, op::SEND | DATA_PKT_FLAG);
        assert_eq!(&send[..8], &[0, 0, 5, 0, 1, 0, 0, 0]);
        assert_eq!(&send[8..], b"hello");

        let (hdr, recv) = &sent[2];
        assert_eq!(hdr.opcode, op::RECV);
        assert_eq!(recv, &[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 1, 0, 0, 2, 0, 0]);

        let (hdr, close) = &sent[3];
        assert_eq!(hdr.opcode, op::CLOSE);
        assert_eq!(close, &[0, 0, 1, 0]);
    }

    #[test]
    fn secured_socket_uses_tls_opcodes() {
        let mut bus = MockBus::new();
        let mut winc = started(&mut bus);
        let sock = winc.socket_open(SocketKind::Stream).unwrap();
        let udp = winc.socket_open(SocketKind::Datagram).unwrap();
        assert_eq!(
            block_on(winc.socket_secure(&mut bus, udp)),
            Err(Error::Driver(DrvError::InvalidArg))
        );

        block_on(winc.socket_secure(&mut bus, sock)).unwrap();
        block_on(winc.socket_recv(&mut bus, sock, 16, 100)).unwrap();
        block_on(winc.socket_close(&mut bus, sock)).unwrap();
        let ops: Vec<u8> = bus.sent_raw().iter().map(|(h, _)| h.opcode).collect();
        assert_eq!(ops, [op::SECURE, op::SSL_RECV, op::SSL_CLOSE]);
    }

    #[test]
    fn older_firmware_refuses_secure() {
        let mut bus = MockBus::new();
        bus.hif_info = 0x8104;
        let mut winc = started(&mut bus);
        let sock = winc.socket_open(SocketKind::Stream).unwrap();
        assert_eq!(
            block_on(winc.socket_secure(&mut bus, sock)),
            Err(Error::Driver(DrvError::Unsupported))
        );
        assert!(bus.sent.is_empty());
    }

    #[test]
    fn argument_checks_send_nothing() {
        let mut bus = MockBus::new();
        let mut winc = started(&mut bus);
        let sock = winc.socket_open(SocketKind::Stream).unwrap();
        assert_eq!(
            block_on(winc.socket_recv(&mut bus, sock, 0, 0)),
            Err(Error::Driver(DrvError::InvalidArg))
        );
        assert_eq!(
            block_on(winc.socket_send(&mut bus, sock, &[])),
            Err(Error::Driver(DrvError::InvalidArg))
        );
        block_on(winc.socket_close(&mut bus, sock)).unwrap();
        assert_eq!(
            block_on(winc.socket_send(&mut bus, sock, b"x")),
            Err(Error::Driver(DrvError::InvalidArg))
        );
        assert_eq!(bus.sent.len(), 1);
    }

    #[test]
    fn accept_and_send_replies() {
        let mut bus = MockBus::new();
        let mut rec = Recorder::default();
        let mut winc = started(&mut bus);
        let listen = winc.socket_open(SocketKind::Stream).unwrap();

        bus.push_inbound(raw_frame(group::IP, op::ACCEPT, &[0, 3, 0x50, 0x00, 10, 0, 0, 7]));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        let conn = SocketId(3);
        assert_eq!(
            rec.events,
            [Ev::Accept {
                listen,
                sock: Some(conn),
                port: 80
            }]
        );
        let session = winc.socket_session(conn).unwrap();

        let mut reply = Vec::new();
        reply.extend_from_slice(&[3, 0]);
        reply.extend_from_slice(&session.to_le_bytes());
        reply.extend_from_slice(&12i16.to_le_bytes());
        reply.extend_from_slice(&[0, 0]);
        bus.push_inbound(raw_frame(group::IP, op::SEND, &reply));
        reply[2..4].copy_from_slice(&session.wrapping_add(1).to_le_bytes());
        bus.push_inbound(raw_frame(group::IP, op::SEND, &reply));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        assert_eq!(rec.events[1..], [Ev::Sent(conn, 12)]);
    }

    #[test]
    fn connect_failure_is_reported() {
        let mut bus = MockBus::new();
        let mut rec = Recorder::default();
        let mut winc = started(&mut bus);
        let sock = winc.socket_open(SocketKind::Stream).unwrap();
        bus.push_inbound(raw_frame(group::IP, op::CONNECT, &[0, (-12i8) as u8, 0, 0, 4, 9, 0, 0]));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        assert_eq!(rec.events, [Ev::Connect(sock, -12)]);
        assert_eq!(winc.socket_error(sock), Some((4, 9)));

        bus.push_inbound(raw_frame(group::IP, op::CONNECT, &[0, 0, 0x20, 0, 0, 0, 0, 0]));
        block_on(winc.poll(&mut bus, &mut rec)).unwrap();
        assert_eq!(winc.socket_data_offset(sock), Some(0x20));
    }
}
