//! Mock bus, flash and handler shared by the unit tests

use std::{collections::VecDeque, string::String, vec::Vec};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_time::Duration;
use futures::executor::block_on;

use crate::{
    bus::{HifBus, IrqLatch, SpiFlash},
    dev::{CmdEvent, ReqId},
    elem::{encode_params, Elems, Param},
    file::{FileEvent, FileHandle, FileType},
    frame::{CmdId, Header, MsgKind, FRAME_HDR_SIZE},
    socket::{SocketEvent, SocketId},
    ssl::TlsFlashStatus,
    winc::{Handler, Winc, WincCfg},
};

pub struct TestCfg;

impl WincCfg for TestCfg {
    type Mutex = NoopRawMutex;
    const WAKE_RETRIES: u8 = 2;
    const WAKE_RETRY_DELAY: Duration = Duration::from_millis(1);
    const MAX_MODULE_REQS: u8 = 2;
}

/// A started driver with full interface access
pub fn started<'d>(bus: &mut MockBus) -> Winc<'d, TestCfg> {
    let mut winc = Winc::new();
    winc.init();
    block_on(winc.start(bus)).unwrap();
    winc
}

pub struct MockBus {
    pub hif_info: u32,
    pub sent: Vec<Vec<u8>>,
    pub inbound: VecDeque<Vec<u8>>,
    pub irq: IrqLatch,
    pub fail_writes: bool,
    /// Writes start failing once this many frames were sent
    pub fail_after: Option<usize>,
    pub wake_failures: u8,
    pub wakes: usize,
    pub sleeps: usize,
    pub delays: usize,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            // block 2, major 1, minor 5
            hif_info: 0x8105,
            sent: Vec::new(),
            inbound: VecDeque::new(),
            irq: IrqLatch::new(),
            fail_writes: false,
            fail_after: None,
            wake_failures: 0,
            wakes: 0,
            sleeps: 0,
            delays: 0,
        }
    }

    pub fn push_inbound(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
        self.irq.signal();
    }

    /// Payloads of every raw frame sent so far, with their header
    pub fn sent_raw(&self) -> Vec<(Header, Vec<u8>)> {
        self.sent
            .iter()
            .map(|f| (Header::decode(f).unwrap(), f[FRAME_HDR_SIZE..].to_vec()))
            .collect()
    }
}

impl HifBus for MockBus {
    type BusError = ();

    async fn hif_info(&mut self) -> Result<u32, ()> {
        Ok(self.hif_info)
    }

    async fn wake(&mut self) -> Result<(), ()> {
        if self.wake_failures > 0 {
            self.wake_failures -= 1;
            return Err(());
        }
        self.wakes += 1;
        Ok(())
    }

    async fn sleep(&mut self) -> Result<(), ()> {
        self.sleeps += 1;
        Ok(())
    }

    async fn delay(&mut self, _duration: Duration) {
        self.delays += 1;
    }

    async fn write_frame(&mut self, parts: &[&[u8]]) -> Result<(), ()> {
        if self.fail_writes || self.fail_after.is_some_and(|n| self.sent.len() >= n) {
            return Err(());
        }
        self.sent.push(parts.concat());
        Ok(())
    }

    async fn read_frame(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        let frame = self.inbound.pop_front().ok_or(())?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn interrupt_pending(&mut self) -> bool {
        self.irq.is_pending()
    }

    fn interrupt_serviced(&mut self) {
        self.irq.clear();
        if !self.inbound.is_empty() {
            self.irq.signal();
        }
    }
}

pub struct MockFlash {
    pub image: Vec<u8>,
    pub reads: Vec<(u32, usize)>,
}

impl MockFlash {
    pub fn new(size: usize) -> Self {
        Self {
            image: std::vec![0xFF; size],
            reads: Vec::new(),
        }
    }
}

impl SpiFlash for MockFlash {
    type FlashError = ();

    async fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), ()> {
        self.reads.push((addr, buf.len()));
        let start = addr as usize;
        let src = self.image.get(start..start + buf.len()).ok_or(())?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

fn frame(group: u8, opcode: u8, kind: MsgKind, seq: u16, num_elems: u8, payload: &[u8]) -> Vec<u8> {
    let hdr = Header {
        group,
        opcode,
        len: (FRAME_HDR_SIZE + payload.len()) as u16,
        kind,
        num_elems,
        seq,
    };
    let mut out = hdr.encode().to_vec();
    out.extend_from_slice(payload);
    out
}

fn params(params: &[Param<'_>]) -> Vec<u8> {
    let mut buf = [0u8; 512];
    let used = encode_params(params, &mut buf).unwrap();
    buf[..used].to_vec()
}

pub fn status_frame(group: u8, opcode: u8, seq: u16, status: u16) -> Vec<u8> {
    frame(group, opcode, MsgKind::Status, seq, 0, &status.to_be_bytes())
}

pub fn rsp_frame(group: u8, opcode: u8, seq: u16, elems: &[Param<'_>]) -> Vec<u8> {
    frame(group, opcode, MsgKind::Rsp, seq, elems.len() as u8, &params(elems))
}

pub fn aec_frame(group: u8, opcode: u8, elems: &[Param<'_>]) -> Vec<u8> {
    frame(group, opcode, MsgKind::Aec, 0, elems.len() as u8, &params(elems))
}

pub fn raw_frame(group: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
    frame(group, opcode, MsgKind::Raw, 0, 0, payload)
}

/// Decoded parameters of a sent command frame
pub fn sent_params(frame: &[u8]) -> (Header, Elems<'_>) {
    let hdr = Header::decode(frame).unwrap();
    let elems = Elems::new(hdr.num_elems, &frame[FRAME_HDR_SIZE..hdr.len as usize]).unwrap();
    (hdr, elems)
}

#[derive(Debug, PartialEq)]
pub enum Ev {
    Status { ctx: u32, req: ReqId, idx: usize, status: u16 },
    Rsp { ctx: u32, req: ReqId, idx: usize, first: Option<u32> },
    Complete { ctx: u32, req: ReqId, num_cmds: usize, num_errors: usize },
    Aec(CmdId),
    File(FileHandle, FileEvent),
    Found(FileType, Option<String>, u16),
    Deleted(FileType, u16),
    Accept { listen: SocketId, sock: Option<SocketId>, port: u16 },
    Connect(SocketId, i8),
    Recv { sock: SocketId, status: i16, data: Vec<u8> },
    Sent(SocketId, i16),
    Certs(TlsFlashStatus),
    OtaNotif(Vec<u8>),
    OtaStatus(u8, u8),
    HfGet { status: u8, handle: u8, size: u32 },
    HfRead(u8, Vec<u8>),
    HfErase(u8),
}

#[derive(Default)]
pub struct Recorder {
    pub events: Vec<Ev>,
}

impl Handler for Recorder {
    fn cmd_event(&mut self, ctx: u32, req: ReqId, event: CmdEvent<'_>) {
        self.events.push(match event {
            CmdEvent::Status { src, status } => Ev::Status {
                ctx,
                req,
                idx: src.idx,
                status,
            },
            CmdEvent::Response { src, elems, .. } => Ev::Rsp {
                ctx,
                req,
                idx: src.idx,
                first: elems.get(0).and_then(|e| e.as_u32()),
            },
            CmdEvent::Complete {
                num_cmds,
                num_errors,
                ..
            } => Ev::Complete {
                ctx,
                req,
                num_cmds,
                num_errors,
            },
        });
    }

    fn aec(&mut self, id: CmdId, _elems: Elems<'_>) {
        self.events.push(Ev::Aec(id));
    }

    fn file(&mut self, file: FileHandle, event: FileEvent) {
        self.events.push(Ev::File(file, event));
    }

    fn file_found(&mut self, kind: FileType, name: Option<&str>, status: u16) {
        self.events.push(Ev::Found(kind, name.map(String::from), status));
    }

    fn file_deleted(&mut self, kind: FileType, status: u16) {
        self.events.push(Ev::Deleted(kind, status));
    }

    fn socket(&mut self, sock: SocketId, event: SocketEvent<'_>) {
        self.events.push(match event {
            SocketEvent::Accept { sock: conn, port, .. } => Ev::Accept {
                listen: sock,
                sock: conn,
                port,
            },
            SocketEvent::Connect { error } => Ev::Connect(sock, error),
            SocketEvent::Recv { status, data, .. } => Ev::Recv {
                sock,
                status,
                data: data.to_vec(),
            },
            SocketEvent::Send { sent } => Ev::Sent(sock, sent),
        });
    }

    fn certs_written(&mut self, status: TlsFlashStatus) {
        self.events.push(Ev::Certs(status));
    }

    fn ota_notif(&mut self, info: &[u8]) {
        self.events.push(Ev::OtaNotif(info.to_vec()));
    }

    fn ota_status(&mut self, kind: u8, status: u8) {
        self.events.push(Ev::OtaStatus(kind, status));
    }

    fn host_file_get(&mut self, status: u8, handle: u8, size: u32) {
        self.events.push(Ev::HfGet { status, handle, size });
    }

    fn host_file_read(&mut self, status: u8, data: &[u8]) {
        self.events.push(Ev::HfRead(status, data.to_vec()));
    }

    fn host_file_erase(&mut self, status: u8) {
        self.events.push(Ev::HfErase(status));
    }
}
