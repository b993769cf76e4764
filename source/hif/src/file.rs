//! File transfer to the chip's file system
//!
//! Writing a file is a two step affair. [`Winc::file_open`] asks the chip
//! to start a transfer, and the chip answers with a transfer handle. File
//! data is then staged in a small buffer and sent one block at a time, and
//! each block must be acknowledged before the next one is sent.
//!
//! The data handed to [`Winc::file_write`] is borrowed until it has been
//! fully staged; [`FileEvent::WriteComplete`] tells the application it may
//! hand over more.

use heapless::Deque;

use crate::{
    cmd_req::{CmdReq, Owner, SrcCmd},
    dev::{CmdEvent, ReqId},
    elem::{Elems, Param},
    frame::group,
    winc::{Handler, Winc, WincCfg},
    DrvError, STATUS_OK,
};

/// Number of files that can be open at once
pub const FILE_CTX_NUM: usize = 1;

/// Size of the block staging buffer
pub const FILE_LOAD_BUF_SZ: usize = 128;

/// Longest file name accepted
pub const MAX_FILENAME_LEN: usize = 32;

/// File system opcodes within [`group::FS`]
pub mod op {
    /// File system operation (list, delete, load)
    pub const FS: u8 = 1;
    /// Block transfer
    pub const FSTSFR: u8 = 2;
}

/// Operation codes carried as the first parameter of [`op::FS`]
pub mod fs_op {
    /// List files of a type
    pub const LIST: u8 = 1;
    /// Delete a file
    pub const DEL: u8 = 2;
    /// Load a file onto the chip
    pub const LOAD: u8 = 3;
}

/// Transfer protocol: block transfer over the interface
const TSFR_PROT: u32 = 1;

const OPEN_REQ_SZ: usize = 96;
const TSFR_REQ_SZ: usize = 160;

/// Events raised outside of dispatch, held for the next poll
const NOTIFY_DEPTH: usize = 4;

/// Kind of file stored on the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileType(pub u16);

impl FileType {
    /// TLS certificate
    pub const CERT: Self = Self(1);
    /// TLS private key
    pub const PRIKEY: Self = Self(2);
    /// Diffie-Hellman parameters
    pub const DHPARAM: Self = Self(3);
    /// Application data
    pub const USER: Self = Self(4);
}

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Read from the chip (not supported)
    Read,
    /// Write to the chip
    Write,
}

/// An open file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(u8);

/// Progress of an open file, reported through [`Handler::file`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEvent {
    /// The chip accepted the transfer; writes may begin
    Open,
    /// All written data has been staged; more may be written
    WriteComplete,
    /// The transfer finished and the handle is no longer valid
    Close,
    /// A block was stored
    Ok,
    /// The open or a block failed
    Error,
}

/// Outcome of [`Winc::file_close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseProgress {
    /// Nothing was left to send; the handle is already released and
    /// [`FileEvent::Close`] is reported on the next [`Winc::poll`]
    Done,
    /// The last block is on its way; [`FileEvent::Close`] follows
    Pending,
}

#[derive(Debug, Clone, Copy)]
struct FileCtx<'d> {
    in_use: bool,
    load_req: Option<ReqId>,
    tsfr_handle: u16,
    block_num: u16,
    pending: Option<&'d [u8]>,
    buf: [u8; FILE_LOAD_BUF_SZ],
    buf_len: usize,
    closing: bool,
}

impl<'d> FileCtx<'d> {
    const EMPTY: Self = Self {
        in_use: false,
        load_req: None,
        tsfr_handle: 0,
        block_num: 0,
        pending: None,
        buf: [0; FILE_LOAD_BUF_SZ],
        buf_len: 0,
        closing: false,
    };

    fn is_full(&self) -> bool {
        self.buf_len >= FILE_LOAD_BUF_SZ
    }

    /// Move pending data into the staging buffer
    ///
    /// Returns the block request to send when the buffer is full, or when
    /// `force` is set and anything is staged.
    fn load(&mut self, force: bool) -> Result<Option<CmdReq>, DrvError> {
        if let Some(data) = self.pending {
            let take = (FILE_LOAD_BUF_SZ - self.buf_len).min(data.len());
            self.buf[self.buf_len..][..take].copy_from_slice(&data[..take]);
            self.buf_len += take;
            let rest = &data[take..];
            self.pending = if rest.is_empty() { None } else { Some(rest) };
        }

        if !(self.is_full() || (force && self.buf_len > 0)) {
            return Ok(None);
        }

        self.block_num = self.block_num.wrapping_add(1);
        let mut req = CmdReq::new(TSFR_REQ_SZ, 1, Owner::File)?;
        req.append(
            group::FS,
            op::FSTSFR,
            &[
                Param::UInt(self.tsfr_handle as u32),
                Param::UInt(self.block_num as u32),
                Param::Bytes(&self.buf[..self.buf_len]),
            ],
        )?;
        nut_trace!("file block {}, {} bytes", self.block_num, self.buf_len);
        Ok(Some(req))
    }
}

/// Transfer handle of a block request
pub(crate) fn block_handle(req: &CmdReq) -> Option<u16> {
    req.src_cmd(0)
        .filter(|src| src.id.opcode() == op::FSTSFR)
        .and_then(|src| src.params.get(0))
        .and_then(|e| e.as_u16())
}

pub(crate) struct FileTable<'d> {
    ctxs: [FileCtx<'d>; FILE_CTX_NUM],
    find: Option<FileType>,
    delete: Option<FileType>,
    events: Deque<(FileHandle, FileEvent), NOTIFY_DEPTH>,
}

impl<'d> FileTable<'d> {
    pub const fn new() -> Self {
        Self {
            ctxs: [FileCtx::EMPTY; FILE_CTX_NUM],
            find: None,
            delete: None,
            events: Deque::new(),
        }
    }

    fn notify(&mut self, file: FileHandle, event: FileEvent) {
        if self.events.push_back((file, event)).is_err() {
            nut_error!("file event dropped");
        }
    }

    /// Report events raised since the last poll
    pub fn deliver<H: Handler>(&mut self, handler: &mut H) {
        while let Some((file, event)) = self.events.pop_front() {
            handler.file(file, event);
        }
    }

    /// A deferred block for transfer `handle` could not be queued
    ///
    /// The chip will never acknowledge it, so the transfer is abandoned.
    pub fn block_dropped(&mut self, handle: u16) {
        let Some(idx) = self.by_tsfr(handle) else {
            return;
        };
        nut_warn!("file transfer {} abandoned", self.ctxs[idx].tsfr_handle);
        self.ctxs[idx] = FileCtx::EMPTY;
        self.notify(FileHandle(idx as u8), FileEvent::Error);
    }

    fn open_ctx(&mut self, file: FileHandle) -> Result<&mut FileCtx<'d>, DrvError> {
        self.ctxs
            .get_mut(file.0 as usize)
            .filter(|c| c.in_use)
            .ok_or(DrvError::InvalidArg)
    }

    fn by_req(&self, id: ReqId) -> Option<usize> {
        self.ctxs
            .iter()
            .position(|c| c.in_use && c.load_req == Some(id))
    }

    fn by_tsfr(&self, handle: u16) -> Option<usize> {
        self.ctxs
            .iter()
            .position(|c| c.in_use && c.tsfr_handle != 0 && c.tsfr_handle == handle)
    }

    pub fn handle_event<H: Handler, const N: usize>(
        &mut self,
        id: ReqId,
        event: CmdEvent<'_>,
        outbox: &mut Deque<CmdReq, N>,
        handler: &mut H,
    ) {
        match event {
            CmdEvent::Status { src, status } => self.on_status(id, &src, status, handler),
            CmdEvent::Response { src, elems, .. } => self.on_response(id, &src, elems, outbox, handler),
            CmdEvent::Complete { .. } => {}
        }
    }

    fn on_status<H: Handler>(&mut self, id: ReqId, src: &SrcCmd<'_>, status: u16, handler: &mut H) {
        let first = src.params.get(0).and_then(|e| e.as_u16());
        match src.id.opcode() {
            op::FS => {
                let kind = FileType(src.params.get(1).and_then(|e| e.as_u16()).unwrap_or(0));
                match first.map(|o| o as u8) {
                    Some(fs_op::LOAD) => {
                        let Some(idx) = self.by_req(id) else {
                            return;
                        };
                        if status != STATUS_OK {
                            nut_warn!("file open failed, status {}", status);
                            self.ctxs[idx] = FileCtx::EMPTY;
                            handler.file(FileHandle(idx as u8), FileEvent::Error);
                        } else {
                            self.ctxs[idx].load_req = None;
                        }
                    }
                    Some(fs_op::LIST) => {
                        if self.find.take().is_some() {
                            handler.file_found(kind, None, status);
                        }
                    }
                    Some(fs_op::DEL) => {
                        if self.delete.take().is_some() {
                            handler.file_deleted(kind, status);
                        }
                    }
                    _ => nut_debug!("status for unknown file op"),
                }
            }
            op::FSTSFR => {
                let Some(idx) = first.and_then(|h| self.by_tsfr(h)) else {
                    return;
                };
                let event = if status == STATUS_OK {
                    FileEvent::Ok
                } else {
                    FileEvent::Error
                };
                handler.file(FileHandle(idx as u8), event);
            }
            other => nut_debug!("status for unknown file opcode {}", other),
        }
    }

    fn on_response<H: Handler, const N: usize>(
        &mut self,
        id: ReqId,
        src: &SrcCmd<'_>,
        elems: Elems<'_>,
        outbox: &mut Deque<CmdReq, N>,
        handler: &mut H,
    ) {
        match src.id.opcode() {
            op::FS => match elems.get(0).and_then(|e| e.as_u8()) {
                Some(fs_op::LOAD) => {
                    let Some(idx) = self.by_req(id) else {
                        return;
                    };
                    let Some(handle) = elems.get(1).and_then(|e| e.as_u16()) else {
                        nut_error!("load response without transfer handle");
                        return;
                    };
                    let ctx = &mut self.ctxs[idx];
                    if ctx.tsfr_handle == 0 {
                        ctx.tsfr_handle = handle;
                        handler.file(FileHandle(idx as u8), FileEvent::Open);
                    }
                }
                Some(fs_op::LIST) => {
                    let Some(kind) = self.find else {
                        return;
                    };
                    let kind = elems.get(1).and_then(|e| e.as_u16()).map(FileType).unwrap_or(kind);
                    let name = elems.get(2).and_then(|e| e.as_str());
                    if name.is_some() {
                        handler.file_found(kind, name, STATUS_OK);
                    }
                }
                _ => nut_debug!("response for unknown file op"),
            },
            op::FSTSFR => self.on_block_ack(elems, outbox, handler),
            other => nut_debug!("response for unknown file opcode {}", other),
        }
    }

    fn on_block_ack<H: Handler, const N: usize>(
        &mut self,
        elems: Elems<'_>,
        outbox: &mut Deque<CmdReq, N>,
        handler: &mut H,
    ) {
        if elems.len() != 3 {
            nut_error!("block ack with {} elements", elems.len());
            return;
        }
        let mut vals = elems.iter().map(|e| e.as_u32());
        let (Some(Some(handle)), Some(Some(block)), Some(Some(remaining))) = (vals.next(), vals.next(), vals.next()) else {
            nut_error!("malformed block ack");
            return;
        };
        let Some(idx) = self.by_tsfr(handle as u16) else {
            nut_debug!("block ack for unknown transfer {}", handle);
            return;
        };
        let file = FileHandle(idx as u8);
        let ctx = &mut self.ctxs[idx];
        if block != ctx.block_num as u32 {
            nut_debug!("stale block ack {}, expecting {}", block, ctx.block_num);
            return;
        }

        ctx.buf_len = 0;
        match ctx.load(false) {
            Ok(Some(req)) => {
                if outbox.push_back(req).is_err() {
                    nut_error!("no room to queue file block");
                }
            }
            Ok(None) => {}
            Err(_e) => nut_error!("could not build file block"),
        }

        if ctx.pending.is_none() {
            handler.file(file, FileEvent::WriteComplete);
        }
        if remaining == 0 {
            self.ctxs[idx] = FileCtx::EMPTY;
            handler.file(file, FileEvent::Close);
        }
    }
}

/// File system operations
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Start writing a file of `len` bytes
    ///
    /// [`FileEvent::Open`] is reported once the chip has accepted the
    /// transfer. Only [`FileMode::Write`] is supported.
    pub fn file_open(&mut self, name: &str, kind: FileType, mode: FileMode, len: u32) -> Result<FileHandle, DrvError> {
        self.ensure_started()?;
        if mode != FileMode::Write || name.is_empty() || name.len() > MAX_FILENAME_LEN {
            return Err(DrvError::InvalidArg);
        }
        let idx = self
            .files
            .ctxs
            .iter()
            .position(|c| !c.in_use)
            .ok_or(DrvError::NoSpace)?;

        let mut req = CmdReq::new(OPEN_REQ_SZ, 1, Owner::File)?;
        req.append(
            group::FS,
            op::FS,
            &[
                Param::UInt(fs_op::LOAD as u32),
                Param::UInt(kind.0 as u32),
                Param::UInt(TSFR_PROT),
                Param::Str(name),
                Param::UInt(len),
            ],
        )?;
        let id = self.transmit(req)?;

        self.files.ctxs[idx] = FileCtx {
            in_use: true,
            load_req: Some(id),
            ..FileCtx::EMPTY
        };
        Ok(FileHandle(idx as u8))
    }

    /// Queue `data` for writing
    ///
    /// `data` stays borrowed until it has been staged. Returns
    /// [`DrvError::Busy`] while earlier data is still pending, the staging
    /// buffer is waiting for an acknowledgement, or the chip has not yet
    /// opened the transfer. If a block cannot be queued the write is undone
    /// and may be retried.
    pub fn file_write(&mut self, file: FileHandle, data: &'d [u8]) -> Result<(), DrvError> {
        self.ensure_started()?;
        let ctx = self.files.open_ctx(file)?;
        if data.is_empty() || ctx.closing {
            return Err(DrvError::InvalidArg);
        }
        if ctx.pending.is_some() || ctx.is_full() || ctx.tsfr_handle == 0 {
            return Err(DrvError::Busy);
        }
        let saved = *ctx;
        ctx.pending = Some(data);
        let res = match ctx.load(false) {
            Ok(Some(req)) => self.transmit(req).map(drop),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        if res.is_err() {
            self.files.ctxs[file.0 as usize] = saved;
        }
        res
    }

    /// Send whatever is staged and finish the transfer
    ///
    /// If the final block cannot be queued the file stays open and the
    /// close may be retried.
    pub fn file_close(&mut self, file: FileHandle) -> Result<CloseProgress, DrvError> {
        self.ensure_started()?;
        let ctx = self.files.open_ctx(file)?;
        if ctx.pending.is_some() || ctx.is_full() {
            return Err(DrvError::Busy);
        }
        let saved = *ctx;
        let flush = match ctx.load(true) {
            Ok(flush) => flush,
            Err(e) => {
                *ctx = saved;
                return Err(e);
            }
        };
        let Some(req) = flush else {
            *ctx = FileCtx::EMPTY;
            self.files.notify(file, FileEvent::Close);
            return Ok(CloseProgress::Done);
        };
        ctx.closing = true;
        if let Err(e) = self.transmit(req) {
            self.files.ctxs[file.0 as usize] = saved;
            return Err(e);
        }
        Ok(CloseProgress::Pending)
    }

    /// List the files of a type
    ///
    /// Each file is reported through [`Handler::file_found`], followed by
    /// a final call with no name.
    pub fn file_find(&mut self, kind: FileType) -> Result<(), DrvError> {
        self.ensure_started()?;
        if self.files.find.is_some() {
            return Err(DrvError::RetryRequest);
        }
        let mut req = CmdReq::new(OPEN_REQ_SZ, 1, Owner::File)?;
        req.append(
            group::FS,
            op::FS,
            &[Param::UInt(fs_op::LIST as u32), Param::UInt(kind.0 as u32)],
        )?;
        self.transmit(req)?;
        self.files.find = Some(kind);
        Ok(())
    }

    /// Delete a file
    ///
    /// The result is reported through [`Handler::file_deleted`].
    pub fn file_delete(&mut self, name: &str, kind: FileType) -> Result<(), DrvError> {
        self.ensure_started()?;
        if name.is_empty() || name.len() > MAX_FILENAME_LEN {
            return Err(DrvError::InvalidArg);
        }
        if self.files.delete.is_some() {
            return Err(DrvError::RetryRequest);
        }
        let mut req = CmdReq::new(OPEN_REQ_SZ, 1, Owner::File)?;
        req.append(
            group::FS,
            op::FS,
            &[
                Param::UInt(fs_op::DEL as u32),
                Param::UInt(kind.0 as u32),
                Param::Str(name),
            ],
        )?;
        self.transmit(req)?;
        self.files.delete = Some(kind);
        Ok(())
    }
}
