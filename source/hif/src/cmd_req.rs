//! Command request builder
//!
//! A [`CmdReq`] packs one or more command frames into a single owned
//! buffer so they can be sent to the chip as a burst. The request is moved
//! into the driver by [`Winc::transmit`](crate::Winc::transmit) and only
//! comes back inside the terminal [`CmdEvent::Complete`](crate::CmdEvent)
//! event, once every command in it has received a status.

use heapless::Vec;

use crate::{
    elem::{encode_params, Elems, Param},
    frame::{patch_seq, CmdId, Header, MsgKind, FRAME_HDR_SIZE},
    DrvError,
};

/// Largest buffer a single request may use
pub const CMD_REQ_BUF_SZ: usize = 256;

/// Largest number of commands a single request may hold
pub const MAX_CMDS_PER_REQ: usize = 4;

/// Who receives the events produced by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The application handler, with an opaque context value
    App(u32),
    /// The file transfer module
    File,
}

#[derive(Debug, Clone, Copy)]
struct CmdSlot {
    start: u16,
    len: u16,
    id: CmdId,
    num_params: u8,
    seq: u16,
    status: Option<u16>,
}

/// A command as it was sent, handed back with its status and responses
///
/// `params` re-reads the parameters the command was built with, so a
/// handler can tell which of several similar commands a response is for.
#[derive(Debug, Clone, Copy)]
pub struct SrcCmd<'a> {
    /// Position of the command within its request
    pub idx: usize,
    /// The command ID
    pub id: CmdId,
    /// The sequence number the command was sent with
    pub seq: u16,
    /// The parameters the command was built with
    pub params: Elems<'a>,
}

/// An owned, multi-command request
pub struct CmdReq {
    buf: Vec<u8, CMD_REQ_BUF_SZ>,
    capacity: usize,
    max_cmds: usize,
    cmds: Vec<CmdSlot, MAX_CMDS_PER_REQ>,
    owner: Owner,
    poisoned: bool,
}

impl CmdReq {
    /// Create an empty request
    ///
    /// `capacity` bounds the encoded size of all commands together, and
    /// must be between one frame header and [`CMD_REQ_BUF_SZ`]. `max_cmds`
    /// must be between 1 and [`MAX_CMDS_PER_REQ`].
    pub fn new(capacity: usize, max_cmds: usize, owner: Owner) -> Result<Self, DrvError> {
        if !(FRAME_HDR_SIZE..=CMD_REQ_BUF_SZ).contains(&capacity) {
            return Err(DrvError::InvalidArg);
        }
        if !(1..=MAX_CMDS_PER_REQ).contains(&max_cmds) {
            return Err(DrvError::InvalidArg);
        }
        Ok(Self {
            buf: Vec::new(),
            capacity,
            max_cmds,
            cmds: Vec::new(),
            owner,
            poisoned: false,
        })
    }

    /// Append one command
    ///
    /// If the command does not fit, the request is poisoned: it can no
    /// longer be transmitted and must be discarded.
    pub fn append(&mut self, group: u8, opcode: u8, params: &[Param<'_>]) -> Result<(), DrvError> {
        if self.poisoned {
            return Err(DrvError::InvalidArg);
        }
        match self.try_append(group, opcode, params) {
            Some(()) => Ok(()),
            None => {
                nut_warn!("command {} {} does not fit request", group, opcode);
                self.poisoned = true;
                Err(DrvError::NoSpace)
            }
        }
    }

    fn try_append(&mut self, group: u8, opcode: u8, params: &[Param<'_>]) -> Option<()> {
        if self.cmds.len() >= self.max_cmds {
            return None;
        }
        let start = self.buf.len();
        let len = FRAME_HDR_SIZE + params.iter().map(Param::encoded_len).sum::<usize>();
        if start + len > self.capacity {
            return None;
        }
        let len16 = u16::try_from(len).ok()?;
        let num_params = u8::try_from(params.len()).ok()?;

        self.buf.resize(start + len, 0).ok()?;
        let frame = &mut self.buf[start..];
        encode_params(params, &mut frame[FRAME_HDR_SIZE..])?;
        let hdr = Header {
            group,
            opcode,
            len: len16,
            kind: MsgKind::Req,
            num_elems: num_params,
            seq: 0,
        };
        frame[..FRAME_HDR_SIZE].copy_from_slice(&hdr.encode());

        self.cmds
            .push(CmdSlot {
                start: start as u16,
                len: len16,
                id: hdr.id(),
                num_params,
                seq: 0,
                status: None,
            })
            .ok()
    }

    /// Throw the request away without sending it
    pub fn discard(self) {
        nut_trace!("discarding request with {} commands", self.cmds.len());
    }

    /// Who receives this request's events
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Number of commands appended
    pub fn num_cmds(&self) -> usize {
        self.cmds.len()
    }

    /// True once an append has failed
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Status received for a command, if any
    pub fn status(&self, idx: usize) -> Option<u16> {
        self.cmds.get(idx)?.status
    }

    /// A command as it was built
    pub fn src_cmd(&self, idx: usize) -> Option<SrcCmd<'_>> {
        let slot = self.cmds.get(idx)?;
        let start = slot.start as usize + FRAME_HDR_SIZE;
        let end = slot.start as usize + slot.len as usize;
        let params = Elems::new(slot.num_params, &self.buf[start..end])?;
        Some(SrcCmd {
            idx,
            id: slot.id,
            seq: slot.seq,
            params,
        })
    }

    pub(crate) fn cmd_ids(&self) -> impl Iterator<Item = CmdId> + '_ {
        self.cmds.iter().map(|c| c.id)
    }

    pub(crate) fn frames(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.cmds
            .iter()
            .map(|c| &self.buf[c.start as usize..][..c.len as usize])
    }

    /// Stamp each command with the next sequence number
    pub(crate) fn assign_seqs(&mut self, next: &mut u16) {
        for slot in self.cmds.iter_mut() {
            slot.seq = *next;
            *next = next.wrapping_add(1);
            patch_seq(&mut self.buf[slot.start as usize..], slot.seq);
        }
    }

    /// Index of the command a status or response refers to
    ///
    /// Only commands still waiting for their status can match.
    pub(crate) fn match_cmd(&self, id: CmdId, seq: u16) -> Option<usize> {
        self.cmds
            .iter()
            .position(|c| c.status.is_none() && c.id == id && c.seq == seq)
    }

    pub(crate) fn set_status(&mut self, idx: usize, status: u16) {
        if let Some(slot) = self.cmds.get_mut(idx) {
            slot.status = Some(status);
        }
    }
}
