//! HIF frame header
//!
//! Every frame exchanged with the chip, in either direction, starts with
//! an eight byte header:
//!
//! ```text
//! [0]     group
//! [1]     opcode (bit 7 = data packet flag on raw sends)
//! [2..4]  total frame length, u16 LE, header included
//! [4]     message kind
//! [5]     number of TLV elements
//! [6..8]  sequence number, u16 LE
//! ```

/// Size of the frame header, in bytes
pub const FRAME_HDR_SIZE: usize = 8;

/// Set on the opcode of raw frames that carry a bulk data section
pub const DATA_PKT_FLAG: u8 = 0x80;

/// Feature groups, the high byte of a [`CmdId`]
pub mod group {
    /// Chip management
    pub const MAIN: u8 = 0;
    /// Wi-Fi connection management
    pub const WIFI: u8 = 1;
    /// Sockets
    pub const IP: u8 = 2;
    /// Host interface management
    pub const HIF: u8 = 3;
    /// Over the air update and host file download
    pub const OTA: u8 = 4;
    /// TLS certificate storage
    pub const SSL: u8 = 5;
    /// Certification test interface
    pub const SIGMA: u8 = 6;
    /// Module file system
    pub const FS: u8 = 8;
}

/// A command identifier, `(group << 8) | opcode`
///
/// The group byte doubles as the module ID that outstanding
/// commands are counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdId(pub u16);

impl CmdId {
    /// Combine a group and opcode
    pub const fn new(group: u8, opcode: u8) -> Self {
        Self(((group as u16) << 8) | opcode as u16)
    }

    /// The feature group (module ID)
    pub const fn group(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// The opcode within the group
    pub const fn opcode(&self) -> u8 {
        self.0 as u8
    }
}

/// The kind of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Packed binary structure, no element framing
    Raw,
    /// Command request (host to chip only)
    Req,
    /// Command response
    Rsp,
    /// Command status
    Status,
    /// Asynchronous event
    Aec,
}

/// Unknown message kind byte
#[derive(Debug, PartialEq)]
pub struct UnknownKind(pub u8);

impl MsgKind {
    const RAW: u8 = 0;
    const REQ: u8 = 1;
    const RSP: u8 = 2;
    const STATUS: u8 = 3;
    const AEC: u8 = 4;
}

impl TryFrom<u8> for MsgKind {
    type Error = UnknownKind;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            Self::RAW => Ok(MsgKind::Raw),
            Self::REQ => Ok(MsgKind::Req),
            Self::RSP => Ok(MsgKind::Rsp),
            Self::STATUS => Ok(MsgKind::Status),
            Self::AEC => Ok(MsgKind::Aec),
            other => Err(UnknownKind(other)),
        }
    }
}

impl From<MsgKind> for u8 {
    fn from(val: MsgKind) -> Self {
        match val {
            MsgKind::Raw => MsgKind::RAW,
            MsgKind::Req => MsgKind::REQ,
            MsgKind::Rsp => MsgKind::RSP,
            MsgKind::Status => MsgKind::STATUS,
            MsgKind::Aec => MsgKind::AEC,
        }
    }
}

/// A decoded frame header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    /// Feature group
    pub group: u8,
    /// Opcode within the group
    pub opcode: u8,
    /// Total frame length, header included
    pub len: u16,
    /// Message kind
    pub kind: MsgKind,
    /// Number of TLV elements in the payload
    pub num_elems: u8,
    /// Sequence number
    pub seq: u16,
}

/// Ways an inbound frame can fail to decode
#[derive(Debug, PartialEq)]
pub enum HeaderError {
    /// Fewer bytes than a header
    Short,
    /// Message kind byte not recognised
    Kind(u8),
}

impl Header {
    /// Header for a raw frame carrying `payload_len` bytes
    pub const fn raw(group: u8, opcode: u8, payload_len: u16) -> Self {
        Self {
            group,
            opcode,
            len: FRAME_HDR_SIZE as u16 + payload_len,
            kind: MsgKind::Raw,
            num_elems: 0,
            seq: 0,
        }
    }

    /// The command ID this frame refers to
    pub fn id(&self) -> CmdId {
        CmdId::new(self.group, self.opcode)
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; FRAME_HDR_SIZE] {
        let len = self.len.to_le_bytes();
        let seq = self.seq.to_le_bytes();
        [
            self.group,
            self.opcode,
            len[0],
            len[1],
            self.kind.into(),
            self.num_elems,
            seq[0],
            seq[1],
        ]
    }

    /// Decode the leading header of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self, HeaderError> {
        let hdr = buf.get(..FRAME_HDR_SIZE).ok_or(HeaderError::Short)?;
        let kind = MsgKind::try_from(hdr[4]).map_err(|UnknownKind(k)| HeaderError::Kind(k))?;
        Ok(Self {
            group: hdr[0],
            opcode: hdr[1],
            len: u16::from_le_bytes([hdr[2], hdr[3]]),
            kind,
            num_elems: hdr[5],
            seq: u16::from_le_bytes([hdr[6], hdr[7]]),
        })
    }
}

/// Overwrite the sequence number of an encoded header in place
pub(crate) fn patch_seq(frame: &mut [u8], seq: u16) {
    if let Some(dst) = frame.get_mut(6..FRAME_HDR_SIZE) {
        dst.copy_from_slice(&seq.to_le_bytes());
    }
}
