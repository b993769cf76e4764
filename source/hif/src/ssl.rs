//! Certificate upload
//!
//! The caller hands over a buffer whose first [`CHUNK_HDR_SZ`] bytes are
//! reserved. Small buffers go out in one frame. Larger ones are cut into
//! [`CHUNKSZ`] chunks, each preceded by a chunk header written into the eight
//! bytes just before it, so no second buffer is needed.
//!
//! The chip answers each chunk with the same header, carrying a flash status
//! in place of the signature. Those statuses are folded into one result,
//! reported when the final chunk is acknowledged.

use crate::{
    frame::{group, DATA_PKT_FLAG},
    winc::{Handler, Winc, WincCfg},
    DrvError, Error, HifBus,
};

/// Write the device's own certificates
pub const WRITE_OWN_CERTS: u8 = 5;

/// Largest buffer sent as a single frame
pub const TXLIMIT: usize = 1536;
/// Chunk size for larger buffers
pub const CHUNKSZ: usize = 1280;
/// Size of the chunk header
pub const CHUNK_HDR_SZ: usize = 8;

const CHUNK_SIG: u16 = 0x6C73;
const ZEROS: [u8; 4] = [0; 4];

/// Outcome of a certificate write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[repr(u8)]
pub enum TlsFlashStatus {
    /// Written
    Ok = 0,
    /// Flash already held these certificates
    OkNoChange = 1,
    /// Flash is now corrupt
    ErrCorrupt = 2,
    /// Write failed, flash unchanged
    ErrNoChange = 3,
    /// Unknown outcome
    ErrUnknown = 4,
}

impl TlsFlashStatus {
    fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::OkNoChange,
            2 => Self::ErrCorrupt,
            3 => Self::ErrNoChange,
            _ => Self::ErrUnknown,
        }
    }
}

/// Chunk header: signature (or status), total, offset and size, in 32 bit words
#[derive(Debug, Clone, Copy, PartialEq)]
struct ChunkHeader {
    sig: u16,
    total32: u16,
    offset32: u16,
    size32: u16,
}

impl ChunkHeader {
    fn encode(&self) -> [u8; CHUNK_HDR_SZ] {
        let mut out = [0u8; CHUNK_HDR_SZ];
        out[0..2].copy_from_slice(&self.sig.to_le_bytes());
        out[2..4].copy_from_slice(&self.total32.to_le_bytes());
        out[4..6].copy_from_slice(&self.offset32.to_le_bytes());
        out[6..8].copy_from_slice(&self.size32.to_le_bytes());
        out
    }

    fn decode(b: &[u8]) -> Option<Self> {
        let b = b.get(..CHUNK_HDR_SZ)?;
        let word = |i: usize| u16::from_le_bytes([b[i], b[i + 1]]);
        Some(Self {
            sig: word(0),
            total32: word(2),
            offset32: word(4),
            size32: word(6),
        })
    }
}

pub(crate) struct CertFold {
    status: TlsFlashStatus,
}

impl CertFold {
    pub const fn new() -> Self {
        Self {
            status: TlsFlashStatus::ErrUnknown,
        }
    }

    fn apply(&mut self, offset32: u16, raw: u16) -> TlsFlashStatus {
        use TlsFlashStatus::*;

        if offset32 == 0 {
            self.status = OkNoChange;
        }
        self.status = match (self.status, TlsFlashStatus::from_raw(raw)) {
            (OkNoChange, Ok) => Ok,
            (held, Ok | OkNoChange) => held,
            (_, ErrCorrupt) => ErrCorrupt,
            (held @ (ErrCorrupt | ErrUnknown), ErrNoChange) => held,
            (_, ErrNoChange) => ErrNoChange,
            (ErrCorrupt, ErrUnknown) => ErrCorrupt,
            (_, ErrUnknown) => ErrUnknown,
        };
        self.status
    }

    pub fn handle_reply<H: Handler>(&mut self, opcode: u8, payload: &[u8], handler: &mut H) {
        if opcode != WRITE_OWN_CERTS {
            nut_debug!("unhandled ssl reply {}", opcode);
            return;
        }
        let Some(hdr) = ChunkHeader::decode(payload) else {
            nut_error!("short certificate reply, {} bytes", payload.len());
            return;
        };
        let status = self.apply(hdr.offset32, hdr.sig);
        nut_trace!("cert chunk at {} acked, status {}", hdr.offset32, hdr.sig);
        if hdr.offset32 as u32 + hdr.size32 as u32 == hdr.total32 as u32 {
            handler.certs_written(status);
        }
    }
}

/// Certificate upload
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Send a certificate bundle to the chip
    ///
    /// The first [`CHUNK_HDR_SZ`] bytes of `buf` are overwritten with a chunk
    /// header. The rest of `buf` is left as it was, even on error. The result
    /// arrives as [`Handler::certs_written`].
    pub async fn send_certs<B: HifBus>(&mut self, bus: &mut B, buf: &mut [u8]) -> Result<(), Error<B::BusError>> {
        let len = buf.len();
        if len < CHUNK_HDR_SZ {
            return Err(DrvError::InvalidArg.into());
        }
        let total32 = u16::try_from((len + 3) / 4).map_err(|_| DrvError::InvalidArg)?;
        let opcode = WRITE_OWN_CERTS | DATA_PKT_FLAG;

        if len <= TXLIMIT {
            let hdr = ChunkHeader {
                sig: CHUNK_SIG,
                total32,
                offset32: 0,
                size32: total32,
            };
            buf[..CHUNK_HDR_SZ].copy_from_slice(&hdr.encode());
            return self.send_raw(bus, group::SSL, opcode, &[&buf[..]]).await;
        }

        let mut ofs = 0;
        while ofs < len {
            let chunk = CHUNKSZ.min(len - ofs);
            let padded = (chunk + 3) & !3;
            let hdr = ChunkHeader {
                sig: CHUNK_SIG,
                total32,
                offset32: (ofs / 4) as u16,
                size32: (padded / 4) as u16,
            }
            .encode();
            let pad = &ZEROS[..padded - chunk];
            nut_trace!("cert chunk {} of {} bytes", ofs, chunk);

            if ofs == 0 {
                buf[..CHUNK_HDR_SZ].copy_from_slice(&hdr);
                self.send_raw(bus, group::SSL, opcode, &[&buf[..chunk], pad]).await?;
            } else {
                let at = ofs - CHUNK_HDR_SZ;
                let mut saved = [0u8; CHUNK_HDR_SZ];
                saved.copy_from_slice(&buf[at..ofs]);
                buf[at..ofs].copy_from_slice(&hdr);
                let res = self
                    .send_raw(bus, group::SSL, opcode, &[&buf[at..ofs + chunk], pad])
                    .await;
                buf[at..ofs].copy_from_slice(&saved);
                res?;
            }
            ofs += chunk;
        }
        Ok(())
    }
}
