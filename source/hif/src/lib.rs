//! # WINC HIF
//!
//! This is the host side core of a driver for Microchip WINC Wi-Fi network
//! controllers. It frames commands for the chip, sends them over a host
//! interface bus (SPI, in practice), and routes the chip's replies back to
//! the code that asked for them.
//!
//! The chip itself runs the Wi-Fi stack, the TCP/IP stack and TLS. The host
//! only ever talks to it through this interface.
//!
//! ## Frames
//!
//! Every exchange is a frame starting with an eight byte header, see
//! [`frame`]. Frames come in a few kinds:
//!
//! * **Raw** frames carry packed little-endian structures. Sockets, OTA and
//!   certificate storage use these directly.
//! * **Req** frames are commands, carrying a list of TLV parameters
//!   (see [`elem`]) and a sequence number.
//! * **Rsp** and **Status** frames are the chip's answers to commands,
//!   matched back to the command by command ID and sequence number. Each
//!   command gets exactly one status, and any number of responses before it.
//! * **Aec** frames are unsolicited asynchronous events.
//!
//! ## Requests
//!
//! Commands are built into a [`CmdReq`], which may hold a small burst of
//! commands. The request is moved into the driver by [`Winc::transmit()`].
//! Every status and response for it is delivered to a [`Handler`], and once
//! all of its commands have a status, the request itself is handed back in
//! a final [`CmdEvent::Complete`]. That is the only way to get it back, so
//! a submitted request can never be reused while the driver still owns it.
//!
//! Requests are queued, and only the request at the head of the queue is on
//! the wire at any time.
//!
//! ## Polling
//!
//! Nothing happens in the background. The application calls
//! [`Winc::poll()`] whenever the bus interrupt fires (or periodically), and
//! the driver sends whatever is queued and then reads and dispatches frames
//! until the interrupt is no longer pending. Handler callbacks run from
//! inside `poll`.
//!
//! ## Chunked transfers
//!
//! Three features move more data than fits in one frame:
//!
//! * Certificate storage splits a certificate bundle into overlapping chunks
//!   and folds the per-chunk results back into one status ([`ssl`]).
//! * The file transfer module stages outgoing file data in a small buffer and
//!   sends it one acknowledged block at a time ([`file`]).
//! * Host file download pulls a file the chip fetched from a URL, either in
//!   blocks over the interface or straight from the SPI flash while the chip
//!   is halted ([`ota`], [`flash`]).
//!
//! ## Compatibility
//!
//! The chip reports its interface version at start. Commands the firmware is
//! known not to support are refused on the host before they are sent, see
//! [`compat`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod bus;
pub mod cmd_req;
pub mod compat;
mod dev;
pub mod elem;
pub mod file;
pub mod flash;
pub mod frame;
pub mod ota;
pub mod socket;
pub mod ssl;
mod winc;

#[cfg(test)]
mod test_util;

pub use crate::{
    bus::{HifBus, IrqLatch, SpiFlash},
    cmd_req::{CmdReq, Owner, SrcCmd},
    compat::HifAccess,
    dev::{CmdEvent, ReqId, MAX_QUEUED_REQS},
    elem::{Elem, ElemType, Elems, Param},
    frame::CmdId,
    winc::{DriverState, Handler, SharedWinc, Winc, WincCfg},
};

/// Size of the buffer inbound frames are read into
pub const RX_BUF_SZ: usize = 1600;

/// Status value the chip uses for success
pub const STATUS_OK: u16 = 0;

/// Driver errors that are detected on the host, with no bus involved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DrvError {
    /// An argument was out of range or inconsistent
    InvalidArg,
    /// The resource is in use; try again once it has finished
    Busy,
    /// Too many operations of this kind are outstanding
    RetryRequest,
    /// The request could not be accepted by the transport
    RequestError,
    /// The driver has not been started
    NotOpen,
    /// The chip's firmware does not support this command
    Unsupported,
    /// No room left in a fixed size table or buffer
    NoSpace,
    /// A validated operation was refused
    Failed,
}

/// An error from a driver operation that touches a bus
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// The underlying bus or flash reported an error
    Bus(E),
    /// The driver refused the operation
    Driver(DrvError),
}

impl<E> From<DrvError> for Error<E> {
    fn from(value: DrvError) -> Self {
        Self::Driver(value)
    }
}
