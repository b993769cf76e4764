//! Driver context
//!
//! [`Winc`] holds every piece of driver state: the request queue, the
//! socket table, file transfer contexts and the rest. Feature operations
//! are implemented on it in their own modules.

use core::marker::PhantomData;

use embassy_sync::{
    blocking_mutex::raw::RawMutex,
    mutex::{Mutex, MutexGuard},
};
use embassy_time::Duration;
use heapless::{Deque, Vec};

use crate::{
    bus::HifBus,
    cmd_req::{CmdReq, Owner},
    compat::{HifAccess, HifGate},
    dev::{CmdEvent, Dev, Dispatch, ReqId},
    elem::Elems,
    file::{block_handle, FileEvent, FileHandle, FileTable, FileType},
    frame::{group, CmdId, Header, MsgKind, FRAME_HDR_SIZE},
    ota::OtaState,
    socket::{SocketEvent, SocketId, SocketTable},
    ssl::{CertFold, TlsFlashStatus},
    DrvError, Error, RX_BUF_SZ,
};

/// Requests built while dispatching, waiting to join the queue
const OUTBOX_LEN: usize = 4;

/// Largest number of parts a raw frame payload may be gathered from
const MAX_RAW_PARTS: usize = 3;

/// Compile time configuration of a [`Winc`]
pub trait WincCfg {
    /// Mutex type used by [`SharedWinc`]
    type Mutex: RawMutex + 'static;

    /// Number of times a failed chip wake is retried
    const WAKE_RETRIES: u8;

    /// Delay between chip wake attempts
    const WAKE_RETRY_DELAY: Duration;

    /// Largest number of outstanding commands per module accepted by
    /// [`Winc::cmd_req`]
    const MAX_MODULE_REQS: u8;
}

/// Driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// Not initialised
    Deinit,
    /// Initialised, chip halted; direct flash access is allowed
    Init,
    /// Firmware running, frames can be exchanged
    Start,
}

/// Receiver of everything the chip reports
///
/// All methods default to doing nothing. They are called from within
/// [`Winc::poll`].
pub trait Handler {
    /// An event for a request submitted with [`Owner::App`]
    fn cmd_event(&mut self, _ctx: u32, _req: ReqId, _event: CmdEvent<'_>) {}

    /// An asynchronous event from a subscribed group
    fn aec(&mut self, _id: CmdId, _elems: Elems<'_>) {}

    /// Progress of an open file transfer
    fn file(&mut self, _file: FileHandle, _event: FileEvent) {}

    /// One result of [`Winc::file_find`]; `name` is `None` on the final call
    fn file_found(&mut self, _kind: FileType, _name: Option<&str>, _status: u16) {}

    /// Result of [`Winc::file_delete`]
    fn file_deleted(&mut self, _kind: FileType, _status: u16) {}

    /// Socket activity
    fn socket(&mut self, _sock: SocketId, _event: SocketEvent<'_>) {}

    /// Combined result of [`Winc::send_certs`]
    fn certs_written(&mut self, _status: TlsFlashStatus) {}

    /// Firmware update availability information
    fn ota_notif(&mut self, _info: &[u8]) {}

    /// Result of an OTA operation
    fn ota_status(&mut self, _kind: u8, _status: u8) {}

    /// Result of [`Winc::host_file_get`]
    fn host_file_get(&mut self, _status: u8, _handle: u8, _size: u32) {}

    /// A block read by [`Winc::host_file_read_hif`]
    fn host_file_read(&mut self, _status: u8, _data: &[u8]) {}

    /// Result of [`Winc::host_file_erase`]
    fn host_file_erase(&mut self, _status: u8) {}
}

#[derive(Debug, Clone, Copy)]
struct ChipPower {
    wake_count: u8,
}

impl ChipPower {
    async fn wake<B: HifBus>(
        &mut self,
        bus: &mut B,
        retries: u8,
        delay: Duration,
    ) -> Result<(), B::BusError> {
        if self.wake_count == 0 {
            let mut tries = 0;
            loop {
                match bus.wake().await {
                    Ok(()) => break,
                    Err(e) if tries >= retries => {
                        nut_error!("chip wake failed after {} retries", tries);
                        return Err(e);
                    }
                    Err(_) => {
                        tries += 1;
                        nut_warn!("chip wake retry {}", tries);
                        bus.delay(delay).await;
                    }
                }
            }
        }
        self.wake_count = self.wake_count.saturating_add(1);
        Ok(())
    }

    async fn sleep<B: HifBus>(&mut self, bus: &mut B) -> Result<(), B::BusError> {
        self.wake_count = self.wake_count.saturating_sub(1);
        if self.wake_count == 0 {
            bus.sleep().await?;
        }
        Ok(())
    }
}

/// The driver context
pub struct Winc<'d, C: WincCfg> {
    state: DriverState,
    dev: Dev,
    gate: HifGate,
    power: ChipPower,
    outbox: Deque<CmdReq, OUTBOX_LEN>,
    pub(crate) files: FileTable<'d>,
    pub(crate) sockets: SocketTable,
    pub(crate) certs: CertFold,
    pub(crate) ota: OtaState,
    rx: [u8; RX_BUF_SZ],
    _cfg: PhantomData<C>,
}

/// Lifecycle
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Create a driver context in the [`DriverState::Deinit`] state
    pub const fn new() -> Self {
        Self {
            state: DriverState::Deinit,
            dev: Dev::new(),
            gate: HifGate::new(),
            power: ChipPower { wake_count: 0 },
            outbox: Deque::new(),
            files: FileTable::new(),
            sockets: SocketTable::new(),
            certs: CertFold::new(),
            ota: OtaState::new(),
            rx: [0; RX_BUF_SZ],
            _cfg: PhantomData,
        }
    }

    /// Reset all state and enter [`DriverState::Init`]
    ///
    /// The chip is expected to be held halted until [`Winc::start`].
    pub fn init(&mut self) {
        self.deinit();
        self.state = DriverState::Init;
        nut_info!("driver initialised");
    }

    /// Read the chip's interface version and start exchanging frames
    ///
    /// Returns whether the firmware's interface version allows full
    /// access or only OTA switch and rollback.
    pub async fn start<B: HifBus>(&mut self, bus: &mut B) -> Result<HifAccess, Error<B::BusError>> {
        if self.state == DriverState::Deinit {
            return Err(DrvError::NotOpen.into());
        }
        self.power
            .wake(bus, C::WAKE_RETRIES, C::WAKE_RETRY_DELAY)
            .await
            .map_err(Error::Bus)?;
        let info = bus.hif_info().await;
        let slept = self.power.sleep(bus).await;
        let info = info.map_err(Error::Bus)?;
        slept.map_err(Error::Bus)?;

        let access = self.gate.enable(info as u16);
        self.state = DriverState::Start;
        nut_info!("driver started");
        Ok(access)
    }

    /// Stop exchanging frames and return to [`DriverState::Init`]
    pub fn stop(&mut self) {
        if self.state == DriverState::Start {
            self.state = DriverState::Init;
            nut_info!("driver stopped");
        }
    }

    /// Drop all state, including queued requests
    pub fn deinit(&mut self) {
        self.state = DriverState::Deinit;
        self.dev = Dev::new();
        self.gate = HifGate::new();
        self.power = ChipPower { wake_count: 0 };
        self.outbox.clear();
        self.files = FileTable::new();
        self.sockets = SocketTable::new();
        self.certs = CertFold::new();
        self.ota = OtaState::new();
    }

    /// Current lifecycle state
    pub fn state(&self) -> DriverState {
        self.state
    }

    pub(crate) fn ensure_started(&self) -> Result<(), DrvError> {
        match self.state {
            DriverState::Start => Ok(()),
            _ => Err(DrvError::NotOpen),
        }
    }
}

/// Command requests
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Create a request whose events go to [`Handler::cmd_event`]
    ///
    /// Fails with [`DrvError::RetryRequest`] while `module` already has
    /// [`WincCfg::MAX_MODULE_REQS`] commands outstanding.
    pub fn cmd_req(&self, module: u8, capacity: usize, max_cmds: usize, ctx: u32) -> Result<CmdReq, DrvError> {
        if self.dev.mod_req_count(module) >= C::MAX_MODULE_REQS {
            return Err(DrvError::RetryRequest);
        }
        CmdReq::new(capacity, max_cmds, Owner::App(ctx))
    }

    /// Queue a request for sending
    ///
    /// The request is consumed, including on failure. On success it is
    /// handed back in [`CmdEvent::Complete`] once every command has its
    /// status.
    pub fn transmit(&mut self, req: CmdReq) -> Result<ReqId, DrvError> {
        self.ensure_started()?;
        for id in req.cmd_ids() {
            self.gate.check(id.group(), id.opcode())?;
        }
        self.dev.transmit(req)
    }

    /// Number of outstanding commands counted against `module`
    pub fn mod_req_count(&self, module: u8) -> u8 {
        self.dev.mod_req_count(module)
    }

    /// Forward asynchronous events of `group` to [`Handler::aec`]
    pub fn aec_register(&mut self, group: u8) -> Result<(), DrvError> {
        self.dev.aec_register(group)
    }

    /// Stop forwarding asynchronous events of `group`
    pub fn aec_deregister(&mut self, group: u8) {
        self.dev.aec_deregister(group)
    }

    /// True once a bus failure has been latched
    ///
    /// Only [`Winc::init`] clears the latch.
    pub fn bus_error(&self) -> bool {
        self.dev.bus_error()
    }
}

/// Bus management and operation
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Service the bus
    ///
    /// Sends the head request if it has not been sent, then reads and
    /// dispatches frames for as long as the chip's interrupt is pending.
    /// All [`Handler`] callbacks run from here.
    ///
    /// On a bus failure every queued request is retired with a
    /// [`CmdEvent::Complete`] counting all of its commands as errors, and
    /// the driver refuses further traffic until re-initialised.
    pub async fn poll<B, H>(&mut self, bus: &mut B, handler: &mut H) -> Result<(), Error<B::BusError>>
    where
        B: HifBus,
        H: Handler,
    {
        self.ensure_started()?;
        self.files.deliver(handler);
        if self.dev.bus_error() {
            self.flush_failed(handler);
            return Err(DrvError::RequestError.into());
        }

        loop {
            if let Err(e) = self.send_head(bus).await {
                self.flush_failed(handler);
                return Err(e);
            }
            if !bus.interrupt_pending() {
                return Ok(());
            }
            let len = match self.recv_frame(bus).await {
                Ok(len) => len,
                Err(e) => {
                    self.flush_failed(handler);
                    return Err(e);
                }
            };
            bus.interrupt_serviced();
            self.dispatch(len, handler);
            self.drain_outbox();
            self.files.deliver(handler);
        }
    }

    async fn send_head<B: HifBus>(&mut self, bus: &mut B) -> Result<(), Error<B::BusError>> {
        let Winc { dev, power, .. } = self;
        let Some(req) = dev.unsent_head() else {
            return Ok(());
        };

        let mut res = power.wake(bus, C::WAKE_RETRIES, C::WAKE_RETRY_DELAY).await;
        if res.is_ok() {
            for frame in req.frames() {
                nut_trace!("tx command frame, {} bytes", frame.len());
                res = bus.write_frame(&[frame]).await;
                if res.is_err() {
                    break;
                }
            }
            let slept = power.sleep(bus).await;
            res = res.and(slept);
        }

        match res {
            Ok(()) => {
                dev.mark_head_sent();
                Ok(())
            }
            Err(e) => {
                dev.set_bus_error();
                Err(Error::Bus(e))
            }
        }
    }

    async fn recv_frame<B: HifBus>(&mut self, bus: &mut B) -> Result<usize, Error<B::BusError>> {
        let Winc { dev, power, rx, .. } = self;
        let mut res = power.wake(bus, C::WAKE_RETRIES, C::WAKE_RETRY_DELAY).await;
        let mut len = 0;
        if res.is_ok() {
            match bus.read_frame(rx).await {
                Ok(n) => len = n,
                Err(e) => res = Err(e),
            }
            let slept = power.sleep(bus).await;
            res = res.and(slept);
        }
        match res {
            Ok(()) => Ok(len),
            Err(e) => {
                dev.set_bus_error();
                Err(Error::Bus(e))
            }
        }
    }

    /// Send one raw frame, gathered from `parts`
    pub(crate) async fn send_raw<B: HifBus>(
        &mut self,
        bus: &mut B,
        group: u8,
        opcode: u8,
        parts: &[&[u8]],
    ) -> Result<(), Error<B::BusError>> {
        self.ensure_started()?;
        if self.dev.bus_error() {
            return Err(DrvError::RequestError.into());
        }
        self.gate.check(group, opcode)?;

        let payload_len: usize = parts.iter().map(|p| p.len()).sum();
        let payload_len = u16::try_from(payload_len)
            .ok()
            .filter(|l| *l as usize + FRAME_HDR_SIZE <= u16::MAX as usize)
            .ok_or(DrvError::InvalidArg)?;
        let hdr = Header::raw(group, opcode, payload_len).encode();

        let mut gather: Vec<&[u8], { MAX_RAW_PARTS + 1 }> = Vec::new();
        let _ = gather.push(&hdr);
        for part in parts {
            gather.push(part).map_err(|_| DrvError::InvalidArg)?;
        }

        nut_trace!("tx raw {} {}, {} bytes", group, opcode, payload_len);
        let mut res = self.power.wake(bus, C::WAKE_RETRIES, C::WAKE_RETRY_DELAY).await;
        if res.is_ok() {
            res = bus.write_frame(&gather).await;
            let slept = self.power.sleep(bus).await;
            res = res.and(slept);
        }
        res.map_err(|e| {
            self.dev.set_bus_error();
            Error::Bus(e)
        })
    }

    fn flush_failed<H: Handler>(&mut self, handler: &mut H) {
        let Winc { dev, files, outbox, .. } = self;
        outbox.clear();
        dev.flush(|d| route(d, files, outbox, handler));
        outbox.clear();
    }

    fn drain_outbox(&mut self) {
        while let Some(req) = self.outbox.pop_front() {
            let block = match req.owner() {
                Owner::File => block_handle(&req),
                Owner::App(_) => None,
            };
            if let Err(_e) = self.transmit(req) {
                nut_error!("deferred request dropped");
                if let Some(handle) = block {
                    self.files.block_dropped(handle);
                }
            }
        }
    }

    fn dispatch<H: Handler>(&mut self, len: usize, handler: &mut H) {
        let Winc {
            dev,
            files,
            sockets,
            certs,
            ota,
            outbox,
            rx,
            ..
        } = self;

        let Some(frame) = rx.get(..len) else {
            nut_error!("frame of {} bytes overruns buffer", len);
            return;
        };
        let hdr = match Header::decode(frame) {
            Ok(hdr) => hdr,
            Err(_) => {
                nut_error!("malformed frame header, {} bytes", len);
                return;
            }
        };
        let hdr_len = hdr.len as usize;
        if hdr_len < FRAME_HDR_SIZE || hdr_len > len || len - hdr_len > 4 {
            nut_error!("corrupted packet, header says {} read {}", hdr.len, len);
            return;
        }
        let payload = &frame[FRAME_HDR_SIZE..hdr_len];
        nut_trace!("rx {} {} kind {}", hdr.group, hdr.opcode, u8::from(hdr.kind));

        match hdr.kind {
            MsgKind::Raw => match hdr.group {
                group::IP => sockets.handle_reply(hdr.opcode, payload, handler),
                group::OTA => ota.handle_reply(hdr.opcode, payload, handler),
                group::SSL => certs.handle_reply(hdr.opcode, payload, handler),
                other => nut_error!("raw frame for unknown group {}", other),
            },
            MsgKind::Rsp | MsgKind::Status | MsgKind::Aec => {
                dev.handle(&hdr, payload, |d| route(d, files, outbox, handler));
            }
            MsgKind::Req => nut_error!("unexpected request frame from chip"),
        }
    }
}

fn route<H: Handler, const N: usize>(
    d: Dispatch<'_>,
    files: &mut FileTable<'_>,
    outbox: &mut Deque<CmdReq, N>,
    handler: &mut H,
) {
    match d {
        Dispatch::Cmd {
            owner: Owner::App(ctx),
            id,
            event,
        } => handler.cmd_event(ctx, id, event),
        Dispatch::Cmd {
            owner: Owner::File,
            id,
            event,
        } => files.handle_event(id, event, outbox, handler),
        Dispatch::Aec { id, elems } => handler.aec(id, elems),
    }
}

impl<'d, C: WincCfg> Default for Winc<'d, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Winc`] behind an async mutex
///
/// For applications that poll from one task and use the driver from
/// others.
///
/// ```rust
/// use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
/// use embassy_time::Duration;
/// use winc_hif::{SharedWinc, WincCfg};
///
/// struct Cfg;
///
/// impl WincCfg for Cfg {
///     type Mutex = CriticalSectionRawMutex;
///     const WAKE_RETRIES: u8 = 3;
///     const WAKE_RETRY_DELAY: Duration = Duration::from_millis(1);
///     const MAX_MODULE_REQS: u8 = 4;
/// }
///
/// static WINC: SharedWinc<'static, Cfg> = SharedWinc::new();
/// ```
pub struct SharedWinc<'d, C: WincCfg> {
    inner: Mutex<C::Mutex, Winc<'d, C>>,
}

impl<'d, C: WincCfg> SharedWinc<'d, C> {
    /// Create a shared, uninitialised driver
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Winc::new()),
        }
    }

    /// Lock the driver for exclusive use
    pub async fn lock(&self) -> MutexGuard<'_, C::Mutex, Winc<'d, C>> {
        self.inner.lock().await
    }
}

impl<'d, C: WincCfg> Default for SharedWinc<'d, C> {
    fn default() -> Self {
        Self::new()
    }
}
