//! Firmware update and host file download
//!
//! Both ride on raw OTA frames. Only one firmware operation (update, switch
//! or rollback) may be outstanding at a time; the chip reports its outcome
//! with an update status reply.
//!
//! A host file is any file the chip downloads into its own flash on the
//! host's behalf. The chip names it with a one byte handle. While the chip
//! runs it can be read back over the host interface; while the chip is held
//! in reset it can be read straight from the SPI flash.

use crate::{
    bus::SpiFlash,
    flash::{entry, find_section, Section, FLASH_SECTOR_SZ},
    frame::group,
    winc::{DriverState, Handler, Winc, WincCfg},
    DrvError, Error, HifBus,
};

/// Raw OTA opcodes
pub mod op {
    /// Set the update notification server URL
    pub const NOTIF_SET_URL: u8 = 100;
    /// Ask the notification server for updates
    pub const NOTIF_CHECK: u8 = 101;
    /// Download and install a firmware image
    pub const START_UPDATE: u8 = 103;
    /// Boot the other firmware image
    pub const SWITCH_FIRMWARE: u8 = 104;
    /// Return to the previous firmware image
    pub const ROLLBACK: u8 = 105;
    /// Notification server answer
    pub const NOTIF_INFO: u8 = 106;
    /// Outcome of a firmware operation
    pub const UPDATE_STATUS: u8 = 107;
    /// Abort a running update
    pub const ABORT: u8 = 109;
    /// Host file status
    pub const HOST_FILE_STATUS: u8 = 112;
    /// Download a host file
    pub const HOST_FILE_DOWNLOAD: u8 = 113;
    /// Read part of a host file
    pub const HOST_FILE_READ: u8 = 114;
    /// Erase the host file
    pub const HOST_FILE_ERASE: u8 = 115;
}

/// No host file is available
pub const HFD_INVALID_HANDLE: u8 = 0xFF;

const STATUS_SUCCESS: u8 = 0;

pub(crate) struct OtaState {
    update_pending: bool,
    get_pending: bool,
    erase_pending: bool,
    handle: u8,
    section: Option<Section>,
}

impl OtaState {
    pub const fn new() -> Self {
        Self {
            update_pending: false,
            get_pending: false,
            erase_pending: false,
            handle: HFD_INVALID_HANDLE,
            section: None,
        }
    }

    fn check_handle(&self, handle: u8) -> Result<(), DrvError> {
        if handle == HFD_INVALID_HANDLE || handle != self.handle {
            return Err(DrvError::InvalidArg);
        }
        Ok(())
    }

    pub fn handle_reply<H: Handler>(&mut self, opcode: u8, payload: &[u8], handler: &mut H) {
        match opcode {
            op::NOTIF_INFO => handler.ota_notif(payload),
            op::UPDATE_STATUS => {
                let [kind, status, ..] = *payload else {
                    return short(opcode);
                };
                self.update_pending = false;
                handler.ota_status(kind, status);
            }
            op::HOST_FILE_STATUS | op::HOST_FILE_DOWNLOAD => {
                let Some(p) = payload.get(..6) else {
                    return short(opcode);
                };
                let size = u32::from_le_bytes([p[0], p[1], p[2], p[3]]);
                let status = p[4];
                if status == STATUS_SUCCESS {
                    self.handle = p[5];
                    nut_info!("host file handle {}, {} bytes", self.handle, size);
                }
                if self.get_pending {
                    self.get_pending = false;
                    handler.host_file_get(status, self.handle, size);
                }
            }
            op::HOST_FILE_READ => {
                let Some(p) = payload.get(..4) else {
                    return short(opcode);
                };
                let block = u16::from_le_bytes([p[2], p[3]]) as usize;
                let data = &payload[4..];
                let data = match data.get(..block) {
                    Some(d) => d,
                    None => {
                        nut_warn!("host file block of {} bytes truncated to {}", block, data.len());
                        data
                    }
                };
                handler.host_file_read(p[0], data);
            }
            op::HOST_FILE_ERASE => {
                let Some(status) = payload.first() else {
                    return short(opcode);
                };
                if self.erase_pending {
                    self.erase_pending = false;
                    handler.host_file_erase(*status);
                }
            }
            other => nut_debug!("unhandled ota reply {}", other),
        }
    }
}

fn short(opcode: u8) {
    nut_error!("short ota reply {}", opcode);
}

/// Firmware update
impl<'d, C: WincCfg> Winc<'d, C> {
    async fn ota_op<B: HifBus>(&mut self, bus: &mut B, opcode: u8, parts: &[&[u8]]) -> Result<(), Error<B::BusError>> {
        if self.ota.update_pending {
            return Err(DrvError::RetryRequest.into());
        }
        self.send_raw(bus, group::OTA, opcode, parts).await?;
        self.ota.update_pending = true;
        Ok(())
    }

    /// Download and install the firmware image at `url`
    pub async fn ota_start_update<B: HifBus>(&mut self, bus: &mut B, url: &str) -> Result<(), Error<B::BusError>> {
        if url.is_empty() {
            return Err(DrvError::InvalidArg.into());
        }
        self.ota_op(bus, op::START_UPDATE, &[url.as_bytes(), &[0]]).await
    }

    /// Roll back to the previous firmware image
    pub async fn ota_rollback<B: HifBus>(&mut self, bus: &mut B) -> Result<(), Error<B::BusError>> {
        self.ota_op(bus, op::ROLLBACK, &[]).await
    }

    /// Switch to the other firmware image
    pub async fn ota_switch_firmware<B: HifBus>(&mut self, bus: &mut B) -> Result<(), Error<B::BusError>> {
        self.ota_op(bus, op::SWITCH_FIRMWARE, &[]).await
    }

    /// Abort a running update
    pub async fn ota_abort<B: HifBus>(&mut self, bus: &mut B) -> Result<(), Error<B::BusError>> {
        self.send_raw(bus, group::OTA, op::ABORT, &[]).await
    }

    /// Set the URL of the update notification server
    pub async fn ota_notif_set_url<B: HifBus>(&mut self, bus: &mut B, url: &str) -> Result<(), Error<B::BusError>> {
        if url.is_empty() {
            return Err(DrvError::InvalidArg.into());
        }
        self.send_raw(bus, group::OTA, op::NOTIF_SET_URL, &[url.as_bytes(), &[0]])
            .await
    }

    /// Ask the notification server whether an update is available
    pub async fn ota_notif_check<B: HifBus>(&mut self, bus: &mut B) -> Result<(), Error<B::BusError>> {
        self.send_raw(bus, group::OTA, op::NOTIF_CHECK, &[]).await
    }
}

/// Host file download
impl<'d, C: WincCfg> Winc<'d, C> {
    /// Have the chip download the file at `url` into its flash
    ///
    /// Any previous host file handle becomes invalid. The outcome arrives
    /// once, as [`Handler::host_file_get`].
    pub async fn host_file_get<B: HifBus>(&mut self, bus: &mut B, url: &str) -> Result<(), Error<B::BusError>> {
        if url.is_empty() {
            return Err(DrvError::InvalidArg.into());
        }
        if self.ota.get_pending {
            return Err(DrvError::RetryRequest.into());
        }
        self.send_raw(bus, group::OTA, op::HOST_FILE_DOWNLOAD, &[url.as_bytes(), &[0]])
            .await?;
        self.ota.handle = HFD_INVALID_HANDLE;
        self.ota.get_pending = true;
        Ok(())
    }

    /// Read `size` bytes at `offset` of the host file through the chip
    pub async fn host_file_read_hif<B: HifBus>(
        &mut self,
        bus: &mut B,
        handle: u8,
        offset: u32,
        size: u32,
    ) -> Result<(), Error<B::BusError>> {
        self.ota.check_handle(handle)?;
        let mut cmd = [0u8; 8];
        cmd[0..4].copy_from_slice(&offset.to_le_bytes());
        cmd[4..8].copy_from_slice(&size.to_le_bytes());
        self.send_raw(bus, group::OTA, op::HOST_FILE_READ, &[&cmd]).await
    }

    /// Read the host file straight from the chip's SPI flash
    ///
    /// The chip must be held in reset, so the driver has to be initialised
    /// but not started.
    pub async fn host_file_read_spi<F: SpiFlash>(
        &mut self,
        flash: &mut F,
        handle: u8,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), Error<F::FlashError>> {
        if handle == HFD_INVALID_HANDLE {
            return Err(DrvError::InvalidArg.into());
        }
        if self.state() != DriverState::Init {
            nut_error!("host file flash read needs the chip halted");
            return Err(DrvError::Failed.into());
        }
        let len = u32::try_from(buf.len()).map_err(|_| DrvError::InvalidArg)?;

        let section = match self.ota.section {
            Some(s) => s,
            None => {
                let mut s = Section::default();
                find_section(flash, entry::HOST_FILE, &mut s).await?;
                if s.size == 0 {
                    nut_error!("no host file region in flash map");
                    return Err(DrvError::Failed.into());
                }
                self.ota.section = Some(s);
                s
            }
        };

        let mut id = [0u8; 4];
        flash.read(section.start, &mut id).await.map_err(Error::Bus)?;
        if id[0] != handle {
            nut_warn!("flash holds host file {}, not {}", id[0], handle);
            return Err(DrvError::Failed.into());
        }
        if offset >= section.size || len > section.size || offset + len >= section.size {
            return Err(DrvError::InvalidArg.into());
        }
        flash
            .read(section.start + FLASH_SECTOR_SZ + offset, buf)
            .await
            .map_err(Error::Bus)
    }

    /// Erase the host file
    ///
    /// The handle is invalid from here on. The outcome arrives once, as
    /// [`Handler::host_file_erase`].
    pub async fn host_file_erase<B: HifBus>(&mut self, bus: &mut B, handle: u8) -> Result<(), Error<B::BusError>> {
        self.ota.check_handle(handle)?;
        self.ota.handle = HFD_INVALID_HANDLE;
        self.send_raw(bus, group::OTA, op::HOST_FILE_ERASE, &[]).await?;
        self.ota.erase_pending = true;
        Ok(())
    }

    /// Handle of the current host file, [`HFD_INVALID_HANDLE`] if none
    pub fn host_file_id(&self) -> u8 {
        self.ota.handle
    }
}
