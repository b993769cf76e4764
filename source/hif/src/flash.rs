//! Flexible flash map lookup
//!
//! Newer firmware images carry a table describing where each region of the
//! chip's SPI flash lives, instead of fixed addresses. The table sits right
//! after the OTA control sector.

use crate::{bus::SpiFlash, DrvError, Error};

/// Flash sector size
pub const FLASH_SECTOR_SZ: u32 = 4096;
/// Size of the OTA control section
pub const OTA_CONTROL_SEC_SZ: u32 = 32;
/// Address of the flash map table
pub const FLASH_MAP_TABLE_ADDR: u32 = FLASH_SECTOR_SZ + OTA_CONTROL_SEC_SZ + 8;
/// Most entries the table may hold
pub const MAX_MAP_ENTRIES: u8 = 32;

/// Region IDs found in the flash map
pub mod entry {
    /// Firmware image
    pub const FIRMWARE: u16 = 0x0011;
    /// PLL and gain tables
    pub const PLL_GAIN: u16 = 0x0021;
    /// TLS root certificates
    pub const ROOT_CERTS: u16 = 0x0031;
    /// Stored connection parameters
    pub const CONN_PARAM: u16 = 0x0034;
    /// Provisioning web pages
    pub const HTTP_FILES: u16 = 0x0035;
    /// TLS server certificates
    pub const TLS_CERTS: u16 = 0x0036;
    /// Downloaded host file
    pub const HOST_FILE: u16 = 0x0041;
}

/// A region of flash
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    /// Start address
    pub start: u32,
    /// Size in bytes
    pub size: u32,
}

/// Look up region `id` in the flash map
///
/// On a match `section` is overwritten. If no entry matches, this still
/// returns `Ok` and `section` is left as it was, so callers should start
/// from a section they can recognise as empty.
pub async fn find_section<F: SpiFlash>(
    flash: &mut F,
    id: u16,
    section: &mut Section,
) -> Result<(), Error<F::FlashError>> {
    let mut buf = [0u8; 8];
    flash.read(FLASH_MAP_TABLE_ADDR, &mut buf[..4]).await.map_err(Error::Bus)?;
    let count = buf[0];
    if count > MAX_MAP_ENTRIES {
        nut_error!("flash map claims {} entries", count);
        return Err(DrvError::Failed.into());
    }

    for i in 0..count as u32 {
        flash
            .read(FLASH_MAP_TABLE_ADDR + 4 + 8 * i, &mut buf)
            .await
            .map_err(Error::Bus)?;
        if u16::from_le_bytes([buf[0], buf[1]]) == id {
            *section = Section {
                start: buf[2] as u32 * FLASH_SECTOR_SZ,
                size: buf[3] as u32 * FLASH_SECTOR_SZ,
            };
            nut_debug!("flash region {} at {}, {} bytes", id, section.start, section.size);
            return Ok(());
        }
    }
    nut_debug!("flash region {} not in map", id);
    Ok(())
}
