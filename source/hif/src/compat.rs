//! Host interface compatibility gate
//!
//! Firmware reports the version of its host interface as a 16 bit word:
//! block in bits 15..14, major in bits 13..8, minor in bits 7..0. A driver
//! and firmware with the same block and major can talk, but older minors
//! lack some commands. Those are listed, newest last, in [`BLACKLIST`], and
//! the minor version picks how far into the list the refusals start.
//!
//! A block or major mismatch leaves only the OTA switch and rollback
//! commands usable, which is enough to get back to a matching firmware.

use crate::{
    frame::{group, CmdId, DATA_PKT_FLAG},
    ota, socket, ssl, DrvError,
};

/// Interface block this driver speaks
pub const HIF_BLOCK: u8 = 2;
/// Interface major version this driver speaks
pub const HIF_MAJOR: u8 = 1;

/// Stands in for "every command but OTA switch and rollback"
pub const OTA_RB_ONLY: u16 = 0xFFFF;

mod wifi {
    pub const CONN: u8 = 40;
    pub const DELETE_CRED: u8 = 41;
    pub const START_PROV_MODE: u8 = 42;
    pub const ENABLE_AP: u8 = 43;
    pub const PASSIVE_SCAN: u8 = 44;
    pub const ROAMING: u8 = 45;
    pub const CONN_PARAM: u8 = 46;
    pub const SCAN_SSID_LIST: u8 = 47;
    pub const SET_STOP_SCAN_OPTION: u8 = 48;
}

/// Commands refused by older firmware, oldest first
pub const BLACKLIST: [u16; 13] = [
    OTA_RB_ONLY,
    CmdId::new(group::SSL, ssl::WRITE_OWN_CERTS).0,
    CmdId::new(group::WIFI, wifi::PASSIVE_SCAN).0,
    CmdId::new(group::WIFI, wifi::CONN).0,
    CmdId::new(group::WIFI, wifi::CONN_PARAM).0,
    CmdId::new(group::WIFI, wifi::DELETE_CRED).0,
    CmdId::new(group::WIFI, wifi::START_PROV_MODE).0,
    CmdId::new(group::WIFI, wifi::ENABLE_AP).0,
    CmdId::new(group::IP, socket::op::RAW_SOCK_OPT).0,
    CmdId::new(group::WIFI, wifi::ROAMING).0,
    CmdId::new(group::IP, socket::op::SECURE).0,
    CmdId::new(group::WIFI, wifi::SCAN_SSID_LIST).0,
    CmdId::new(group::WIFI, wifi::SET_STOP_SCAN_OPTION).0,
];

/// A decoded interface version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HifVersion {
    /// Interface block
    pub block: u8,
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
}

impl From<u16> for HifVersion {
    fn from(value: u16) -> Self {
        Self {
            block: (value >> 14) as u8,
            major: ((value >> 8) & 0x3F) as u8,
            minor: value as u8,
        }
    }
}

/// What the gate allows after [`HifGate::enable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HifAccess {
    /// Everything the firmware's minor version supports
    Full,
    /// Only OTA switch and rollback
    Restricted,
}

/// Send-time command filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HifGate {
    offset: u8,
}

impl HifGate {
    /// A gate that refuses all but OTA switch and rollback
    pub const fn new() -> Self {
        Self { offset: 0 }
    }

    /// Configure the gate from the firmware's interface word
    pub fn enable(&mut self, hif_info: u16) -> HifAccess {
        let ver = HifVersion::from(hif_info);
        if ver.block != HIF_BLOCK || ver.major != HIF_MAJOR {
            nut_error!(
                "HIF {}.{} does not match driver {}.{}, limited to OTA switch/rollback",
                ver.block,
                ver.major,
                HIF_BLOCK,
                HIF_MAJOR
            );
            self.offset = 0;
            return HifAccess::Restricted;
        }
        self.offset = match ver.minor {
            0 => 1,
            1 | 2 => 2,
            3 => 3,
            4 => 10,
            5 => 13,
            _ => BLACKLIST.len() as u8,
        };
        nut_info!("HIF {}.{}.{} enabled", ver.block, ver.major, ver.minor);
        HifAccess::Full
    }

    /// Check whether a command may be sent
    ///
    /// The data packet flag on `opcode` is ignored.
    pub fn check(&self, group: u8, opcode: u8) -> Result<(), DrvError> {
        let opcode = opcode & !DATA_PKT_FLAG;
        if group == group::OTA && (opcode == ota::op::ROLLBACK || opcode == ota::op::SWITCH_FIRMWARE) {
            return Ok(());
        }
        if self.offset == 0 {
            nut_error!("HIF blocked: {} {}", group, opcode);
            return Err(DrvError::Unsupported);
        }
        let code = CmdId::new(group, opcode).0;
        let refused = BLACKLIST
            .get(self.offset as usize..)
            .map(|tail| tail.contains(&code))
            .unwrap_or(false);
        if refused {
            nut_error!("HIF blocked: {} {}", group, opcode);
            return Err(DrvError::Unsupported);
        }
        Ok(())
    }
}

impl Default for HifGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hif(block: u16, major: u16, minor: u16) -> u16 {
        (block << 14) | (major << 8) | minor
    }

    fn open(minor: u16) -> HifGate {
        let mut gate = HifGate::new();
        assert_eq!(gate.enable(hif(2, 1, minor)), HifAccess::Full);
        gate
    }

    fn split(code: u16) -> (u8, u8) {
        ((code >> 8) as u8, code as u8)
    }

    #[test]
    fn version_fields() {
        assert_eq!(
            HifVersion::from(hif(2, 1, 5)),
            HifVersion {
                block: 2,
                major: 1,
                minor: 5
            }
        );
    }

    #[test]
    fn mismatch_leaves_only_rollback_and_switch() {
        let mut gate = HifGate::new();
        assert_eq!(gate.enable(hif(1, 1, 9)), HifAccess::Restricted);
        assert_eq!(gate.enable(hif(2, 2, 9)), HifAccess::Restricted);
        assert_eq!(gate.check(group::OTA, ota::op::ROLLBACK), Ok(()));
        assert_eq!(gate.check(group::OTA, ota::op::SWITCH_FIRMWARE), Ok(()));
        assert_eq!(gate.check(group::OTA, ota::op::START_UPDATE), Err(DrvError::Unsupported));
        assert_eq!(gate.check(group::MAIN, 1), Err(DrvError::Unsupported));
    }

    #[test]
    fn refusals_follow_minor_offset() {
        let offsets = [(0u16, 1usize), (1, 2), (2, 2), (3, 3), (4, 10), (5, 13), (6, 13), (200, 13)];
        for (minor, offset) in offsets {
            let gate = open(minor);
            for (i, code) in BLACKLIST.iter().enumerate().skip(1) {
                let (g, o) = split(*code);
                let expect = if i >= offset { Err(DrvError::Unsupported) } else { Ok(()) };
                assert_eq!(gate.check(g, o), expect, "minor {} entry {}", minor, i);
            }
            assert_eq!(gate.check(group::MAIN, 1), Ok(()));
        }
    }

    #[test]
    fn data_packet_flag_is_masked() {
        let gate = open(0);
        assert_eq!(
            gate.check(group::SSL, ssl::WRITE_OWN_CERTS | DATA_PKT_FLAG),
            Err(DrvError::Unsupported)
        );
        let gate = open(1);
        assert_eq!(gate.check(group::SSL, ssl::WRITE_OWN_CERTS | DATA_PKT_FLAG), Ok(()));
    }
}
