//! NVMe admin commands and the data structures they return.
//!
//! Everything here is little-endian (NVMe 1.4, section 4.1).

use crate::structure::{trim_ascii, Structure};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub mod opcode {
    pub const GET_LOG_PAGE: u8 = 0x02;
    pub const IDENTIFY: u8 = 0x06;
    pub const GET_FEATURES: u8 = 0x0A;
}

/// Log page identifiers for Get Log Page.
pub mod log_page {
    pub const ERROR_INFORMATION: u8 = 0x01;
    pub const SMART_HEALTH: u8 = 0x02;
    pub const FIRMWARE_SLOT: u8 = 0x03;
}

/// Controller or Namespace Structure values for Identify (CDW10 bits 7:0).
pub mod cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
}

/// Namespace id addressing every namespace, used for controller-wide logs.
pub const NSID_ALL: u32 = 0xFFFF_FFFF;

pub const IDENTIFY_LEN: usize = 4096;
pub const SMART_LOG_LEN: usize = 512;

/// An admin command in the layout of Linux's `struct nvme_admin_cmd`, which
/// also serves as the platform-neutral description of the command.
///
/// `addr` and `data_len` describe the data buffer; transports fill `addr`
/// in themselves.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct NvmeAdminCommand {
    pub opcode: u8,
    pub flags: u8,
    pub _reserved: [u8; 2],
    pub nsid: [u8; 4],
    pub cdw2: [u8; 4],
    pub cdw3: [u8; 4],
    pub metadata: [u8; 8],
    pub addr: [u8; 8],
    pub metadata_len: [u8; 4],
    pub data_len: [u8; 4],
    pub cdw10: [u8; 4],
    pub cdw11: [u8; 4],
    pub cdw12: [u8; 4],
    pub cdw13: [u8; 4],
    pub cdw14: [u8; 4],
    pub cdw15: [u8; 4],
    pub timeout_ms: [u8; 4],
    pub result: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<NvmeAdminCommand>(), 72);

impl Structure for NvmeAdminCommand {
    const NAME: &'static str = "NVMe admin command";
}

impl NvmeAdminCommand {
    pub fn new(opcode: u8, nsid: u32, data_len: u32) -> Self {
        Self {
            opcode,
            nsid: nsid.to_le_bytes(),
            data_len: data_len.to_le_bytes(),
            ..Self::zeroed()
        }
    }

    pub fn identify(cns: u8, nsid: u32) -> Self {
        Self::new(opcode::IDENTIFY, nsid, IDENTIFY_LEN as u32).with_cdw10(u32::from(cns))
    }

    /// Get Log Page for `len` bytes of log `lid`. NUMDL (CDW10 bits 31:16)
    /// holds the zero-based dword count.
    pub fn get_log_page(lid: u8, nsid: u32, len: u32) -> Self {
        let numd = (len / 4).saturating_sub(1);
        let numdl = numd & 0xFFFF;
        let numdu = numd >> 16;
        Self::new(opcode::GET_LOG_PAGE, nsid, len)
            .with_cdw10(u32::from(lid) | numdl << 16)
            .with_cdw11(numdu)
    }

    pub fn with_cdw10(mut self, value: u32) -> Self {
        self.cdw10 = value.to_le_bytes();
        self
    }

    pub fn with_cdw11(mut self, value: u32) -> Self {
        self.cdw11 = value.to_le_bytes();
        self
    }

    pub fn with_timeout_ms(mut self, value: u32) -> Self {
        self.timeout_ms = value.to_le_bytes();
        self
    }

    pub fn nsid(&self) -> u32 {
        u32::from_le_bytes(self.nsid)
    }

    pub fn data_len(&self) -> u32 {
        u32::from_le_bytes(self.data_len)
    }

    pub fn metadata_len(&self) -> u32 {
        u32::from_le_bytes(self.metadata_len)
    }

    pub fn timeout_ms(&self) -> u32 {
        u32::from_le_bytes(self.timeout_ms)
    }

    pub fn result(&self) -> u32 {
        u32::from_le_bytes(self.result)
    }

    /// Command dwords 2, 3 and 10 through 15, in that order.
    pub fn dwords(&self) -> [u32; 8] {
        [
            self.cdw2, self.cdw3, self.cdw10, self.cdw11, self.cdw12, self.cdw13, self.cdw14,
            self.cdw15,
        ]
        .map(u32::from_le_bytes)
    }

    pub fn cdw10(&self) -> u32 {
        u32::from_le_bytes(self.cdw10)
    }

    pub fn cdw11(&self) -> u32 {
        u32::from_le_bytes(self.cdw11)
    }

    /// The 64-byte submission queue entry for this command with the data
    /// pointer left zero.
    pub fn submission_entry(&self, command_id: u16) -> SubmissionQueueEntry {
        let mut cdw0 = [0u8; 4];
        cdw0[0] = self.opcode;
        cdw0[1] = self.flags;
        cdw0[2..].copy_from_slice(&command_id.to_le_bytes());
        SubmissionQueueEntry {
            cdw0,
            nsid: self.nsid,
            cdw2: self.cdw2,
            cdw3: self.cdw3,
            metadata_pointer: self.metadata,
            prp1: [0; 8],
            prp2: [0; 8],
            cdw10: self.cdw10,
            cdw11: self.cdw11,
            cdw12: self.cdw12,
            cdw13: self.cdw13,
            cdw14: self.cdw14,
            cdw15: self.cdw15,
        }
    }
}

/// The on-queue form of an admin command (NVMe 1.4 figure 105).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SubmissionQueueEntry {
    /// Opcode, fused/PSDT flags and command identifier.
    pub cdw0: [u8; 4],
    pub nsid: [u8; 4],
    pub cdw2: [u8; 4],
    pub cdw3: [u8; 4],
    pub metadata_pointer: [u8; 8],
    pub prp1: [u8; 8],
    pub prp2: [u8; 8],
    pub cdw10: [u8; 4],
    pub cdw11: [u8; 4],
    pub cdw12: [u8; 4],
    pub cdw13: [u8; 4],
    pub cdw14: [u8; 4],
    pub cdw15: [u8; 4],
}

const_assert_eq!(core::mem::size_of::<SubmissionQueueEntry>(), 64);

impl Structure for SubmissionQueueEntry {
    const NAME: &'static str = "NVMe submission queue entry";
}

impl SubmissionQueueEntry {
    pub fn opcode(&self) -> u8 {
        self.cdw0[0]
    }

    pub fn command_id(&self) -> u16 {
        u16::from_le_bytes([self.cdw0[2], self.cdw0[3]])
    }
}

/// Identify Controller data structure (CNS 01h).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IdentifyController {
    pub vid: [u8; 2],
    pub ssvid: [u8; 2],
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    pub mdts: u8,
    pub cntlid: [u8; 2],
    pub ver: [u8; 4],
    pub _reserved_84: [u8; 172],
    pub oacs: [u8; 2],
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: [u8; 2],
    pub cctemp: [u8; 2],
    pub _reserved_270: [u8; 10],
    pub tnvmcap: [u8; 16],
    pub unvmcap: [u8; 16],
    pub _reserved_312: [u8; 204],
    pub nn: [u8; 4],
    pub _remainder: [u8; 3576],
}

const_assert_eq!(core::mem::size_of::<IdentifyController>(), IDENTIFY_LEN);

impl Structure for IdentifyController {
    const NAME: &'static str = "NVMe Identify Controller";
}

impl IdentifyController {
    pub fn vendor_id(&self) -> u16 {
        u16::from_le_bytes(self.vid)
    }

    pub fn serial(&self) -> String {
        trim_ascii(&self.sn)
    }

    pub fn model(&self) -> String {
        trim_ascii(&self.mn)
    }

    pub fn firmware(&self) -> String {
        trim_ascii(&self.fr)
    }

    pub fn controller_id(&self) -> u16 {
        u16::from_le_bytes(self.cntlid)
    }

    /// Specification version as (major, minor, tertiary).
    pub fn version(&self) -> (u16, u8, u8) {
        let v = u32::from_le_bytes(self.ver);
        ((v >> 16) as u16, (v >> 8) as u8, v as u8)
    }

    /// Warning composite temperature threshold, Kelvin.
    pub fn warning_temperature(&self) -> u16 {
        u16::from_le_bytes(self.wctemp)
    }

    /// Critical composite temperature threshold, Kelvin.
    pub fn critical_temperature(&self) -> u16 {
        u16::from_le_bytes(self.cctemp)
    }

    pub fn total_capacity(&self) -> u128 {
        u128::from_le_bytes(self.tnvmcap)
    }

    pub fn namespace_count(&self) -> u32 {
        u32::from_le_bytes(self.nn)
    }
}

/// Identify Namespace data structure (CNS 00h).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IdentifyNamespace {
    pub nsze: [u8; 8],
    pub ncap: [u8; 8],
    pub nuse: [u8; 8],
    pub nsfeat: u8,
    pub nlbaf: u8,
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub _reserved_30: [u8; 98],
    pub lbaf: [[u8; 4]; 16],
    pub _remainder: [u8; 3904],
}

const_assert_eq!(core::mem::size_of::<IdentifyNamespace>(), IDENTIFY_LEN);

impl Structure for IdentifyNamespace {
    const NAME: &'static str = "NVMe Identify Namespace";
}

impl IdentifyNamespace {
    /// Namespace size in logical blocks.
    pub fn size(&self) -> u64 {
        u64::from_le_bytes(self.nsze)
    }

    pub fn capacity(&self) -> u64 {
        u64::from_le_bytes(self.ncap)
    }

    pub fn utilization(&self) -> u64 {
        u64::from_le_bytes(self.nuse)
    }

    /// Bytes per logical block of the format currently in use.
    pub fn lba_size(&self) -> u64 {
        let format = u32::from_le_bytes(self.lbaf[usize::from(self.flbas & 0x0F)]);
        let lbads = (format >> 16) & 0xFF;
        if !(9..=63).contains(&lbads) {
            return 0;
        }
        1 << lbads
    }
}

bitflags::bitflags! {
    /// Critical Warning field of the SMART / Health Information log.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CriticalWarning: u8 {
        const AVAILABLE_SPARE = 1 << 0;
        const TEMPERATURE = 1 << 1;
        const RELIABILITY_DEGRADED = 1 << 2;
        const READ_ONLY = 1 << 3;
        const VOLATILE_BACKUP_FAILED = 1 << 4;
        const PERSISTENT_MEMORY_READ_ONLY = 1 << 5;
    }
}

/// SMART / Health Information log page (log id 02h).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SmartLog {
    pub critical_warning: u8,
    /// Composite temperature, Kelvin.
    pub temperature: [u8; 2],
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub endurance_group_warning: u8,
    pub _reserved_7: [u8; 25],
    pub data_units_read: [u8; 16],
    pub data_units_written: [u8; 16],
    pub host_read_commands: [u8; 16],
    pub host_write_commands: [u8; 16],
    pub controller_busy_time: [u8; 16],
    pub power_cycles: [u8; 16],
    pub power_on_hours: [u8; 16],
    pub unsafe_shutdowns: [u8; 16],
    pub media_errors: [u8; 16],
    pub error_log_entries: [u8; 16],
    pub warning_temperature_time: [u8; 4],
    pub critical_temperature_time: [u8; 4],
    pub temperature_sensors: [[u8; 2]; 8],
    pub _reserved_216: [u8; 296],
}

const_assert_eq!(core::mem::size_of::<SmartLog>(), SMART_LOG_LEN);

impl Structure for SmartLog {
    const NAME: &'static str = "NVMe SMART / Health log";
}

impl SmartLog {
    pub fn critical_warning(&self) -> CriticalWarning {
        CriticalWarning::from_bits_retain(self.critical_warning)
    }

    pub fn temperature(&self) -> u16 {
        u16::from_le_bytes(self.temperature)
    }

    /// Populated temperature sensors, Kelvin, indexed from 1.
    pub fn temperature_sensors(&self) -> impl Iterator<Item = (usize, u16)> + '_ {
        self.temperature_sensors
            .iter()
            .map(|t| u16::from_le_bytes(*t))
            .enumerate()
            .filter(|(_, t)| *t != 0)
            .map(|(i, t)| (i + 1, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn smart_log_page_command() {
        let cmd = NvmeAdminCommand::get_log_page(log_page::SMART_HEALTH, NSID_ALL, 512);
        assert_eq!(cmd.cdw10(), 0x007F_0002);
        assert_eq!(cmd.nsid(), 0xFFFF_FFFF);
        assert_eq!(cmd.data_len(), 512);
        let bytes = cmd.encode();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(&bytes[4..8], &[0xFF; 4]);
        assert_eq!(&bytes[36..40], &[0x00, 0x02, 0, 0]);
        assert_eq!(&bytes[40..44], &[0x02, 0x00, 0x7F, 0x00]);
    }

    #[test]
    fn large_log_page_splits_dword_count() {
        let cmd = NvmeAdminCommand::get_log_page(0xC0, NSID_ALL, 0x40_0000);
        assert_eq!(cmd.cdw10() >> 16, 0xFFFF);
        assert_eq!(cmd.cdw11(), 0x000F);
    }

    #[test]
    fn identify_controller_command() {
        let cmd = NvmeAdminCommand::identify(cns::CONTROLLER, 0);
        assert_eq!(cmd.opcode, 0x06);
        assert_eq!(cmd.cdw10(), 1);
        assert_eq!(cmd.data_len(), 4096);
    }

    #[test]
    fn submission_entry_layout() {
        let sqe = NvmeAdminCommand::identify(cns::NAMESPACE, 1).submission_entry(7);
        let bytes = sqe.encode();
        assert_eq!(&bytes[0..4], &[0x06, 0x00, 0x07, 0x00]);
        assert_eq!(&bytes[4..8], &[0x01, 0, 0, 0]);
        assert_eq!(&bytes[40..44], &[0, 0, 0, 0]);
        assert_eq!(sqe.command_id(), 7);
    }

    #[test]
    fn identify_controller_fields() {
        let mut data = vec![0u8; IDENTIFY_LEN];
        data[0..2].copy_from_slice(&0x144Du16.to_le_bytes());
        data[4..24].copy_from_slice(b"S4EWNX0R123456      ");
        data[24..64].copy_from_slice(b"Samsung SSD 970 EVO Plus 1TB            ");
        data[64..72].copy_from_slice(b"2B2QEXM7");
        data[80..84].copy_from_slice(&0x0001_0300u32.to_le_bytes());
        data[266..268].copy_from_slice(&358u16.to_le_bytes());
        data[516..520].copy_from_slice(&1u32.to_le_bytes());
        let id = IdentifyController::decode(&data).unwrap();
        assert_eq!(id.vendor_id(), 0x144D);
        assert_eq!(id.serial(), "S4EWNX0R123456");
        assert_eq!(id.model(), "Samsung SSD 970 EVO Plus 1TB");
        assert_eq!(id.firmware(), "2B2QEXM7");
        assert_eq!(id.version(), (1, 3, 0));
        assert_eq!(id.warning_temperature(), 358);
        assert_eq!(id.namespace_count(), 1);
    }

    #[test]
    fn identify_namespace_fields() {
        let mut data = vec![0u8; IDENTIFY_LEN];
        data[0..8].copy_from_slice(&1_953_525_168u64.to_le_bytes());
        data[26] = 1;
        data[132..136].copy_from_slice(&(12u32 << 16).to_le_bytes());
        let ns = IdentifyNamespace::decode(&data).unwrap();
        assert_eq!(ns.size(), 1_953_525_168);
        assert_eq!(ns.lba_size(), 4096);
    }

    #[test]
    fn smart_log_offsets() {
        let mut data = [0u8; SMART_LOG_LEN];
        data[0] = 0x02;
        data[1..3].copy_from_slice(&310u16.to_le_bytes());
        data[128] = 0x39;
        data[129] = 0x30;
        data[202..204].copy_from_slice(&305u16.to_le_bytes());
        let log = SmartLog::decode(&data).unwrap();
        assert_eq!(log.temperature(), 310);
        assert_eq!(u128::from_le_bytes(log.power_on_hours), 12345);
        assert_eq!(log.critical_warning(), CriticalWarning::TEMPERATURE);
        assert_eq!(log.temperature_sensors().collect::<Vec<_>>(), vec![(2, 305)]);
    }

    proptest! {
        #[test]
        fn admin_command_survives(opcode: u8, nsid: u32, len: u32, cdw10: u32, cdw11: u32, timeout: u32) {
            let cmd = NvmeAdminCommand::new(opcode, nsid, len)
                .with_cdw10(cdw10)
                .with_cdw11(cdw11)
                .with_timeout_ms(timeout);
            let decoded = NvmeAdminCommand::decode(cmd.encode()).unwrap();
            prop_assert_eq!(decoded, cmd);
            prop_assert_eq!(decoded.cdw10(), cdw10);
            prop_assert_eq!(decoded.timeout_ms(), timeout);
        }
    }
}
