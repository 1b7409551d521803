//! SCSI command descriptor blocks and replies.
//!
//! ATA commands reach SATA drives wrapped in the SCSI ATA PASS-THROUGH
//! CDBs (SAT, T10/04-262r8 section 13.2) below; multi-byte CDB fields are
//! big-endian on the wire.

use crate::structure::{pad_ascii, trim_ascii, Structure};
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

pub mod opcode {
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const LOG_SENSE: u8 = 0x4D;
    pub const ATA_PASS_THROUGH_16: u8 = 0x85;
    pub const ATA_PASS_THROUGH_12: u8 = 0xA1;
}

/// SAM status byte values.
pub mod status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

pub mod ata_command {
    pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
    pub const SMART: u8 = 0xB0;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
}

/// Values of the FEATURES register for the SMART command.
pub mod smart_feature {
    pub const READ_DATA: u8 = 0xD0;
    pub const READ_THRESHOLDS: u8 = 0xD1;
    pub const READ_LOG: u8 = 0xD5;
    pub const RETURN_STATUS: u8 = 0xDA;
}

/// LBA signature every SMART command must carry (LBA mid 4Fh, high C2h).
pub const SMART_LBA_SIGNATURE: u64 = 0x00C2_4F00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtaProtocol {
    HardReset = 0,
    SoftReset = 1,
    NonData = 3,
    PioDataIn = 4,
    PioDataOut = 5,
    Dma = 6,
    DmaQueued = 7,
    DeviceDiagnostic = 8,
    DeviceReset = 9,
    UdmaDataIn = 10,
    UdmaDataOut = 11,
    Fpdma = 12,
    ReturnResponseInformation = 15,
}

impl AtaProtocol {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 0x0F {
            0 => Self::HardReset,
            1 => Self::SoftReset,
            3 => Self::NonData,
            4 => Self::PioDataIn,
            5 => Self::PioDataOut,
            6 => Self::Dma,
            7 => Self::DmaQueued,
            8 => Self::DeviceDiagnostic,
            9 => Self::DeviceReset,
            10 => Self::UdmaDataIn,
            11 => Self::UdmaDataOut,
            12 => Self::Fpdma,
            15 => Self::ReturnResponseInformation,
            _ => return None,
        })
    }
}

/// Where the pass-through CDB says the transfer length lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferLength {
    None = 0,
    InFeatures = 1,
    InSectorCount = 2,
    InStpsiu = 3,
}

/// Byte 2 of both ATA PASS-THROUGH CDBs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassThroughFlags {
    /// Seconds to wait before checking status, encoded 0..=3.
    pub off_line: u8,
    /// Return the ATA registers in the sense data even on success.
    pub ck_cond: bool,
    pub t_type: bool,
    /// Transfer is from the device to the host.
    pub t_dir: bool,
    /// Transfer length counts 512-byte blocks rather than bytes.
    pub byt_blok: bool,
    pub t_length: TransferLength,
}

impl PassThroughFlags {
    /// PIO data-in of whole sectors, registers returned.
    pub const READ_SECTORS: Self = Self {
        off_line: 0,
        ck_cond: true,
        t_type: false,
        t_dir: true,
        byt_blok: true,
        t_length: TransferLength::InSectorCount,
    };

    /// No data phase, registers returned.
    pub const NON_DATA: Self = Self {
        off_line: 0,
        ck_cond: true,
        t_type: false,
        t_dir: false,
        byt_blok: false,
        t_length: TransferLength::None,
    };

    pub fn to_byte(self) -> u8 {
        (self.off_line & 0x3) << 6
            | u8::from(self.ck_cond) << 5
            | u8::from(self.t_type) << 4
            | u8::from(self.t_dir) << 3
            | u8::from(self.byt_blok) << 2
            | self.t_length as u8
    }

    pub fn from_byte(byte: u8) -> Self {
        Self {
            off_line: byte >> 6,
            ck_cond: byte & 0x20 != 0,
            t_type: byte & 0x10 != 0,
            t_dir: byte & 0x08 != 0,
            byt_blok: byte & 0x04 != 0,
            t_length: match byte & 0x3 {
                0 => TransferLength::None,
                1 => TransferLength::InFeatures,
                2 => TransferLength::InSectorCount,
                _ => TransferLength::InStpsiu,
            },
        }
    }
}

/// INQUIRY (6-byte CDB).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InquiryCommand {
    pub operation_code: u8,
    /// Bit 0 is EVPD.
    pub flags: u8,
    pub page_code: u8,
    pub allocation_length: [u8; 2],
    pub control: u8,
}

const_assert_eq!(core::mem::size_of::<InquiryCommand>(), 6);

impl InquiryCommand {
    pub fn new(allocation_length: u16) -> Self {
        Self {
            operation_code: opcode::INQUIRY,
            flags: 0,
            page_code: 0,
            allocation_length: allocation_length.to_be_bytes(),
            control: 0,
        }
    }

    /// Vital product data page request.
    pub fn vpd(page_code: u8, allocation_length: u16) -> Self {
        Self {
            flags: 1,
            page_code,
            ..Self::new(allocation_length)
        }
    }

    pub fn allocation_length(&self) -> u16 {
        u16::from_be_bytes(self.allocation_length)
    }

    pub fn evpd(&self) -> bool {
        self.flags & 1 != 0
    }
}

impl Structure for InquiryCommand {
    const NAME: &'static str = "INQUIRY command";
}

/// SCSI peripheral device type, from byte 0 of the INQUIRY reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum PeripheralType {
    DirectAccessBlock,
    SequentialAccess,
    Cdrom,
    OpticalMemory,
    StorageArrayController,
    OpticalCard,
    Other(u8),
}

impl From<u8> for PeripheralType {
    fn from(code: u8) -> Self {
        match code & 0x1F {
            0x00 => Self::DirectAccessBlock,
            0x01 => Self::SequentialAccess,
            0x05 => Self::Cdrom,
            0x07 => Self::OpticalMemory,
            0x0C => Self::StorageArrayController,
            0x0F => Self::OpticalCard,
            other => Self::Other(other),
        }
    }
}

/// Standard INQUIRY data (SPC-4 table 137).
///
/// Devices may return as little as 36 bytes; decoding zero-extends
/// anything between that and the full 96.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct InquiryData {
    /// Qualifier in bits 7-5, device type in bits 4-0.
    pub peripheral: u8,
    /// Bit 7 is RMB (removable medium).
    pub removable: u8,
    pub version: u8,
    /// NORMACA bit 5, HISUP bit 4, response data format bits 3-0.
    pub response_format: u8,
    pub additional_length: u8,
    pub flags: [u8; 3],
    pub vendor_identification: [u8; 8],
    pub product_identification: [u8; 16],
    pub product_revision_level: [u8; 4],
    pub vendor_specific: [u8; 20],
    pub clocking: u8,
    pub _reserved1: u8,
    pub version_descriptors: [u8; 16],
    pub _reserved2: [u8; 22],
}

const_assert_eq!(core::mem::size_of::<InquiryData>(), 96);

impl Structure for InquiryData {
    const NAME: &'static str = "INQUIRY data";
    const MIN_SIZE: usize = 36;
}

impl InquiryData {
    pub fn new(vendor: &str, product: &str, revision: &str) -> Self {
        Self {
            response_format: 2,
            additional_length: 91,
            vendor_identification: pad_ascii(vendor),
            product_identification: pad_ascii(product),
            product_revision_level: pad_ascii(revision),
            ..Self::zeroed()
        }
    }

    pub fn peripheral_type(&self) -> PeripheralType {
        PeripheralType::from(self.peripheral)
    }

    pub fn peripheral_qualifier(&self) -> u8 {
        self.peripheral >> 5
    }

    pub fn is_removable(&self) -> bool {
        self.removable & 0x80 != 0
    }

    pub fn vendor(&self) -> String {
        trim_ascii(&self.vendor_identification)
    }

    pub fn product(&self) -> String {
        trim_ascii(&self.product_identification)
    }

    pub fn revision(&self) -> String {
        trim_ascii(&self.product_revision_level)
    }

    /// Many USB bridges and older disks put the serial number here.
    pub fn vendor_specific_text(&self) -> String {
        trim_ascii(&self.vendor_specific)
    }

    pub fn version_descriptor(&self, index: usize) -> Option<u16> {
        let chunk = self.version_descriptors.chunks_exact(2).nth(index)?;
        Some(u16::from_be_bytes([chunk[0], chunk[1]]))
    }
}

/// ATA PASS-THROUGH (12).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AtaPassThrough12 {
    pub operation_code: u8,
    /// Protocol in bits 4-1.
    pub protocol: u8,
    pub flags: u8,
    pub features: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
    pub command: u8,
    pub _reserved: u8,
    pub control: u8,
}

const_assert_eq!(core::mem::size_of::<AtaPassThrough12>(), 12);

impl Structure for AtaPassThrough12 {
    const NAME: &'static str = "ATA PASS-THROUGH(12)";
}

impl AtaPassThrough12 {
    pub fn new(protocol: AtaProtocol, command: u8, flags: PassThroughFlags) -> Self {
        Self {
            operation_code: opcode::ATA_PASS_THROUGH_12,
            protocol: (protocol as u8) << 1,
            flags: flags.to_byte(),
            command,
            ..Self::zeroed()
        }
    }

    pub fn with_features(mut self, features: u8) -> Self {
        self.features = features;
        self
    }

    pub fn with_sector_count(mut self, count: u8) -> Self {
        self.sector_count = count;
        self
    }

    /// Sets the 24 LBA bits this CDB can carry.
    pub fn with_lba(mut self, lba: u32) -> Self {
        let [low, mid, high, _] = lba.to_le_bytes();
        self.lba_low = low;
        self.lba_mid = mid;
        self.lba_high = high;
        self
    }

    pub fn protocol(&self) -> Option<AtaProtocol> {
        AtaProtocol::from_bits(self.protocol >> 1)
    }

    pub fn flags(&self) -> PassThroughFlags {
        PassThroughFlags::from_byte(self.flags)
    }

    pub fn lba(&self) -> u32 {
        u32::from_le_bytes([self.lba_low, self.lba_mid, self.lba_high, 0])
    }
}

/// ATA PASS-THROUGH (16).
///
/// Each 16-bit register pair is stored high byte first; the six LBA bytes
/// interleave the 48-bit "previous" (ext) bytes with the current ones.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AtaPassThrough16 {
    pub operation_code: u8,
    /// Multiple count in bits 7-5, protocol in bits 4-1, EXTEND in bit 0.
    pub protocol: u8,
    pub flags: u8,
    pub features: [u8; 2],
    pub sector_count: [u8; 2],
    pub lba_low_ext: u8,
    pub lba_low: u8,
    pub lba_mid_ext: u8,
    pub lba_mid: u8,
    pub lba_high_ext: u8,
    pub lba_high: u8,
    pub device: u8,
    pub command: u8,
    pub control: u8,
}

const_assert_eq!(core::mem::size_of::<AtaPassThrough16>(), 16);

impl Structure for AtaPassThrough16 {
    const NAME: &'static str = "ATA PASS-THROUGH(16)";
}

impl AtaPassThrough16 {
    pub fn new(protocol: AtaProtocol, command: u8, flags: PassThroughFlags) -> Self {
        Self {
            operation_code: opcode::ATA_PASS_THROUGH_16,
            protocol: (protocol as u8) << 1,
            flags: flags.to_byte(),
            command,
            ..Self::zeroed()
        }
    }

    /// IDENTIFY DEVICE, one 512-byte sector in.
    pub fn identify_device() -> Self {
        Self::new(
            AtaProtocol::PioDataIn,
            ata_command::IDENTIFY_DEVICE,
            PassThroughFlags::READ_SECTORS,
        )
        .with_sector_count(1)
    }

    /// IDENTIFY PACKET DEVICE, for ATAPI devices that reject IDENTIFY DEVICE.
    pub fn identify_packet_device() -> Self {
        Self {
            command: ata_command::IDENTIFY_PACKET_DEVICE,
            ..Self::identify_device()
        }
    }

    /// A SMART subcommand reading one sector (READ DATA, READ THRESHOLDS).
    pub fn smart_read(feature: u8) -> Self {
        Self::new(
            AtaProtocol::PioDataIn,
            ata_command::SMART,
            PassThroughFlags::READ_SECTORS,
        )
        .with_features(u16::from(feature))
        .with_sector_count(1)
        .with_lba(SMART_LBA_SIGNATURE)
    }

    pub fn smart_return_status() -> Self {
        Self::new(AtaProtocol::NonData, ata_command::SMART, PassThroughFlags::NON_DATA)
            .with_features(u16::from(smart_feature::RETURN_STATUS))
            .with_lba(SMART_LBA_SIGNATURE)
    }

    pub fn with_features(mut self, features: u16) -> Self {
        self.features = features.to_be_bytes();
        self
    }

    pub fn with_sector_count(mut self, count: u16) -> Self {
        self.sector_count = count.to_be_bytes();
        self
    }

    pub fn with_lba(mut self, lba: u64) -> Self {
        let bytes = lba.to_le_bytes();
        self.lba_low = bytes[0];
        self.lba_mid = bytes[1];
        self.lba_high = bytes[2];
        self.lba_low_ext = bytes[3];
        self.lba_mid_ext = bytes[4];
        self.lba_high_ext = bytes[5];
        self
    }

    pub fn protocol(&self) -> Option<AtaProtocol> {
        AtaProtocol::from_bits(self.protocol >> 1)
    }

    pub fn flags(&self) -> PassThroughFlags {
        PassThroughFlags::from_byte(self.flags)
    }

    pub fn features(&self) -> u16 {
        u16::from_be_bytes(self.features)
    }

    pub fn sector_count(&self) -> u16 {
        u16::from_be_bytes(self.sector_count)
    }

    pub fn lba(&self) -> u64 {
        u64::from_le_bytes([
            self.lba_low,
            self.lba_mid,
            self.lba_high,
            self.lba_low_ext,
            self.lba_mid_ext,
            self.lba_high_ext,
            0,
            0,
        ])
    }
}

/// Number of data bytes an ATA PASS-THROUGH CDB asks for, when it can be
/// worked out from the CDB alone.
pub(crate) fn ata_transfer_length(flags: PassThroughFlags, features: u16, count: u16) -> Option<usize> {
    let units = match flags.t_length {
        TransferLength::None => return Some(0),
        TransferLength::InFeatures => usize::from(features),
        TransferLength::InSectorCount => usize::from(count),
        TransferLength::InStpsiu => return None,
    };
    Some(if flags.byt_blok { units * 512 } else { units })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn inquiry_golden_vector() {
        let cmd = InquiryCommand::new(96);
        assert_eq!(cmd.encode(), &[0x12, 0x00, 0x00, 0x00, 0x60, 0x00]);
    }

    #[test]
    fn inquiry_max_allocation_length() {
        let cmd = InquiryCommand::new(u16::MAX);
        assert_eq!(cmd.encode(), &[0x12, 0x00, 0x00, 0xFF, 0xFF, 0x00]);
        assert_eq!(InquiryCommand::decode(cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn vpd_sets_evpd() {
        let cmd = InquiryCommand::vpd(0x80, 252);
        assert_eq!(cmd.encode(), &[0x12, 0x01, 0x80, 0x00, 0xFC, 0x00]);
        assert!(cmd.evpd());
    }

    #[test]
    fn identify_device_golden_vector() {
        assert_eq!(
            AtaPassThrough16::identify_device().encode(),
            &[0x85, 0x08, 0x2E, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0xEC, 0]
        );
    }

    #[test]
    fn smart_read_data_golden_vector() {
        assert_eq!(
            AtaPassThrough16::smart_read(smart_feature::READ_DATA).encode(),
            &[0x85, 0x08, 0x2E, 0x00, 0xD0, 0x00, 0x01, 0x00, 0x00, 0x00, 0x4F, 0x00, 0xC2, 0x00, 0xB0, 0x00]
        );
    }

    #[test]
    fn smart_return_status_golden_vector() {
        assert_eq!(
            AtaPassThrough16::smart_return_status().encode(),
            &[0x85, 0x06, 0x20, 0x00, 0xDA, 0x00, 0x00, 0x00, 0x00, 0x00, 0x4F, 0x00, 0xC2, 0x00, 0xB0, 0x00]
        );
    }

    #[test]
    fn pass_through_12_layout() {
        let cdb = AtaPassThrough12::new(
            AtaProtocol::PioDataIn,
            ata_command::SMART,
            PassThroughFlags::READ_SECTORS,
        )
        .with_features(smart_feature::READ_THRESHOLDS)
        .with_sector_count(1)
        .with_lba(0xC24F00);
        assert_eq!(
            cdb.encode(),
            &[0xA1, 0x08, 0x2E, 0xD1, 0x01, 0x00, 0x4F, 0xC2, 0x00, 0xB0, 0x00, 0x00]
        );
        assert_eq!(cdb.lba(), 0xC24F00);
    }

    #[test]
    fn flags_byte() {
        assert_eq!(PassThroughFlags::READ_SECTORS.to_byte(), 0x2E);
        assert_eq!(PassThroughFlags::from_byte(0x2E), PassThroughFlags::READ_SECTORS);
        assert_eq!(PassThroughFlags::NON_DATA.to_byte(), 0x20);
    }

    #[test]
    fn transfer_length() {
        let cdb = AtaPassThrough16::identify_device();
        assert_eq!(
            ata_transfer_length(cdb.flags(), cdb.features(), cdb.sector_count()),
            Some(512)
        );
        let cdb = AtaPassThrough16::smart_return_status();
        assert_eq!(
            ata_transfer_length(cdb.flags(), cdb.features(), cdb.sector_count()),
            Some(0)
        );
    }

    #[test]
    fn inquiry_data_short_reply() {
        let mut reply = [0u8; 36];
        reply[0] = 0x05;
        reply[1] = 0x80;
        reply[8..16].copy_from_slice(b"ACME    ");
        reply[16..32].copy_from_slice(b"Turbo Disk 9000 ");
        reply[32..36].copy_from_slice(b"1.02");
        let data = InquiryData::decode(&reply).unwrap();
        assert_eq!(data.vendor(), "ACME");
        assert_eq!(data.product(), "Turbo Disk 9000");
        assert_eq!(data.revision(), "1.02");
        assert_eq!(data.peripheral_type(), PeripheralType::Cdrom);
        assert!(data.is_removable());
        assert_eq!(data._reserved2, [0; 22]);
    }

    #[test]
    fn inquiry_data_too_short() {
        let err = InquiryData::decode(&[0u8; 35]).unwrap_err();
        assert_eq!(err.expected, 36);
        assert_eq!(err.actual, 35);
    }

    #[test]
    fn empty_strings_round_trip() {
        let data = InquiryData::new("", "", "");
        let decoded = InquiryData::decode(data.encode()).unwrap();
        assert_eq!(decoded.vendor(), "");
        assert_eq!(decoded, data);
    }

    proptest! {
        #[test]
        fn pass_through_16_fields_survive(features: u16, count: u16, lba in 0u64..(1 << 48), command: u8) {
            let cdb = AtaPassThrough16::new(AtaProtocol::Dma, command, PassThroughFlags::READ_SECTORS)
                .with_features(features)
                .with_sector_count(count)
                .with_lba(lba);
            let decoded = AtaPassThrough16::decode(cdb.encode()).unwrap();
            prop_assert_eq!(decoded.features(), features);
            prop_assert_eq!(decoded.sector_count(), count);
            prop_assert_eq!(decoded.lba(), lba);
            prop_assert_eq!(decoded.command, command);
            prop_assert_eq!(decoded.protocol(), Some(AtaProtocol::Dma));
        }

        #[test]
        fn inquiry_command_survives(len: u16) {
            let decoded = InquiryCommand::decode(InquiryCommand::new(len).encode()).unwrap();
            prop_assert_eq!(decoded.allocation_length(), len);
        }
    }
}
