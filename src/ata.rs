//! ATA reply structures carried back through ATA PASS-THROUGH.
//!
//! ATA data is a little-endian array of 16-bit words. String fields pack
//! two characters per word with the first character in the high byte, so
//! every word has to be byte-swapped before reading it as ASCII.

use crate::structure::Structure;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

/// Number of attribute slots in the SMART data and threshold tables.
pub const SMART_ATTRIBUTE_SLOTS: usize = 30;

fn word_swapped_string(bytes: &[u8]) -> String {
    bytes
        .chunks_exact(2)
        .flat_map(|chunk| [chunk[1], chunk[0]])
        .map(char::from)
        .collect::<String>()
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

fn word_swapped_field<const N: usize>(value: &str) -> [u8; N] {
    let mut field = [b' '; N];
    for (dst, src) in field.iter_mut().zip(value.bytes()) {
        *dst = src;
    }
    for pair in field.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    field
}

/// IDENTIFY DEVICE data (ACS-3 table 45), also returned by IDENTIFY PACKET
/// DEVICE with the ATAPI bit set in word 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct IdentifyDeviceData {
    pub general_configuration: [u8; 2],
    pub _words_1_9: [u8; 18],
    pub serial_number: [u8; 20],
    pub _words_20_22: [u8; 6],
    pub firmware_revision: [u8; 8],
    pub model_number: [u8; 40],
    pub _words_47_59: [u8; 26],
    pub lba28_sectors: [u8; 4],
    pub _words_62_81: [u8; 40],
    pub command_set_supported: [u8; 2],
    pub _words_83_84: [u8; 4],
    pub command_set_enabled: [u8; 2],
    pub _words_86_99: [u8; 28],
    pub lba48_sectors: [u8; 8],
    pub _words_104_216: [u8; 226],
    pub rotation_rate: [u8; 2],
    pub _words_218_254: [u8; 74],
    pub integrity: [u8; 2],
}

const_assert_eq!(core::mem::size_of::<IdentifyDeviceData>(), 512);

impl Structure for IdentifyDeviceData {
    const NAME: &'static str = "IDENTIFY DEVICE data";
}

impl IdentifyDeviceData {
    pub fn new(model: &str, serial: &str, firmware: &str) -> Self {
        Self {
            model_number: word_swapped_field(model),
            serial_number: word_swapped_field(serial),
            firmware_revision: word_swapped_field(firmware),
            ..Self::zeroed()
        }
    }

    pub fn model(&self) -> String {
        word_swapped_string(&self.model_number)
    }

    pub fn serial(&self) -> String {
        word_swapped_string(&self.serial_number)
    }

    pub fn firmware(&self) -> String {
        word_swapped_string(&self.firmware_revision)
    }

    /// Word 0 bit 15 marks an ATAPI (packet) device.
    pub fn is_atapi(&self) -> bool {
        u16::from_le_bytes(self.general_configuration) & 0x8000 != 0
    }

    pub fn smart_supported(&self) -> bool {
        u16::from_le_bytes(self.command_set_supported) & 0x0001 != 0
    }

    pub fn smart_enabled(&self) -> bool {
        u16::from_le_bytes(self.command_set_enabled) & 0x0001 != 0
    }

    /// User-addressable sectors, preferring the 48-bit count when present.
    pub fn sectors(&self) -> u64 {
        match u64::from_le_bytes(self.lba48_sectors) {
            0 => u64::from(u32::from_le_bytes(self.lba28_sectors)),
            n => n,
        }
    }

    /// Nominal media rotation rate: `Some(0)` for non-rotating media,
    /// `None` when the device does not report it.
    pub fn rotation_rate(&self) -> Option<u16> {
        match u16::from_le_bytes(self.rotation_rate) {
            0x0000 | 0xFFFF => None,
            0x0001 => Some(0),
            rpm => Some(rpm),
        }
    }
}

/// One 12-byte entry of the SMART READ DATA attribute table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AttributeRecord {
    pub id: u8,
    pub flags: [u8; 2],
    pub current: u8,
    pub worst: u8,
    pub raw: [u8; 6],
    pub _reserved: u8,
}

const_assert_eq!(core::mem::size_of::<AttributeRecord>(), 12);

impl AttributeRecord {
    pub fn new(id: u8, flags: u16, current: u8, worst: u8, raw: u64) -> Self {
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&raw.to_le_bytes()[..6]);
        Self {
            id,
            flags: flags.to_le_bytes(),
            current,
            worst,
            raw: bytes,
            _reserved: 0,
        }
    }

    pub fn flags(&self) -> u16 {
        u16::from_le_bytes(self.flags)
    }

    pub fn raw_value(&self) -> u64 {
        let r = self.raw;
        u64::from_le_bytes([r[0], r[1], r[2], r[3], r[4], r[5], 0, 0])
    }
}

/// SMART READ DATA reply (feature D0h).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SmartData {
    pub revision: [u8; 2],
    pub attributes: [AttributeRecord; SMART_ATTRIBUTE_SLOTS],
    pub offline_collection_status: u8,
    pub self_test_status: u8,
    pub offline_collection_time: [u8; 2],
    pub _vendor_specific_366: u8,
    pub offline_collection_capability: u8,
    pub smart_capability: [u8; 2],
    pub error_logging_capability: u8,
    pub _vendor_specific_371: u8,
    pub short_self_test_minutes: u8,
    pub extended_self_test_minutes: u8,
    pub conveyance_self_test_minutes: u8,
    pub extended_self_test_minutes_word: [u8; 2],
    pub _reserved: [u8; 9],
    pub _vendor_specific: [u8; 125],
    pub checksum: u8,
}

const_assert_eq!(core::mem::size_of::<SmartData>(), 512);

impl Structure for SmartData {
    const NAME: &'static str = "SMART data";
}

impl SmartData {
    pub fn revision(&self) -> u16 {
        u16::from_le_bytes(self.revision)
    }

    /// Self-test execution status, upper nibble.
    pub fn self_test_result(&self) -> u8 {
        self.self_test_status >> 4
    }

    pub fn checksum_valid(&self) -> bool {
        checksum_valid(self.encode())
    }

    /// Sets `checksum` so the table sums to zero.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = seal_byte(self.encode());
    }
}

/// One entry of the SMART READ THRESHOLDS table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ThresholdRecord {
    pub id: u8,
    pub threshold: u8,
    pub _reserved: [u8; 10],
}

const_assert_eq!(core::mem::size_of::<ThresholdRecord>(), 12);

/// SMART READ THRESHOLDS reply (feature D1h).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SmartThresholds {
    pub revision: [u8; 2],
    pub entries: [ThresholdRecord; SMART_ATTRIBUTE_SLOTS],
    pub _reserved: [u8; 149],
    pub checksum: u8,
}

const_assert_eq!(core::mem::size_of::<SmartThresholds>(), 512);

impl Structure for SmartThresholds {
    const NAME: &'static str = "SMART thresholds";
}

impl SmartThresholds {
    pub fn checksum_valid(&self) -> bool {
        checksum_valid(self.encode())
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = seal_byte(self.encode());
    }

    pub fn get(&self, id: u8) -> Option<u8> {
        if id == 0 {
            return None;
        }
        self.entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.threshold)
    }
}

fn checksum_valid(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

fn seal_byte(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)).wrapping_neg()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_IDENTIFY_RESPONSE: [u8; 94] = [
        0x40, 0x00, 0xFF, 0x3F, 0x37, 0xC8, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x3F, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x33, 0x51, 0x21, 0x5A, 0x42, 0x4E, 0x4B, 0x30, 0x32, 0x33,
        0x33, 0x35, 0x32, 0x38, 0x20, 0x54, 0x20, 0x20, 0x20, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x56, 0x52, 0x30, 0x54, 0x42, 0x31, 0x51, 0x36, 0x61, 0x53, 0x73, 0x6D, 0x6E, 0x75,
        0x20, 0x67, 0x53, 0x53, 0x20, 0x44, 0x36, 0x38, 0x20, 0x30, 0x56, 0x45, 0x20, 0x4F, 0x54,
        0x31, 0x20, 0x42, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20, 0x20,
        0x20, 0x20, 0x20, 0x20,
    ];

    #[test]
    fn identify_strings_are_word_swapped() {
        let mut reply = [0u8; 512];
        reply[..VALID_IDENTIFY_RESPONSE.len()].copy_from_slice(&VALID_IDENTIFY_RESPONSE);
        let identify = IdentifyDeviceData::decode(&reply).unwrap();
        assert_eq!(identify.model(), "Samsung SSD 860 EVO 1TB");
        assert_eq!(identify.serial(), "Q3Z!NB0K325382T");
        assert_eq!(identify.firmware(), "RVT01B6Q");
        assert!(!identify.is_atapi());
    }

    #[test]
    fn identify_rejects_short_reply() {
        let err = IdentifyDeviceData::decode(&VALID_IDENTIFY_RESPONSE).unwrap_err();
        assert_eq!(err.expected, 512);
        assert_eq!(err.actual, 94);
    }

    #[test]
    fn identify_field_offsets() {
        let mut reply = [0u8; 512];
        reply[1] = 0x80;
        reply[120..124].copy_from_slice(&1_000_000u32.to_le_bytes());
        reply[164] = 0x01;
        reply[170] = 0x01;
        reply[434..436].copy_from_slice(&7200u16.to_le_bytes());
        let identify = IdentifyDeviceData::decode(&reply).unwrap();
        assert!(identify.is_atapi());
        assert_eq!(identify.sectors(), 1_000_000);
        assert!(identify.smart_supported());
        assert!(identify.smart_enabled());
        assert_eq!(identify.rotation_rate(), Some(7200));

        reply[200..208].copy_from_slice(&1_953_525_168u64.to_le_bytes());
        let identify = IdentifyDeviceData::decode(&reply).unwrap();
        assert_eq!(identify.sectors(), 1_953_525_168);
    }

    #[test]
    fn identify_new_matches_decode() {
        let identify = IdentifyDeviceData::new("WDC WD40EFRX", "WD-1234", "82.00A82");
        let decoded = IdentifyDeviceData::decode(identify.encode()).unwrap();
        assert_eq!(decoded.model(), "WDC WD40EFRX");
        assert_eq!(decoded.serial(), "WD-1234");
        assert_eq!(decoded.firmware(), "82.00A82");
    }

    #[test]
    fn smart_table_offsets() {
        let mut data = SmartData::zeroed();
        data.attributes[0] = AttributeRecord::new(0x05, 0x0033, 100, 99, 0x0102_0304_0506);
        data.self_test_status = 0x40;
        let bytes = data.encode();
        assert_eq!(&bytes[2..14], &[0x05, 0x33, 0x00, 100, 99, 6, 5, 4, 3, 2, 1, 0]);
        assert_eq!(bytes[363], 0x40);
        assert_eq!(data.attributes[0].raw_value(), 0x0102_0304_0506);
        assert_eq!(data.self_test_result(), 4);
    }

    #[test]
    fn checksum() {
        let mut data = SmartData::zeroed();
        data.attributes[0] = AttributeRecord::new(0xC2, 0x0022, 36, 52, 36);
        assert!(!data.checksum_valid());
        data.seal();
        assert!(data.checksum_valid());

        let mut thresholds = SmartThresholds::zeroed();
        thresholds.entries[0].id = 0x05;
        thresholds.entries[0].threshold = 10;
        thresholds.seal();
        assert!(thresholds.checksum_valid());
        assert_eq!(thresholds.get(0x05), Some(10));
        assert_eq!(thresholds.get(0x06), None);
        assert_eq!(thresholds.get(0x00), None);
    }
}
