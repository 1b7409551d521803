//! Normalizing S.M.A.R.T. data.
//!
//! ATA drives report a table of vendor-defined attributes with per-attribute
//! thresholds. NVMe drives report a fixed health log with a critical warning
//! bitmap and no thresholds, so the two decode into different shapes.

use crate::ata::{SmartData, SmartThresholds};
use crate::device::DeviceKind;
use crate::error::MalformedResponse;
use crate::nvme::{CriticalWarning, SmartLog};
use crate::sense::AtaStatusReturn;
use crate::structure::Structure;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

/// A hint for the unit of an attribute's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Unknown,
    Celsius,
    Milliseconds,
    Hours,
    Count,
}

use Unit::{Celsius, Count, Hours, Milliseconds, Unknown};

/// Commonly agreed meanings of ATA attribute ids. Vendors do deviate.
static ATTRIBUTES: &[(u8, &str, Unit)] = &[
    (0x01, "read_error_rate", Unknown),
    (0x02, "throughput_performance", Unknown),
    (0x03, "spin_up_time", Milliseconds),
    (0x04, "start_stop_count", Count),
    (0x05, "reallocated_sectors_count", Count),
    (0x06, "read_channel_margin", Unknown),
    (0x07, "seek_error_rate", Unknown),
    (0x08, "seek_time_performance", Unknown),
    // Some vendors count minutes or seconds here.
    (0x09, "power_on_hours", Hours),
    (0x0A, "spin_retry_count", Count),
    (0x0B, "recalibration_retries", Count),
    (0x0C, "power_cycle_count", Count),
    (0x0D, "soft_read_error_rate", Count),
    (0x16, "current_helium_level", Unknown),
    (0xAA, "available_reserved_space", Unknown),
    (0xAB, "ssd_program_fail_count", Count),
    (0xAC, "ssd_erase_fail_count", Count),
    (0xAD, "ssd_wear_leveling_count", Count),
    (0xAE, "power_loss_count", Count),
    (0xB0, "erase_fail_count", Count),
    (0xB1, "wear_range_delta", Unknown),
    (0xB2, "used_reserved_block_count", Count),
    (0xB3, "used_reserved_block_count_total", Count),
    (0xB4, "unused_reserved_block_count_total", Count),
    (0xB5, "program_fail_count_total", Count),
    (0xB6, "erase_fail_count", Count),
    (0xB7, "runtime_bad_block", Count),
    (0xB8, "parity_error_count", Count),
    (0xB9, "head_stability", Unknown),
    (0xBA, "induced_op_vibration_detection", Unknown),
    (0xBB, "reported_uncorrectable_errors", Count),
    (0xBC, "commands_timed_out", Count),
    (0xBD, "high_fly_writes", Count),
    (0xBE, "temperature_difference", Celsius),
    (0xBF, "gsense_error_rate", Count),
    (0xC0, "unsafe_shutdown_count", Count),
    (0xC1, "load_cycle_count", Count),
    (0xC2, "temperature_absolute", Celsius),
    (0xC3, "hardware_ecc_recovered", Unknown),
    (0xC4, "reallocation_event_count", Count),
    (0xC5, "current_pending_sector_count", Count),
    (0xC6, "uncorrectable_sector_count", Count),
    (0xC7, "ultra_dma_crc_error_count", Count),
    (0xC8, "write_error_rate", Count),
    (0xC9, "soft_read_error_rate", Count),
    (0xCA, "data_address_marks", Count),
    (0xCB, "run_out_cancel", Count),
    (0xCC, "soft_ecc_correction", Count),
    (0xCD, "thermal_asperity_rate", Count),
    (0xCE, "flying_height", Unknown),
    (0xCF, "spin_height_current", Unknown),
    (0xD0, "spin_buzz", Count),
    (0xD1, "offline_seek_performance", Unknown),
    (0xD2, "vibration_during_write", Unknown),
    (0xD3, "vibration_during_write", Unknown),
    (0xD4, "shock_during_write", Unknown),
    (0xDC, "disk_shift", Unknown),
    (0xDD, "gsense_error_rate", Count),
    (0xDE, "loaded_hours", Hours),
    (0xDF, "load_unload_retry_count", Count),
    (0xE0, "load_friction", Unknown),
    (0xE1, "load_unload_cycle_count", Count),
    (0xE2, "load_in_time", Unknown),
    (0xE3, "torque_amplification_count", Count),
    (0xE4, "power_off_retract_cycle", Count),
    (0xE6, "thrashing", Unknown),
    (0xE7, "life_left", Unknown),
    (0xE8, "endurance_remaining", Unknown),
    (0xE9, "media_wearout_indicator", Unknown),
    (0xF0, "head_flying_hours", Hours),
    (0xF1, "total_lbas_written", Count),
    (0xF2, "total_lbas_read", Count),
    (0xF3, "total_lbas_written_ex", Unknown),
    (0xF4, "total_lbas_read_ex", Unknown),
    (0xF9, "nand_writes", Unknown),
    (0xFA, "read_error_retry_rate", Count),
    (0xFB, "minimum_spares_remaining", Unknown),
    (0xFC, "newly_added_bad_flash_block", Unknown),
    (0xFE, "free_fall_events", Count),
];

/// Name and unit for a known attribute id.
pub fn attribute_info(id: u8) -> Option<(&'static str, Unit)> {
    ATTRIBUTES
        .iter()
        .find(|(known, _, _)| *known == id)
        .map(|(_, name, unit)| (*name, *unit))
}

/// Attribute meanings specific to a family of drives, layered over the
/// common table for drives of `kind` whose model matches `model`.
#[derive(Debug)]
pub struct DriveEntry {
    pub name: &'static str,
    pub kind: DeviceKind,
    /// Regular expression matched against the start of the model string.
    pub model: &'static str,
    pub attributes: &'static [(u8, &'static str, Unit)],
}

impl DriveEntry {
    pub fn matches(&self, kind: DeviceKind, model: &str) -> bool {
        self.kind == kind
            && Regex::new(&format!("^(?:{})", self.model)).is_ok_and(|re| re.is_match(model))
    }
}

static DRIVE_DATABASE: &[DriveEntry] = &[
    // Seen on the 850 EVO 2TB and 860 EVO 1TB.
    DriveEntry {
        name: "Samsung SSDs",
        kind: DeviceKind::ScsiAta,
        model: r"Samsung SSD 8[56]0 EVO [12]TB",
        attributes: &[(0xEB, "por_recovery_count", Count)],
    },
];

/// Database entries that apply to a drive, in the order they are layered.
pub fn drive_entries(kind: DeviceKind, model: &str) -> impl Iterator<Item = &'static DriveEntry> + '_ {
    DRIVE_DATABASE
        .iter()
        .filter(move |entry| entry.matches(kind, model))
}

/// Renames attributes the matching drive entries know better. Later entries
/// win over earlier ones.
pub fn apply_drive_entries(attributes: &mut [SmartAttribute], kind: DeviceKind, model: &str) {
    for entry in drive_entries(kind, model) {
        for attribute in attributes.iter_mut() {
            if let Some((_, name, unit)) = entry.attributes.iter().find(|(id, _, _)| *id == attribute.id) {
                attribute.name = name.to_string();
                attribute.unit = *unit;
            }
        }
    }
}

pub const TEMPERATURE_ABSOLUTE: u8 = 0xC2;
pub const TEMPERATURE_DIFFERENCE: u8 = 0xBE;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmartAttribute {
    pub id: u8,
    pub name: String,
    pub unit: Unit,
    pub flags: u16,
    pub current: u8,
    pub worst: u8,
    pub threshold: Option<u8>,
    pub raw: [u8; 6],
    /// `raw` as a little-endian integer; vendors may pack several values.
    pub raw_value: u64,
    pub exceeded: bool,
}

impl SmartAttribute {
    /// Flag bit 0: a threshold crossing predicts imminent failure.
    pub fn is_prefailure(&self) -> bool {
        self.flags & 0x0001 != 0
    }

    pub fn set_threshold(&mut self, threshold: Option<u8>) {
        self.threshold = threshold;
        self.exceeded = threshold.is_some_and(|t| self.current <= t);
    }
}

/// Decodes a 512-byte SMART READ DATA reply into its attributes in table
/// order. Walking stops at the first slot with id 0.
pub fn decode_ata_smart(bytes: &[u8]) -> Result<Vec<SmartAttribute>, MalformedResponse> {
    let data = SmartData::decode(bytes)?;
    Ok(data
        .attributes
        .iter()
        .take_while(|record| record.id != 0)
        .map(|record| {
            let (name, unit) = match attribute_info(record.id) {
                Some((name, unit)) => (name.to_string(), unit),
                None => (format!("Unknown ({})", record.id), Unit::Unknown),
            };
            SmartAttribute {
                id: record.id,
                name,
                unit,
                flags: record.flags(),
                current: record.current,
                worst: record.worst,
                threshold: None,
                raw: record.raw,
                raw_value: record.raw_value(),
                exceeded: false,
            }
        })
        .collect())
}

pub fn decode_ata_thresholds(bytes: &[u8]) -> Result<SmartThresholds, MalformedResponse> {
    SmartThresholds::decode(bytes)
}

/// Merges thresholds into `attributes` and recomputes `exceeded`.
pub fn apply_thresholds(attributes: &mut [SmartAttribute], thresholds: &SmartThresholds) {
    for attribute in attributes {
        attribute.set_threshold(thresholds.get(attribute.id));
    }
}

/// Drive temperature in degrees Celsius, from attribute C2h if present and
/// otherwise from BEh.
pub fn ata_temperature(attributes: &[SmartAttribute]) -> Option<i32> {
    let find = |id| attributes.iter().find(|a| a.id == id);
    if let Some(absolute) = find(TEMPERATURE_ABSOLUTE) {
        return Some(i32::from(absolute.raw[0]));
    }
    find(TEMPERATURE_DIFFERENCE).map(|a| 100 - i32::from(a.current))
}

/// Overall verdict of SMART RETURN STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SmartStatus {
    Passed,
    ThresholdExceeded,
}

impl SmartStatus {
    /// Reads the verdict from the LBA mid/high output registers.
    pub fn from_registers(registers: &AtaStatusReturn) -> Option<Self> {
        match (registers.lba_mid, registers.lba_high) {
            (0x4F, 0xC2) => Some(SmartStatus::Passed),
            (0xF4, 0x2C) => Some(SmartStatus::ThresholdExceeded),
            _ => None,
        }
    }
}

const SENSOR_NAMES: [&str; 8] = [
    "temperature_sensor_1",
    "temperature_sensor_2",
    "temperature_sensor_3",
    "temperature_sensor_4",
    "temperature_sensor_5",
    "temperature_sensor_6",
    "temperature_sensor_7",
    "temperature_sensor_8",
];

/// Named metrics of the NVMe SMART / Health log. Temperatures are Kelvin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NvmeHealth {
    pub critical_warning: u8,
    pub metrics: BTreeMap<&'static str, u128>,
}

impl NvmeHealth {
    pub fn warnings(&self) -> CriticalWarning {
        CriticalWarning::from_bits_retain(self.critical_warning)
    }

    /// True when the controller has raised any critical warning.
    pub fn exceeded(&self) -> bool {
        self.critical_warning != 0
    }

    pub fn get(&self, name: &str) -> Option<u128> {
        self.metrics.get(name).copied()
    }

    pub fn temperature_celsius(&self) -> Option<i32> {
        match self.get("temperature")? {
            0 => None,
            kelvin => Some(kelvin as i32 - 273),
        }
    }
}

pub fn decode_nvme_health_log(bytes: &[u8]) -> Result<NvmeHealth, MalformedResponse> {
    let log = SmartLog::decode(bytes)?;
    let wide = u128::from_le_bytes;
    let mut metrics = BTreeMap::from([
        ("critical_warning", u128::from(log.critical_warning)),
        ("temperature", u128::from(log.temperature())),
        ("available_spare", u128::from(log.available_spare)),
        (
            "available_spare_threshold",
            u128::from(log.available_spare_threshold),
        ),
        ("percentage_used", u128::from(log.percentage_used)),
        (
            "endurance_group_warning",
            u128::from(log.endurance_group_warning),
        ),
        ("data_units_read", wide(log.data_units_read)),
        ("data_units_written", wide(log.data_units_written)),
        ("host_read_commands", wide(log.host_read_commands)),
        ("host_write_commands", wide(log.host_write_commands)),
        ("controller_busy_time", wide(log.controller_busy_time)),
        ("power_cycles", wide(log.power_cycles)),
        ("power_on_hours", wide(log.power_on_hours)),
        ("unsafe_shutdowns", wide(log.unsafe_shutdowns)),
        ("media_errors", wide(log.media_errors)),
        ("error_log_entries", wide(log.error_log_entries)),
        (
            "warning_temperature_time",
            u128::from(u32::from_le_bytes(log.warning_temperature_time)),
        ),
        (
            "critical_temperature_time",
            u128::from(u32::from_le_bytes(log.critical_temperature_time)),
        ),
    ]);
    for (index, kelvin) in log.temperature_sensors() {
        metrics.insert(SENSOR_NAMES[index - 1], u128::from(kelvin));
    }
    Ok(NvmeHealth {
        critical_warning: log.critical_warning,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ata::{AttributeRecord, ThresholdRecord};
    use bytemuck::Zeroable;

    fn table(records: &[AttributeRecord]) -> Vec<u8> {
        let mut data = SmartData::zeroed();
        data.attributes[..records.len()].copy_from_slice(records);
        data.seal();
        data.encode().to_vec()
    }

    #[test]
    fn stops_at_zero_id() {
        let mut raw = table(&[
            AttributeRecord::new(0x01, 0x000F, 117, 99, 0x0A2B_3C4D),
            AttributeRecord::new(0x09, 0x0032, 92, 92, 7321),
            AttributeRecord::new(0xC2, 0x0022, 36, 52, 0x0028_0000_0024),
        ]);
        // garbage after the terminator must be ignored
        raw[2 + 4 * 12] = 0x05;
        let attributes = decode_ata_smart(&raw).unwrap();
        assert_eq!(attributes.len(), 3);
        assert_eq!(
            attributes.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![0x01, 0x09, 0xC2]
        );
        assert_eq!(attributes[1].name, "power_on_hours");
        assert_eq!(attributes[1].unit, Unit::Hours);
        assert_eq!(attributes[1].raw_value, 7321);
        assert!(attributes[0].is_prefailure());
        assert!(attributes.iter().all(|a| !a.exceeded && a.threshold.is_none()));
    }

    #[test]
    fn full_table_without_terminator() {
        let records: Vec<_> = (1..=30u8)
            .map(|id| AttributeRecord::new(id, 0, 100, 100, 0))
            .collect();
        assert_eq!(decode_ata_smart(&table(&records)).unwrap().len(), 30);
    }

    #[test]
    fn unknown_ids_are_kept() {
        let attributes =
            decode_ata_smart(&table(&[AttributeRecord::new(0x99, 0, 1, 1, 0)])).unwrap();
        assert_eq!(attributes[0].name, "Unknown (153)");
        assert_eq!(attributes[0].unit, Unit::Unknown);
    }

    #[test]
    fn drive_entries_rename_vendor_attributes() {
        let records = table(&[
            AttributeRecord::new(0x09, 0x0032, 99, 99, 1234),
            AttributeRecord::new(0xEB, 0x0032, 99, 99, 17),
        ]);

        let mut evo = decode_ata_smart(&records).unwrap();
        apply_drive_entries(&mut evo, DeviceKind::ScsiAta, "Samsung SSD 860 EVO 1TB");
        assert_eq!(evo[0].name, "power_on_hours");
        assert_eq!(evo[1].name, "por_recovery_count");
        assert_eq!(evo[1].unit, Unit::Count);

        let mut other = decode_ata_smart(&records).unwrap();
        apply_drive_entries(&mut other, DeviceKind::ScsiAta, "Samsung SSD 860 EVO 500GB");
        assert_eq!(other[1].name, "Unknown (235)");

        assert_eq!(drive_entries(DeviceKind::ScsiAta, "Samsung SSD 850 EVO 2TB").count(), 1);
        assert_eq!(drive_entries(DeviceKind::Nvme, "Samsung SSD 850 EVO 2TB").count(), 0);
        assert_eq!(drive_entries(DeviceKind::ScsiAta, "ACME Samsung SSD 850 EVO 2TB").count(), 0);
    }

    #[test]
    fn short_table_is_malformed() {
        let err = decode_ata_smart(&[0u8; 511]).unwrap_err();
        assert_eq!((err.expected, err.actual), (512, 511));
    }

    #[test]
    fn thresholds_decide_exceeded() {
        let mut attributes = decode_ata_smart(&table(&[
            AttributeRecord::new(0x05, 0x0033, 100, 100, 0),
            AttributeRecord::new(0x0A, 0x0013, 97, 97, 0),
            AttributeRecord::new(0xBB, 0x0032, 36, 36, 0),
            AttributeRecord::new(0xC7, 0x003E, 200, 200, 0),
        ]))
        .unwrap();
        let mut thresholds = SmartThresholds::zeroed();
        thresholds.entries[0] = ThresholdRecord {
            id: 0x05,
            threshold: 10,
            _reserved: [0; 10],
        };
        thresholds.entries[1] = ThresholdRecord {
            id: 0x0A,
            threshold: 97,
            _reserved: [0; 10],
        };
        thresholds.entries[2] = ThresholdRecord {
            id: 0xBB,
            threshold: 40,
            _reserved: [0; 10],
        };
        thresholds.seal();
        let decoded = decode_ata_thresholds(thresholds.encode()).unwrap();
        apply_thresholds(&mut attributes, &decoded);

        let exceeded: Vec<_> = attributes.iter().map(|a| (a.id, a.exceeded)).collect();
        assert_eq!(
            exceeded,
            vec![(0x05, false), (0x0A, true), (0xBB, true), (0xC7, false)]
        );
        assert_eq!(attributes[3].threshold, None);
    }

    #[test]
    fn temperature_prefers_absolute() {
        let attributes = decode_ata_smart(&table(&[
            AttributeRecord::new(0xBE, 0, 64, 50, 0),
            AttributeRecord::new(0xC2, 0, 36, 52, 0x0028_0000_0024),
        ]))
        .unwrap();
        assert_eq!(ata_temperature(&attributes), Some(36));
        assert_eq!(ata_temperature(&attributes[..1]), Some(36));
        // The table itself keeps the drive's normalized bytes.
        assert_eq!((attributes[0].current, attributes[0].worst), (64, 50));
        assert_eq!(ata_temperature(&[]), None);
    }

    #[test]
    fn smart_status_registers() {
        let mut regs = AtaStatusReturn {
            extend: false,
            error: 0,
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0x4F,
            lba_high: 0xC2,
            device: 0,
            status: 0x50,
        };
        assert_eq!(SmartStatus::from_registers(&regs), Some(SmartStatus::Passed));
        regs.lba_mid = 0xF4;
        regs.lba_high = 0x2C;
        assert_eq!(
            SmartStatus::from_registers(&regs),
            Some(SmartStatus::ThresholdExceeded)
        );
        regs.lba_mid = 0;
        assert_eq!(SmartStatus::from_registers(&regs), None);
    }

    #[test]
    fn nvme_health_metrics() {
        let mut raw = [0u8; 512];
        raw[1..3].copy_from_slice(&318u16.to_le_bytes());
        raw[3] = 100;
        raw[5] = 3;
        raw[112..128].copy_from_slice(&1_234u128.to_le_bytes());
        raw[128..144].copy_from_slice(&8_760u128.to_le_bytes());
        raw[160..176].copy_from_slice(&2u128.to_le_bytes());
        raw[200..202].copy_from_slice(&320u16.to_le_bytes());
        let health = decode_nvme_health_log(&raw).unwrap();
        assert_eq!(health.get("temperature"), Some(318));
        assert_eq!(health.temperature_celsius(), Some(45));
        assert_eq!(health.get("power_on_hours"), Some(8_760));
        assert_eq!(health.get("power_cycles"), Some(1_234));
        assert_eq!(health.get("media_errors"), Some(2));
        assert_eq!(health.get("percentage_used"), Some(3));
        assert_eq!(health.get("temperature_sensor_1"), Some(320));
        assert_eq!(health.get("temperature_sensor_2"), None);
        assert!(!health.exceeded());
    }

    #[test]
    fn nvme_exceeded_follows_critical_warning() {
        let mut raw = [0u8; 512];
        raw[0] = 0x04;
        // a worn-out percentage alone does not count
        raw[5] = 255;
        let health = decode_nvme_health_log(&raw).unwrap();
        assert!(health.exceeded());
        assert_eq!(health.warnings(), CriticalWarning::RELIABILITY_DEGRADED);
        assert_eq!(health.temperature_celsius(), None);
    }
}
