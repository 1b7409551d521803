//! Turning SCSI sense data and NVMe completion status into a [`Diagnostic`].
//!
//! Classification of SCSI sense only looks at the sense key; ASC/ASCQ
//! refine the human-readable cause.

use serde::Serialize;
use std::fmt;

/// Size of the sense buffer handed to every transport.
pub const SENSE_BUFFER_LEN: usize = 32;

/// Coarse outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Success,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    AbortedCommand,
    VendorSpecific,
    Unknown,
}

impl Category {
    /// Everything except SUCCESS and RECOVERED_ERROR counts as a failure.
    pub fn is_failure(self) -> bool {
        !matches!(self, Category::Success | Category::RecoveredError)
    }

    pub fn severity(self) -> Severity {
        match self {
            Category::Success => Severity::Info,
            Category::RecoveredError | Category::UnitAttention => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Category for a SCSI sense key.
    pub fn from_sense_key(key: u8) -> Self {
        match key & 0x0F {
            0x0 | 0xF => Category::Success,
            0x1 => Category::RecoveredError,
            0x2 => Category::NotReady,
            0x3 => Category::MediumError,
            0x4 => Category::HardwareError,
            0x5 => Category::IllegalRequest,
            0x6 => Category::UnitAttention,
            0x9 => Category::VendorSpecific,
            0xA | 0xB => Category::AbortedCommand,
            _ => Category::Unknown,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Success => "success",
            Category::RecoveredError => "recovered error",
            Category::NotReady => "not ready",
            Category::MediumError => "medium error",
            Category::HardwareError => "hardware error",
            Category::IllegalRequest => "illegal request",
            Category::UnitAttention => "unit attention",
            Category::AbortedCommand => "aborted command",
            Category::VendorSpecific => "vendor specific",
            Category::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Category,
    pub cause: String,
}

impl Diagnostic {
    pub fn new(category: Category, cause: impl Into<String>) -> Self {
        Self {
            severity: category.severity(),
            category,
            cause: cause.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(Category::Success, "command completed")
    }

    pub fn is_failure(&self) -> bool {
        self.category.is_failure()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.cause)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SenseFormat {
    Fixed,
    Descriptor,
}

/// The decoded header of a sense buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseInfo {
    pub format: SenseFormat,
    /// `false` for deferred errors (response codes 71h/73h).
    pub current: bool,
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

/// A sense buffer as returned by the device, kept verbatim for display.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    bytes: [u8; SENSE_BUFFER_LEN],
    len: u8,
}

impl Default for SenseData {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SenseData")
            .field(&hex::encode(self.as_bytes()))
            .finish()
    }
}

impl SenseData {
    pub const fn empty() -> Self {
        Self {
            bytes: [0; SENSE_BUFFER_LEN],
            len: 0,
        }
    }

    /// Copies at most [`SENSE_BUFFER_LEN`] bytes of `bytes`.
    pub fn new(bytes: &[u8]) -> Self {
        let len = bytes.len().min(SENSE_BUFFER_LEN);
        let mut sense = Self::empty();
        sense.bytes[..len].copy_from_slice(&bytes[..len]);
        sense.len = len as u8;
        sense
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// True when the device wrote nothing, or only zeros.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    pub fn parse(&self) -> Option<SenseInfo> {
        let data = self.as_bytes();
        let (format, current) = match data.first()? & 0x7F {
            0x70 => (SenseFormat::Fixed, true),
            0x71 => (SenseFormat::Fixed, false),
            0x72 => (SenseFormat::Descriptor, true),
            0x73 => (SenseFormat::Descriptor, false),
            _ => return None,
        };
        let at = |i: usize| data.get(i).copied().unwrap_or(0);
        let (key, asc, ascq) = match format {
            SenseFormat::Fixed => {
                if data.len() < 3 {
                    return None;
                }
                (at(2) & 0x0F, at(12), at(13))
            }
            SenseFormat::Descriptor => {
                if data.len() < 2 {
                    return None;
                }
                (at(1) & 0x0F, at(2), at(3))
            }
        };
        Some(SenseInfo {
            format,
            current,
            key,
            asc,
            ascq,
        })
    }

    /// Walks the descriptors of descriptor-format sense.
    pub fn descriptors(&self) -> Descriptors<'_> {
        let data = self.as_bytes();
        let body = match self.parse() {
            Some(SenseInfo {
                format: SenseFormat::Descriptor,
                ..
            }) if data.len() > 8 => {
                let additional = usize::from(data[7]);
                &data[8..data.len().min(8 + additional)]
            }
            _ => &[],
        };
        Descriptors { rest: body }
    }

    /// ATA registers returned by an ATA PASS-THROUGH command with CK_COND
    /// set, from either sense format.
    pub fn ata_status_return(&self) -> Option<AtaStatusReturn> {
        let info = self.parse()?;
        match info.format {
            SenseFormat::Descriptor => self
                .descriptors()
                .find(|d| d.code == ATA_STATUS_RETURN && d.data.len() >= 14)
                .map(|d| AtaStatusReturn {
                    extend: d.data[2] & 1 != 0,
                    error: d.data[3],
                    sector_count: d.data[5],
                    lba_low: d.data[7],
                    lba_mid: d.data[9],
                    lba_high: d.data[11],
                    device: d.data[12],
                    status: d.data[13],
                }),
            SenseFormat::Fixed => {
                let data = self.as_bytes();
                if data.len() < 12 {
                    return None;
                }
                Some(AtaStatusReturn {
                    extend: data[8] & 0x80 != 0,
                    error: data[3],
                    status: data[4],
                    device: data[5],
                    sector_count: data[6],
                    lba_low: data[9],
                    lba_mid: data[10],
                    lba_high: data[11],
                })
            }
        }
    }
}

/// Descriptor type of the SAT ATA Status Return descriptor.
pub const ATA_STATUS_RETURN: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    pub code: u8,
    /// The whole descriptor, header included.
    pub data: &'a [u8],
}

pub struct Descriptors<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < 2 {
            return None;
        }
        let len = (2 + usize::from(self.rest[1])).min(self.rest.len());
        let (data, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Descriptor {
            code: data[0],
            data,
        })
    }
}

/// Low 8 bits of the ATA output registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaStatusReturn {
    pub extend: bool,
    pub error: u8,
    pub sector_count: u8,
    pub lba_low: u8,
    pub lba_mid: u8,
    pub lba_high: u8,
    pub device: u8,
    pub status: u8,
}

fn sense_key_name(key: u8) -> &'static str {
    match key & 0x0F {
        0x0 => "NO SENSE",
        0x1 => "RECOVERED ERROR",
        0x2 => "NOT READY",
        0x3 => "MEDIUM ERROR",
        0x4 => "HARDWARE ERROR",
        0x5 => "ILLEGAL REQUEST",
        0x6 => "UNIT ATTENTION",
        0x7 => "DATA PROTECT",
        0x8 => "BLANK CHECK",
        0x9 => "VENDOR SPECIFIC",
        0xA => "COPY ABORTED",
        0xB => "ABORTED COMMAND",
        0xD => "VOLUME OVERFLOW",
        0xE => "MISCOMPARE",
        0xF => "COMPLETED",
        _ => "RESERVED",
    }
}

fn additional_sense(asc: u8, ascq: u8) -> Option<&'static str> {
    Some(match (asc, ascq) {
        (0x00, 0x00) => "no additional sense information",
        (0x00, 0x1D) => "ATA pass-through information available",
        (0x04, 0x00) => "logical unit not ready, cause not reportable",
        (0x04, 0x01) => "logical unit is in process of becoming ready",
        (0x04, 0x02) => "logical unit not ready, initializing command required",
        (0x04, 0x03) => "logical unit not ready, manual intervention required",
        (0x04, 0x04) => "logical unit not ready, format in progress",
        (0x04, 0x09) => "logical unit not ready, self-test in progress",
        (0x0B, 0x01) => "warning, specified temperature exceeded",
        (0x0C, 0x00) => "write error",
        (0x11, 0x00) => "unrecovered read error",
        (0x20, 0x00) => "invalid command operation code",
        (0x21, 0x00) => "logical block address out of range",
        (0x24, 0x00) => "invalid field in CDB",
        (0x25, 0x00) => "logical unit not supported",
        (0x26, 0x00) => "invalid field in parameter list",
        (0x29, 0x00) => "power on, reset, or bus device reset occurred",
        (0x3A, 0x00) => "medium not present",
        (0x5D, 0x00) => "failure prediction threshold exceeded",
        _ => return None,
    })
}

/// Classifies a SCSI command outcome from its sense buffer and SAM status.
pub fn classify_scsi(sense: &SenseData, sam_status: u8) -> Diagnostic {
    if let Some(info) = sense.parse() {
        let category = Category::from_sense_key(info.key);
        let cause = match additional_sense(info.asc, info.ascq) {
            Some(text) => format!("{} ({text})", sense_key_name(info.key)),
            None => format!(
                "{} (ASC/ASCQ {:02X}h/{:02X}h)",
                sense_key_name(info.key),
                info.asc,
                info.ascq
            ),
        };
        let cause = if info.current {
            cause
        } else {
            format!("deferred error: {cause}")
        };
        return Diagnostic::new(category, cause);
    }
    if !sense.is_empty() {
        return Diagnostic::new(
            Category::Unknown,
            format!("unrecognised sense response code {:02X}h", sense.as_bytes()[0]),
        );
    }
    match sam_status {
        crate::scsi::status::GOOD | crate::scsi::status::CONDITION_MET => Diagnostic::success(),
        crate::scsi::status::CHECK_CONDITION => {
            Diagnostic::new(Category::Unknown, "check condition without sense data")
        }
        other => Diagnostic::new(
            Category::Unknown,
            format!("SCSI status {other:02X}h without sense data"),
        ),
    }
}

/// The 15-bit NVMe completion status field (completion dword 3, bits 31:17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NvmeStatusField(pub u16);

impl NvmeStatusField {
    pub fn from_completion_dw3(dw3: u32) -> Self {
        Self(((dw3 >> 17) & 0x7FFF) as u16)
    }

    /// Status code.
    pub fn sc(self) -> u8 {
        self.0 as u8
    }

    /// Status code type.
    pub fn sct(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    pub fn more(self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn do_not_retry(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn is_success(self) -> bool {
        self.sct() == 0 && self.sc() == 0
    }

    pub fn category(self) -> Category {
        match (self.sct(), self.sc()) {
            (0, 0x00) => Category::Success,
            (0, 0x01 | 0x02 | 0x0B | 0x80) => Category::IllegalRequest,
            (0, 0x04) => Category::MediumError,
            (0, 0x06) => Category::HardwareError,
            (0, 0x05 | 0x07..=0x0A) => Category::AbortedCommand,
            (0, 0x82 | 0x84) => Category::NotReady,
            (1, _) => Category::IllegalRequest,
            (2, _) => Category::MediumError,
            (3, _) => Category::HardwareError,
            (7, _) => Category::VendorSpecific,
            _ => Category::Unknown,
        }
    }

    pub fn diagnostic(self) -> Diagnostic {
        let cause = match nvme_status_message(self.sct(), self.sc()) {
            Some(text) => text.to_string(),
            None => format!(
                "status code type {:X}h, status code {:02X}h",
                self.sct(),
                self.sc()
            ),
        };
        let cause = if self.do_not_retry() {
            format!("{cause} (do not retry)")
        } else {
            cause
        };
        Diagnostic::new(self.category(), cause)
    }
}

fn nvme_status_message(sct: u8, sc: u8) -> Option<&'static str> {
    Some(match (sct, sc) {
        (0, 0x00) => "Successful Completion",
        (0, 0x01) => "Invalid Command Opcode",
        (0, 0x02) => "Invalid Field in Command",
        (0, 0x03) => "Command ID Conflict",
        (0, 0x04) => "Data Transfer Error",
        (0, 0x05) => "Commands Aborted due to Power Loss Notification",
        (0, 0x06) => "Internal Error",
        (0, 0x07) => "Command Abort Requested",
        (0, 0x08) => "Command Aborted due to SQ Deletion",
        (0, 0x09) => "Command Aborted due to Failed Fused Command",
        (0, 0x0A) => "Command Aborted due to Missing Fused Command",
        (0, 0x0B) => "Invalid Namespace or Format",
        (0, 0x0C) => "Command Sequence Error",
        (0, 0x0D) => "Invalid SGL Segment Descriptor",
        (0, 0x0E) => "Invalid Number of SGL Descriptors",
        (0, 0x0F) => "Data SGL Length Invalid",
        (0, 0x10) => "Metadata SGL Length Invalid",
        (0, 0x11) => "SGL Descriptor Type Invalid",
        (0, 0x12) => "Invalid Use of Controller Memory Buffer",
        (0, 0x13) => "PRP Offset Invalid",
        (0, 0x14) => "Atomic Write Unit Exceeded",
        (0, 0x15) => "Operation Denied",
        (0, 0x16) => "SGL Offset Invalid",
        (0, 0x18) => "Host Identifier Inconsistent Format",
        (0, 0x19) => "Keep Alive Timer Expired",
        (0, 0x1A) => "Keep Alive Timeout Invalid",
        (0, 0x1B) => "Command Aborted due to Preempt and Abort",
        (0, 0x1C) => "Sanitize Failed",
        (0, 0x1D) => "Sanitize In Progress",
        (0, 0x1E) => "SGL Data Block Granularity Invalid",
        (0, 0x1F) => "Command Not Supported for Queue in CMB",
        (0, 0x20) => "Namespace is Write Protected",
        (0, 0x21) => "Command Interrupted",
        (0, 0x22) => "Transient Transport Error",
        (0, 0x80) => "LBA Out of Range",
        (0, 0x81) => "Capacity Exceeded",
        (0, 0x82) => "Namespace Not Ready",
        (0, 0x83) => "Reservation Conflict",
        (0, 0x84) => "Format In Progress",
        (1, 0x00) => "Completion Queue Invalid",
        (1, 0x01) => "Invalid Queue Identifier",
        (1, 0x02) => "Invalid Queue Size",
        (1, 0x03) => "Abort Command Limit Exceeded",
        (1, 0x05) => "Asynchronous Event Request Limit Exceeded",
        (1, 0x06) => "Invalid Firmware Slot",
        (1, 0x07) => "Invalid Firmware Image",
        (1, 0x08) => "Invalid Interrupt Vector",
        (1, 0x09) => "Invalid Log Page",
        (1, 0x0A) => "Invalid Format",
        (1, 0x0B) => "Firmware Activation Requires Conventional Reset",
        (1, 0x0C) => "Invalid Queue Deletion",
        (1, 0x0D) => "Feature Identifier Not Saveable",
        (1, 0x0E) => "Feature Not Changeable",
        (1, 0x0F) => "Feature Not Namespace Specific",
        (1, 0x10) => "Firmware Activation Requires NVM Subsystem Reset",
        (1, 0x11) => "Firmware Activation Requires Controller Level Reset",
        (1, 0x12) => "Firmware Activation Requires Maximum Time Violation",
        (1, 0x13) => "Firmware Activation Prohibited",
        (1, 0x14) => "Overlapping Range",
        (1, 0x15) => "Namespace Insufficient Capacity",
        (1, 0x16) => "Namespace Identifier Unavailable",
        (1, 0x18) => "Namespace Already Attached",
        (1, 0x19) => "Namespace Is Private",
        (1, 0x1A) => "Namespace Not Attached",
        (1, 0x1B) => "Thin Provisioning Not Supported",
        (1, 0x1C) => "Controller List Invalid",
        (1, 0x1D) => "Device Self-test In Progress",
        (1, 0x1E) => "Boot Partition Write Prohibited",
        (1, 0x1F) => "Invalid Controller Identifier",
        (1, 0x20) => "Invalid Secondary Controller State",
        (1, 0x21) => "Invalid Number of Controller Resources",
        (1, 0x22) => "Invalid Resource Identifier",
        (1, 0x23) => "Sanitize Prohibited While Persistent Memory Region is Enabled",
        (1, 0x24) => "ANA Group Identifier Invalid",
        (1, 0x25) => "ANA Attach Failed",
        (1, 0x80) => "Conflicting Attributes",
        (1, 0x81) => "Invalid Protection Information",
        (1, 0x82) => "Attempted Write to Read Only Range",
        (2, 0x80) => "Write Fault",
        (2, 0x81) => "Unrecovered Read Error",
        (2, 0x82) => "End-to-end Guard Check Error",
        (2, 0x83) => "End-to-end Application Tag Check Error",
        (2, 0x84) => "End-to-end Reference Tag Check Error",
        (2, 0x85) => "Compare Failure",
        (2, 0x86) => "Access Denied",
        (2, 0x87) => "Deallocated or Unwritten Logical Block",
        (3, 0x00) => "Internal Path Error",
        (3, 0x01) => "Asymmetric Access Persistent Loss",
        (3, 0x02) => "Asymmetric Access Inaccessible",
        (3, 0x03) => "Asymmetric Access Transition",
        (3, 0x60) => "Controller Pathing Error",
        (3, 0x70) => "Host Pathing Error",
        (3, 0x71) => "Command Aborted By Host",
        _ => return None,
    })
}

#[cfg(test)]
#[path = "tests/sense.rs"]
mod tests;
