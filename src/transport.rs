//! The contract every platform pass-through implements.
//!
//! A [`Transport`] moves one command and its data phase to the device and
//! reports what the device said back. It does not interpret the outcome;
//! that is [`Status::diagnostic`]'s job.

use crate::device::DeviceKind;
use crate::error::{OpenError, SmartError, TransportError};
use crate::nvme::NvmeAdminCommand;
use crate::scsi::{self, opcode, AtaPassThrough12, AtaPassThrough16, InquiryCommand, PassThroughFlags};
use crate::sense::{classify_scsi, Category, Diagnostic, NvmeStatusField, SenseData};
use crate::structure::Structure;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    ToDevice,
    FromDevice,
}

/// The data phase of a command, borrowing the caller's buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum DataPhase<'a> {
    /// Device to host.
    In(&'a mut [u8]),
    /// Host to device.
    Out(&'a [u8]),
    None,
}

impl DataPhase<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            DataPhase::In(_) => Direction::FromDevice,
            DataPhase::Out(_) => Direction::ToDevice,
            DataPhase::None => Direction::None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DataPhase::In(buf) => buf.len(),
            DataPhase::Out(buf) => buf.len(),
            DataPhase::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A SCSI command descriptor block of one of the standard lengths.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cdb {
    bytes: [u8; 16],
    len: u8,
}

impl std::fmt::Debug for Cdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cdb").field(&hex::encode(self.as_bytes())).finish()
    }
}

impl Cdb {
    pub fn new(bytes: &[u8]) -> Result<Self, SmartError> {
        if !matches!(bytes.len(), 6 | 10 | 12 | 16) {
            return Err(SmartError::InvalidCdb(bytes.len()));
        }
        let mut cdb = [0u8; 16];
        cdb[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            bytes: cdb,
            len: bytes.len() as u8,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Transfer length implied by the CDB, for the commands whose layout
    /// is known.
    pub fn declared_transfer_len(&self) -> Option<usize> {
        let b = self.as_bytes();
        match (self.opcode(), b.len()) {
            (opcode::INQUIRY, 6) => InquiryCommand::decode(b)
                .ok()
                .map(|c| usize::from(c.allocation_length())),
            (opcode::REQUEST_SENSE, 6) => Some(usize::from(b[4])),
            (opcode::LOG_SENSE, 10) => Some(usize::from(u16::from_be_bytes([b[7], b[8]]))),
            (opcode::ATA_PASS_THROUGH_16, 16) => {
                let cdb = AtaPassThrough16::decode(b).ok()?;
                scsi::ata_transfer_length(cdb.flags(), cdb.features(), cdb.sector_count())
            }
            (opcode::ATA_PASS_THROUGH_12, 12) => {
                let cdb = AtaPassThrough12::decode(b).ok()?;
                scsi::ata_transfer_length(
                    cdb.flags(),
                    u16::from(cdb.features),
                    u16::from(cdb.sector_count),
                )
            }
            _ => None,
        }
    }

    /// Direction implied by the CDB, where known.
    pub fn declared_direction(&self) -> Option<Direction> {
        let flags = match self.opcode() {
            opcode::INQUIRY | opcode::REQUEST_SENSE | opcode::LOG_SENSE => {
                return Some(Direction::FromDevice)
            }
            opcode::ATA_PASS_THROUGH_16 if self.len == 16 => PassThroughFlags::from_byte(self.bytes[2]),
            opcode::ATA_PASS_THROUGH_12 if self.len == 12 => PassThroughFlags::from_byte(self.bytes[2]),
            _ => return None,
        };
        Some(match (flags.t_length, flags.t_dir) {
            (scsi::TransferLength::None, _) => Direction::None,
            (_, true) => Direction::FromDevice,
            (_, false) => Direction::ToDevice,
        })
    }
}

/// Structures that are complete SCSI CDBs.
pub trait CommandBlock: Structure {}

impl CommandBlock for InquiryCommand {}
impl CommandBlock for AtaPassThrough12 {}
impl CommandBlock for AtaPassThrough16 {}

impl<C: CommandBlock> From<&C> for Cdb {
    fn from(block: &C) -> Self {
        let bytes = block.encode();
        let mut cdb = [0u8; 16];
        cdb[..bytes.len()].copy_from_slice(bytes);
        Self {
            bytes: cdb,
            len: bytes.len() as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Scsi(Cdb),
    NvmeAdmin(NvmeAdminCommand),
}

impl Command {
    pub fn declared_transfer_len(&self) -> Option<usize> {
        match self {
            Command::Scsi(cdb) => cdb.declared_transfer_len(),
            Command::NvmeAdmin(cmd) => Some(cmd.data_len() as usize),
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::Scsi(cdb) => cdb.opcode(),
            Command::NvmeAdmin(cmd) => cmd.opcode,
        }
    }
}

/// Rejects a data phase whose size or direction does not match what the
/// command itself declares.
pub fn validate_data_phase(command: &Command, data: &DataPhase<'_>) -> Result<(), SmartError> {
    if let Some(declared) = command.declared_transfer_len() {
        if declared != data.len() {
            return Err(SmartError::BufferLength {
                declared,
                supplied: data.len(),
            });
        }
    }
    if let Command::Scsi(cdb) = command {
        if let Some(direction) = cdb.declared_direction() {
            if !data.is_empty() && direction != data.direction() {
                return Err(SmartError::DirectionMismatch);
            }
        }
    }
    Ok(())
}

/// Outcome reported by a SCSI device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScsiStatus {
    /// SAM status byte.
    pub status: u8,
    pub sense: SenseData,
}

/// Outcome reported by an NVMe controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeStatus {
    pub field: NvmeStatusField,
    /// Completion dword 0, command specific.
    pub result: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Scsi(ScsiStatus),
    Nvme(NvmeStatus),
}

impl Status {
    pub fn good() -> Self {
        Status::Scsi(ScsiStatus {
            status: scsi::status::GOOD,
            sense: SenseData::empty(),
        })
    }

    pub fn diagnostic(&self) -> Diagnostic {
        match self {
            Status::Scsi(s) => classify_scsi(&s.sense, s.status),
            Status::Nvme(s) => s.field.diagnostic(),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Status::Scsi(s) => classify_scsi(&s.sense, s.status).category,
            Status::Nvme(s) => s.field.category(),
        }
    }

    /// Sense bytes, empty for NVMe.
    pub fn sense(&self) -> &[u8] {
        match self {
            Status::Scsi(s) => s.sense.as_bytes(),
            Status::Nvme(_) => &[],
        }
    }
}

/// What came back from one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub bytes_transferred: usize,
    pub status: Status,
}

pub trait Transport {
    /// Issues one command and blocks until the OS call returns.
    ///
    /// An `Ok` only means the pass-through call itself worked; the
    /// device's verdict is in [`Completion::status`].
    fn issue(
        &mut self,
        command: &Command,
        data: DataPhase<'_>,
        timeout: Duration,
    ) -> Result<Completion, TransportError>;
}

/// Transports that can open a device path themselves.
pub trait Connect: Transport + Sized {
    fn connect(path: &Path, kind: DeviceKind) -> Result<Self, OpenError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn issue(
        &mut self,
        command: &Command,
        data: DataPhase<'_>,
        timeout: Duration,
    ) -> Result<Completion, TransportError> {
        (**self).issue(command, data, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scsi::smart_feature;

    #[test]
    fn cdb_lengths() {
        assert!(Cdb::new(&[0; 6]).is_ok());
        assert!(Cdb::new(&[0; 16]).is_ok());
        assert!(matches!(Cdb::new(&[0; 7]), Err(SmartError::InvalidCdb(7))));
        assert!(matches!(Cdb::new(&[]), Err(SmartError::InvalidCdb(0))));
    }

    #[test]
    fn declared_lengths() {
        let inquiry = Command::Scsi(Cdb::from(&InquiryCommand::new(96)));
        assert_eq!(inquiry.declared_transfer_len(), Some(96));
        let smart = Command::Scsi(Cdb::from(&AtaPassThrough16::smart_read(smart_feature::READ_DATA)));
        assert_eq!(smart.declared_transfer_len(), Some(512));
        let status = Command::Scsi(Cdb::from(&AtaPassThrough16::smart_return_status()));
        assert_eq!(status.declared_transfer_len(), Some(0));
        let log = Command::NvmeAdmin(NvmeAdminCommand::get_log_page(2, 0xFFFF_FFFF, 512));
        assert_eq!(log.declared_transfer_len(), Some(512));
        let unknown = Command::Scsi(Cdb::new(&[0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0]).unwrap());
        assert_eq!(unknown.declared_transfer_len(), None);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let inquiry = Command::Scsi(Cdb::from(&InquiryCommand::new(96)));
        let mut short = [0u8; 36];
        assert!(matches!(
            validate_data_phase(&inquiry, &DataPhase::In(&mut short)),
            Err(SmartError::BufferLength {
                declared: 96,
                supplied: 36
            })
        ));
        let mut exact = [0u8; 96];
        assert!(validate_data_phase(&inquiry, &DataPhase::In(&mut exact)).is_ok());
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let inquiry = Command::Scsi(Cdb::from(&InquiryCommand::new(4)));
        let out = [0u8; 4];
        assert!(matches!(
            validate_data_phase(&inquiry, &DataPhase::Out(&out)),
            Err(SmartError::DirectionMismatch)
        ));
    }

    #[test]
    fn direction_of_data_phase() {
        let mut buf = [0u8; 4];
        assert_eq!(DataPhase::In(&mut buf).direction(), Direction::FromDevice);
        assert_eq!(DataPhase::Out(&buf).direction(), Direction::ToDevice);
        assert_eq!(DataPhase::None.direction(), Direction::None);
    }

    #[test]
    fn good_status_is_success() {
        assert_eq!(Status::good().category(), Category::Success);
        assert!(Status::good().sense().is_empty());
    }
}
