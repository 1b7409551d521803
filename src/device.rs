//! Devices: a path, a protocol family and, while open, a transport.
//!
//! A device is created closed. `open` (or `attach` with a ready transport)
//! starts a session; everything read during the session is memoized on it
//! and dropped together with the transport on `close`.

use crate::ata::{IdentifyDeviceData, SmartData, SmartThresholds};
use crate::config::{Options, RecoveredErrorPolicy};
use crate::error::{CommandFailure, MalformedResponse, Result, SmartError};
use crate::nvme::{
    cns, log_page, IdentifyController, IdentifyNamespace, NvmeAdminCommand, NSID_ALL,
    SMART_LOG_LEN,
};
use crate::platform::NativeTransport;
use crate::scsi::{smart_feature, AtaPassThrough16, InquiryCommand, InquiryData, PeripheralType};
use crate::sense::Category;
use crate::smart::{
    apply_drive_entries, apply_thresholds, ata_temperature, decode_ata_smart,
    decode_nvme_health_log, NvmeHealth, SmartAttribute, SmartStatus,
};
use crate::structure::Structure;
use crate::transport::{
    validate_data_phase, Cdb, Command, Completion, Connect, DataPhase, Status, Transport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Allocation length used for standard INQUIRY.
pub const INQUIRY_LEN: u16 = 96;

/// Which command set a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// SCSI, or ATA reached through SCSI ATA PASS-THROUGH.
    ScsiAta,
    Nvme,
}

impl DeviceKind {
    /// Guesses the kind from the device name alone. `None` means the name
    /// does not say, e.g. `\\.\PhysicalDrive0` or `/dev/disk2`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with("nvme") {
            Some(DeviceKind::Nvme)
        } else if ["sd", "sg", "sr", "st", "hd"]
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            Some(DeviceKind::ScsiAta)
        } else {
            None
        }
    }

    /// Kind of `path`, asking the device when the name does not say.
    pub fn detect(path: &Path) -> Result<Self> {
        match Self::from_path(path) {
            Some(kind) => Ok(kind),
            None => Ok(crate::platform::detect_kind(path)?),
        }
    }
}

/// Static description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub vendor: Option<String>,
    pub device_type: Option<PeripheralType>,
    pub capacity_bytes: Option<u64>,
    pub smart_supported: Option<bool>,
}

/// Health data in the shape the protocol reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SmartTable {
    Ata { attributes: Vec<SmartAttribute> },
    Nvme(NvmeHealth),
}

impl SmartTable {
    /// Any attribute at or below its threshold, or any NVMe critical warning.
    pub fn exceeded(&self) -> bool {
        match self {
            SmartTable::Ata { attributes } => attributes.iter().any(|a| a.exceeded),
            SmartTable::Nvme(health) => health.exceeded(),
        }
    }

    pub fn temperature(&self) -> Option<i32> {
        match self {
            SmartTable::Ata { attributes } => ata_temperature(attributes),
            SmartTable::Nvme(health) => health.temperature_celsius(),
        }
    }
}

/// The capability set shared by both device variants.
pub trait StorageDevice {
    fn path(&self) -> &Path;
    fn kind(&self) -> DeviceKind;
    fn is_open(&self) -> bool;

    /// Ends the session. Closing a closed device does nothing.
    fn close(&mut self);

    /// Issues `command` as is. Fails with [`SmartError::Command`] when the
    /// device reports failure; the raw status rides along either way.
    fn issue_raw_command(&mut self, command: &Command, data: DataPhase<'_>) -> Result<Completion>;

    fn identify(&mut self) -> Result<Identity>;

    fn smart_table(&mut self) -> Result<SmartTable>;

    fn model(&mut self) -> Result<String> {
        Ok(self.identify()?.model)
    }

    fn serial(&mut self) -> Result<String> {
        Ok(self.identify()?.serial)
    }

    /// Degrees Celsius, if the device reports it.
    fn temperature(&mut self) -> Result<Option<i32>> {
        Ok(self.smart_table()?.temperature())
    }
}

/// Validates, issues and judges one command.
fn execute<T: Transport>(
    transport: &mut T,
    options: &Options,
    command: &Command,
    data: DataPhase<'_>,
) -> Result<Completion> {
    validate_data_phase(command, &data)?;
    debug!(
        opcode = command.opcode(),
        direction = ?data.direction(),
        len = data.len(),
        "issuing command"
    );
    match command {
        Command::Scsi(cdb) => trace!(cdb = %hex::encode(cdb.as_bytes())),
        Command::NvmeAdmin(cmd) => trace!(cmd = %hex::encode(cmd.encode())),
    }

    let completion = transport.issue(command, data, options.timeout)?;
    let diagnostic = completion.status.diagnostic();
    trace!(
        transferred = completion.bytes_transferred,
        sense = %hex::encode(completion.status.sense()),
        %diagnostic,
        "command completed"
    );

    let rejected = diagnostic.is_failure()
        || (diagnostic.category == Category::RecoveredError
            && options.recovered_errors == RecoveredErrorPolicy::Reject);
    if rejected {
        warn!(opcode = command.opcode(), %diagnostic, "command failed");
        return Err(CommandFailure {
            status: completion.status,
            diagnostic,
        }
        .into());
    }
    Ok(completion)
}

/// Issues a data-in command into a fresh buffer and decodes the part the
/// device actually filled.
fn read_structure<S: Structure, T: Transport>(
    transport: &mut T,
    options: &Options,
    command: &Command,
    len: usize,
) -> Result<S> {
    let mut buf = vec![0u8; len];
    let completion = execute(transport, options, command, DataPhase::In(&mut buf))?;
    let filled = completion.bytes_transferred.min(len);
    Ok(S::decode(&buf[..filled])?)
}

struct AtaSession<T> {
    transport: T,
    inquiry: Option<InquiryData>,
    identity: Option<Identity>,
    smart: Option<SmartTable>,
}

/// A SCSI device, or an ATA device behind a SCSI-ATA translation layer.
pub struct ScsiAtaDevice<T = NativeTransport> {
    path: PathBuf,
    options: Options,
    session: Option<AtaSession<T>>,
}

impl<T> std::fmt::Debug for ScsiAtaDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScsiAtaDevice")
            .field("path", &self.path)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl<T: Connect> ScsiAtaDevice<T> {
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(SmartError::AlreadyOpen(self.path.clone()));
        }
        let transport = T::connect(&self.path, DeviceKind::ScsiAta)?;
        self.attach(transport)
    }
}

impl<T: Transport> ScsiAtaDevice<T> {
    /// A closed device.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: Options::default(),
            session: None,
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Starts a session on an already connected transport.
    pub fn attach(&mut self, transport: T) -> Result<()> {
        if self.session.is_some() {
            return Err(SmartError::AlreadyOpen(self.path.clone()));
        }
        debug!(path = %self.path.display(), "session opened");
        self.session = Some(AtaSession {
            transport,
            inquiry: None,
            identity: None,
            smart: None,
        });
        Ok(())
    }

    fn session(&mut self) -> Result<&mut AtaSession<T>> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(SmartError::Closed(self.path.clone())),
        }
    }

    fn read<S: Structure>(&mut self, cdb: Cdb, len: usize) -> Result<S> {
        let options = self.options.clone();
        let session = self.session()?;
        read_structure(&mut session.transport, &options, &Command::Scsi(cdb), len)
    }

    /// Standard INQUIRY data, memoized for the session.
    pub fn inquiry(&mut self) -> Result<InquiryData> {
        if let Some(data) = self.session()?.inquiry {
            return Ok(data);
        }
        let cdb = Cdb::from(&InquiryCommand::new(INQUIRY_LEN));
        let data: InquiryData = self.read(cdb, usize::from(INQUIRY_LEN))?;
        self.session()?.inquiry = Some(data);
        Ok(data)
    }

    /// ATA IDENTIFY DEVICE, retried as IDENTIFY PACKET DEVICE when the
    /// device rejects it and the fallback is enabled.
    pub fn identify_device(&mut self) -> Result<IdentifyDeviceData> {
        let len = core::mem::size_of::<IdentifyDeviceData>();
        match self.read(Cdb::from(&AtaPassThrough16::identify_device()), len) {
            Err(SmartError::Command(failure)) if self.options.atapi_fallback => {
                warn!(
                    path = %self.path.display(),
                    diagnostic = %failure.diagnostic,
                    "IDENTIFY DEVICE rejected, trying IDENTIFY PACKET DEVICE"
                );
                self.read(Cdb::from(&AtaPassThrough16::identify_packet_device()), len)
            }
            other => other,
        }
    }

    pub fn smart_data(&mut self) -> Result<SmartData> {
        let cdb = Cdb::from(&AtaPassThrough16::smart_read(smart_feature::READ_DATA));
        self.read(cdb, core::mem::size_of::<SmartData>())
    }

    pub fn smart_thresholds(&mut self) -> Result<SmartThresholds> {
        let cdb = Cdb::from(&AtaPassThrough16::smart_read(smart_feature::READ_THRESHOLDS));
        self.read(cdb, core::mem::size_of::<SmartThresholds>())
    }

    /// The drive's own pass/fail verdict (SMART RETURN STATUS).
    pub fn smart_status(&mut self) -> Result<SmartStatus> {
        let completion = self.issue_raw_command(
            &Command::Scsi(Cdb::from(&AtaPassThrough16::smart_return_status())),
            DataPhase::None,
        )?;
        let sense = match completion.status {
            Status::Scsi(status) => status.sense,
            Status::Nvme(_) => return Err(missing_registers(0)),
        };
        sense
            .ata_status_return()
            .and_then(|registers| SmartStatus::from_registers(&registers))
            .ok_or_else(|| missing_registers(sense.as_bytes().len()))
    }

    fn build_identity(&mut self) -> Result<Identity> {
        let inquiry = self.inquiry()?;
        let ata = match self.identify_device() {
            Ok(ata) => Some(ata),
            Err(SmartError::Command(failure)) => {
                warn!(
                    path = %self.path.display(),
                    diagnostic = %failure.diagnostic,
                    "no ATA IDENTIFY data, using INQUIRY"
                );
                None
            }
            Err(err) => return Err(err),
        };
        let pick = |ata: Option<String>, fallback: String| match ata {
            Some(value) if !value.is_empty() => value,
            _ => fallback,
        };
        Ok(Identity {
            model: pick(ata.map(|a| a.model()), inquiry.product()),
            serial: pick(ata.map(|a| a.serial()), inquiry.vendor_specific_text()),
            firmware: pick(ata.map(|a| a.firmware()), inquiry.revision()),
            vendor: Some(inquiry.vendor()).filter(|v| !v.is_empty()),
            device_type: Some(inquiry.peripheral_type()),
            capacity_bytes: ata
                .map(|a| a.sectors().saturating_mul(512))
                .filter(|b| *b > 0),
            smart_supported: ata.map(|a| a.smart_supported()),
        })
    }

    fn build_smart_table(&mut self) -> Result<SmartTable> {
        let data = self.smart_data()?;
        let mut attributes = decode_ata_smart(data.encode())?;
        if !data.checksum_valid() {
            warn!(path = %self.path.display(), "SMART data checksum mismatch");
        }
        match self.smart_thresholds() {
            Ok(thresholds) => apply_thresholds(&mut attributes, &thresholds),
            Err(SmartError::Command(failure)) => warn!(
                path = %self.path.display(),
                diagnostic = %failure.diagnostic,
                "SMART thresholds unavailable"
            ),
            Err(err) => return Err(err),
        }
        match self.identify() {
            Ok(identity) => apply_drive_entries(&mut attributes, DeviceKind::ScsiAta, &identity.model),
            Err(SmartError::Command(failure)) => warn!(
                path = %self.path.display(),
                diagnostic = %failure.diagnostic,
                "no model to look up drive-specific attributes"
            ),
            Err(err) => return Err(err),
        }
        Ok(SmartTable::Ata { attributes })
    }
}

fn missing_registers(actual: usize) -> SmartError {
    MalformedResponse {
        structure: "ATA status return",
        expected: 14,
        actual,
    }
    .into()
}

impl<T: Transport> StorageDevice for ScsiAtaDevice<T> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::ScsiAta
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            debug!(path = %self.path.display(), "session closed");
        }
    }

    fn issue_raw_command(&mut self, command: &Command, data: DataPhase<'_>) -> Result<Completion> {
        let options = self.options.clone();
        let session = self.session()?;
        execute(&mut session.transport, &options, command, data)
    }

    fn identify(&mut self) -> Result<Identity> {
        if let Some(identity) = &self.session()?.identity {
            return Ok(identity.clone());
        }
        let identity = self.build_identity()?;
        self.session()?.identity = Some(identity.clone());
        Ok(identity)
    }

    fn smart_table(&mut self) -> Result<SmartTable> {
        if let Some(table) = &self.session()?.smart {
            return Ok(table.clone());
        }
        let table = self.build_smart_table()?;
        self.session()?.smart = Some(table.clone());
        Ok(table)
    }
}

struct NvmeSession<T> {
    transport: T,
    controller: Option<Box<IdentifyController>>,
    identity: Option<Identity>,
    smart: Option<SmartTable>,
}

/// An NVMe controller, addressed through its admin queue.
pub struct NvmeDevice<T = NativeTransport> {
    path: PathBuf,
    options: Options,
    session: Option<NvmeSession<T>>,
}

impl<T> std::fmt::Debug for NvmeDevice<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeDevice")
            .field("path", &self.path)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl<T: Connect> NvmeDevice<T> {
    pub fn open(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Err(SmartError::AlreadyOpen(self.path.clone()));
        }
        let transport = T::connect(&self.path, DeviceKind::Nvme)?;
        self.attach(transport)
    }
}

impl<T: Transport> NvmeDevice<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: Options::default(),
            session: None,
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn attach(&mut self, transport: T) -> Result<()> {
        if self.session.is_some() {
            return Err(SmartError::AlreadyOpen(self.path.clone()));
        }
        debug!(path = %self.path.display(), "session opened");
        self.session = Some(NvmeSession {
            transport,
            controller: None,
            identity: None,
            smart: None,
        });
        Ok(())
    }

    fn session(&mut self) -> Result<&mut NvmeSession<T>> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(SmartError::Closed(self.path.clone())),
        }
    }

    fn read<S: Structure>(&mut self, command: NvmeAdminCommand) -> Result<S> {
        let options = self.options.clone();
        let len = command.data_len() as usize;
        let session = self.session()?;
        read_structure(
            &mut session.transport,
            &options,
            &Command::NvmeAdmin(command),
            len,
        )
    }

    /// Identify Controller, memoized for the session.
    pub fn identify_controller(&mut self) -> Result<IdentifyController> {
        if let Some(controller) = &self.session()?.controller {
            return Ok(**controller);
        }
        let controller: IdentifyController =
            self.read(NvmeAdminCommand::identify(cns::CONTROLLER, 0))?;
        self.session()?.controller = Some(Box::new(controller));
        Ok(controller)
    }

    pub fn identify_namespace(&mut self, nsid: u32) -> Result<IdentifyNamespace> {
        self.read(NvmeAdminCommand::identify(cns::NAMESPACE, nsid))
    }

    /// Reads log page `lid` into `buf`, returning the bytes transferred.
    /// The buffer length must be a non-zero multiple of four.
    pub fn read_log_page(&mut self, lid: u8, nsid: u32, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || buf.len() % 4 != 0 || u32::try_from(buf.len()).is_err() {
            return Err(SmartError::BufferLength {
                declared: buf.len() / 4 * 4,
                supplied: buf.len(),
            });
        }
        let command = NvmeAdminCommand::get_log_page(lid, nsid, buf.len() as u32);
        let completion = self.issue_raw_command(&Command::NvmeAdmin(command), DataPhase::In(buf))?;
        Ok(completion.bytes_transferred)
    }

    pub fn health_log(&mut self) -> Result<NvmeHealth> {
        let mut buf = [0u8; SMART_LOG_LEN];
        let transferred = self.read_log_page(log_page::SMART_HEALTH, NSID_ALL, &mut buf)?;
        Ok(decode_nvme_health_log(&buf[..transferred.min(SMART_LOG_LEN)])?)
    }
}

impl<T: Transport> StorageDevice for NvmeDevice<T> {
    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Nvme
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            debug!(path = %self.path.display(), "session closed");
        }
    }

    fn issue_raw_command(&mut self, command: &Command, data: DataPhase<'_>) -> Result<Completion> {
        let options = self.options.clone();
        let session = self.session()?;
        execute(&mut session.transport, &options, command, data)
    }

    fn identify(&mut self) -> Result<Identity> {
        if let Some(identity) = &self.session()?.identity {
            return Ok(identity.clone());
        }
        let controller = self.identify_controller()?;
        let capacity = u64::try_from(controller.total_capacity()).unwrap_or(u64::MAX);
        let identity = Identity {
            model: controller.model(),
            serial: controller.serial(),
            firmware: controller.firmware(),
            vendor: None,
            device_type: None,
            capacity_bytes: Some(capacity).filter(|c| *c > 0),
            smart_supported: Some(true),
        };
        self.session()?.identity = Some(identity.clone());
        Ok(identity)
    }

    fn smart_table(&mut self) -> Result<SmartTable> {
        if let Some(table) = &self.session()?.smart {
            return Ok(table.clone());
        }
        let table = SmartTable::Nvme(self.health_log()?);
        self.session()?.smart = Some(table.clone());
        Ok(table)
    }
}

/// A device of either kind. The variant is fixed when the device is made.
pub enum Device<T = NativeTransport> {
    ScsiAta(ScsiAtaDevice<T>),
    Nvme(NvmeDevice<T>),
}

impl<T> std::fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::ScsiAta(d) => std::fmt::Debug::fmt(d, f),
            Device::Nvme(d) => std::fmt::Debug::fmt(d, f),
        }
    }
}

impl<T: Transport> Device<T> {
    /// A closed device of the given kind.
    pub fn new(path: impl Into<PathBuf>, kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::ScsiAta => Device::ScsiAta(ScsiAtaDevice::new(path)),
            DeviceKind::Nvme => Device::Nvme(NvmeDevice::new(path)),
        }
    }

    pub fn with_options(self, options: Options) -> Self {
        match self {
            Device::ScsiAta(d) => Device::ScsiAta(d.with_options(options)),
            Device::Nvme(d) => Device::Nvme(d.with_options(options)),
        }
    }

    pub fn attach(&mut self, transport: T) -> Result<()> {
        match self {
            Device::ScsiAta(d) => d.attach(transport),
            Device::Nvme(d) => d.attach(transport),
        }
    }

    fn inner(&self) -> &dyn StorageDevice {
        match self {
            Device::ScsiAta(d) => d,
            Device::Nvme(d) => d,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn StorageDevice {
        match self {
            Device::ScsiAta(d) => d,
            Device::Nvme(d) => d,
        }
    }
}

impl<T: Connect> Device<T> {
    /// Detects the kind of `path` and opens it with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, Options::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref();
        let kind = DeviceKind::detect(path)?;
        let mut device = Self::new(path, kind).with_options(options);
        device.reopen()?;
        Ok(device)
    }

    /// Opens a closed device again with a fresh session.
    pub fn reopen(&mut self) -> Result<()> {
        match self {
            Device::ScsiAta(d) => d.open(),
            Device::Nvme(d) => d.open(),
        }
    }
}

impl<T: Transport> StorageDevice for Device<T> {
    fn path(&self) -> &Path {
        self.inner().path()
    }

    fn kind(&self) -> DeviceKind {
        self.inner().kind()
    }

    fn is_open(&self) -> bool {
        self.inner().is_open()
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn issue_raw_command(&mut self, command: &Command, data: DataPhase<'_>) -> Result<Completion> {
        self.inner_mut().issue_raw_command(command, data)
    }

    fn identify(&mut self) -> Result<Identity> {
        self.inner_mut().identify()
    }

    fn smart_table(&mut self) -> Result<SmartTable> {
        self.inner_mut().smart_table()
    }

    fn temperature(&mut self) -> Result<Option<i32>> {
        self.inner_mut().temperature()
    }
}

#[cfg(test)]
#[path = "tests/device.rs"]
mod tests;
