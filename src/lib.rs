//! # smart-passthru
//! Reads identification and S.M.A.R.T. health data from storage devices by
//! sending SCSI, ATA and NVMe commands through the operating system's
//! pass-through interface, without external tools like `smartctl`.
//!
//! ## Platforms
//! *   **Linux**: `SG_IO` for SCSI/ATA, `NVME_IOCTL_ADMIN_CMD` for NVMe.
//! *   **Windows**: `IOCTL_SCSI_PASS_THROUGH_DIRECT` for SCSI/ATA,
//!     protocol-specific storage queries for NVMe Identify and log pages.
//! *   **macOS**: the IOKit SCSITask user client (SCSI/ATA only).
//!
//! All command issuance needs root or administrator privileges.
//!
//! ```no_run
//! use smart_passthru::{Device, StorageDevice};
//!
//! let mut device: Device = Device::open("/dev/sda")?;
//! let identity = device.identify()?;
//! println!("{} ({})", identity.model, identity.serial);
//! if let Some(celsius) = device.temperature()? {
//!     println!("{celsius} °C");
//! }
//! # Ok::<(), smart_passthru::SmartError>(())
//! ```

pub mod ata;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod nvme;
mod platform;
pub mod scsi;
pub mod sense;
pub mod smart;
pub mod structure;
pub mod transport;

pub use config::{Options, RecoveredErrorPolicy};
pub use device::{Device, DeviceKind, Identity, NvmeDevice, ScsiAtaDevice, SmartTable, StorageDevice};
pub use discovery::{discover, DiscoveredDevice};
pub use error::{CommandFailure, MalformedResponse, OpenError, Result, SmartError, TransportError};
pub use platform::NativeTransport;
pub use sense::{Category, Diagnostic};
pub use smart::{NvmeHealth, SmartAttribute, SmartStatus};
pub use structure::Structure;
pub use transport::{Cdb, Command, Completion, DataPhase, Direction, Status, Transport};
