//! Linux pass-through: `SG_IO` for SCSI/ATA devices and
//! `NVME_IOCTL_ADMIN_CMD` for NVMe controllers and namespaces.

use crate::device::DeviceKind;
use crate::error::{OpenError, TransportError};
use crate::nvme::NvmeAdminCommand;
use crate::sense::{NvmeStatusField, SenseData, SENSE_BUFFER_LEN};
use crate::structure::Structure;
use crate::transport::{Command, Completion, Connect, DataPhase, NvmeStatus, ScsiStatus, Status, Transport};
use nix::errno::Errno;
use nix::libc::{c_int, c_uchar, c_uint, c_ushort, c_void};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SG_INTERFACE_ID: c_int = b'S' as c_int;
const SG_DXFER_NONE: c_int = -1;
const SG_DXFER_TO_DEV: c_int = -2;
const SG_DXFER_FROM_DEV: c_int = -3;

const DID_OK: c_ushort = 0x00;
const DID_BUS_BUSY: c_ushort = 0x02;
const DID_TIME_OUT: c_ushort = 0x03;
const DRIVER_TIMEOUT: c_ushort = 0x06;
const DRIVER_SENSE: c_ushort = 0x08;

/// `struct sg_io_hdr` from `<scsi/sg.h>`.
#[repr(C)]
struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: c_uchar,
    mx_sb_len: c_uchar,
    iovec_count: c_ushort,
    dxfer_len: c_uint,
    dxferp: *mut c_void,
    cmdp: *const c_uchar,
    sbp: *mut c_uchar,
    timeout: c_uint,
    flags: c_uint,
    pack_id: c_int,
    usr_ptr: *mut c_void,
    status: c_uchar,
    masked_status: c_uchar,
    msg_status: c_uchar,
    sb_len_wr: c_uchar,
    host_status: c_ushort,
    driver_status: c_ushort,
    resid: c_int,
    duration: c_uint,
    info: c_uint,
}

nix::ioctl_readwrite_bad!(sg_io, 0x2285, SgIoHdr);
nix::ioctl_readwrite!(nvme_admin_cmd, b'N', 0x41, NvmeAdminCommand);

/// An open device node.
#[derive(Debug)]
pub struct SgTransport {
    file: File,
    path: PathBuf,
    kind: DeviceKind,
}

fn open_error(path: &Path, err: std::io::Error) -> OpenError {
    match err.kind() {
        std::io::ErrorKind::NotFound => OpenError::NotFound(path.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => OpenError::PermissionDenied(path.to_path_buf()),
        _ => OpenError::Os {
            path: path.to_path_buf(),
            source: err,
        },
    }
}

fn errno_error(errno: Errno) -> TransportError {
    match errno {
        Errno::EACCES | Errno::EPERM => TransportError::PermissionDenied,
        Errno::EBUSY => TransportError::DeviceBusy,
        Errno::ETIMEDOUT => TransportError::Timeout,
        Errno::ENOTTY | Errno::EINVAL | Errno::EOPNOTSUPP => {
            TransportError::Unsupported("ioctl not supported by this device")
        }
        other => TransportError::Io(other as i32),
    }
}

impl SgTransport {
    /// Opens `path` read-only and non-blocking; pass-through ioctls do not
    /// need write access to the node.
    pub fn open(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(nix::libc::O_NONBLOCK)
            .open(path)
            .map_err(|e| open_error(path, e))?;
        let file_type = file.metadata().map_err(|e| open_error(path, e))?.file_type();
        if !file_type.is_block_device() && !file_type.is_char_device() {
            return Err(OpenError::NotADevice(path.to_path_buf()));
        }
        debug!(path = %path.display(), ?kind, "opened device node");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sg_io(&mut self, cdb: &[u8], data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        let mut sense = [0u8; SENSE_BUFFER_LEN];
        let (direction, dxferp, dxfer_len) = match data {
            DataPhase::In(buf) => (SG_DXFER_FROM_DEV, buf.as_mut_ptr().cast::<c_void>(), buf.len()),
            DataPhase::Out(buf) => (SG_DXFER_TO_DEV, buf.as_ptr().cast_mut().cast::<c_void>(), buf.len()),
            DataPhase::None => (SG_DXFER_NONE, std::ptr::null_mut(), 0),
        };
        let mut hdr = SgIoHdr {
            interface_id: SG_INTERFACE_ID,
            dxfer_direction: direction,
            cmd_len: cdb.len() as c_uchar,
            mx_sb_len: SENSE_BUFFER_LEN as c_uchar,
            iovec_count: 0,
            dxfer_len: u32::try_from(dxfer_len).map_err(|_| TransportError::Io(Errno::EINVAL as i32))?,
            dxferp,
            cmdp: cdb.as_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            flags: 0,
            pack_id: 0,
            usr_ptr: std::ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        // SAFETY: every pointer in `hdr` refers to a buffer that outlives the
        // call and whose length is the one recorded next to it.
        unsafe { sg_io(self.file.as_raw_fd(), &mut hdr) }.map_err(errno_error)?;

        match hdr.host_status {
            DID_OK => {}
            DID_TIME_OUT => return Err(TransportError::Timeout),
            DID_BUS_BUSY => return Err(TransportError::DeviceBusy),
            _ => return Err(TransportError::Io(Errno::EIO as i32)),
        }
        match hdr.driver_status & 0x0F {
            0 | DRIVER_SENSE => {}
            DRIVER_TIMEOUT => return Err(TransportError::Timeout),
            _ => return Err(TransportError::Io(Errno::EIO as i32)),
        }

        let written = usize::from(hdr.sb_len_wr).min(SENSE_BUFFER_LEN);
        let resid = usize::try_from(hdr.resid).unwrap_or(0);
        Ok(Completion {
            bytes_transferred: dxfer_len.saturating_sub(resid),
            status: Status::Scsi(ScsiStatus {
                status: hdr.status,
                sense: SenseData::new(&sense[..written]),
            }),
        })
    }

    fn nvme_admin(
        &mut self,
        command: &NvmeAdminCommand,
        data: DataPhase<'_>,
        timeout: Duration,
    ) -> Result<Completion, TransportError> {
        let mut cmd = *command;
        let (addr, len) = match data {
            DataPhase::In(buf) => (buf.as_mut_ptr() as u64, buf.len()),
            DataPhase::Out(buf) => (buf.as_ptr() as u64, buf.len()),
            DataPhase::None => (0, 0),
        };
        cmd.addr = addr.to_le_bytes();
        if cmd.timeout_ms() == 0 {
            cmd = cmd.with_timeout_ms(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        }

        // SAFETY: `addr` points at the caller's buffer, which is at least
        // `data_len` bytes long (checked before any transport is reached).
        let ret = unsafe { nvme_admin_cmd(self.file.as_raw_fd(), &mut cmd) }.map_err(errno_error)?;

        // A positive return is the NVMe status field without the phase tag.
        let field = NvmeStatusField((ret & 0x7FFF) as u16);
        Ok(Completion {
            bytes_transferred: if field.is_success() { len } else { 0 },
            status: Status::Nvme(NvmeStatus {
                field,
                result: cmd.result(),
            }),
        })
    }
}

impl Transport for SgTransport {
    fn issue(&mut self, command: &Command, data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        match (command, self.kind) {
            (Command::Scsi(cdb), DeviceKind::ScsiAta) => self.sg_io(cdb.as_bytes(), data, timeout),
            (Command::NvmeAdmin(cmd), DeviceKind::Nvme) => self.nvme_admin(cmd, data, timeout),
            (Command::Scsi(_), DeviceKind::Nvme) => {
                Err(TransportError::Unsupported("SCSI commands on an NVMe device"))
            }
            (Command::NvmeAdmin(_), DeviceKind::ScsiAta) => {
                Err(TransportError::Unsupported("NVMe admin commands on a SCSI device"))
            }
        }
    }
}

impl Connect for SgTransport {
    fn connect(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        Self::open(path, kind)
    }
}

/// Resolves symlinks such as `/dev/disk/by-id/*` and names the kind from
/// the real node.
pub fn detect_kind(path: &Path) -> Result<DeviceKind, OpenError> {
    let real = std::fs::canonicalize(path).map_err(|e| open_error(path, e))?;
    if let Some(kind) = DeviceKind::from_path(&real) {
        return Ok(kind);
    }
    let file_type = std::fs::metadata(&real)
        .map_err(|e| open_error(path, e))?
        .file_type();
    if file_type.is_block_device() || file_type.is_char_device() {
        Ok(DeviceKind::ScsiAta)
    } else {
        Err(OpenError::NotADevice(path.to_path_buf()))
    }
}

/// Whole disks under `/sys/block`, as `/dev` paths.
pub fn discover() -> std::io::Result<Vec<(PathBuf, DeviceKind)>> {
    let mut names: Vec<String> = std::fs::read_dir("/sys/block")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("sd") || name.starts_with("nvme"))
        .collect();
    names.sort();
    Ok(names
        .into_iter()
        .filter_map(|name| {
            let path = Path::new("/dev").join(&name);
            DeviceKind::from_path(&path).map(|kind| (path, kind))
        })
        .collect())
}
