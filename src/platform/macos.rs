//! macOS pass-through through the IOKit SCSITask user client.
//!
//! The user client is only published for devices no block storage driver
//! holds exclusively, so mounted internal disks usually refuse it. NVMe
//! admin pass-through has no public user client at all.

use crate::device::DeviceKind;
use crate::error::{OpenError, TransportError};
use crate::sense::SenseData;
use crate::transport::{Command, Completion, Connect, DataPhase, ScsiStatus, Status, Transport};
use std::ffi::{c_char, c_void, CString};
use std::path::{Path, PathBuf};
use std::process::Command as Process;
use std::ptr::null_mut;
use std::time::Duration;
use tracing::debug;

type IoReturn = i32;
type IoObject = u32;
type CfUuidRef = *const c_void;

const IO_RETURN_SUCCESS: IoReturn = 0;
const IO_RETURN_NOT_PRIVILEGED: IoReturn = 0xE000_02C1_u32 as i32;
const IO_RETURN_EXCLUSIVE_ACCESS: IoReturn = 0xE000_02C5_u32 as i32;
const IO_RETURN_UNSUPPORTED: IoReturn = 0xE000_02C7_u32 as i32;
const IO_RETURN_BUSY: IoReturn = 0xE000_02D5_u32 as i32;
const IO_RETURN_TIMEOUT: IoReturn = 0xE000_02D6_u32 as i32;
const IO_RETURN_NOT_PERMITTED: IoReturn = 0xE000_02E2_u32 as i32;

const DATA_TRANSFER_NONE: u8 = 0;
const DATA_TRANSFER_TO_TARGET: u8 = 1;
const DATA_TRANSFER_FROM_TARGET: u8 = 2;

/// Parent levels searched above the BSD node for the user client.
const MAX_PARENT_DEPTH: usize = 8;

const IO_CF_PLUGIN_INTERFACE_ID: [u8; 16] = [
    0xC2, 0x44, 0xE8, 0x58, 0x10, 0x9C, 0x11, 0xD4, 0x91, 0xD4, 0x00, 0x50, 0xE4, 0xC6, 0x42, 0x6F,
];
const SCSI_TASK_DEVICE_USER_CLIENT_TYPE_ID: [u8; 16] = [
    0x7D, 0x66, 0x67, 0x8E, 0x08, 0xA2, 0x11, 0xD5, 0xA1, 0xB8, 0x00, 0x30, 0x65, 0x7D, 0x05, 0x2A,
];
const SCSI_TASK_DEVICE_INTERFACE_ID: [u8; 16] = [
    0x6B, 0xD4, 0x8F, 0x55, 0x0E, 0x8A, 0x11, 0xD5, 0xA1, 0xB8, 0x00, 0x30, 0x65, 0x7D, 0x05, 0x2A,
];

#[repr(C)]
#[derive(Clone, Copy)]
struct CfUuidBytes([u8; 16]);

#[repr(C)]
struct IoVirtualRange {
    address: usize,
    length: usize,
}

#[repr(C)]
#[allow(dead_code)]
struct IUnknownVtbl {
    _reserved: *mut c_void,
    query_interface: unsafe extern "C" fn(*mut c_void, CfUuidBytes, *mut *mut c_void) -> i32,
    add_ref: unsafe extern "C" fn(*mut c_void) -> u32,
    release: unsafe extern "C" fn(*mut c_void) -> u32,
}

#[repr(C)]
#[allow(dead_code)]
struct ScsiTaskDeviceVtbl {
    base: IUnknownVtbl,
    version: u16,
    revision: u16,
    is_exclusive_access_available: unsafe extern "C" fn(*mut c_void) -> u8,
    add_callback_dispatcher_to_run_loop: unsafe extern "C" fn(*mut c_void, *mut c_void) -> IoReturn,
    remove_callback_dispatcher_from_run_loop: unsafe extern "C" fn(*mut c_void),
    obtain_exclusive_access: unsafe extern "C" fn(*mut c_void) -> IoReturn,
    release_exclusive_access: unsafe extern "C" fn(*mut c_void) -> IoReturn,
    create_scsi_task: unsafe extern "C" fn(*mut c_void) -> *mut *const ScsiTaskVtbl,
}

/// Leading part of `SCSITaskInterface`, up to `ExecuteTaskSync`.
#[repr(C)]
#[allow(dead_code)]
struct ScsiTaskVtbl {
    base: IUnknownVtbl,
    version: u16,
    revision: u16,
    is_task_active: unsafe extern "C" fn(*mut c_void) -> u8,
    set_task_attribute: unsafe extern "C" fn(*mut c_void, u32) -> IoReturn,
    get_task_attribute: unsafe extern "C" fn(*mut c_void, *mut u32) -> IoReturn,
    set_command_descriptor_block: unsafe extern "C" fn(*mut c_void, *mut u8, u8) -> IoReturn,
    get_command_descriptor_block_size: unsafe extern "C" fn(*mut c_void) -> u8,
    get_command_descriptor_block: unsafe extern "C" fn(*mut c_void, *mut u8) -> IoReturn,
    set_scatter_gather_entries:
        unsafe extern "C" fn(*mut c_void, *mut IoVirtualRange, u8, u64, u8) -> IoReturn,
    set_timeout_duration: unsafe extern "C" fn(*mut c_void, u32) -> IoReturn,
    get_timeout_duration: unsafe extern "C" fn(*mut c_void) -> u32,
    set_task_completion_callback: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> IoReturn,
    execute_task_async: unsafe extern "C" fn(*mut c_void) -> IoReturn,
    execute_task_sync: unsafe extern "C" fn(*mut c_void, *mut u8, *mut u32, *mut u64) -> IoReturn,
}

#[link(name = "IOKit", kind = "framework")]
extern "C" {
    fn IOBSDNameMatching(main_port: u32, options: u32, bsd_name: *const c_char) -> *mut c_void;
    fn IOServiceGetMatchingService(main_port: u32, matching: *mut c_void) -> IoObject;
    fn IORegistryEntryGetParentEntry(entry: IoObject, plane: *const c_char, parent: *mut IoObject) -> IoReturn;
    fn IOObjectRelease(object: IoObject) -> IoReturn;
    fn IOCreatePlugInInterfaceForService(
        service: IoObject,
        plugin_type: CfUuidRef,
        interface_type: CfUuidRef,
        the_interface: *mut *mut *const IUnknownVtbl,
        the_score: *mut i32,
    ) -> IoReturn;
}

#[link(name = "CoreFoundation", kind = "framework")]
extern "C" {
    fn CFUUIDGetConstantUUIDWithBytes(
        alloc: *const c_void,
        b0: u8, b1: u8, b2: u8, b3: u8, b4: u8, b5: u8, b6: u8, b7: u8,
        b8: u8, b9: u8, b10: u8, b11: u8, b12: u8, b13: u8, b14: u8, b15: u8,
    ) -> CfUuidRef;
}

fn uuid(b: [u8; 16]) -> CfUuidRef {
    // SAFETY: constant UUIDs are interned by CoreFoundation and never freed.
    unsafe {
        CFUUIDGetConstantUUIDWithBytes(
            std::ptr::null(),
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

fn io_error(path: &Path, code: IoReturn, what: &str) -> OpenError {
    match code {
        IO_RETURN_NOT_PRIVILEGED | IO_RETURN_NOT_PERMITTED => OpenError::PermissionDenied(path.to_path_buf()),
        _ => OpenError::Os {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("{what} (IOReturn {code:#010x})")),
        },
    }
}

fn transport_error(code: IoReturn) -> TransportError {
    match code {
        IO_RETURN_NOT_PRIVILEGED | IO_RETURN_NOT_PERMITTED => TransportError::PermissionDenied,
        IO_RETURN_BUSY | IO_RETURN_EXCLUSIVE_ACCESS => TransportError::DeviceBusy,
        IO_RETURN_TIMEOUT => TransportError::Timeout,
        IO_RETURN_UNSUPPORTED => TransportError::Unsupported("rejected by the SCSITask user client"),
        other => TransportError::Io(other),
    }
}

/// `/dev/disk2` or `/dev/rdisk2` to `disk2`.
fn bsd_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    Some(name.strip_prefix('r').filter(|n| n.starts_with("disk")).unwrap_or(name))
}

/// A SCSITask device interface with its plug-in and registry entry.
pub struct IoKitTransport {
    service: IoObject,
    plugin: *mut *const IUnknownVtbl,
    device: *mut *const ScsiTaskDeviceVtbl,
    path: PathBuf,
}

impl std::fmt::Debug for IoKitTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoKitTransport").field("path", &self.path).finish()
    }
}

impl Drop for IoKitTransport {
    fn drop(&mut self) {
        // SAFETY: both interfaces were obtained in `open` and are released once.
        unsafe {
            ((**self.device).base.release)(self.device.cast());
            ((**self.plugin).release)(self.plugin.cast());
            IOObjectRelease(self.service);
        }
    }
}

impl IoKitTransport {
    pub fn open(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        if kind == DeviceKind::Nvme {
            return Err(OpenError::Unsupported {
                path: path.to_path_buf(),
                reason: "NVMe pass-through is not available on macOS",
            });
        }
        let name = bsd_name(path)
            .and_then(|n| CString::new(n).ok())
            .ok_or_else(|| OpenError::NotADevice(path.to_path_buf()))?;

        // SAFETY: the matching dictionary is consumed by
        // IOServiceGetMatchingService.
        let mut entry = unsafe { IOServiceGetMatchingService(0, IOBSDNameMatching(0, 0, name.as_ptr())) };
        if entry == 0 {
            return Err(OpenError::NotFound(path.to_path_buf()));
        }

        let plane = c"IOService";
        for _ in 0..MAX_PARENT_DEPTH {
            match Self::attach_user_client(entry, path) {
                Ok(Some(transport)) => return Ok(transport),
                Ok(None) => {}
                Err(err) => {
                    // SAFETY: `entry` was not taken by the failed attach.
                    unsafe { IOObjectRelease(entry) };
                    return Err(err);
                }
            }
            let mut parent: IoObject = 0;
            // SAFETY: `entry` is a valid registry entry we own.
            let kr = unsafe { IORegistryEntryGetParentEntry(entry, plane.as_ptr(), &mut parent) };
            // SAFETY: released exactly once; the parent holds its own reference.
            unsafe { IOObjectRelease(entry) };
            if kr != IO_RETURN_SUCCESS {
                break;
            }
            entry = parent;
        }
        Err(OpenError::Unsupported {
            path: path.to_path_buf(),
            reason: "no SCSITask user client above this disk",
        })
    }

    /// Tries the SCSITask user client on `service`. Takes ownership of
    /// `service` only when it succeeds.
    fn attach_user_client(service: IoObject, path: &Path) -> Result<Option<Self>, OpenError> {
        let mut plugin: *mut *const IUnknownVtbl = null_mut();
        let mut score = 0i32;
        // SAFETY: out pointers are valid locals.
        let kr = unsafe {
            IOCreatePlugInInterfaceForService(
                service,
                uuid(SCSI_TASK_DEVICE_USER_CLIENT_TYPE_ID),
                uuid(IO_CF_PLUGIN_INTERFACE_ID),
                &mut plugin,
                &mut score,
            )
        };
        if kr != IO_RETURN_SUCCESS || plugin.is_null() {
            return Ok(None);
        }

        let mut device: *mut c_void = null_mut();
        // SAFETY: `plugin` is a live IOCFPlugInInterface.
        let hr = unsafe {
            ((**plugin).query_interface)(plugin.cast(), CfUuidBytes(SCSI_TASK_DEVICE_INTERFACE_ID), &mut device)
        };
        if hr != 0 || device.is_null() {
            // SAFETY: releasing the plug-in we just created.
            unsafe { ((**plugin).release)(plugin.cast()) };
            return Err(io_error(path, hr, "QueryInterface for SCSITaskDeviceInterface failed"));
        }
        debug!(path = %path.display(), "attached SCSITask user client");
        Ok(Some(Self {
            service,
            plugin,
            device: device.cast(),
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn execute(&mut self, cdb: &[u8], data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        let (direction, address, len) = match data {
            DataPhase::In(buf) => (DATA_TRANSFER_FROM_TARGET, buf.as_mut_ptr() as usize, buf.len()),
            DataPhase::Out(buf) => (DATA_TRANSFER_TO_TARGET, buf.as_ptr() as usize, buf.len()),
            DataPhase::None => (DATA_TRANSFER_NONE, 0, 0),
        };
        let this = self.device.cast::<c_void>();
        // SAFETY: `self.device` stays valid for the transport's lifetime.
        let device = unsafe { &**self.device };

        // SAFETY: plain calls on the live device interface.
        let kr = unsafe { (device.obtain_exclusive_access)(this) };
        if kr != IO_RETURN_SUCCESS {
            return Err(transport_error(kr));
        }
        // SAFETY: as above.
        let task = unsafe { (device.create_scsi_task)(this) };
        let result = if task.is_null() {
            Err(TransportError::Io(IO_RETURN_UNSUPPORTED))
        } else {
            let result = Self::run_task(task, cdb, direction, address, len, timeout);
            // SAFETY: the task was created above and is released once.
            unsafe { ((**task).base.release)(task.cast()) };
            result
        };
        // SAFETY: exclusive access was obtained above.
        unsafe { (device.release_exclusive_access)(this) };
        result
    }

    fn run_task(
        task: *mut *const ScsiTaskVtbl,
        cdb: &[u8],
        direction: u8,
        address: usize,
        len: usize,
        timeout: Duration,
    ) -> Result<Completion, TransportError> {
        let this = task.cast::<c_void>();
        // SAFETY: `task` is a live SCSITaskInterface.
        let vtbl = unsafe { &**task };
        let mut cdb_bytes = [0u8; 16];
        cdb_bytes[..cdb.len()].copy_from_slice(cdb);
        let mut range = IoVirtualRange { address, length: len };
        let mut sense = [0u8; 18];
        let mut task_status = 0u32;
        let mut transferred = 0u64;

        // SAFETY: every pointer refers to a local or to the caller's buffer,
        // all of which outlive the synchronous execution.
        unsafe {
            let kr = (vtbl.set_command_descriptor_block)(this, cdb_bytes.as_mut_ptr(), cdb.len() as u8);
            if kr != IO_RETURN_SUCCESS {
                return Err(transport_error(kr));
            }
            let entries = u8::from(len > 0);
            let kr = (vtbl.set_scatter_gather_entries)(this, &mut range, entries, len as u64, direction);
            if kr != IO_RETURN_SUCCESS {
                return Err(transport_error(kr));
            }
            let kr = (vtbl.set_timeout_duration)(this, u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
            if kr != IO_RETURN_SUCCESS {
                return Err(transport_error(kr));
            }
            let kr = (vtbl.execute_task_sync)(this, sense.as_mut_ptr(), &mut task_status, &mut transferred);
            if kr != IO_RETURN_SUCCESS {
                return Err(transport_error(kr));
            }
        }

        // Values above 0xFF are transport failures rather than SAM status.
        let status = u8::try_from(task_status).map_err(|_| TransportError::Io(task_status as i32))?;
        Ok(Completion {
            bytes_transferred: usize::try_from(transferred).unwrap_or(len).min(len),
            status: Status::Scsi(ScsiStatus {
                status,
                sense: SenseData::new(&sense),
            }),
        })
    }
}

impl Transport for IoKitTransport {
    fn issue(&mut self, command: &Command, data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        match command {
            Command::Scsi(cdb) => self.execute(cdb.as_bytes(), data, timeout),
            Command::NvmeAdmin(_) => Err(TransportError::Unsupported(
                "NVMe pass-through is not available on macOS",
            )),
        }
    }
}

impl Connect for IoKitTransport {
    fn connect(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        Self::open(path, kind)
    }
}

/// `diskutil info` key/value pairs for `device`.
fn diskutil_info(device: &str) -> std::io::Result<Option<Vec<(String, String)>>> {
    let output = Process::new("diskutil").args(["info", device]).output()?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Some(
        stdout
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, val)| (key.trim().to_string(), val.trim().to_string()))
            .collect(),
    ))
}

/// The `Protocol` line of `diskutil info` names the bus.
pub fn detect_kind(path: &Path) -> Result<DeviceKind, OpenError> {
    if !path.exists() {
        return Err(OpenError::NotFound(path.to_path_buf()));
    }
    let device = path.to_string_lossy();
    let info = diskutil_info(&device)
        .map_err(|source| OpenError::Os {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| OpenError::NotADevice(path.to_path_buf()))?;
    let protocol = info
        .iter()
        .find(|(key, _)| key == "Protocol")
        .map(|(_, val)| val.as_str())
        .unwrap_or_default();
    Ok(match protocol {
        "PCI-Express" | "NVMe" | "Apple Fabric" => DeviceKind::Nvme,
        _ => DeviceKind::ScsiAta,
    })
}

/// Whole disks from `diskutil list`.
pub fn discover() -> std::io::Result<Vec<(PathBuf, DeviceKind)>> {
    let output = Process::new("diskutil").arg("list").output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("'diskutil list' failed: {stderr}"),
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter(|line| line.starts_with("/dev/disk"))
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| !is_partition(id))
        .map(|id| {
            let path = PathBuf::from(id);
            let kind = detect_kind(&path).unwrap_or(DeviceKind::ScsiAta);
            (path, kind)
        })
        .collect())
}

/// `/dev/disk0s1` is a slice of `/dev/disk0`.
fn is_partition(device_id: &str) -> bool {
    if let Some(after_disk) = device_id.strip_prefix("/dev/disk") {
        if let Some(s_index) = after_disk.find('s') {
            let slice_part = &after_disk[s_index + 1..];
            return !slice_part.is_empty() && slice_part.chars().all(|c| c.is_ascii_digit());
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions() {
        assert!(is_partition("/dev/disk0s1"));
        assert!(is_partition("/dev/disk10s12"));
        assert!(!is_partition("/dev/disk0"));
        assert!(!is_partition("/dev/disk3"));
        assert!(!is_partition("/dev/diskXs"));
    }

    #[test]
    fn bsd_names() {
        assert_eq!(bsd_name(Path::new("/dev/disk2")), Some("disk2"));
        assert_eq!(bsd_name(Path::new("/dev/rdisk2")), Some("disk2"));
    }

    #[test]
    fn nvme_open_is_unsupported() {
        let Err(err) = IoKitTransport::open(Path::new("/dev/disk3"), DeviceKind::Nvme) else {
            panic!("NVMe open succeeded");
        };
        assert!(matches!(err, OpenError::Unsupported { .. }));
        assert_eq!(crate::SmartError::from(err).kind(), "unsupported");
    }

    #[test]
    fn missing_disk_is_not_found() {
        assert!(matches!(
            detect_kind(Path::new("/dev/disk999")),
            Err(OpenError::NotFound(_))
        ));
    }
}
