//! Windows pass-through.
//!
//! SCSI and ATA PASS-THROUGH CDBs go through `IOCTL_SCSI_PASS_THROUGH_DIRECT`.
//! The storage stack does not let NVMe admin commands through, so the two
//! NVMe commands this crate needs are mapped onto
//! `IOCTL_STORAGE_QUERY_PROPERTY` protocol-specific queries.

use crate::device::DeviceKind;
use crate::error::{OpenError, TransportError};
use crate::nvme::{opcode as nvme_opcode, NvmeAdminCommand};
use crate::sense::{NvmeStatusField, SenseData, SENSE_BUFFER_LEN};
use crate::transport::{Command, Completion, Connect, DataPhase, NvmeStatus, ScsiStatus, Status, Transport};
use std::ffi::c_void;
use std::mem::size_of;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::{null, null_mut};
use std::time::Duration;
use tracing::debug;
use windows_sys::Win32::{
    Foundation::{CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{BusTypeNvme, CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, STORAGE_BUS_TYPE},
    System::Ioctl::{
        NVMeDataTypeIdentify, NVMeDataTypeLogPage, PropertyStandardQuery, ProtocolTypeNvme,
        StorageAdapterProtocolSpecificProperty, StorageDeviceProperty, StorageDeviceProtocolSpecificProperty,
        IOCTL_STORAGE_QUERY_PROPERTY, STORAGE_DEVICE_DESCRIPTOR, STORAGE_PROPERTY_ID, STORAGE_PROPERTY_QUERY,
        STORAGE_PROTOCOL_SPECIFIC_DATA, STORAGE_QUERY_TYPE,
    },
    System::IO::DeviceIoControl,
};

const IOCTL_SCSI_PASS_THROUGH_DIRECT: u32 = 0x0004_D014;

const SCSI_IOCTL_DATA_OUT: u8 = 0;
const SCSI_IOCTL_DATA_IN: u8 = 1;
const SCSI_IOCTL_DATA_UNSPECIFIED: u8 = 2;

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INVALID_DATA: u32 = 13;
const ERROR_INVALID_FUNCTION: u32 = 1;
const ERROR_NOT_SUPPORTED: u32 = 50;
const ERROR_SEM_TIMEOUT: u32 = 121;
const ERROR_BUSY: u32 = 170;

/// `SCSI_PASS_THROUGH_DIRECT` from `ntddscsi.h`.
#[repr(C)]
struct ScsiPassThroughDirect {
    length: u16,
    scsi_status: u8,
    path_id: u8,
    target_id: u8,
    lun: u8,
    cdb_length: u8,
    sense_info_length: u8,
    data_in: u8,
    data_transfer_length: u32,
    time_out_value: u32,
    data_buffer: *mut c_void,
    sense_info_offset: u32,
    cdb: [u8; 16],
}

#[repr(C)]
struct SptdWithSense {
    sptd: ScsiPassThroughDirect,
    sense: [u8; SENSE_BUFFER_LEN],
}

/// `STORAGE_PROPERTY_QUERY` with the protocol-specific request in place of
/// `AdditionalParameters`.
#[repr(C)]
struct ProtocolQuery {
    property_id: STORAGE_PROPERTY_ID,
    query_type: STORAGE_QUERY_TYPE,
    request: STORAGE_PROTOCOL_SPECIFIC_DATA,
}

/// Offset of `ProtocolSpecificData` in `STORAGE_PROTOCOL_DATA_DESCRIPTOR`.
const DESCRIPTOR_HEADER: usize = 8;

struct WindowsDeviceHandle(HANDLE);

impl Drop for WindowsDeviceHandle {
    fn drop(&mut self) {
        if self.0 != INVALID_HANDLE_VALUE {
            // SAFETY: the handle came from CreateFileW and is closed once.
            unsafe { CloseHandle(self.0) };
        }
    }
}

impl std::fmt::Debug for WindowsDeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WindowsDeviceHandle").field(&self.0).finish()
    }
}

fn last_error() -> u32 {
    // SAFETY: reads thread-local state only.
    unsafe { GetLastError() }
}

fn transport_error(code: u32) -> TransportError {
    match code {
        ERROR_ACCESS_DENIED => TransportError::PermissionDenied,
        ERROR_BUSY => TransportError::DeviceBusy,
        ERROR_SEM_TIMEOUT => TransportError::Timeout,
        ERROR_NOT_SUPPORTED | ERROR_INVALID_FUNCTION => {
            TransportError::Unsupported("request not supported by the storage driver")
        }
        other => TransportError::Io(other as i32),
    }
}

fn open_device(path: &Path, access: u32) -> Result<WindowsDeviceHandle, OpenError> {
    let wide_path: Vec<u16> = path.as_os_str().encode_wide().chain(std::iter::once(0)).collect();
    // SAFETY: `wide_path` is NUL terminated and outlives the call.
    let handle = unsafe {
        CreateFileW(
            wide_path.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            null(),
            OPEN_EXISTING,
            0,
            null_mut(),
        )
    };
    if handle != INVALID_HANDLE_VALUE {
        return Ok(WindowsDeviceHandle(handle));
    }
    Err(match last_error() {
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => OpenError::NotFound(path.to_path_buf()),
        ERROR_ACCESS_DENIED => OpenError::PermissionDenied(path.to_path_buf()),
        code => OpenError::Os {
            path: path.to_path_buf(),
            source: std::io::Error::from_raw_os_error(code as i32),
        },
    })
}

/// Issues `code` with separate input and output buffers, returning the
/// number of bytes written to `output`.
fn device_io_control(
    handle: &WindowsDeviceHandle,
    code: u32,
    input: *const c_void,
    input_len: usize,
    output: *mut c_void,
    output_len: usize,
) -> Result<usize, TransportError> {
    let mut bytes_returned: u32 = 0;
    // SAFETY: callers pass buffers valid for the stated lengths.
    let ok = unsafe {
        DeviceIoControl(
            handle.0,
            code,
            input,
            input_len as u32,
            output,
            output_len as u32,
            &mut bytes_returned,
            null_mut(),
        )
    };
    if ok == 0 {
        return Err(transport_error(last_error()));
    }
    Ok(bytes_returned as usize)
}

fn bus_type(handle: &WindowsDeviceHandle) -> Result<STORAGE_BUS_TYPE, TransportError> {
    let query = STORAGE_PROPERTY_QUERY {
        PropertyId: StorageDeviceProperty,
        QueryType: PropertyStandardQuery,
        AdditionalParameters: [0],
    };
    let mut buffer = [0u8; 1024];
    let returned = device_io_control(
        handle,
        IOCTL_STORAGE_QUERY_PROPERTY,
        (&query as *const STORAGE_PROPERTY_QUERY).cast(),
        size_of::<STORAGE_PROPERTY_QUERY>(),
        buffer.as_mut_ptr().cast(),
        buffer.len(),
    )?;
    if returned < size_of::<STORAGE_DEVICE_DESCRIPTOR>() {
        return Err(TransportError::Io(ERROR_NOT_SUPPORTED as i32));
    }
    // SAFETY: at least a full descriptor was written; the read is unaligned.
    let descriptor: STORAGE_DEVICE_DESCRIPTOR =
        unsafe { std::ptr::read_unaligned(buffer.as_ptr().cast()) };
    Ok(descriptor.BusType)
}

/// An open `\\.\PhysicalDriveN` handle.
#[derive(Debug)]
pub struct SptdTransport {
    handle: WindowsDeviceHandle,
    path: PathBuf,
    kind: DeviceKind,
}

impl SptdTransport {
    pub fn open(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        let handle = open_device(path, GENERIC_READ | GENERIC_WRITE)?;
        debug!(path = %path.display(), ?kind, "opened device handle");
        Ok(Self {
            handle,
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scsi(&mut self, cdb: &[u8], data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        let (data_in, buffer, len) = match data {
            DataPhase::In(buf) => (SCSI_IOCTL_DATA_IN, buf.as_mut_ptr().cast::<c_void>(), buf.len()),
            DataPhase::Out(buf) => (SCSI_IOCTL_DATA_OUT, buf.as_ptr().cast_mut().cast::<c_void>(), buf.len()),
            DataPhase::None => (SCSI_IOCTL_DATA_UNSPECIFIED, null_mut(), 0),
        };
        let mut request = SptdWithSense {
            sptd: ScsiPassThroughDirect {
                length: size_of::<ScsiPassThroughDirect>() as u16,
                scsi_status: 0,
                path_id: 0,
                target_id: 0,
                lun: 0,
                cdb_length: cdb.len() as u8,
                sense_info_length: SENSE_BUFFER_LEN as u8,
                data_in,
                data_transfer_length: len as u32,
                // Whole seconds, at least one.
                time_out_value: u32::try_from(timeout.as_secs().max(1)).unwrap_or(u32::MAX),
                data_buffer: buffer,
                sense_info_offset: std::mem::offset_of!(SptdWithSense, sense) as u32,
                cdb: [0; 16],
            },
            sense: [0; SENSE_BUFFER_LEN],
        };
        request.sptd.cdb[..cdb.len()].copy_from_slice(cdb);

        let request_ptr: *mut SptdWithSense = &mut request;
        device_io_control(
            &self.handle,
            IOCTL_SCSI_PASS_THROUGH_DIRECT,
            request_ptr.cast_const().cast(),
            size_of::<SptdWithSense>(),
            request_ptr.cast(),
            size_of::<SptdWithSense>(),
        )?;

        Ok(Completion {
            bytes_transferred: (request.sptd.data_transfer_length as usize).min(len),
            status: Status::Scsi(ScsiStatus {
                status: request.sptd.scsi_status,
                sense: SenseData::new(&request.sense[..usize::from(request.sptd.sense_info_length)
                    .min(SENSE_BUFFER_LEN)]),
            }),
        })
    }

    fn nvme(&mut self, command: &NvmeAdminCommand, data: DataPhase<'_>) -> Result<Completion, TransportError> {
        let DataPhase::In(buf) = data else {
            return Err(TransportError::Unsupported("only data-in NVMe commands are available"));
        };
        let (property, data_type, value, sub_value) = match command.opcode {
            nvme_opcode::IDENTIFY => (
                StorageAdapterProtocolSpecificProperty,
                NVMeDataTypeIdentify,
                command.cdw10() & 0xFF,
                command.nsid(),
            ),
            nvme_opcode::GET_LOG_PAGE => (
                StorageDeviceProtocolSpecificProperty,
                NVMeDataTypeLogPage,
                command.cdw10() & 0xFF,
                0,
            ),
            _ => {
                return Err(TransportError::Unsupported(
                    "only Identify and Get Log Page are available on this platform",
                ))
            }
        };

        let request_offset = size_of::<STORAGE_PROTOCOL_SPECIFIC_DATA>();
        let mut query = ProtocolQuery {
            property_id: property,
            query_type: PropertyStandardQuery,
            // SAFETY: plain integer fields, all-zero is valid.
            request: unsafe { std::mem::zeroed() },
        };
        query.request.ProtocolType = ProtocolTypeNvme;
        query.request.DataType = data_type as u32;
        query.request.ProtocolDataRequestValue = value;
        query.request.ProtocolDataRequestSubValue = sub_value;
        query.request.ProtocolDataOffset = request_offset as u32;
        query.request.ProtocolDataLength = buf.len() as u32;

        let mut output = vec![0u8; DESCRIPTOR_HEADER + request_offset + buf.len()];
        let returned = device_io_control(
            &self.handle,
            IOCTL_STORAGE_QUERY_PROPERTY,
            (&query as *const ProtocolQuery).cast(),
            size_of::<ProtocolQuery>(),
            output.as_mut_ptr().cast(),
            output.len(),
        )?;

        let (copied, result) = protocol_reply(&output[..returned.min(output.len())], buf)?;
        // The driver fails the IOCTL itself when the controller rejects the
        // command, so a reply that got this far completed successfully.
        Ok(Completion {
            bytes_transferred: copied,
            status: Status::Nvme(NvmeStatus {
                field: NvmeStatusField(0),
                result,
            }),
        })
    }
}

/// Copies the payload of a returned `STORAGE_PROTOCOL_DATA_DESCRIPTOR` into
/// `buf`. Returns the bytes copied and `FixedProtocolReturnData` (the
/// completion dword 0).
fn protocol_reply(reply: &[u8], buf: &mut [u8]) -> Result<(usize, u32), TransportError> {
    let malformed = TransportError::Io(ERROR_INVALID_DATA as i32);
    let header_end = DESCRIPTOR_HEADER + size_of::<STORAGE_PROTOCOL_SPECIFIC_DATA>();
    if reply.len() < header_end {
        return Err(malformed);
    }
    let field = |at: usize| {
        let at = DESCRIPTOR_HEADER + at;
        u32::from_le_bytes([reply[at], reply[at + 1], reply[at + 2], reply[at + 3]])
    };
    // ProtocolDataOffset counts from the start of the protocol-specific data.
    let offset = field(16) as usize;
    let length = field(20) as usize;
    if offset < size_of::<STORAGE_PROTOCOL_SPECIFIC_DATA>() {
        return Err(malformed);
    }
    let start = DESCRIPTOR_HEADER + offset;
    if start > reply.len() {
        return Err(malformed);
    }
    let copied = length.min(buf.len()).min(reply.len() - start);
    buf[..copied].copy_from_slice(&reply[start..start + copied]);
    Ok((copied, field(24)))
}

impl Transport for SptdTransport {
    fn issue(&mut self, command: &Command, data: DataPhase<'_>, timeout: Duration) -> Result<Completion, TransportError> {
        match (command, self.kind) {
            (Command::Scsi(cdb), DeviceKind::ScsiAta) => self.scsi(cdb.as_bytes(), data, timeout),
            (Command::NvmeAdmin(cmd), DeviceKind::Nvme) => self.nvme(cmd, data),
            (Command::Scsi(_), DeviceKind::Nvme) => {
                Err(TransportError::Unsupported("SCSI commands on an NVMe device"))
            }
            (Command::NvmeAdmin(_), DeviceKind::ScsiAta) => {
                Err(TransportError::Unsupported("NVMe admin commands on a SCSI device"))
            }
        }
    }
}

impl Connect for SptdTransport {
    fn connect(path: &Path, kind: DeviceKind) -> Result<Self, OpenError> {
        Self::open(path, kind)
    }
}

/// Asks the storage driver which bus the device sits on.
pub fn detect_kind(path: &Path) -> Result<DeviceKind, OpenError> {
    let handle = open_device(path, 0)?;
    match bus_type(&handle) {
        Ok(bus) if bus == BusTypeNvme => Ok(DeviceKind::Nvme),
        Ok(_) => Ok(DeviceKind::ScsiAta),
        Err(err) => {
            debug!(path = %path.display(), %err, "bus type query failed, assuming SCSI");
            Ok(DeviceKind::ScsiAta)
        }
    }
}

/// `\\.\PhysicalDrive0` upwards, stopping at the first number that does
/// not exist.
pub fn discover() -> std::io::Result<Vec<(PathBuf, DeviceKind)>> {
    let mut devices = Vec::new();
    for i in 0..64 {
        let path = PathBuf::from(format!(r"\\.\PhysicalDrive{i}"));
        match detect_kind(&path) {
            Ok(kind) => devices.push((path, kind)),
            Err(OpenError::NotFound(_)) => break,
            Err(err) => {
                debug!(%err, "skipping drive");
            }
        }
    }
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sptd_layout() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(size_of::<ScsiPassThroughDirect>(), 56);
        assert_eq!(size_of::<STORAGE_PROTOCOL_SPECIFIC_DATA>(), 40);
        assert_eq!(std::mem::offset_of!(ProtocolQuery, request), 8);
    }

    #[test]
    fn error_codes() {
        assert_eq!(transport_error(ERROR_ACCESS_DENIED), TransportError::PermissionDenied);
        assert_eq!(transport_error(ERROR_SEM_TIMEOUT), TransportError::Timeout);
        assert_eq!(transport_error(ERROR_BUSY), TransportError::DeviceBusy);
        assert!(matches!(transport_error(ERROR_NOT_SUPPORTED), TransportError::Unsupported(_)));
    }

    fn reply(offset: u32, length: u32, dword0: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; DESCRIPTOR_HEADER + 40];
        out[DESCRIPTOR_HEADER + 16..DESCRIPTOR_HEADER + 20].copy_from_slice(&offset.to_le_bytes());
        out[DESCRIPTOR_HEADER + 20..DESCRIPTOR_HEADER + 24].copy_from_slice(&length.to_le_bytes());
        out[DESCRIPTOR_HEADER + 24..DESCRIPTOR_HEADER + 28].copy_from_slice(&dword0.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn protocol_reply_copies_payload_and_dword0() {
        let mut buf = [0u8; 8];
        let out = reply(40, 4, 0x1234, &[1, 2, 3, 4]);
        assert_eq!(protocol_reply(&out, &mut buf), Ok((4, 0x1234)));
        assert_eq!(buf[..4], [1, 2, 3, 4]);
    }

    #[test]
    fn protocol_reply_is_clipped_to_what_came_back() {
        let mut buf = [0u8; 8];
        let out = reply(40, 512, 0, &[9, 9]);
        assert_eq!(protocol_reply(&out, &mut buf), Ok((2, 0)));
    }

    #[test]
    fn malformed_protocol_reply_is_an_error() {
        let mut buf = [0u8; 8];
        let bad = TransportError::Io(ERROR_INVALID_DATA as i32);
        assert_eq!(protocol_reply(&[0u8; 20], &mut buf), Err(bad));
        assert_eq!(protocol_reply(&reply(8, 4, 0, &[1, 2, 3, 4]), &mut buf), Err(bad));
        assert_eq!(protocol_reply(&reply(400, 4, 0, &[]), &mut buf), Err(bad));
    }

    #[test]
    fn missing_drive_is_not_found() {
        let err = SptdTransport::open(Path::new(r"\\.\PhysicalDrive999"), DeviceKind::ScsiAta).unwrap_err();
        assert!(matches!(err, OpenError::NotFound(_) | OpenError::PermissionDenied(_)));
    }
}
