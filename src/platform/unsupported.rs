//! Fallback for operating systems without a pass-through implementation.

use crate::device::DeviceKind;
use crate::error::{OpenError, TransportError};
use crate::transport::{Command, Completion, Connect, DataPhase, Transport};
use std::path::{Path, PathBuf};
use std::time::Duration;

const REASON: &str = "no pass-through interface for this operating system";

#[derive(Debug)]
pub enum UnsupportedTransport {}

impl Transport for UnsupportedTransport {
    fn issue(&mut self, _: &Command, _: DataPhase<'_>, _: Duration) -> Result<Completion, TransportError> {
        match *self {}
    }
}

impl Connect for UnsupportedTransport {
    fn connect(path: &Path, _: DeviceKind) -> Result<Self, OpenError> {
        Err(OpenError::Unsupported {
            path: path.to_path_buf(),
            reason: REASON,
        })
    }
}

pub fn detect_kind(path: &Path) -> Result<DeviceKind, OpenError> {
    Err(OpenError::NotADevice(path.to_path_buf()))
}

pub fn discover() -> std::io::Result<Vec<(PathBuf, DeviceKind)>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_is_unsupported() {
        let err = UnsupportedTransport::connect(Path::new("/dev/sda"), DeviceKind::ScsiAta).unwrap_err();
        assert!(matches!(err, OpenError::Unsupported { reason: REASON, .. }));
        assert!(discover().unwrap().is_empty());
    }
}
