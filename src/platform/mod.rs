//! Native pass-through, one module per operating system.
//!
//! Each module exports a transport implementing [`Connect`], a
//! `detect_kind` for paths whose name does not give the protocol away, and a
//! `discover` listing whole disks.
//!
//! [`Connect`]: crate::transport::Connect

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{detect_kind, discover, SgTransport as NativeTransport};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{detect_kind, discover, SptdTransport as NativeTransport};

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::{detect_kind, discover, IoKitTransport as NativeTransport};

#[cfg(not(any(target_os = "linux", windows, target_os = "macos")))]
mod unsupported;
#[cfg(not(any(target_os = "linux", windows, target_os = "macos")))]
pub use unsupported::{detect_kind, discover, UnsupportedTransport as NativeTransport};
