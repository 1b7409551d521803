//! The encode/decode contract shared by every fixed-layout command and
//! response record.
//!
//! Records are `#[repr(C)]` structs built only from `u8` and `[u8; N]`
//! fields, so they have alignment 1, no padding, and the same layout on every
//! host. Multi-byte fields are stored as byte arrays and converted with an
//! explicit `from_be_bytes` / `from_le_bytes` in their accessors.

use crate::error::MalformedResponse;
use bytemuck::Pod;

pub trait Structure: Pod {
    /// Name used in `MalformedResponse` diagnostics.
    const NAME: &'static str;

    /// Shortest input `decode` accepts. Anything between this and the full
    /// size is zero-extended (e.g. a 36-byte standard INQUIRY reply into the
    /// 96-byte record).
    const MIN_SIZE: usize = core::mem::size_of::<Self>();

    /// The exact on-the-wire bytes of this record.
    fn encode(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self, MalformedResponse> {
        let size = core::mem::size_of::<Self>();
        if bytes.len() < Self::MIN_SIZE {
            return Err(MalformedResponse {
                structure: Self::NAME,
                expected: Self::MIN_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes.len() >= size {
            return Ok(bytemuck::pod_read_unaligned(&bytes[..size]));
        }
        let mut value = Self::zeroed();
        bytemuck::bytes_of_mut(&mut value)[..bytes.len()].copy_from_slice(bytes);
        Ok(value)
    }
}

/// Trims the space/NUL padding of a fixed-width ASCII field.
pub(crate) fn trim_ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == ' ' || c == '\0')
        .to_string()
}

/// Space-pads `value` into a fixed-width field, truncating if necessary.
pub(crate) fn pad_ascii<const N: usize>(value: &str) -> [u8; N] {
    let mut field = [b' '; N];
    for (dst, src) in field.iter_mut().zip(value.bytes()) {
        *dst = src;
    }
    field
}
