//! Utility Functions Module
//!
//! Small helpers shared by the protocol layers: the [`proprietary_enum!`](crate::proprietary_enum)
//! macro used for BACnet enumerations with proprietary ranges, and frame formatting for
//! trace logging.

mod enum_macros;

use std::fmt;

/// Lazily formatted hex view of a frame, for use in log statements.
///
/// Formatting only happens if the log record is actually emitted, so it is cheap to
/// pass to `log::trace!` on the hot path.
pub struct HexFrame<'a>(pub &'a [u8]);

impl fmt::Display for HexFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes] {}", self.0.len(), hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_frame_display() {
        let frame = [0x81, 0x0A, 0x00, 0x04];
        assert_eq!(HexFrame(&frame).to_string(), "[4 bytes] 810a0004");
        assert_eq!(HexFrame(&[]).to_string(), "[0 bytes] ");
    }
}
