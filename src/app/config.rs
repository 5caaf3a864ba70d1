use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{MaxApduSize, MaxSegments};

/// Segmentation support advertised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    None = 3,
}

impl Segmentation {
    /// Segmented messages may be sent
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    /// Segmented messages may be received
    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }
}

/// Application layer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ApplicationConfig {
    /// Largest APDU this device accepts, announced in outgoing requests
    pub max_apdu: MaxApduSize,
    pub segmentation: Segmentation,
    /// Time to wait for a reply before a confirmed request is resent, in milliseconds
    pub apdu_timeout: u32,
    /// Transmissions of a confirmed request before giving up; zero is treated as one
    pub apdu_retries: u8,
    /// Segments this device accepts in a response, announced in outgoing requests
    pub max_segments: MaxSegments,
    /// Window size proposed when sending and acknowledged when receiving segments
    pub proposed_window_size: u8,
    /// Advertise `proposed_window_size` in SegmentACKs instead of the window the
    /// sender proposed. Acks still follow the sender's window.
    pub force_window_size: bool,
    /// Idle time after which a partial reassembly is discarded, in milliseconds
    pub segment_timeout: u32,
    /// Reassemblies kept in progress at once; the oldest is evicted beyond this
    pub max_concurrent_reassemblies: usize,
    /// Largest message reassembled from segments, in bytes
    pub max_reassembled_length: usize,
}

impl ApplicationConfig {
    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout as u64)
    }

    pub fn segment_timeout(&self) -> Duration {
        Duration::from_millis(self.segment_timeout as u64)
    }

    /// Window size actually used when sending segments
    pub fn window_size(&self) -> u8 {
        self.proposed_window_size.clamp(1, 127)
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            max_apdu: MaxApduSize::Up1476,
            segmentation: Segmentation::Both,
            apdu_timeout: 3000,
            apdu_retries: 3,
            max_segments: MaxSegments::SixtyFour,
            proposed_window_size: 16,
            force_window_size: false,
            segment_timeout: 60_000,
            max_concurrent_reassemblies: 16,
            max_reassembled_length: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_support() {
        assert!(Segmentation::Both.can_transmit());
        assert!(Segmentation::Both.can_receive());
        assert!(Segmentation::Transmit.can_transmit());
        assert!(!Segmentation::Transmit.can_receive());
        assert!(!Segmentation::None.can_transmit());
        assert!(!Segmentation::None.can_receive());
    }

    #[test]
    fn test_defaults() {
        let config = ApplicationConfig::default();
        assert_eq!(config.apdu_timeout(), Duration::from_secs(3));
        assert_eq!(config.apdu_retries, 3);
        assert_eq!(config.window_size(), 16);

        let zero_window = ApplicationConfig {
            proposed_window_size: 0,
            ..config
        };
        assert_eq!(zero_window.window_size(), 1);
    }
}
