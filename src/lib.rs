#![doc = include_str!("../README.md")]

pub mod app;
pub mod network;
pub mod service;
pub mod transport;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::{ApplicationConfig, ApplicationError, ApplicationLayer};
pub use service::{ConfirmedServiceChoice, ServiceError, UnconfirmedServiceChoice};
pub use transport::{Address, DataLinkAddress, Transport};

#[doc(hidden)]
pub use pastey;

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
pub const BACNET_MAX_MPDU: usize = 1497;
