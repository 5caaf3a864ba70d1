//! In-process transport linking two endpoints with channels.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{Address, DataLinkAddress, Result, Transport, TransportError};

/// One end of an in-memory link.
///
/// Every frame sent on one end is delivered to the other, whatever its destination
/// address. The receiving end sees it as coming from the sender's MAC address.
#[derive(Debug)]
pub struct MemoryTransport {
    address: Address,
    outbound: mpsc::UnboundedSender<(Bytes, Address)>,
    inbound: Mutex<mpsc::UnboundedReceiver<(Bytes, Address)>>,
    max_apdu: usize,
    frames_sent: AtomicUsize,
}

impl MemoryTransport {
    /// Create two linked endpoints, `mac:01` and `mac:02`
    pub fn pair() -> (Self, Self) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();

        let a = Self {
            address: Address::local(DataLinkAddress::Mac(vec![0x01])),
            outbound: to_b,
            inbound: Mutex::new(from_b),
            max_apdu: crate::BACNET_MAX_APDU,
            frames_sent: AtomicUsize::new(0),
        };
        let b = Self {
            address: Address::local(DataLinkAddress::Mac(vec![0x02])),
            outbound: to_a,
            inbound: Mutex::new(from_a),
            max_apdu: crate::BACNET_MAX_APDU,
            frames_sent: AtomicUsize::new(0),
        };
        (a, b)
    }

    /// Limit the APDU size this endpoint reports
    pub fn with_max_apdu(mut self, max_apdu: usize) -> Self {
        self.max_apdu = max_apdu;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Number of frames sent from this endpoint so far
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: &[u8], _destination: &Address) -> Result<usize> {
        self.outbound
            .send((Bytes::copy_from_slice(frame), self.address.clone()))
            .map_err(|_| TransportError::Closed)?;
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(frame.len())
    }

    async fn receive(&self) -> Result<(Bytes, Address)> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn broadcast_address(&self) -> Address {
        Address::local(DataLinkAddress::Mac(vec![0xFF]))
    }

    async fn wait_for_all_transmits_flushed(&self, _timeout: Duration) -> bool {
        true
    }

    fn max_apdu_length(&self) -> usize {
        self.max_apdu
    }

    fn header_length(&self) -> usize {
        0
    }

    fn max_buffer_length(&self) -> usize {
        // NPDU with a full routing header in front of the APDU
        self.max_apdu + 21
    }

    fn local_address(&self) -> Result<Address> {
        Ok(self.address.clone())
    }
}
