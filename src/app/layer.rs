use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::dispatcher::{
    ConfirmedServiceHandler, ErasedConfirmedHandler, ErasedUnconfirmedHandler,
    UnconfirmedServiceHandler,
};
use super::pdu::{AbortPdu, SegmentAckPdu, UnconfirmedRequestHeader};
use super::segmentation::SegmentAckRouter;
use super::transaction::TransactionTable;
use super::{
    ApplicationConfig, ApplicationError, ApplicationStatistics, InvokeIdAllocator, Result,
    SegmentReassembler, TransactionKey,
};
use crate::network::Npdu;
use crate::service::{AbortReason, ConfirmedServiceChoice, UnconfirmedServiceChoice};
use crate::transport::{Address, Transport, TransportError};
use crate::util::HexFrame;

/// State shared by the application layer handle, spawned handlers and segmented senders
pub(super) struct Shared {
    pub(super) transport: Arc<dyn Transport>,
    pub(super) config: ApplicationConfig,
    pub(super) invoke_ids: InvokeIdAllocator,
    pub(super) transactions: TransactionTable,
    pub(super) reassembler: SegmentReassembler,
    pub(super) segment_acks: SegmentAckRouter,
    pub(super) listeners: broadcast::Sender<(Address, SegmentAckPdu)>,
    pub(super) confirmed: DashMap<ConfirmedServiceChoice, Arc<dyn ErasedConfirmedHandler>>,
    pub(super) unconfirmed: DashMap<UnconfirmedServiceChoice, Arc<dyn ErasedUnconfirmedHandler>>,
    stats: Mutex<ApplicationStatistics>,
}

impl Shared {
    /// Frame `apdu` behind an NPDU addressed to `destination` and send it
    pub(super) async fn send_apdu(
        &self,
        destination: &Address,
        apdu: &[u8],
        expecting_reply: bool,
    ) -> Result<()> {
        let mut frame = BytesMut::with_capacity(apdu.len() + 24);
        Npdu::routed(destination.route.clone(), expecting_reply).encode(&mut frame);
        frame.extend_from_slice(apdu);

        log::trace!("TX {} to {}", HexFrame(&frame), destination);
        self.transport.send(&frame, destination).await?;
        self.record(|stats| stats.apdus_sent += 1);
        Ok(())
    }

    pub(super) async fn send_abort(
        &self,
        destination: &Address,
        invoke_id: u8,
        server: bool,
        reason: AbortReason,
    ) -> Result<()> {
        let mut apdu = BytesMut::with_capacity(3);
        AbortPdu {
            server,
            invoke_id,
            reason,
        }
        .encode(&mut apdu);

        log::debug!(
            "Aborting invoke ID {} with {}: {}",
            invoke_id,
            destination,
            reason
        );
        self.send_apdu(destination, &apdu, false).await?;
        self.record(|stats| stats.aborts_sent += 1);
        Ok(())
    }

    pub(super) fn record(&self, update: impl FnOnce(&mut ApplicationStatistics)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut stats);
    }
}

/// BACnet application layer over one transport.
///
/// Acts as client and server at once: outgoing confirmed requests are tracked as
/// [`Transaction`](super::Transaction)s while inbound requests are routed to the
/// registered service handlers. Cloning the handle is cheap; all clones share state.
#[derive(Clone)]
pub struct ApplicationLayer {
    pub(super) shared: Arc<Shared>,
}

impl fmt::Debug for ApplicationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationLayer")
            .field("config", &self.shared.config)
            .field("pending_transactions", &self.shared.transactions.len())
            .field("reassemblies", &self.shared.reassembler.len())
            .field("confirmed_handlers", &self.shared.confirmed.len())
            .field("unconfirmed_handlers", &self.shared.unconfirmed.len())
            .finish()
    }
}

impl ApplicationLayer {
    /// Create an application layer drawing invoke IDs from the process-wide allocator
    pub fn new<T: Transport + 'static>(transport: Arc<T>, config: ApplicationConfig) -> Self {
        Self::with_allocator(transport, config, InvokeIdAllocator::global())
    }

    /// Create an application layer with its own invoke ID allocator
    pub fn with_allocator<T: Transport + 'static>(
        transport: Arc<T>,
        config: ApplicationConfig,
        invoke_ids: InvokeIdAllocator,
    ) -> Self {
        let mut reassembler = SegmentReassembler::new(
            config.segment_timeout(),
            config.max_concurrent_reassemblies,
            config.max_reassembled_length,
        );
        if config.force_window_size {
            reassembler = reassembler.with_window_override(config.window_size());
        }
        let (listeners, _) = broadcast::channel(64);

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                invoke_ids,
                transactions: TransactionTable::default(),
                reassembler,
                segment_acks: SegmentAckRouter::default(),
                listeners,
                confirmed: DashMap::new(),
                unconfirmed: DashMap::new(),
                stats: Mutex::new(ApplicationStatistics::default()),
            }),
        }
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.shared.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Handle confirmed requests for `service` with `handler`, replacing any earlier one
    pub fn register_confirmed<H>(&self, service: ConfirmedServiceChoice, handler: H)
    where
        H: ConfirmedServiceHandler + 'static,
    {
        self.shared.confirmed.insert(service, Arc::new(handler));
    }

    /// Handle unconfirmed requests for `service` with `handler`, replacing any earlier one
    pub fn register_unconfirmed<H>(&self, service: UnconfirmedServiceChoice, handler: H)
    where
        H: UnconfirmedServiceHandler + 'static,
    {
        self.shared.unconfirmed.insert(service, Arc::new(handler));
    }

    /// Send an unconfirmed request
    pub async fn send_unconfirmed(
        &self,
        destination: &Address,
        service: UnconfirmedServiceChoice,
        payload: &[u8],
    ) -> Result<()> {
        let max_apdu = self.shared.transport.max_apdu_length();
        if payload.len() + 2 > max_apdu {
            return Err(ApplicationError::MaxApduLengthExceeded);
        }

        let mut apdu = BytesMut::with_capacity(payload.len() + 2);
        UnconfirmedRequestHeader {
            service_choice: service.into(),
        }
        .encode(&mut apdu);
        apdu.extend_from_slice(payload);
        self.shared.send_apdu(destination, &apdu, false).await
    }

    /// Receive and dispatch frames until the transport closes
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.shared.transport.receive().await {
                Ok((frame, source)) => self.dispatch(frame, source).await,
                Err(TransportError::Closed) => {
                    log::debug!("Transport closed, stopping receive loop");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Every SegmentACK received, whether or not a sender was waiting for it
    pub fn subscribe_segment_acks(&self) -> broadcast::Receiver<(Address, SegmentAckPdu)> {
        self.shared.listeners.subscribe()
    }

    /// Snapshot of the counters
    pub fn statistics(&self) -> ApplicationStatistics {
        self.shared
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Confirmed requests awaiting an answer
    pub fn pending_transactions(&self) -> usize {
        self.shared.transactions.len()
    }

    pub fn is_pending(&self, key: &TransactionKey) -> bool {
        self.shared.transactions.contains(key)
    }
}

/// Split a received frame into its NPDU and APDU
pub(super) fn split_frame(frame: &Bytes) -> Result<(Npdu, Bytes)> {
    let (npdu, length) = Npdu::decode(frame)?;
    Ok((npdu, frame.slice(length..)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::app::pdu::Apdu;
    use crate::app::{ConfirmedReply, MaxSegments, TransactionState};
    use crate::service::{
        ConfirmedService, DecodeFailure, ErrorClass, ErrorCode, RawConfirmedRequest,
        RejectReason, ServiceAck, ServiceError,
    };
    use crate::transport::MemoryTransport;
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    struct Echo;

    #[async_trait]
    impl ConfirmedServiceHandler for Echo {
        type Request = Bytes;

        fn decode(&self, payload: &[u8]) -> std::result::Result<Bytes, DecodeFailure> {
            match payload.first() {
                Some(0xFE) => Err(DecodeFailure::from_status(-2)),
                Some(0xFD) => Err(DecodeFailure::from_status(-7)),
                _ => Ok(Bytes::copy_from_slice(payload)),
            }
        }

        async fn handle(
            &self,
            request: Bytes,
            reply: ConfirmedReply,
        ) -> std::result::Result<(), ServiceError> {
            match request.first() {
                Some(0xFC) => Err(ServiceError::InvalidParameters("no".into())),
                Some(0xFB) => reply
                    .error(ErrorClass::Property, ErrorCode::UnknownProperty)
                    .await
                    .map_err(|e| ServiceError::EncodingError(e.to_string())),
                Some(0xFA) => reply
                    .simple_ack()
                    .await
                    .map_err(|e| ServiceError::EncodingError(e.to_string())),
                _ => {
                    let size = request.len().max(1) * 100;
                    reply
                        .complex_ack(Bytes::from(vec![0x5A; size]))
                        .await
                        .map_err(|e| ServiceError::EncodingError(e.to_string()))
                }
            }
        }
    }

    fn layers(config: ApplicationConfig) -> (ApplicationLayer, ApplicationLayer) {
        let (a, b) = MemoryTransport::pair();
        let client = ApplicationLayer::with_allocator(
            Arc::new(a),
            config.clone(),
            InvokeIdAllocator::new(5),
        );
        let server = ApplicationLayer::with_allocator(Arc::new(b), config, InvokeIdAllocator::new(0));
        server.register_confirmed(ConfirmedServiceChoice::ReadProperty, Echo);

        for layer in [&client, &server] {
            let layer = layer.clone();
            tokio::spawn(async move { layer.run().await });
        }
        (client, server)
    }

    fn server_address() -> Address {
        Address::local(crate::transport::DataLinkAddress::Mac(vec![0x02]))
    }

    fn read(payload: &[u8]) -> RawConfirmedRequest {
        RawConfirmedRequest::new(ConfirmedServiceChoice::ReadProperty, payload.to_vec())
    }

    #[tokio::test]
    async fn test_complex_ack_completes_request() {
        let (client, server) = layers(ApplicationConfig::default());

        let ack = assert_ok!(client.request(&server_address(), &read(&[1, 2, 3])).await);
        assert_eq!(ack.service_choice(), 12);
        assert_eq!(ack.payload(), Bytes::from(vec![0x5A; 300]));

        let stats = client.statistics();
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.complex_acks, 1);
        assert_eq!(server.statistics().confirmed_requests, 1);
        assert_eq!(client.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_simple_ack_and_peer_error() {
        let (client, _server) = layers(ApplicationConfig::default());

        let ack = assert_ok!(client.request(&server_address(), &read(&[0xFA])).await);
        assert_eq!(ack, ServiceAck::Simple { service_choice: 12 });

        let error = assert_err!(client.request(&server_address(), &read(&[0xFB])).await);
        assert!(matches!(
            error,
            ApplicationError::PeerError {
                service: 12,
                class: ErrorClass::Property,
                code: ErrorCode::UnknownProperty,
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_tag_is_rejected() {
        let (client, server) = layers(ApplicationConfig::default());

        let error = assert_err!(client.request(&server_address(), &read(&[0xFE])).await);
        assert!(matches!(
            error,
            ApplicationError::Rejected(RejectReason::InvalidTag)
        ));
        assert_eq!(server.statistics().aborts_sent, 0);

        let error = assert_err!(client.request(&server_address(), &read(&[0xFD])).await);
        assert!(matches!(
            error,
            ApplicationError::Aborted {
                server: true,
                reason: AbortReason::Other
            }
        ));
    }

    #[tokio::test]
    async fn test_handler_failure_aborts() {
        let (client, _server) = layers(ApplicationConfig::default());
        let error = assert_err!(client.request(&server_address(), &read(&[0xFC])).await);
        assert!(matches!(
            error,
            ApplicationError::Aborted {
                server: true,
                reason: AbortReason::Other
            }
        ));
    }

    #[tokio::test]
    async fn test_unregistered_service_is_rejected() {
        let (client, _server) = layers(ApplicationConfig::default());
        let request = RawConfirmedRequest::new(ConfirmedServiceChoice::WriteProperty, vec![1]);
        let error = assert_err!(client.request(&server_address(), &request).await);
        assert!(matches!(
            error,
            ApplicationError::Rejected(RejectReason::UnrecognizedService)
        ));
    }

    #[tokio::test]
    async fn test_segmented_response_end_to_end() {
        let (a, b) = MemoryTransport::pair();
        let client = ApplicationLayer::with_allocator(
            Arc::new(a.with_max_apdu(480)),
            ApplicationConfig {
                proposed_window_size: 2,
                force_window_size: true,
                ..Default::default()
            },
            InvokeIdAllocator::new(0),
        );
        let server = ApplicationLayer::with_allocator(
            Arc::new(b),
            ApplicationConfig::default(),
            InvokeIdAllocator::new(0),
        );
        server.register_confirmed(ConfirmedServiceChoice::ReadProperty, Echo);
        let mut acks = client.subscribe_segment_acks();
        for layer in [&client, &server] {
            let layer = layer.clone();
            tokio::spawn(async move { layer.run().await });
        }

        // 30 bytes of request produce a 3000 byte answer: 7 segments of 475 bytes
        let ack = assert_ok!(client.request(&server_address(), &read(&[7; 30])).await);
        assert_eq!(ack.payload().len(), 3000);
        assert!(ack.payload().iter().all(|b| *b == 0x5A));

        // Let the server take in the final SegmentACK
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = client.statistics();
        assert_eq!(stats.segments_received, 7);
        assert_eq!(stats.segment_acks, 0);
        assert_eq!(server.statistics().segment_acks, 4);
        assert!(acks.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_segmentation_refused_when_peer_does_not_accept() {
        let (client, server) = layers(ApplicationConfig {
            max_segments: MaxSegments::Unspecified,
            segmentation: crate::app::Segmentation::None,
            ..Default::default()
        });

        let error = assert_err!(client.request(&server_address(), &read(&[1; 20])).await);
        assert!(matches!(
            error,
            ApplicationError::Aborted {
                server: true,
                reason: AbortReason::SegmentationNotSupported
            }
        ));
        assert_eq!(server.statistics().aborts_sent, 1);
        // The abort is the only answer the server produced
        assert_eq!(server.statistics().apdus_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound() {
        let (a, b) = MemoryTransport::pair();
        let b = Arc::new(b);
        let client = ApplicationLayer::with_allocator(
            Arc::new(a),
            ApplicationConfig {
                apdu_retries: 3,
                apdu_timeout: 50,
                ..Default::default()
            },
            InvokeIdAllocator::new(0),
        );

        let started = tokio::time::Instant::now();
        let error = assert_err!(client.request(&server_address(), &read(&[1])).await);
        assert!(matches!(error, ApplicationError::Timeout));

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150));
        assert!(elapsed < Duration::from_millis(160));
        assert_eq!(client.statistics().apdus_sent, 3);
        assert_eq!(client.statistics().retries, 2);

        // Three identical frames reached the silent peer
        let mut frames = Vec::new();
        for _ in 0..3 {
            frames.push(b.receive().await.unwrap().0);
        }
        assert!(frames.iter().all(|f| *f == frames[0]));
        assert_eq!(client.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_invoke_id_isolation() {
        let (a, b) = MemoryTransport::pair();
        let b = Arc::new(b);
        let client = ApplicationLayer::with_allocator(
            Arc::new(a),
            ApplicationConfig::default(),
            InvokeIdAllocator::new(0),
        );
        let peer = server_address();

        let mut seven = client
            .begin_request(&peer, ConfirmedServiceChoice::ReadProperty, Bytes::new(), Some(7))
            .await
            .unwrap();
        let mut eight = client
            .begin_request(&peer, ConfirmedServiceChoice::ReadProperty, Bytes::new(), Some(8))
            .await
            .unwrap();
        assert!(matches!(
            client
                .begin_request(&peer, ConfirmedServiceChoice::ReadProperty, Bytes::new(), Some(7))
                .await,
            Err(ApplicationError::DuplicateInvokeId { invoke_id: 7, .. })
        ));

        let mut frame = BytesMut::new();
        Npdu::new().encode(&mut frame);
        crate::app::pdu::SimpleAckPdu {
            invoke_id: 7,
            service_choice: 12,
        }
        .encode(&mut frame);
        client.dispatch(frame.freeze(), peer.clone()).await;

        assert_ok!(client.end_request(&mut seven, Duration::from_millis(10)).await);
        assert_eq!(seven.state(), TransactionState::Completed);
        assert!(matches!(
            client.end_request(&mut eight, Duration::from_millis(10)).await,
            Err(ApplicationError::Timeout)
        ));
        assert_eq!(eight.state(), TransactionState::TimedOut);
        assert_eq!(eight.attempts(), 1);

        // The pair of requests went out untouched
        let (first, _) = b.receive().await.unwrap();
        let (_, apdu) = split_frame(&first).unwrap();
        assert!(matches!(
            Apdu::decode(apdu).unwrap(),
            Apdu::ConfirmedRequest { header, .. } if header.invoke_id == 7
        ));
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused() {
        let (a, _b) = MemoryTransport::pair();
        let client = ApplicationLayer::with_allocator(
            Arc::new(a.with_max_apdu(50)),
            ApplicationConfig::default(),
            InvokeIdAllocator::new(0),
        );
        let request = read(&[0; 47]);
        assert!(matches!(
            client.request(&server_address(), &request).await,
            Err(ApplicationError::MaxApduLengthExceeded)
        ));
        assert_eq!(client.pending_transactions(), 0);
        assert_eq!(request.service_choice(), ConfirmedServiceChoice::ReadProperty);
    }

    #[tokio::test]
    async fn test_run_stops_when_transport_closes() {
        let (a, b) = MemoryTransport::pair();
        let layer = ApplicationLayer::new(Arc::new(a), ApplicationConfig::default());
        drop(b);
        assert_ok!(layer.run().await);
    }
}
