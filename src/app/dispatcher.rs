//! Inbound routing.
//!
//! [`ApplicationLayer::dispatch`] is the single entry point for received frames. Each
//! APDU goes to exactly one place:
//!
//! - confirmed and unconfirmed requests to the service handler registered for them
//! - acknowledgements, errors, rejects and server aborts to the pending transaction
//! - segments of segmented requests and ComplexACKs to the reassembler, and from there
//!   back through the same routing once complete
//! - SegmentACKs and client aborts to the windowed sender of a segmented response

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::layer::{split_frame, Shared};
use super::pdu::{
    ComplexAckHeader, ConfirmedRequestHeader, ErrorPdu, RejectPdu, SimpleAckPdu,
    UnconfirmedRequestHeader,
};
use super::segmentation::{SegmentSignal, SegmentedResponse};
use super::transaction::Completion;
use super::{
    plan_segments, Apdu, ApplicationError, ApplicationLayer, MaxSegments, Result, Segment,
    SegmentPlan, TransactionKey,
};
use crate::service::{
    AbortReason, ConfirmedServiceChoice, DecodeFailure, ErrorClass, ErrorCode, RejectReason,
    ServiceAck, ServiceError, UnconfirmedServiceChoice,
};
use crate::transport::Address;
use crate::util::HexFrame;

/// Server side implementation of a confirmed service.
///
/// `decode` runs first; a failure is answered with a Reject when the failure class maps
/// to a reject reason and with an Abort otherwise. `handle` then runs on its own task and
/// answers through the [`ConfirmedReply`]. If it returns an error before answering, the
/// peer receives an Abort with reason Other.
#[async_trait]
pub trait ConfirmedServiceHandler: Send + Sync {
    type Request: Send;

    fn decode(&self, payload: &[u8]) -> std::result::Result<Self::Request, DecodeFailure>;

    async fn handle(
        &self,
        request: Self::Request,
        reply: ConfirmedReply,
    ) -> std::result::Result<(), ServiceError>;
}

/// Server side implementation of an unconfirmed service. Failures are logged; the
/// sender never learns about them.
#[async_trait]
pub trait UnconfirmedServiceHandler: Send + Sync {
    type Request: Send;

    fn decode(&self, payload: &[u8]) -> std::result::Result<Self::Request, DecodeFailure>;

    async fn handle(
        &self,
        source: Address,
        request: Self::Request,
    ) -> std::result::Result<(), ServiceError>;
}

pub(super) enum HandlerFailure {
    Decode(DecodeFailure),
    Service(ServiceError),
}

#[async_trait]
pub(super) trait ErasedConfirmedHandler: Send + Sync {
    async fn invoke(
        &self,
        payload: Bytes,
        reply: ConfirmedReply,
    ) -> std::result::Result<(), HandlerFailure>;
}

#[async_trait]
impl<H: ConfirmedServiceHandler> ErasedConfirmedHandler for H {
    async fn invoke(
        &self,
        payload: Bytes,
        reply: ConfirmedReply,
    ) -> std::result::Result<(), HandlerFailure> {
        let request = self.decode(&payload).map_err(HandlerFailure::Decode)?;
        match self.handle(request, reply).await {
            Ok(()) => Ok(()),
            Err(ServiceError::Decode(failure)) => Err(HandlerFailure::Decode(failure)),
            Err(e) => Err(HandlerFailure::Service(e)),
        }
    }
}

#[async_trait]
pub(super) trait ErasedUnconfirmedHandler: Send + Sync {
    async fn invoke(&self, source: Address, payload: Bytes)
        -> std::result::Result<(), ServiceError>;
}

#[async_trait]
impl<H: UnconfirmedServiceHandler> ErasedUnconfirmedHandler for H {
    async fn invoke(
        &self,
        source: Address,
        payload: Bytes,
    ) -> std::result::Result<(), ServiceError> {
        let request = self.decode(&payload)?;
        self.handle(source, request).await
    }
}

struct ReplyContext {
    shared: Arc<Shared>,
    source: Address,
    invoke_id: u8,
    service_choice: u8,
    max_segments: MaxSegments,
    max_apdu: usize,
    responded: AtomicBool,
}

/// Answers one confirmed request. Only the first answer is sent; clones share that
/// guarantee.
#[derive(Clone)]
pub struct ConfirmedReply {
    context: Arc<ReplyContext>,
}

impl std::fmt::Debug for ConfirmedReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmedReply")
            .field("source", &self.context.source)
            .field("invoke_id", &self.context.invoke_id)
            .field("service_choice", &self.context.service_choice)
            .field("max_segments", &self.context.max_segments)
            .field("max_apdu", &self.context.max_apdu)
            .field("responded", &self.has_responded())
            .finish()
    }
}

impl ConfirmedReply {
    pub fn source(&self) -> &Address {
        &self.context.source
    }

    pub fn invoke_id(&self) -> u8 {
        self.context.invoke_id
    }

    pub fn service_choice(&self) -> u8 {
        self.context.service_choice
    }

    /// Segments the client accepts in the answer. `Unspecified` means the answer must
    /// fit one frame.
    pub fn max_segments(&self) -> MaxSegments {
        self.context.max_segments
    }

    /// Largest APDU the client and the transport both accept
    pub fn max_apdu(&self) -> usize {
        self.context.max_apdu
    }

    pub fn has_responded(&self) -> bool {
        self.context.responded.load(Ordering::SeqCst)
    }

    fn claim(&self) -> Result<()> {
        if self.context.responded.swap(true, Ordering::SeqCst) {
            return Err(ApplicationError::TransactionError(format!(
                "invoke ID {} from {} already answered",
                self.context.invoke_id, self.context.source
            )));
        }
        Ok(())
    }

    async fn send(&self, apdu: &[u8]) -> Result<()> {
        self.context
            .shared
            .send_apdu(&self.context.source, apdu, false)
            .await
    }

    pub async fn simple_ack(&self) -> Result<()> {
        self.claim()?;
        let mut apdu = BytesMut::with_capacity(3);
        SimpleAckPdu {
            invoke_id: self.context.invoke_id,
            service_choice: self.context.service_choice,
        }
        .encode(&mut apdu);
        self.send(&apdu).await
    }

    /// Answer with a ComplexACK, segmenting it when it does not fit one frame.
    ///
    /// When the client cannot take the answer the exchange is aborted and
    /// [`ApplicationError::SegmentationRefused`] is returned.
    pub async fn complex_ack(&self, payload: Bytes) -> Result<()> {
        self.claim()?;
        let context = &self.context;
        let shared = &context.shared;
        let max_segments = if shared.config.segmentation.can_transmit() {
            context.max_segments
        } else {
            MaxSegments::Unspecified
        };

        match plan_segments(&payload, context.max_apdu, max_segments) {
            SegmentPlan::Single => {
                let mut apdu = BytesMut::with_capacity(3 + payload.len());
                ComplexAckHeader {
                    segment: None,
                    invoke_id: context.invoke_id,
                    service_choice: context.service_choice,
                }
                .encode(&mut apdu);
                apdu.extend_from_slice(&payload);
                self.send(&apdu).await
            }
            SegmentPlan::Segmented(segments) => {
                SegmentedResponse::new(
                    shared.clone(),
                    context.source.clone(),
                    context.invoke_id,
                    context.service_choice,
                    segments,
                )
                .start()
                .await
            }
            SegmentPlan::Refused(reason) => {
                log::debug!(
                    "{} byte answer to invoke ID {} does not fit {} bytes x {:?}",
                    payload.len(),
                    context.invoke_id,
                    context.max_apdu,
                    max_segments
                );
                shared.record(|stats| stats.segmentation_errors += 1);
                shared
                    .send_abort(&context.source, context.invoke_id, true, reason)
                    .await?;
                Err(ApplicationError::SegmentationRefused(reason))
            }
        }
    }

    pub async fn error(&self, class: ErrorClass, code: ErrorCode) -> Result<()> {
        self.claim()?;
        let mut apdu = BytesMut::with_capacity(8);
        ErrorPdu {
            invoke_id: self.context.invoke_id,
            service_choice: self.context.service_choice,
            error_class: class,
            error_code: code,
        }
        .encode(&mut apdu);
        self.send(&apdu).await
    }

    pub async fn reject(&self, reason: RejectReason) -> Result<()> {
        self.claim()?;
        send_reject(
            &self.context.shared,
            &self.context.source,
            self.context.invoke_id,
            reason,
        )
        .await
    }

    pub async fn abort(&self, reason: AbortReason) -> Result<()> {
        self.claim()?;
        self.context
            .shared
            .send_abort(&self.context.source, self.context.invoke_id, true, reason)
            .await
    }
}

async fn send_reject(
    shared: &Shared,
    destination: &Address,
    invoke_id: u8,
    reason: RejectReason,
) -> Result<()> {
    let mut apdu = BytesMut::with_capacity(3);
    RejectPdu { invoke_id, reason }.encode(&mut apdu);
    log::debug!(
        "Rejecting invoke ID {} from {}: {}",
        invoke_id,
        destination,
        reason
    );
    shared.send_apdu(destination, &apdu, false).await
}

/// Answer a failed handler unless it already answered
async fn answer_failure(reply: &ConfirmedReply, failure: Option<HandlerFailure>) {
    if reply.has_responded() {
        return;
    }

    let result = match failure {
        Some(HandlerFailure::Decode(failure)) => match failure.reject_reason() {
            Some(reason) => reply.reject(reason).await,
            None => reply.abort(AbortReason::Other).await,
        },
        _ => reply.abort(AbortReason::Other).await,
    };
    if let Err(e) = result {
        log::warn!(
            "Failed to answer invoke ID {} from {}: {}",
            reply.invoke_id(),
            reply.source(),
            e
        );
    }
}

impl ApplicationLayer {
    /// Route one received frame. Frames that cannot be decoded are logged and dropped.
    pub async fn dispatch(&self, frame: Bytes, source: Address) {
        log::trace!("RX {} from {}", HexFrame(&frame), source);
        let shared = &self.shared;

        let (npdu, apdu) = match split_frame(&frame) {
            Ok(parts) => parts,
            Err(e) => {
                log::debug!("Dropping frame from {}: {}", source, e);
                shared.record(|stats| stats.unknown_apdus += 1);
                return;
            }
        };
        if npdu.is_network_message() {
            log::trace!("Ignoring network layer message from {}", source);
            return;
        }

        let source = match npdu.source {
            Some(route) => Address::routed(source.link, route),
            None => source,
        };

        let apdu = match Apdu::decode(apdu) {
            Ok(apdu) => apdu,
            Err(e) => {
                log::debug!("Dropping APDU from {}: {}", source, e);
                shared.record(|stats| stats.unknown_apdus += 1);
                return;
            }
        };
        shared.record(|stats| stats.apdus_received += 1);

        self.process_apdu(apdu, source).await;
    }

    async fn process_apdu(&self, apdu: Apdu, source: Address) {
        let shared = &self.shared;
        match apdu {
            Apdu::ConfirmedRequest { header, payload } => {
                if header.segment.is_none() {
                    self.process_confirmed_request(header, payload, source);
                    return;
                }
                if !shared.config.segmentation.can_receive() {
                    self.abort_quietly(
                        &source,
                        header.invoke_id,
                        true,
                        AbortReason::SegmentationNotSupported,
                    )
                    .await;
                    return;
                }
                if let Some(segment) = Segment::from_request(&header, payload) {
                    if let Some(message) = self.process_segment(&source, segment).await {
                        self.dispatch_reassembled(message, source).await;
                    }
                }
            }
            Apdu::UnconfirmedRequest { header, payload } => {
                self.process_unconfirmed_request(header, payload, source)
            }
            Apdu::SimpleAck(pdu) => {
                shared.record(|stats| stats.simple_acks += 1);
                self.complete(
                    source,
                    pdu.invoke_id,
                    Completion::Ack(ServiceAck::Simple {
                        service_choice: pdu.service_choice,
                    }),
                );
            }
            Apdu::ComplexAck { header, payload } => {
                if header.segment.is_none() {
                    self.process_complex_ack(header, payload, source);
                    return;
                }
                let key = TransactionKey::new(source.clone(), header.invoke_id);
                if !shared.transactions.touch(&key) {
                    log::debug!(
                        "Segment of invoke ID {} from {} matches no pending request",
                        header.invoke_id,
                        source
                    );
                    return;
                }
                if !shared.config.segmentation.can_receive() {
                    self.abort_quietly(
                        &source,
                        header.invoke_id,
                        false,
                        AbortReason::SegmentationNotSupported,
                    )
                    .await;
                    shared.transactions.complete(
                        &key,
                        Completion::Failed("peer segmented its answer".to_string()),
                    );
                    return;
                }
                if let Some(segment) = Segment::from_complex_ack(&header, payload) {
                    if let Some(message) = self.process_segment(&source, segment).await {
                        self.dispatch_reassembled(message, source).await;
                    }
                }
            }
            Apdu::SegmentAck(pdu) => {
                shared.record(|stats| stats.segment_acks += 1);
                let _ = shared.listeners.send((source.clone(), pdu));
                if pdu.server {
                    log::debug!(
                        "Unexpected SegmentACK for client invoke ID {} from {}",
                        pdu.invoke_id,
                        source
                    );
                    return;
                }
                let key = TransactionKey::new(source, pdu.invoke_id);
                if !shared.segment_acks.route(&key, SegmentSignal::Ack(pdu)) {
                    log::debug!(
                        "SegmentACK for invoke ID {} from {} matches no segmented response",
                        key.invoke_id,
                        key.address
                    );
                }
            }
            Apdu::Error(pdu) => {
                shared.record(|stats| stats.errors += 1);
                self.complete(
                    source,
                    pdu.invoke_id,
                    Completion::Error {
                        service: pdu.service_choice,
                        class: pdu.error_class,
                        code: pdu.error_code,
                    },
                );
            }
            Apdu::Reject(pdu) => {
                shared.record(|stats| stats.rejects += 1);
                self.complete(source, pdu.invoke_id, Completion::Reject(pdu.reason));
            }
            Apdu::Abort(pdu) => {
                shared.record(|stats| stats.aborts += 1);
                if pdu.server {
                    shared.reassembler.discard(&source, pdu.invoke_id, true);
                    self.complete(
                        source,
                        pdu.invoke_id,
                        Completion::Abort {
                            server: true,
                            reason: pdu.reason,
                        },
                    );
                } else {
                    shared.reassembler.discard(&source, pdu.invoke_id, false);
                    let key = TransactionKey::new(source, pdu.invoke_id);
                    shared
                        .segment_acks
                        .route(&key, SegmentSignal::Abort(pdu.reason));
                }
            }
        }
    }

    /// Route a message completed by the reassembler
    async fn dispatch_reassembled(&self, message: Bytes, source: Address) {
        match Apdu::decode(message) {
            Ok(Apdu::ConfirmedRequest { header, payload }) => {
                self.process_confirmed_request(header, payload, source)
            }
            Ok(Apdu::ComplexAck { header, payload }) => {
                self.process_complex_ack(header, payload, source)
            }
            Ok(other) => log::debug!(
                "Reassembled unexpected {:?} from {}",
                other.apdu_type(),
                source
            ),
            Err(e) => log::debug!("Reassembled undecodable APDU from {}: {}", source, e),
        }
    }

    /// Feed a segment to the reassembler, acknowledging it as required. Returns the
    /// complete message once the last segment is in.
    async fn process_segment(&self, source: &Address, segment: Segment) -> Option<Bytes> {
        let shared = &self.shared;
        shared.record(|stats| stats.segments_received += 1);
        let invoke_id = segment.invoke_id;
        let from_server = segment.server;

        match shared.reassembler.accept(source, segment) {
            Ok(receipt) => {
                if let Some(ack) = receipt.ack {
                    let mut apdu = BytesMut::with_capacity(4);
                    ack.encode(&mut apdu);
                    if let Err(e) = shared.send_apdu(source, &apdu, false).await {
                        log::warn!("Failed to send SegmentACK to {}: {}", source, e);
                    }
                }
                receipt.reassembled
            }
            Err(e) => {
                log::warn!(
                    "Abandoning segmented invoke ID {} from {}: {}",
                    invoke_id,
                    source,
                    e
                );
                shared.record(|stats| stats.segmentation_errors += 1);
                self.abort_quietly(source, invoke_id, !from_server, e.abort_reason())
                    .await;
                if from_server {
                    shared.transactions.complete(
                        &TransactionKey::new(source.clone(), invoke_id),
                        Completion::Failed(e.to_string()),
                    );
                }
                None
            }
        }
    }

    fn process_confirmed_request(
        &self,
        header: ConfirmedRequestHeader,
        payload: Bytes,
        source: Address,
    ) {
        let shared = self.shared.clone();
        shared.record(|stats| stats.confirmed_requests += 1);

        let handler = ConfirmedServiceChoice::try_from(header.service_choice)
            .ok()
            .and_then(|service| shared.confirmed.get(&service).map(|h| h.value().clone()));
        let Some(handler) = handler else {
            tokio::spawn(async move {
                if let Err(e) = send_reject(
                    &shared,
                    &source,
                    header.invoke_id,
                    RejectReason::UnrecognizedService,
                )
                .await
                {
                    log::warn!("Failed to reject invoke ID {}: {}", header.invoke_id, e);
                }
            });
            return;
        };

        let max_segments = match (header.segmented_response_accepted, header.max_segments) {
            (false, _) => MaxSegments::Unspecified,
            (true, MaxSegments::Unspecified) => MaxSegments::GreaterThan64,
            (true, max_segments) => max_segments,
        };
        let max_apdu = header
            .max_apdu
            .size()
            .min(shared.transport.max_apdu_length());

        let reply = ConfirmedReply {
            context: Arc::new(ReplyContext {
                shared,
                source,
                invoke_id: header.invoke_id,
                service_choice: header.service_choice,
                max_segments,
                max_apdu,
                responded: AtomicBool::new(false),
            }),
        };

        tokio::spawn(async move {
            let handler_reply = reply.clone();
            let outcome =
                tokio::spawn(async move { handler.invoke(payload, handler_reply).await }).await;

            match outcome {
                Ok(Ok(())) => {
                    if !reply.has_responded() {
                        log::debug!(
                            "Handler for invoke ID {} from {} returned without answering",
                            reply.invoke_id(),
                            reply.source()
                        );
                    }
                }
                Ok(Err(HandlerFailure::Decode(failure))) => {
                    log::debug!(
                        "Cannot decode service {} from {}: {}",
                        reply.service_choice(),
                        reply.source(),
                        failure
                    );
                    answer_failure(&reply, Some(HandlerFailure::Decode(failure))).await;
                }
                Ok(Err(HandlerFailure::Service(e))) => {
                    log::warn!(
                        "Service {} for {} failed: {}",
                        reply.service_choice(),
                        reply.source(),
                        e
                    );
                    answer_failure(&reply, Some(HandlerFailure::Service(e))).await;
                }
                Err(e) => {
                    log::warn!(
                        "Handler for service {} from {} panicked: {}",
                        reply.service_choice(),
                        reply.source(),
                        e
                    );
                    answer_failure(&reply, None).await;
                }
            }
        });
    }

    fn process_unconfirmed_request(
        &self,
        header: UnconfirmedRequestHeader,
        payload: Bytes,
        source: Address,
    ) {
        let shared = &self.shared;
        shared.record(|stats| stats.unconfirmed_requests += 1);

        let Ok(service) = UnconfirmedServiceChoice::try_from(header.service_choice) else {
            log::debug!(
                "Unknown unconfirmed service {} from {}",
                header.service_choice,
                source
            );
            return;
        };
        let Some(handler) = shared.unconfirmed.get(&service).map(|h| h.value().clone()) else {
            log::trace!("No handler for {:?} from {}", service, source);
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = handler.invoke(source.clone(), payload).await {
                log::warn!("{:?} from {} failed: {}", service, source, e);
            }
        });
    }

    fn process_complex_ack(&self, header: ComplexAckHeader, payload: Bytes, source: Address) {
        self.shared.record(|stats| stats.complex_acks += 1);
        self.complete(
            source,
            header.invoke_id,
            Completion::Ack(ServiceAck::Complex {
                service_choice: header.service_choice,
                payload,
            }),
        );
    }

    fn complete(&self, source: Address, invoke_id: u8, completion: Completion) {
        let key = TransactionKey::new(source, invoke_id);
        if !self.shared.transactions.complete(&key, completion) {
            log::debug!(
                "Answer for invoke ID {} from {} matches no pending request",
                key.invoke_id,
                key.address
            );
        }
    }

    async fn abort_quietly(
        &self,
        destination: &Address,
        invoke_id: u8,
        server: bool,
        reason: AbortReason,
    ) {
        if let Err(e) = self
            .shared
            .send_abort(destination, invoke_id, server, reason)
            .await
        {
            log::warn!(
                "Failed to abort invoke ID {} with {}: {}",
                invoke_id,
                destination,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::pdu::{AbortPdu, SegmentAckPdu, SegmentHeader};
    use crate::app::{ApplicationConfig, InvokeIdAllocator, MaxApduSize, Segmentation};
    use crate::network::{NetworkAddress, Npdu, NpduControl};
    use crate::transport::{DataLinkAddress, MemoryTransport, Transport};
    use std::time::Duration;

    struct Recorder(tokio::sync::mpsc::UnboundedSender<(Address, Bytes)>);

    #[async_trait]
    impl UnconfirmedServiceHandler for Recorder {
        type Request = Bytes;

        fn decode(&self, payload: &[u8]) -> std::result::Result<Bytes, DecodeFailure> {
            Ok(Bytes::copy_from_slice(payload))
        }

        async fn handle(
            &self,
            source: Address,
            request: Bytes,
        ) -> std::result::Result<(), ServiceError> {
            self.0
                .send((source, request))
                .map_err(|_| ServiceError::UnsupportedService)
        }
    }

    struct Answer(Bytes);

    #[async_trait]
    impl ConfirmedServiceHandler for Answer {
        type Request = ();

        fn decode(&self, _payload: &[u8]) -> std::result::Result<(), DecodeFailure> {
            Ok(())
        }

        async fn handle(
            &self,
            _request: (),
            reply: ConfirmedReply,
        ) -> std::result::Result<(), ServiceError> {
            reply
                .complex_ack(self.0.clone())
                .await
                .map_err(|e| ServiceError::EncodingError(e.to_string()))
        }
    }

    fn frame(apdu: &[u8]) -> Bytes {
        let mut frame = BytesMut::new();
        Npdu::new().encode(&mut frame);
        frame.extend_from_slice(apdu);
        frame.freeze()
    }

    async fn next_apdu(peer: &MemoryTransport) -> Apdu {
        let (frame, _) = peer.receive().await.unwrap();
        let (_, apdu) = split_frame(&frame).unwrap();
        Apdu::decode(apdu).unwrap()
    }

    fn local(config: ApplicationConfig) -> (ApplicationLayer, MemoryTransport) {
        let (a, b) = MemoryTransport::pair();
        (
            ApplicationLayer::with_allocator(Arc::new(a), config, InvokeIdAllocator::new(0)),
            b,
        )
    }

    fn request_segment(sequence_number: u8, more_follows: bool, content: &[u8]) -> Bytes {
        let mut apdu = BytesMut::new();
        ConfirmedRequestHeader {
            segment: Some(SegmentHeader {
                sequence_number,
                proposed_window_size: 2,
                more_follows,
            }),
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up1476,
            invoke_id: 40,
            service_choice: ConfirmedServiceChoice::ReadProperty.into(),
        }
        .encode(&mut apdu);
        apdu.extend_from_slice(content);
        frame(&apdu)
    }

    #[tokio::test]
    async fn test_unconfirmed_request_reaches_handler() {
        let (app, peer) = local(ApplicationConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        app.register_unconfirmed(UnconfirmedServiceChoice::WhoIs, Recorder(tx));

        app.dispatch(frame(&[0x10, 0x08, 0x09, 0x01]), peer.address().clone())
            .await;
        let (source, request) = rx.recv().await.unwrap();
        assert_eq!(&source, peer.address());
        assert_eq!(&request[..], &[0x09, 0x01]);
        assert_eq!(app.statistics().unconfirmed_requests, 1);
    }

    #[tokio::test]
    async fn test_routed_source_is_kept() {
        let (app, peer) = local(ApplicationConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        app.register_unconfirmed(UnconfirmedServiceChoice::IAm, Recorder(tx));

        let mut routed = BytesMut::new();
        Npdu {
            control: NpduControl {
                source_present: true,
                ..Default::default()
            },
            source: Some(NetworkAddress::new(9, vec![0x21])),
            ..Npdu::new()
        }
        .encode(&mut routed);
        routed.extend_from_slice(&[0x10, 0x00]);
        app.dispatch(routed.freeze(), peer.address().clone()).await;

        let (source, _) = rx.recv().await.unwrap();
        assert_eq!(
            source,
            Address::routed(DataLinkAddress::Mac(vec![0x02]), NetworkAddress::new(9, vec![0x21]))
        );
    }

    #[tokio::test]
    async fn test_garbage_is_counted_and_dropped() {
        let (app, peer) = local(ApplicationConfig::default());
        app.dispatch(Bytes::from_static(&[0x01]), peer.address().clone())
            .await;
        app.dispatch(frame(&[0x90]), peer.address().clone()).await;
        let stats = app.statistics();
        assert_eq!(stats.unknown_apdus, 2);
        assert_eq!(stats.apdus_received, 0);
    }

    #[tokio::test]
    async fn test_segmented_request_is_reassembled() {
        let (app, peer) = local(ApplicationConfig::default());
        app.register_confirmed(
            ConfirmedServiceChoice::ReadProperty,
            Answer(Bytes::from_static(b"ok")),
        );

        app.dispatch(request_segment(0, true, b"ab"), peer.address().clone())
            .await;
        match next_apdu(&peer).await {
            Apdu::SegmentAck(ack) => {
                assert_eq!(ack.sequence_number, 0);
                assert!(ack.server);
                assert_eq!(ack.invoke_id, 40);
            }
            other => panic!("expected SegmentACK, got {:?}", other),
        }

        app.dispatch(request_segment(1, false, b"cd"), peer.address().clone())
            .await;
        assert!(matches!(next_apdu(&peer).await, Apdu::SegmentAck(ack) if ack.sequence_number == 1));
        match next_apdu(&peer).await {
            Apdu::ComplexAck { header, payload } => {
                assert_eq!(header.invoke_id, 40);
                assert_eq!(header.segment, None);
                assert_eq!(&payload[..], b"ok");
            }
            other => panic!("expected ComplexACK, got {:?}", other),
        }
        assert_eq!(app.statistics().confirmed_requests, 1);
    }

    #[tokio::test]
    async fn test_segmented_request_without_receive_support() {
        let (app, peer) = local(ApplicationConfig {
            segmentation: Segmentation::Transmit,
            ..Default::default()
        });
        app.dispatch(request_segment(0, true, b"ab"), peer.address().clone())
            .await;
        assert_eq!(
            next_apdu(&peer).await,
            Apdu::Abort(AbortPdu {
                server: true,
                invoke_id: 40,
                reason: AbortReason::SegmentationNotSupported,
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_answer_to_non_segmenting_peer_is_aborted() {
        let (app, peer) = local(ApplicationConfig::default());
        app.register_confirmed(
            ConfirmedServiceChoice::ReadProperty,
            Answer(Bytes::from(vec![1u8; 600])),
        );

        let mut apdu = BytesMut::new();
        ConfirmedRequestHeader {
            segment: None,
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up480,
            invoke_id: 41,
            service_choice: 12,
        }
        .encode(&mut apdu);
        app.dispatch(frame(&apdu), peer.address().clone()).await;

        assert_eq!(
            next_apdu(&peer).await,
            Apdu::Abort(AbortPdu {
                server: true,
                invoke_id: 41,
                reason: AbortReason::SegmentationNotSupported,
            })
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(app.statistics().apdus_sent, 1);
        assert_eq!(app.statistics().segmentation_errors, 1);
    }

    #[tokio::test]
    async fn test_segment_acks_are_published() {
        let (app, peer) = local(ApplicationConfig::default());
        let mut listener = app.subscribe_segment_acks();

        let ack = SegmentAckPdu {
            negative: false,
            server: true,
            invoke_id: 3,
            sequence_number: 0,
            actual_window_size: 1,
        };
        let mut apdu = BytesMut::new();
        ack.encode(&mut apdu);
        app.dispatch(frame(&apdu), peer.address().clone()).await;

        let (source, received) = listener.recv().await.unwrap();
        assert_eq!(&source, peer.address());
        assert_eq!(received, ack);
        assert_eq!(app.statistics().segment_acks, 1);
        assert_eq!(app.statistics().apdus_sent, 0);
    }

    #[tokio::test]
    async fn test_stray_answers_are_ignored() {
        let (app, peer) = local(ApplicationConfig::default());
        let mut apdu = BytesMut::new();
        SimpleAckPdu {
            invoke_id: 99,
            service_choice: 15,
        }
        .encode(&mut apdu);
        app.dispatch(frame(&apdu), peer.address().clone()).await;
        assert_eq!(app.statistics().simple_acks, 1);
        assert_eq!(app.pending_transactions(), 0);
        assert_eq!(app.transport().max_apdu_length(), crate::BACNET_MAX_APDU);
    }
}
