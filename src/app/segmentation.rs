//! Outbound segmentation of ComplexACKs.
//!
//! [`plan_segments`] decides whether a response fits one frame, must be split, or
//! cannot be sent to the peer at all. A split response is sent by a windowed sender
//! running on its own task: it transmits a window of segments, waits for the peer's
//! SegmentACK and either advances, rewinds to the first unacknowledged segment, or
//! gives up when no acknowledgement arrives in time.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::layer::Shared;
use super::pdu::{
    ComplexAckHeader, SegmentAckPdu, SegmentHeader, COMPLEX_ACK_HEADER_LENGTH,
    SEGMENTED_COMPLEX_ACK_HEADER_LENGTH,
};
use super::{ApplicationError, MaxSegments, Result, TransactionKey, MAX_SEGMENT_COUNT};
use crate::service::AbortReason;
use crate::transport::Address;

/// How a ComplexACK payload is sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentPlan {
    /// Fits one unsegmented frame
    Single,
    /// Segment contents in sequence order
    Segmented(Vec<Bytes>),
    /// Cannot be delivered; the exchange is aborted with this reason
    Refused(AbortReason),
}

/// Plan the transmission of a ComplexACK carrying `payload` to a peer accepting APDUs
/// of `max_apdu` bytes and `max_segments` segments.
///
/// Each segment carries `max_apdu` minus the segmented header of application data.
pub fn plan_segments(payload: &Bytes, max_apdu: usize, max_segments: MaxSegments) -> SegmentPlan {
    if COMPLEX_ACK_HEADER_LENGTH + payload.len() <= max_apdu {
        return SegmentPlan::Single;
    }

    let Some(limit) = max_segments.limit() else {
        return SegmentPlan::Refused(AbortReason::SegmentationNotSupported);
    };

    let capacity = max_apdu.saturating_sub(SEGMENTED_COMPLEX_ACK_HEADER_LENGTH);
    if capacity == 0 {
        return SegmentPlan::Refused(AbortReason::ApduTooLong);
    }

    let count = payload.len().div_ceil(capacity);
    if count > limit.min(MAX_SEGMENT_COUNT) {
        return SegmentPlan::Refused(AbortReason::ApduTooLong);
    }

    SegmentPlan::Segmented(
        (0..count)
            .map(|i| payload.slice(i * capacity..((i + 1) * capacity).min(payload.len())))
            .collect(),
    )
}

/// Inbound event for a windowed sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SegmentSignal {
    Ack(SegmentAckPdu),
    Abort(AbortReason),
}

/// Routes SegmentACKs and Aborts from clients to the sender of the matching
/// segmented response
#[derive(Debug, Clone, Default)]
pub(super) struct SegmentAckRouter {
    routes: Arc<DashMap<TransactionKey, mpsc::Sender<SegmentSignal>>>,
}

/// Keeps a route registered; dropping it removes the route
#[derive(Debug)]
pub(super) struct RouteGuard {
    routes: Arc<DashMap<TransactionKey, mpsc::Sender<SegmentSignal>>>,
    key: TransactionKey,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.remove(&self.key);
    }
}

impl SegmentAckRouter {
    /// Claim the route for `key`; `None` when a segmented response with that key is
    /// already in progress
    pub(super) fn register(
        &self,
        key: TransactionKey,
    ) -> Option<(RouteGuard, mpsc::Receiver<SegmentSignal>)> {
        match self.routes.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (sender, receiver) = mpsc::channel(16);
                vacant.insert(sender);
                let guard = RouteGuard {
                    routes: self.routes.clone(),
                    key,
                };
                Some((guard, receiver))
            }
        }
    }

    /// Deliver `signal` to the sender registered under `key`
    pub(super) fn route(&self, key: &TransactionKey, signal: SegmentSignal) -> bool {
        let sender = self.routes.get(key).map(|sender| sender.clone());
        match sender {
            Some(sender) => sender.try_send(signal).is_ok(),
            None => false,
        }
    }

    #[cfg(test)]
    pub(super) fn is_routed(&self, key: &TransactionKey) -> bool {
        self.routes.contains_key(key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Sending(usize),
    AwaitingAck(usize),
    Complete,
    Aborted,
}

/// A ComplexACK being sent in segments
pub(super) struct SegmentedResponse {
    shared: Arc<Shared>,
    destination: Address,
    invoke_id: u8,
    service_choice: u8,
    segments: Vec<Bytes>,
    proposed_window: u8,
    window: u8,
}

impl SegmentedResponse {
    pub(super) fn new(
        shared: Arc<Shared>,
        destination: Address,
        invoke_id: u8,
        service_choice: u8,
        segments: Vec<Bytes>,
    ) -> Self {
        let proposed_window = shared.config.window_size();
        Self {
            shared,
            destination,
            invoke_id,
            service_choice,
            segments,
            proposed_window,
            window: proposed_window,
        }
    }

    /// Send the first segment and hand the rest of the exchange to a background task
    pub(super) async fn start(self) -> Result<()> {
        let key = TransactionKey::new(self.destination.clone(), self.invoke_id);
        let (guard, signals) = self.shared.segment_acks.register(key).ok_or_else(|| {
            ApplicationError::SegmentationError(format!(
                "segmented response to invoke ID {} from {} already in progress",
                self.invoke_id, self.destination
            ))
        })?;

        log::debug!(
            "Sending {} segments of invoke ID {} to {}",
            self.segments.len(),
            self.invoke_id,
            self.destination
        );
        self.send_segment(0).await?;
        tokio::spawn(self.run(guard, signals));
        Ok(())
    }

    async fn send_segment(&self, index: usize) -> Result<()> {
        let header = ComplexAckHeader {
            segment: Some(SegmentHeader {
                sequence_number: index as u8,
                proposed_window_size: self.window,
                more_follows: index + 1 < self.segments.len(),
            }),
            invoke_id: self.invoke_id,
            service_choice: self.service_choice,
        };

        let content = &self.segments[index];
        let mut buffer =
            BytesMut::with_capacity(SEGMENTED_COMPLEX_ACK_HEADER_LENGTH + content.len());
        header.encode(&mut buffer);
        buffer.extend_from_slice(content);
        self.shared
            .send_apdu(&self.destination, &buffer, false)
            .await
    }

    fn ack_due(&self, index: usize) -> bool {
        index % self.window as usize == 0 || index + 1 == self.segments.len()
    }

    /// Windowed send loop, entered after segment zero went out
    async fn run(mut self, _route: RouteGuard, mut signals: mpsc::Receiver<SegmentSignal>) {
        let timeout = self.shared.config.apdu_timeout();
        let max_rewinds = self.shared.config.apdu_retries.max(1);
        let mut rewinds = 0;
        let mut state = SenderState::AwaitingAck(0);

        loop {
            state = match state {
                SenderState::Sending(index) => match self.send_segment(index).await {
                    Ok(()) if self.ack_due(index) => SenderState::AwaitingAck(index),
                    Ok(()) => SenderState::Sending(index + 1),
                    Err(e) => {
                        log::warn!(
                            "Failed to send segment {} of invoke ID {} to {}: {}",
                            index,
                            self.invoke_id,
                            self.destination,
                            e
                        );
                        SenderState::Aborted
                    }
                },
                SenderState::AwaitingAck(index) => {
                    match self.await_ack(&mut signals, timeout).await {
                        Some(SegmentSignal::Ack(ack)) => {
                            self.window = ack.actual_window_size.clamp(1, self.proposed_window);
                            let acknowledged = ack.sequence_number as usize;
                            if !ack.negative && acknowledged >= index {
                                // Past `index` when a resent segment filled a gap
                                rewinds = 0;
                                if acknowledged + 1 >= self.segments.len() {
                                    SenderState::Complete
                                } else {
                                    SenderState::Sending(acknowledged + 1)
                                }
                            } else if rewinds >= max_rewinds {
                                log::warn!(
                                    "Giving up on invoke ID {} to {} after {} retransmissions",
                                    self.invoke_id,
                                    self.destination,
                                    rewinds
                                );
                                SenderState::Aborted
                            } else {
                                rewinds += 1;
                                let resume = (ack.sequence_number as usize + 1).min(index);
                                log::debug!(
                                    "Peer {} acknowledged segment {} of invoke ID {}, resending from {}",
                                    self.destination,
                                    ack.sequence_number,
                                    self.invoke_id,
                                    resume
                                );
                                SenderState::Sending(resume)
                            }
                        }
                        Some(SegmentSignal::Abort(reason)) => {
                            log::debug!(
                                "Peer {} aborted segmented invoke ID {}: {}",
                                self.destination,
                                self.invoke_id,
                                reason
                            );
                            SenderState::Aborted
                        }
                        None => {
                            log::warn!(
                                "No SegmentACK from {} for segment {} of invoke ID {}",
                                self.destination,
                                index,
                                self.invoke_id
                            );
                            SenderState::Aborted
                        }
                    }
                }
                SenderState::Complete => {
                    log::debug!(
                        "Segmented response to invoke ID {} from {} complete",
                        self.invoke_id,
                        self.destination
                    );
                    break;
                }
                SenderState::Aborted => {
                    self.shared.record(|stats| stats.segmentation_errors += 1);
                    break;
                }
            };
        }
    }

    async fn await_ack(
        &self,
        signals: &mut mpsc::Receiver<SegmentSignal>,
        timeout: Duration,
    ) -> Option<SegmentSignal> {
        if !self
            .shared
            .transport
            .wait_for_all_transmits_flushed(timeout)
            .await
        {
            log::debug!("Transmit queue to {} not flushed in time", self.destination);
        }
        tokio::time::timeout(timeout, signals.recv())
            .await
            .ok()
            .flatten()
    }
}
