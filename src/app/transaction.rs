//! Pending-transaction table and the confirmed request pattern.
//!
//! Every confirmed request is registered under its [`TransactionKey`] until the
//! dispatcher completes it with the peer's answer. [`ApplicationLayer::begin_request`]
//! sends a request once, [`ApplicationLayer::end_request`] waits for its outcome and
//! [`ApplicationLayer::request`] wraps both in the bounded retry loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};

use super::pdu::ConfirmedRequestHeader;
use super::{ApplicationError, ApplicationLayer, MaxApduSize, MaxSegments, Result};
use crate::service::{
    AbortReason, ConfirmedService, ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason,
    ServiceAck,
};
use crate::transport::Address;

/// Identifies one confirmed exchange: the peer and the invoke ID chosen by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub address: Address,
    pub invoke_id: u8,
}

impl TransactionKey {
    pub fn new(address: Address, invoke_id: u8) -> Self {
        Self { address, invoke_id }
    }
}

/// Client side state of a confirmed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Sent and awaiting an answer
    Sent,
    /// Answered with a SimpleACK or ComplexACK
    Completed,
    /// The last wait ended without an answer; the request may be resent
    TimedOut,
    /// Answered with an Error, Reject or Abort, or failed locally
    Failed,
}

/// Outcome delivered to a waiting transaction by the dispatcher
#[derive(Debug)]
pub(super) enum Completion {
    Ack(ServiceAck),
    Error {
        service: u8,
        class: ErrorClass,
        code: ErrorCode,
    },
    Reject(RejectReason),
    Abort {
        server: bool,
        reason: AbortReason,
    },
    /// The exchange failed on this side, e.g. a segmented answer could not be reassembled
    Failed(String),
}

impl Completion {
    fn into_result(self) -> Result<ServiceAck> {
        match self {
            Completion::Ack(ack) => Ok(ack),
            Completion::Error {
                service,
                class,
                code,
            } => Err(ApplicationError::PeerError {
                service,
                class,
                code,
            }),
            Completion::Reject(reason) => Err(ApplicationError::Rejected(reason)),
            Completion::Abort { server, reason } => {
                Err(ApplicationError::Aborted { server, reason })
            }
            Completion::Failed(message) => Err(ApplicationError::SegmentationError(message)),
        }
    }
}

#[derive(Debug)]
struct PendingSlot {
    generation: u64,
    completion: oneshot::Sender<Completion>,
    progress: Arc<Notify>,
}

#[derive(Debug)]
pub(super) struct Registration {
    generation: u64,
    receiver: oneshot::Receiver<Completion>,
    progress: Arc<Notify>,
}

/// Concurrent map of the confirmed requests awaiting an answer
#[derive(Debug, Clone, Default)]
pub(super) struct TransactionTable {
    slots: Arc<DashMap<TransactionKey, PendingSlot>>,
    generation: Arc<AtomicU64>,
}

impl TransactionTable {
    /// Claim `key`; `None` if another transaction holds it
    pub(super) fn register(&self, key: TransactionKey) -> Option<Registration> {
        match self.slots.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let (completion, receiver) = oneshot::channel();
                let progress = Arc::new(Notify::new());
                vacant.insert(PendingSlot {
                    generation,
                    completion,
                    progress: progress.clone(),
                });
                Some(Registration {
                    generation,
                    receiver,
                    progress,
                })
            }
        }
    }

    /// Hand `completion` to the transaction registered under `key`, removing it.
    /// Returns `false` when no transaction was waiting.
    pub(super) fn complete(&self, key: &TransactionKey, completion: Completion) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => slot.completion.send(completion).is_ok(),
            None => false,
        }
    }

    /// Restart the waiting transaction's timer
    pub(super) fn touch(&self, key: &TransactionKey) -> bool {
        match self.slots.get(key) {
            Some(slot) => {
                slot.progress.notify_one();
                true
            }
            None => false,
        }
    }

    pub(super) fn contains(&self, key: &TransactionKey) -> bool {
        self.slots.contains_key(key)
    }

    pub(super) fn len(&self) -> usize {
        self.slots.len()
    }

    fn release(&self, key: &TransactionKey, generation: u64) {
        self.slots
            .remove_if(key, |_, slot| slot.generation == generation);
    }
}

/// Handle on an outstanding confirmed request.
///
/// Dropping the handle withdraws the request from the transaction table; an answer
/// arriving afterwards is ignored.
#[derive(Debug)]
pub struct Transaction {
    key: TransactionKey,
    service_choice: u8,
    apdu: Bytes,
    generation: u64,
    receiver: oneshot::Receiver<Completion>,
    progress: Arc<Notify>,
    state: TransactionState,
    attempts: u8,
    table: TransactionTable,
}

impl Transaction {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn invoke_id(&self) -> u8 {
        self.key.invoke_id
    }

    pub fn destination(&self) -> &Address {
        &self.key.address
    }

    pub fn service_choice(&self) -> u8 {
        self.service_choice
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of times the request has been sent
    pub fn attempts(&self) -> u8 {
        self.attempts
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Completed | TransactionState::Failed
        )
    }

    /// Wait up to `timeout` for the outcome. The timer restarts whenever a segment of
    /// the answer arrives.
    async fn wait(&mut self, timeout: Duration) -> Result<ServiceAck> {
        if self.is_finished() {
            return Err(ApplicationError::TransactionError(format!(
                "invoke ID {} to {} already finished",
                self.key.invoke_id, self.key.address
            )));
        }

        let outcome = loop {
            let event =
                tokio::time::timeout(timeout, next_event(&mut self.receiver, &self.progress)).await;

            match event {
                Err(_) => break Err(ApplicationError::Timeout),
                Ok(None) => continue,
                Ok(Some(Ok(completion))) => break Ok(completion),
                Ok(Some(Err(_))) => {
                    break Err(ApplicationError::TransactionError(
                        "transaction table closed".to_string(),
                    ))
                }
            }
        };

        match outcome {
            Ok(completion) => {
                let result = completion.into_result();
                self.state = if result.is_ok() {
                    TransactionState::Completed
                } else {
                    TransactionState::Failed
                };
                result
            }
            Err(ApplicationError::Timeout) => {
                self.state = TransactionState::TimedOut;
                Err(ApplicationError::Timeout)
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }
}

/// Next completion, or `None` when progress was reported instead
async fn next_event(
    receiver: &mut oneshot::Receiver<Completion>,
    progress: &Notify,
) -> Option<std::result::Result<Completion, oneshot::error::RecvError>> {
    tokio::select! {
        completion = receiver => Some(completion),
        _ = progress.notified() => None,
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.table.release(&self.key, self.generation);
    }
}

impl ApplicationLayer {
    /// Register and send a confirmed request once.
    ///
    /// Without an explicit `invoke_id` one is allocated, skipping IDs already in use
    /// for `destination`. An explicit ID that is in use is refused.
    pub async fn begin_request(
        &self,
        destination: &Address,
        service: ConfirmedServiceChoice,
        payload: Bytes,
        invoke_id: Option<u8>,
    ) -> Result<Transaction> {
        let shared = &self.shared;
        let max_apdu = shared.transport.max_apdu_length();
        if ConfirmedRequestHeader::UNSEGMENTED_LENGTH + payload.len() > max_apdu {
            return Err(ApplicationError::MaxApduLengthExceeded);
        }

        let (key, registration) = match invoke_id {
            Some(invoke_id) => {
                let key = TransactionKey::new(destination.clone(), invoke_id);
                let registration = shared.transactions.register(key.clone()).ok_or_else(|| {
                    ApplicationError::DuplicateInvokeId {
                        address: destination.clone(),
                        invoke_id,
                    }
                })?;
                (key, registration)
            }
            None => self.register_next(destination)?,
        };

        let config = &shared.config;
        let accept_segments = config.segmentation.can_receive();
        let header = ConfirmedRequestHeader {
            segment: None,
            segmented_response_accepted: accept_segments,
            max_segments: if accept_segments {
                config.max_segments
            } else {
                MaxSegments::Unspecified
            },
            max_apdu: MaxApduSize::fitting(config.max_apdu.size().min(max_apdu)),
            invoke_id: key.invoke_id,
            service_choice: service.into(),
        };
        let mut buffer =
            BytesMut::with_capacity(ConfirmedRequestHeader::UNSEGMENTED_LENGTH + payload.len());
        header.encode(&mut buffer);
        buffer.extend_from_slice(&payload);

        let mut transaction = Transaction {
            key,
            service_choice: header.service_choice,
            apdu: buffer.freeze(),
            generation: registration.generation,
            receiver: registration.receiver,
            progress: registration.progress,
            state: TransactionState::Sent,
            attempts: 0,
            table: shared.transactions.clone(),
        };

        log::debug!(
            "Sending {:?} request with invoke ID {} to {}",
            service,
            transaction.key.invoke_id,
            destination
        );
        shared
            .send_apdu(destination, &transaction.apdu, true)
            .await?;
        transaction.attempts = 1;
        Ok(transaction)
    }

    fn register_next(&self, destination: &Address) -> Result<(TransactionKey, Registration)> {
        let shared = &self.shared;
        for _ in 0..=u8::MAX {
            let key = TransactionKey::new(destination.clone(), shared.invoke_ids.next_id());
            if let Some(registration) = shared.transactions.register(key.clone()) {
                return Ok((key, registration));
            }
        }
        Err(ApplicationError::TransactionError(format!(
            "no free invoke ID for {}",
            destination
        )))
    }

    /// Wait up to `timeout` for the outcome of a request sent with
    /// [`begin_request`](Self::begin_request)
    pub async fn end_request(
        &self,
        transaction: &mut Transaction,
        timeout: Duration,
    ) -> Result<ServiceAck> {
        transaction.wait(timeout).await
    }

    /// Send the identical request again
    pub async fn resend(&self, transaction: &mut Transaction) -> Result<()> {
        if transaction.is_finished() {
            return Err(ApplicationError::TransactionError(format!(
                "invoke ID {} to {} already finished",
                transaction.key.invoke_id, transaction.key.address
            )));
        }

        log::debug!(
            "Resending invoke ID {} to {} (attempt {})",
            transaction.key.invoke_id,
            transaction.key.address,
            transaction.attempts + 1
        );
        self.shared
            .send_apdu(&transaction.key.address, &transaction.apdu, true)
            .await?;
        self.shared.record(|stats| stats.retries += 1);
        transaction.attempts = transaction.attempts.saturating_add(1);
        transaction.state = TransactionState::Sent;
        Ok(())
    }

    /// Perform a confirmed service, retrying on timeout.
    ///
    /// The request is sent up to `apdu_retries` times, waiting `apdu_timeout` for an
    /// answer after each. Errors, rejects and aborts from the peer end the exchange
    /// immediately.
    pub async fn request<S: ConfirmedService>(
        &self,
        destination: &Address,
        service: &S,
    ) -> Result<S::Ack> {
        let mut payload = BytesMut::new();
        service.encode(&mut payload)?;

        let mut transaction = self
            .begin_request(destination, service.service_choice(), payload.freeze(), None)
            .await?;

        let attempts = self.shared.config.apdu_retries.max(1);
        let timeout = self.shared.config.apdu_timeout();
        loop {
            match self.end_request(&mut transaction, timeout).await {
                Ok(ack) => return Ok(service.decode_ack(ack)?),
                Err(ApplicationError::Timeout) if transaction.attempts < attempts => {
                    self.resend(&mut transaction).await?;
                }
                Err(ApplicationError::Timeout) => {
                    log::warn!(
                        "No answer from {} to invoke ID {} after {} attempts",
                        destination,
                        transaction.key.invoke_id,
                        transaction.attempts
                    );
                    return Err(ApplicationError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DataLinkAddress;

    fn key(invoke_id: u8) -> TransactionKey {
        TransactionKey::new(Address::local(DataLinkAddress::Mac(vec![7])), invoke_id)
    }

    fn transaction(table: &TransactionTable, key: TransactionKey) -> Transaction {
        let registration = table.register(key.clone()).unwrap();
        Transaction {
            key,
            service_choice: 12,
            apdu: Bytes::new(),
            generation: registration.generation,
            receiver: registration.receiver,
            progress: registration.progress,
            state: TransactionState::Sent,
            attempts: 1,
            table: table.clone(),
        }
    }

    fn ack() -> Completion {
        Completion::Ack(ServiceAck::Simple { service_choice: 12 })
    }

    #[test]
    fn test_duplicate_registration_refused() {
        let table = TransactionTable::default();
        let _first = table.register(key(1)).unwrap();
        assert!(table.register(key(1)).is_none());
        assert!(table.register(key(2)).is_some());
    }

    #[tokio::test]
    async fn test_completion_matches_invoke_id() {
        let table = TransactionTable::default();
        let mut seven = transaction(&table, key(7));
        let mut eight = transaction(&table, key(8));

        assert!(table.complete(&key(7), ack()));
        assert!(!table.complete(&key(9), ack()));

        let result = seven.wait(Duration::from_millis(10)).await.unwrap();
        assert_eq!(result, ServiceAck::Simple { service_choice: 12 });
        assert_eq!(seven.state(), TransactionState::Completed);

        assert!(table.contains(&key(8)));
        tokio_test::assert_err!(eight.wait(Duration::from_millis(10)).await);
        assert_eq!(eight.state(), TransactionState::TimedOut);
    }

    #[tokio::test]
    async fn test_peer_failures_are_typed() {
        let table = TransactionTable::default();
        let mut rejected = transaction(&table, key(1));
        table.complete(&key(1), Completion::Reject(RejectReason::InvalidTag));
        assert!(matches!(
            rejected.wait(Duration::from_millis(10)).await,
            Err(ApplicationError::Rejected(RejectReason::InvalidTag))
        ));
        assert_eq!(rejected.state(), TransactionState::Failed);

        // A finished transaction cannot be waited on again
        assert!(matches!(
            rejected.wait(Duration::from_millis(10)).await,
            Err(ApplicationError::TransactionError(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_only_own_generation() {
        let table = TransactionTable::default();
        let first = transaction(&table, key(3));
        table.complete(&key(3), ack());
        let second = transaction(&table, key(3));

        drop(first);
        assert!(table.contains(&key(3)));
        drop(second);
        assert!(!table.contains(&key(3)));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_restarts_timer() {
        let table = TransactionTable::default();
        let mut pending = transaction(&table, key(4));

        let toucher = table.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                toucher.touch(&key(4));
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
            toucher.complete(&key(4), ack());
        });

        let started = tokio::time::Instant::now();
        tokio_test::assert_ok!(pending.wait(Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(160));
    }
}
