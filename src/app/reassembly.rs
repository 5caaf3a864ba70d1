//! Inbound segment reassembly.
//!
//! A peer that segments a confirmed request or a ComplexACK sends it as a series of
//! segments numbered from zero, acknowledging every window. [`SegmentReassembler`]
//! collects the segments per exchange, decides when a SegmentACK is due and hands back
//! the complete message once every segment has arrived.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

use super::pdu::{ComplexAckHeader, ConfirmedRequestHeader, SegmentAckPdu};
use crate::service::AbortReason;
use crate::transport::Address;

/// Reasons a segment cannot be accepted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// The reassembled message would exceed the configured size limit
    #[error("reassembled message of {length} bytes exceeds the limit of {max}")]
    TooLarge { length: usize, max: usize },
}

impl ReassemblyError {
    /// Reason to send when aborting the exchange
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            ReassemblyError::TooLarge { .. } => AbortReason::BufferOverflow,
        }
    }
}

/// One received segment of a segmented ConfirmedRequest or ComplexACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub invoke_id: u8,
    /// Sent by the server of the transaction, i.e. part of a ComplexACK
    pub server: bool,
    pub sequence_number: u8,
    pub proposed_window_size: u8,
    pub more_follows: bool,
    /// Application data carried by this segment
    pub content: Bytes,
    /// Unsegmented form of the PDU header, carried by segment zero so the reassembled
    /// message can be decoded like any other APDU
    pub lead: Option<Bytes>,
}

impl Segment {
    /// Segment of a confirmed request; `None` when the request is not segmented
    pub fn from_request(header: &ConfirmedRequestHeader, content: Bytes) -> Option<Self> {
        let segment = header.segment?;
        let lead = (segment.sequence_number == 0).then(|| {
            let mut buffer = BytesMut::new();
            ConfirmedRequestHeader {
                segment: None,
                ..*header
            }
            .encode(&mut buffer);
            buffer.freeze()
        });

        Some(Self {
            invoke_id: header.invoke_id,
            server: false,
            sequence_number: segment.sequence_number,
            proposed_window_size: segment.proposed_window_size,
            more_follows: segment.more_follows,
            content,
            lead,
        })
    }

    /// Segment of a ComplexACK; `None` when the acknowledgement is not segmented
    pub fn from_complex_ack(header: &ComplexAckHeader, content: Bytes) -> Option<Self> {
        let segment = header.segment?;
        let lead = (segment.sequence_number == 0).then(|| {
            let mut buffer = BytesMut::new();
            ComplexAckHeader {
                segment: None,
                ..*header
            }
            .encode(&mut buffer);
            buffer.freeze()
        });

        Some(Self {
            invoke_id: header.invoke_id,
            server: true,
            sequence_number: segment.sequence_number,
            proposed_window_size: segment.proposed_window_size,
            more_follows: segment.more_follows,
            content,
            lead,
        })
    }
}

/// Outcome of accepting a segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentReceipt {
    /// SegmentACK to send back to the segment's sender
    pub ack: Option<SegmentAckPdu>,
    /// The complete, unsegmented APDU once the last missing segment arrived
    pub reassembled: Option<Bytes>,
}

type AssemblyKey = (Address, u8, bool);

#[derive(Debug)]
struct Assembly {
    segments: BTreeMap<u8, Bytes>,
    lead: Option<Bytes>,
    expected: Option<usize>,
    length: usize,
    started: Instant,
    last_activity: Instant,
}

impl Assembly {
    fn new(now: Instant) -> Self {
        Self {
            segments: BTreeMap::new(),
            lead: None,
            expected: None,
            length: 0,
            started: now,
            last_activity: now,
        }
    }

    /// Highest sequence number up to which every segment has arrived
    fn contiguous(&self) -> Option<u8> {
        let mut last = None;
        for (expected, sequence) in (0..=u8::MAX).zip(self.segments.keys()) {
            if *sequence != expected {
                break;
            }
            last = Some(expected);
        }
        last
    }

    fn is_complete(&self) -> bool {
        match self.expected {
            Some(expected) => {
                self.segments.len() >= expected
                    && self.contiguous().map(|last| last as usize + 1) == Some(expected)
            }
            None => false,
        }
    }

    fn concatenate(&self) -> Bytes {
        let lead = self.lead.as_deref().unwrap_or_default();
        let mut message = BytesMut::with_capacity(lead.len() + self.length);
        message.extend_from_slice(lead);
        for content in self.segments.values() {
            message.extend_from_slice(content);
        }
        message.freeze()
    }
}

/// A reassembled exchange, remembered so retransmitted segments are acknowledged
/// instead of starting over
#[derive(Debug, Clone, Copy)]
struct Finished {
    final_sequence: u8,
    at: Instant,
}

/// Reassembles segmented messages from any number of peers concurrently.
///
/// Exchanges are keyed by source address, invoke ID and sender role, so a peer's
/// segmented request and its segmented response to one of our requests never mix
/// even when they share an invoke ID. Segments are stored by sequence number: a
/// duplicate replaces the earlier copy, and a message is complete only once every
/// sequence number up to the final one is present.
///
/// Completing a message always acknowledges the final segment. Segments that arrive
/// for a completed exchange within the segment timeout are acknowledged the same way
/// and otherwise ignored; segment zero starts a new exchange.
#[derive(Debug)]
pub struct SegmentReassembler {
    assemblies: DashMap<AssemblyKey, Assembly>,
    finished: DashMap<AssemblyKey, Finished>,
    window_override: Option<u8>,
    timeout: Duration,
    max_assemblies: usize,
    max_length: usize,
}

impl SegmentReassembler {
    pub fn new(timeout: Duration, max_assemblies: usize, max_length: usize) -> Self {
        Self {
            assemblies: DashMap::new(),
            finished: DashMap::new(),
            window_override: None,
            timeout,
            max_assemblies: max_assemblies.max(1),
            max_length,
        }
    }

    /// Advertise `window` in acknowledgements instead of the window the sender
    /// proposed. The ack cadence still follows the sender's proposal.
    pub fn with_window_override(mut self, window: u8) -> Self {
        self.window_override = Some(window);
        self
    }

    /// Store a segment received from `source`.
    pub fn accept(
        &self,
        source: &Address,
        segment: Segment,
    ) -> Result<SegmentReceipt, ReassemblyError> {
        let now = Instant::now();
        self.purge_stale(now);

        let key = (source.clone(), segment.invoke_id, segment.server);
        let window = segment.proposed_window_size.max(1);
        let advertised = self.window_override.unwrap_or(window).max(1);
        let sequence = segment.sequence_number;
        let ack_due = sequence % window == 0 || !segment.more_follows;
        let ack = |sequence_number: u8, negative: bool| SegmentAckPdu {
            negative,
            server: !segment.server,
            invoke_id: segment.invoke_id,
            sequence_number,
            actual_window_size: advertised,
        };

        if segment.lead.is_some() {
            self.finished.remove(&key);
        } else if let Some(finished) = self.finished.get(&key).map(|entry| *entry.value()) {
            log::trace!(
                "Segment {} of finished invoke ID {} from {}, acknowledging {}",
                sequence,
                segment.invoke_id,
                source,
                finished.final_sequence
            );
            return Ok(SegmentReceipt {
                ack: Some(ack(finished.final_sequence, false)),
                reassembled: None,
            });
        }

        if !self.assemblies.contains_key(&key) && self.assemblies.len() >= self.max_assemblies {
            self.evict_oldest();
        }

        let mut entry = self
            .assemblies
            .entry(key.clone())
            .or_insert_with(|| Assembly::new(now));
        let assembly = entry.value_mut();

        let replaced = assembly
            .segments
            .get(&sequence)
            .map(|content| content.len())
            .unwrap_or(0);
        let length = assembly.length - replaced + segment.content.len();
        if length > self.max_length {
            drop(entry);
            self.assemblies.remove(&key);
            return Err(ReassemblyError::TooLarge {
                length,
                max: self.max_length,
            });
        }

        if segment.lead.is_some() {
            assembly.lead = segment.lead;
        }
        if !segment.more_follows {
            assembly.expected = Some(sequence as usize + 1);
        }
        assembly.length = length;
        assembly.last_activity = now;
        assembly.segments.insert(sequence, segment.content);

        if !assembly.is_complete() {
            let ack = if ack_due {
                assembly.contiguous().map(|last| ack(last, last < sequence))
            } else {
                None
            };
            log::trace!(
                "Stored segment {} of invoke ID {} from {} ({} held)",
                sequence,
                segment.invoke_id,
                source,
                assembly.segments.len()
            );
            return Ok(SegmentReceipt {
                ack,
                reassembled: None,
            });
        }

        let message = assembly.concatenate();
        let count = assembly.segments.len();
        let final_sequence = (count - 1) as u8;
        drop(entry);
        self.assemblies.remove(&key);
        self.finished.insert(
            key,
            Finished {
                final_sequence,
                at: now,
            },
        );

        log::debug!(
            "Reassembled {} bytes from {} segments of invoke ID {} from {}",
            message.len(),
            count,
            segment.invoke_id,
            source
        );
        Ok(SegmentReceipt {
            ack: Some(ack(final_sequence, false)),
            reassembled: Some(message),
        })
    }

    /// Drop any partial message for the exchange
    pub fn discard(&self, source: &Address, invoke_id: u8, server: bool) -> bool {
        self.assemblies
            .remove(&(source.clone(), invoke_id, server))
            .is_some()
    }

    /// Exchanges currently being reassembled
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    fn purge_stale(&self, now: Instant) {
        self.finished
            .retain(|_, finished| now.duration_since(finished.at) < self.timeout);
        self.assemblies.retain(|(source, invoke_id, _), assembly| {
            let live = now.duration_since(assembly.last_activity) < self.timeout;
            if !live {
                log::debug!(
                    "Discarding stale reassembly of invoke ID {} from {}",
                    invoke_id,
                    source
                );
            }
            live
        });
    }

    fn evict_oldest(&self) {
        let oldest = self
            .assemblies
            .iter()
            .min_by_key(|entry| entry.value().started)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            log::warn!(
                "Too many concurrent reassemblies, evicting invoke ID {} from {}",
                key.1,
                key.0
            );
            self.assemblies.remove(&key);
        }
    }
}
