use super::{
    modular_cmp::{tsn_gt, tsn_le, tsn_lt},
    path::{Path, PathId, PathTable},
    streams::OutboundFragment,
};
use crate::sctp::sctp_parsing::{DataChunk, ForwardTsn, SkippedStream};
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Partial reliability policy of a message (RFC 3758).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrPolicy {
    /// Retransmit until acknowledged
    #[default]
    Reliable,
    /// Abandon once the lifetime has passed
    Ttl(Duration),
    /// Abandon after this many retransmissions
    Rtx(u32),
    /// Abandon to make room for messages with a lower priority value when
    /// the send queue is full
    Priority(u32),
    /// Abandon when the stream is reset
    StreamReset,
}

/// A DATA chunk owned by the queue engine, from TSN assignment until it is
/// acknowledged or abandoned and forwarded past.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUnit {
    pub tsn: u32,
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub payload: Vec<u8>,
    pub policy: PrPolicy,
    pub expiry: Option<Instant>,
    pub message_id: u64,
    pub enqueued_at: Instant,
    pub sent_at: Option<Instant>,
    pub transmissions: u32,
    pub acked: bool,
    /// Acknowledged through a non-renegable gap block
    pub nr_acked: bool,
    pub abandoned: bool,
    /// Counted in the outstanding bytes of `last_destination`
    pub in_flight: bool,
    pub needs_retransmit: bool,
    /// Fast-retransmitted since the last T3 expiry on its path
    pub fast_retransmitted: bool,
    pub missing_reports: u32,
    pub initial_destination: Option<PathId>,
    pub last_destination: Option<PathId>,
    pub next_destination: Option<PathId>,
}

impl DataUnit {
    fn new(fragment: OutboundFragment, tsn: u32) -> Self {
        Self {
            tsn,
            stream: fragment.stream,
            ssn: fragment.ssn,
            ppid: fragment.ppid,
            unordered: fragment.unordered,
            beginning: fragment.beginning,
            ending: fragment.ending,
            payload: fragment.payload,
            policy: fragment.policy,
            expiry: fragment.expiry,
            message_id: fragment.message_id,
            enqueued_at: fragment.enqueued_at,
            sent_at: None,
            transmissions: 0,
            acked: false,
            nr_acked: false,
            abandoned: false,
            in_flight: false,
            needs_retransmit: false,
            fast_retransmitted: false,
            missing_reports: 0,
            initial_destination: None,
            last_destination: None,
            next_destination: None,
        }
    }

    pub fn len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn to_chunk(&self) -> DataChunk {
        DataChunk {
            tsn: self.tsn,
            stream: self.stream,
            ssn: self.ssn,
            ppid: self.ppid,
            unordered: self.unordered,
            beginning: self.beginning,
            ending: self.ending,
            immediate: false,
            payload: self.payload.clone(),
        }
    }

    /// Has the policy condition for abandoning this chunk been met?
    pub fn must_abandon(&self, now: Instant) -> bool {
        match self.policy {
            PrPolicy::Ttl(_) => self.expiry.map_or(false, |expiry| now > expiry),
            PrPolicy::Rtx(limit) => self.needs_retransmit && self.transmissions > limit,
            _ => false,
        }
    }

    /// Removes the chunk from its path's flight size.
    fn leave_flight(&mut self, paths: &mut PathTable) {
        if self.in_flight {
            self.in_flight = false;
            if let Some(last) = self.last_destination {
                let path = &mut paths[last];
                path.outstanding_bytes = path.outstanding_bytes.saturating_sub(self.len());
            }
        }
    }

    fn record_send(&mut self, path: &mut Path, now: Instant) {
        self.transmissions += 1;
        self.sent_at = Some(now);
        self.needs_retransmit = false;
        self.missing_reports = 0;
        self.initial_destination.get_or_insert(path.id);
        self.last_destination = Some(path.id);
        self.next_destination = None;
        self.in_flight = true;
        path.outstanding_bytes += self.len();
        path.last_transmission = Some(now);
    }
}

/// Identifies a message that was given up on, for the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbandonedMessage {
    pub stream: u16,
    pub ssn: u16,
    pub unordered: bool,
    pub message_id: u64,
    /// The last fragment never received a TSN, so more fragments may still
    /// wait in the send stream
    pub incomplete: bool,
}

/// The transmission and retransmission queues of an association.
///
/// ```text
///        retransmission                 transmission
///   |  sent, awaiting ack  |     |  TSN assigned, unsent  |
///   +----+----+----+----+--+     +----+----+----+----+----+
///   ^                       ^    ^                        ^
///   cum_tsn_ack + 1    highest sent                  next_tsn - 1
/// ```
///
/// Both queues hold consecutive TSNs in order, which lets a TSN be found by
/// its offset from the head.
#[derive(Debug)]
pub struct QueueEngine {
    pub(super) next_tsn: u32,
    /// The peer's cumulative TSN ack
    pub(super) cum_tsn_ack: u32,
    /// Forward-TSN point: every TSN up to here is acked or abandoned
    pub(super) advanced_peer_ack_point: u32,
    pub(super) retransmission: VecDeque<DataUnit>,
    pub(super) transmission: VecDeque<DataUnit>,
}

impl QueueEngine {
    pub fn new(initial_tsn: u32) -> Self {
        let before = initial_tsn.wrapping_sub(1);
        Self {
            next_tsn: initial_tsn,
            cum_tsn_ack: before,
            advanced_peer_ack_point: before,
            retransmission: VecDeque::new(),
            transmission: VecDeque::new(),
        }
    }

    pub fn next_tsn(&self) -> u32 {
        self.next_tsn
    }

    pub fn cum_tsn_ack(&self) -> u32 {
        self.cum_tsn_ack
    }

    pub fn advanced_peer_ack_point(&self) -> u32 {
        self.advanced_peer_ack_point
    }

    /// The highest TSN handed to the network
    pub fn highest_sent(&self) -> u32 {
        self.retransmission
            .back()
            .map_or(self.cum_tsn_ack, |unit| unit.tsn)
    }

    /// Gives a fragment the next TSN and queues it for transmission.
    pub fn assign(&mut self, fragment: OutboundFragment) -> u32 {
        let tsn = self.next_tsn;
        self.next_tsn = tsn.wrapping_add(1);
        self.transmission.push_back(DataUnit::new(fragment, tsn));
        tsn
    }

    /// Nothing is queued or awaiting acknowledgement.
    pub fn is_empty(&self) -> bool {
        self.retransmission.is_empty() && self.transmission.is_empty()
    }

    /// Units sent and neither acknowledged nor abandoned
    pub fn unacked(&self) -> impl Iterator<Item = &DataUnit> + '_ {
        self.retransmission
            .iter()
            .filter(|unit| !unit.acked && !unit.abandoned)
    }

    /// Bytes waiting in the transmission queue
    pub fn queued_bytes(&self) -> u32 {
        self.transmission
            .iter()
            .filter(|unit| !unit.abandoned)
            .map(DataUnit::len)
            .sum()
    }

    /// The unsent head, moving abandoned units out of the way.
    pub fn peek_new(&mut self) -> Option<&DataUnit> {
        while self.transmission.front().map_or(false, |u| u.abandoned) {
            let unit = self.transmission.pop_front()?;
            self.retransmission.push_back(unit);
        }
        self.transmission.front()
    }

    /// Sends the unsent head on `path`.
    pub fn send_new(&mut self, path: &mut Path, now: Instant) -> Option<DataChunk> {
        self.peek_new()?;
        let mut unit = self.transmission.pop_front()?;
        unit.record_send(path, now);
        let chunk = unit.to_chunk();
        self.retransmission.push_back(unit);
        Some(chunk)
    }

    /// TSNs marked for retransmission toward `path`, oldest first
    pub fn retransmissions_for(&self, path: PathId) -> Vec<u32> {
        self.retransmission
            .iter()
            .filter(|unit| unit.needs_retransmit && unit.next_destination == Some(path))
            .map(|unit| unit.tsn)
            .collect()
    }

    /// Sends a marked unit again on `path`.
    pub fn send_retransmission(&mut self, tsn: u32, path: &mut Path, now: Instant) -> Option<DataChunk> {
        let unit = self.unit_mut(tsn)?;
        if !unit.needs_retransmit {
            return None;
        }
        unit.record_send(path, now);
        Some(unit.to_chunk())
    }

    pub fn unit(&self, tsn: u32) -> Option<&DataUnit> {
        let index = self.index_of(tsn)?;
        self.retransmission.get(index)
    }

    pub(super) fn unit_mut(&mut self, tsn: u32) -> Option<&mut DataUnit> {
        let index = self.index_of(tsn)?;
        self.retransmission.get_mut(index)
    }

    fn index_of(&self, tsn: u32) -> Option<usize> {
        let head = self.retransmission.front()?.tsn;
        let index = tsn.wrapping_sub(head) as usize;
        match self.retransmission.get(index) {
            Some(unit) if unit.tsn == tsn => Some(index),
            _ => self.retransmission.iter().position(|unit| unit.tsn == tsn),
        }
    }

    /// T3-rtx expiry on `expired`: every chunk in flight there is marked for
    /// retransmission toward `destination` and leaves the flight size.
    /// Returns the number of chunks marked.
    pub fn mark_path_for_retransmission(
        &mut self,
        expired: PathId,
        destination: PathId,
        paths: &mut PathTable,
    ) -> usize {
        let mut marked = 0;
        for unit in self.retransmission.iter_mut() {
            if unit.in_flight && unit.last_destination == Some(expired) && !unit.acked {
                unit.leave_flight(paths);
                unit.needs_retransmit = true;
                unit.fast_retransmitted = false;
                unit.missing_reports = 0;
                unit.next_destination = Some(destination);
                marked += 1;
            }
        }
        marked
    }

    /// Moves pending retransmissions off a failed path.
    pub fn redirect_retransmissions(&mut self, from: PathId, to: PathId) {
        for unit in self.retransmission.iter_mut() {
            if unit.needs_retransmit && unit.next_destination == Some(from) {
                unit.next_destination = Some(to);
            }
        }
    }

    /// Drops every unit at or below `cum`. Returns the units that had not been
    /// acknowledged before.
    pub(super) fn retire_through(&mut self, cum: u32, paths: &mut PathTable) -> Vec<DataUnit> {
        let mut retired = vec![];
        while self
            .retransmission
            .front()
            .map_or(false, |unit| tsn_le(unit.tsn, cum))
        {
            if let Some(mut unit) = self.retransmission.pop_front() {
                unit.leave_flight(paths);
                retired.push(unit);
            }
        }
        if tsn_gt(cum, self.cum_tsn_ack) {
            self.cum_tsn_ack = cum;
        }
        if tsn_lt(self.advanced_peer_ack_point, self.cum_tsn_ack) {
            self.advanced_peer_ack_point = self.cum_tsn_ack;
        }
        retired
    }

    /// Abandons every chunk whose policy condition holds, with the rest of
    /// its message.
    pub fn abandon_expired(&mut self, now: Instant, paths: &mut PathTable) -> Vec<AbandonedMessage> {
        self.abandon_messages(|unit| unit.must_abandon(now), paths)
    }

    /// Abandons chunks of the given streams under the stream-reset policy.
    pub fn abandon_for_reset(&mut self, streams: &[u16], paths: &mut PathTable) -> Vec<AbandonedMessage> {
        self.abandon_messages(
            |unit| unit.policy == PrPolicy::StreamReset && streams.contains(&unit.stream),
            paths,
        )
    }

    /// Abandons messages whose priority value is greater than `priority`
    /// until at least `needed` bytes are freed. Sent but unacknowledged
    /// chunks count as freed once abandoned.
    pub fn abandon_lower_priority(
        &mut self,
        priority: u32,
        needed: u32,
        paths: &mut PathTable,
    ) -> Vec<AbandonedMessage> {
        let mut candidates: Vec<(u32, u64)> = self
            .retransmission
            .iter()
            .chain(self.transmission.iter())
            .filter(|unit| !unit.acked && !unit.abandoned)
            .filter_map(|unit| match unit.policy {
                PrPolicy::Priority(p) if p > priority => Some((p, unit.message_id)),
                _ => None,
            })
            .collect();
        // Least important first
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates.dedup_by_key(|c| c.1);

        let mut chosen = vec![];
        let mut freed = 0;
        for (_, message_id) in candidates {
            if freed >= needed {
                break;
            }
            if chosen.contains(&message_id) {
                continue;
            }
            freed += self
                .retransmission
                .iter()
                .chain(self.transmission.iter())
                .filter(|unit| unit.message_id == message_id)
                .map(DataUnit::len)
                .sum::<u32>();
            chosen.push(message_id);
        }
        self.abandon_messages(|unit| chosen.contains(&unit.message_id), paths)
    }

    fn abandon_messages(
        &mut self,
        mut condition: impl FnMut(&DataUnit) -> bool,
        paths: &mut PathTable,
    ) -> Vec<AbandonedMessage> {
        let mut doomed: Vec<u64> = vec![];
        for unit in self.retransmission.iter().chain(self.transmission.iter()) {
            if !unit.acked && !unit.abandoned && condition(unit) && !doomed.contains(&unit.message_id) {
                doomed.push(unit.message_id);
            }
        }

        let mut abandoned: Vec<AbandonedMessage> = vec![];
        for unit in self
            .retransmission
            .iter_mut()
            .chain(self.transmission.iter_mut())
            .filter(|unit| doomed.contains(&unit.message_id))
        {
            unit.leave_flight(paths);
            unit.abandoned = true;
            unit.needs_retransmit = false;
            match abandoned.iter_mut().find(|a| a.message_id == unit.message_id) {
                Some(message) => message.incomplete = !unit.ending,
                None => abandoned.push(AbandonedMessage {
                    stream: unit.stream,
                    ssn: unit.ssn,
                    unordered: unit.unordered,
                    message_id: unit.message_id,
                    incomplete: !unit.ending,
                }),
            }
        }
        abandoned
    }

    /// Moves the Forward-TSN point over consecutive abandoned chunks
    /// (RFC 3758 C2). Returns the FORWARD-TSN to send when the point is
    /// ahead of the peer's cumulative ack.
    pub fn advance_peer_ack_point(&mut self) -> Option<ForwardTsn> {
        if tsn_lt(self.advanced_peer_ack_point, self.cum_tsn_ack) {
            self.advanced_peer_ack_point = self.cum_tsn_ack;
        }
        for unit in self.retransmission.iter().chain(self.transmission.iter()) {
            if tsn_le(unit.tsn, self.advanced_peer_ack_point) {
                continue;
            }
            if unit.tsn == self.advanced_peer_ack_point.wrapping_add(1) && unit.abandoned {
                self.advanced_peer_ack_point = unit.tsn;
            } else {
                break;
            }
        }
        self.forward_tsn()
    }

    /// The FORWARD-TSN describing the current Forward-TSN point, if it is
    /// ahead of the peer's cumulative ack
    pub fn forward_tsn(&self) -> Option<ForwardTsn> {
        if !tsn_gt(self.advanced_peer_ack_point, self.cum_tsn_ack) {
            return None;
        }
        let mut streams: Vec<SkippedStream> = vec![];
        for unit in self.retransmission.iter().chain(self.transmission.iter()) {
            if tsn_gt(unit.tsn, self.advanced_peer_ack_point) {
                break;
            }
            if unit.unordered || !unit.abandoned {
                continue;
            }
            match streams.iter_mut().find(|s| s.stream == unit.stream) {
                Some(skipped) => skipped.ssn = unit.ssn,
                None => streams.push(SkippedStream {
                    stream: unit.stream,
                    ssn: unit.ssn,
                }),
            }
        }
        Some(ForwardTsn {
            new_cum_tsn: self.advanced_peer_ack_point,
            streams,
        })
    }

    /// Drops all data, for teardown. Returns the number of units discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.retransmission.len() + self.transmission.len();
        self.retransmission.clear();
        self.transmission.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sctp::association::config::Config;

    fn fragment(stream: u16, ssn: u16, message_id: u64, policy: PrPolicy, now: Instant) -> OutboundFragment {
        OutboundFragment {
            stream,
            ssn,
            ppid: 0,
            unordered: false,
            beginning: true,
            ending: true,
            payload: vec![0; 100],
            policy,
            expiry: match policy {
                PrPolicy::Ttl(ttl) => Some(now + ttl),
                _ => None,
            },
            enqueued_at: now,
            message_id,
        }
    }

    fn paths() -> PathTable {
        PathTable::new(
            ["10.0.0.2".parse().unwrap(), "10.0.1.2".parse().unwrap()],
            &Config::default(),
        )
    }

    const PRIMARY: PathId = PathId::new(0);
    const SECONDARY: PathId = PathId::new(1);

    #[test]
    fn tsns_are_assigned_in_order_across_wraparound() {
        let now = Instant::now();
        let mut queue = QueueEngine::new(u32::MAX - 1);
        let tsns: Vec<u32> = (0..4)
            .map(|i| queue.assign(fragment(0, i, i as u64, PrPolicy::Reliable, now)))
            .collect();
        assert_eq!(tsns, vec![u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(queue.cum_tsn_ack(), u32::MAX - 2);
        assert_eq!(queue.queued_bytes(), 400);
    }

    #[test]
    fn sending_moves_units_into_flight() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(1);
        queue.assign(fragment(0, 0, 0, PrPolicy::Reliable, now));
        queue.assign(fragment(0, 1, 1, PrPolicy::Reliable, now));

        let chunk = queue.send_new(&mut paths[PRIMARY], now).unwrap();
        assert_eq!(chunk.tsn, 1);
        assert_eq!(paths[PRIMARY].outstanding_bytes, 100);
        assert_eq!(queue.highest_sent(), 1);
        assert_eq!(queue.unit(1).unwrap().transmissions, 1);

        let retired = queue.retire_through(1, &mut paths);
        assert_eq!(retired.len(), 1);
        assert_eq!(paths[PRIMARY].outstanding_bytes, 0);
        assert_eq!(queue.cum_tsn_ack(), 1);
        assert!(!queue.is_empty());
    }

    #[test]
    fn timeout_marks_only_chunks_in_flight_on_the_path() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(1);
        for i in 0..3 {
            queue.assign(fragment(0, i, i as u64, PrPolicy::Reliable, now));
        }
        queue.send_new(&mut paths[PRIMARY], now);
        queue.send_new(&mut paths[SECONDARY], now);
        queue.send_new(&mut paths[PRIMARY], now);

        let marked = queue.mark_path_for_retransmission(PRIMARY, SECONDARY, &mut paths);
        assert_eq!(marked, 2);
        assert_eq!(paths[PRIMARY].outstanding_bytes, 0);
        assert_eq!(paths[SECONDARY].outstanding_bytes, 100);
        assert_eq!(queue.retransmissions_for(SECONDARY), vec![1, 3]);

        let chunk = queue
            .send_retransmission(1, &mut paths[SECONDARY], now)
            .unwrap();
        assert_eq!(chunk.tsn, 1);
        assert_eq!(queue.unit(1).unwrap().transmissions, 2);
        assert_eq!(paths[SECONDARY].outstanding_bytes, 200);
        // Not marked any more
        assert!(queue
            .send_retransmission(1, &mut paths[SECONDARY], now)
            .is_none());
    }

    #[test]
    fn expired_chunks_are_abandoned_and_forwarded_past() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(10);
        queue.assign(fragment(4, 0, 0, PrPolicy::Ttl(Duration::from_millis(50)), now));
        queue.assign(fragment(4, 1, 1, PrPolicy::Ttl(Duration::from_millis(50)), now));
        queue.assign(fragment(4, 2, 2, PrPolicy::Reliable, now));
        for _ in 0..3 {
            queue.send_new(&mut paths[PRIMARY], now);
        }
        assert_eq!(paths[PRIMARY].outstanding_bytes, 300);

        assert!(queue.abandon_expired(now, &mut paths).is_empty());
        let later = now + Duration::from_millis(51);
        let abandoned = queue.abandon_expired(later, &mut paths);
        assert_eq!(abandoned.len(), 2);
        assert_eq!(paths[PRIMARY].outstanding_bytes, 100);

        let forward = queue.advance_peer_ack_point().unwrap();
        assert_eq!(forward.new_cum_tsn, 11);
        assert_eq!(forward.streams, vec![SkippedStream { stream: 4, ssn: 1 }]);

        // Once the peer acks past the point there is nothing left to forward
        queue.retire_through(11, &mut paths);
        assert!(queue.advance_peer_ack_point().is_none());
    }

    #[test]
    fn rtx_limit_abandons_after_too_many_sends() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(1);
        queue.assign(fragment(0, 0, 0, PrPolicy::Rtx(1), now));
        queue.send_new(&mut paths[PRIMARY], now);
        assert!(!queue.unit(1).unwrap().must_abandon(now));

        // One retransmission is allowed
        queue.mark_path_for_retransmission(PRIMARY, PRIMARY, &mut paths);
        assert!(!queue.unit(1).unwrap().must_abandon(now));
        queue.send_retransmission(1, &mut paths[PRIMARY], now);
        assert!(!queue.unit(1).unwrap().must_abandon(now));

        // A second one is not
        queue.mark_path_for_retransmission(PRIMARY, PRIMARY, &mut paths);
        assert!(queue.unit(1).unwrap().must_abandon(now));
        assert_eq!(queue.abandon_expired(now, &mut paths).len(), 1);
        assert!(queue.retransmissions_for(PRIMARY).is_empty());
        assert_eq!(queue.advance_peer_ack_point().unwrap().new_cum_tsn, 1);
    }

    #[test]
    fn priority_eviction_frees_least_important_first() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(1);
        queue.assign(fragment(0, 0, 0, PrPolicy::Priority(5), now));
        queue.assign(fragment(0, 1, 1, PrPolicy::Priority(9), now));
        queue.assign(fragment(0, 2, 2, PrPolicy::Priority(1), now));

        let abandoned = queue.abandon_lower_priority(3, 50, &mut paths);
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].ssn, 1);
        assert_eq!(queue.queued_bytes(), 200);
    }

    #[test]
    fn abandoned_unsent_units_are_skipped() {
        let now = Instant::now();
        let mut paths = paths();
        let mut queue = QueueEngine::new(1);
        queue.assign(fragment(0, 0, 0, PrPolicy::StreamReset, now));
        queue.assign(fragment(1, 0, 1, PrPolicy::Reliable, now));
        assert_eq!(queue.abandon_for_reset(&[0], &mut paths).len(), 1);
        let chunk = queue.send_new(&mut paths[PRIMARY], now).unwrap();
        assert_eq!(chunk.tsn, 2);
        assert_eq!(queue.advance_peer_ack_point().unwrap().new_cum_tsn, 1);
    }
}
