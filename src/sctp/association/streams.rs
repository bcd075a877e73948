use super::{
    modular_cmp::{ssn_ge, ssn_gt, tsn_le, tsn_lt},
    queue::PrPolicy,
};
use crate::sctp::sctp_parsing::{DataChunk, SkippedStream};
use rustc_hash::FxHashMap;
use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    time::Instant,
};

/// A piece of a user message waiting in a send stream. Messages larger than
/// a packet are split into several fragments when they are queued. Ordered
/// fragments get their SSN when they leave the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFragment {
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub payload: Vec<u8>,
    pub policy: PrPolicy,
    pub expiry: Option<Instant>,
    pub enqueued_at: Instant,
    /// Orders messages across streams; shared by the fragments of a message
    pub message_id: u64,
}

/// An outbound stream: its SSN counter and queued fragments.
#[derive(Debug, Default)]
pub struct SendStream {
    next_ssn: u16,
    /// SSN of the message whose fragments are leaving the stream
    current_ssn: u16,
    queue: VecDeque<OutboundFragment>,
    /// A reset was requested and the peer has not answered yet
    pub reset_pending: bool,
}

impl SendStream {
    pub fn next_ssn(&self) -> u16 {
        self.next_ssn
    }

    pub fn head(&self) -> Option<&OutboundFragment> {
        self.queue.front()
    }

    fn is_ready(&self) -> bool {
        !self.reset_pending && !self.queue.is_empty()
    }
}

/// All outbound streams of an association.
#[derive(Debug, Default)]
pub struct SendStreams {
    streams: BTreeMap<u16, SendStream>,
    count: u16,
    queued_bytes: usize,
    queued_messages: usize,
    next_message_id: u64,
    /// The stream whose message has been partly handed to the queue
    continuing: Option<u16>,
}

impl SendStreams {
    pub fn new(count: u16) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    /// Number of streams negotiated with the peer
    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn set_count(&mut self, count: u16) {
        self.count = count;
    }

    /// Splits a message into fragments of at most `max_fragment` bytes and
    /// queues them.
    pub fn enqueue(&mut self, message: OutboundMessage, max_fragment: usize, now: Instant) {
        let OutboundMessage {
            stream,
            payload,
            ppid,
            unordered,
            policy,
        } = message;
        let send_stream = self.streams.entry(stream).or_default();
        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let expiry = match policy {
            PrPolicy::Ttl(lifetime) => Some(now + lifetime),
            _ => None,
        };

        let max_fragment = max_fragment.max(1);
        let pieces: Vec<&[u8]> = if payload.is_empty() {
            vec![&payload[..]]
        } else {
            payload.chunks(max_fragment).collect()
        };
        let last = pieces.len() - 1;
        for (i, piece) in pieces.into_iter().enumerate() {
            self.queued_bytes += piece.len();
            send_stream.queue.push_back(OutboundFragment {
                stream,
                ssn: 0,
                ppid,
                unordered,
                beginning: i == 0,
                ending: i == last,
                payload: piece.to_vec(),
                policy,
                expiry,
                enqueued_at: now,
                message_id,
            });
        }
        self.queued_messages += 1;
    }

    /// Picks the stream whose head fragment should be sent next. Once a
    /// message has started, its stream keeps the turn until the message is
    /// complete.
    pub fn select(&mut self, scheduler: &mut dyn StreamScheduler) -> Option<u16> {
        if let Some(stream) = self.continuing {
            if self.streams.get(&stream).map_or(false, |s| !s.queue.is_empty()) {
                return Some(stream);
            }
            self.continuing = None;
        }
        scheduler.select(self)
    }

    pub fn head(&self, stream: u16) -> Option<&OutboundFragment> {
        self.streams.get(&stream)?.head()
    }

    /// Takes the head fragment of a stream. The first fragment of an ordered
    /// message takes the stream's next SSN, so messages dropped before this
    /// point leave no hole in the sequence.
    pub fn pop(&mut self, stream: u16) -> Option<OutboundFragment> {
        let send_stream = self.streams.get_mut(&stream)?;
        let mut fragment = send_stream.queue.pop_front()?;
        if !fragment.unordered {
            if fragment.beginning {
                send_stream.current_ssn = send_stream.next_ssn;
                send_stream.next_ssn = send_stream.next_ssn.wrapping_add(1);
            }
            fragment.ssn = send_stream.current_ssn;
        }
        self.account_removed(&fragment);
        self.continuing = if fragment.ending { None } else { Some(stream) };
        Some(fragment)
    }

    fn account_removed(&mut self, fragment: &OutboundFragment) {
        self.queued_bytes -= fragment.payload.len();
        if fragment.ending {
            self.queued_messages -= 1;
        }
    }

    /// Streams that have fragments ready, in ascending order
    pub fn ready(&self) -> impl Iterator<Item = (u16, &SendStream)> + '_ {
        self.streams
            .iter()
            .filter(|(_, s)| s.is_ready())
            .map(|(id, s)| (*id, s))
    }

    pub fn has_data(&self) -> bool {
        self.streams.values().any(|s| !s.queue.is_empty())
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn queued_messages(&self) -> usize {
        self.queued_messages
    }

    /// Bytes ready for the next transmission, ignoring streams blocked by a
    /// pending reset
    pub fn sendable_bytes(&self) -> usize {
        self.ready()
            .flat_map(|(_, s)| s.queue.iter())
            .map(|f| f.payload.len())
            .sum()
    }

    /// Drops every queued fragment that satisfies `abandon`, together with
    /// the other fragments of the same message. A message already partly
    /// handed to the queue is left for the queue to abandon.
    pub fn abandon_where(
        &mut self,
        mut abandon: impl FnMut(&OutboundFragment) -> bool,
    ) -> Vec<OutboundFragment> {
        let continuing = self.continuing;
        let mut doomed = vec![];
        for (id, stream) in self.streams.iter() {
            for fragment in stream.queue.iter() {
                let started = continuing == Some(*id)
                    && stream.queue.front().map(|f| f.message_id) == Some(fragment.message_id);
                if !started && abandon(fragment) && !doomed.contains(&fragment.message_id) {
                    doomed.push(fragment.message_id);
                }
            }
        }

        let mut removed = vec![];
        for stream in self.streams.values_mut() {
            let (gone, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut stream.queue)
                .into_iter()
                .partition(|f| doomed.contains(&f.message_id));
            stream.queue = kept;
            removed.extend(gone);
        }
        for fragment in removed.iter() {
            self.queued_bytes -= fragment.payload.len();
            if fragment.ending {
                self.queued_messages -= 1;
            }
        }
        removed
    }

    /// Abandons fragments of the message being sent on `stream`.
    pub fn abandon_continuing(&mut self, stream: u16, message_id: u64) -> Vec<OutboundFragment> {
        if self.continuing == Some(stream) {
            self.continuing = None;
        }
        let mut removed = vec![];
        if let Some(send_stream) = self.streams.get_mut(&stream) {
            while send_stream
                .queue
                .front()
                .map_or(false, |f| f.message_id == message_id)
            {
                removed.extend(send_stream.queue.pop_front());
            }
        }
        for fragment in removed.iter() {
            self.account_removed(fragment);
        }
        removed
    }

    /// Blocks streams until the peer confirms their reset.
    pub fn begin_reset(&mut self, streams: &[u16]) {
        for id in streams {
            self.streams.entry(*id).or_default().reset_pending = true;
        }
    }

    /// Zeroes the SSN counters of reset streams and unblocks them.
    pub fn complete_reset(&mut self, streams: &[u16]) {
        for id in streams {
            let stream = self.streams.entry(*id).or_default();
            stream.reset_pending = false;
            stream.next_ssn = 0;
        }
    }

    pub fn cancel_reset(&mut self, streams: &[u16]) {
        for id in streams {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.reset_pending = false;
            }
        }
    }

    pub fn stream(&self, id: u16) -> Option<&SendStream> {
        self.streams.get(&id)
    }
}

/// A user message handed to the association for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub stream: u16,
    pub payload: Vec<u8>,
    pub ppid: u32,
    pub unordered: bool,
    pub policy: PrPolicy,
}

impl OutboundMessage {
    /// An ordered, fully reliable message
    pub fn new(stream: u16, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            stream,
            payload: payload.into(),
            ppid: 0,
            unordered: false,
            policy: PrPolicy::Reliable,
        }
    }

    pub fn unordered(mut self) -> Self {
        self.unordered = true;
        self
    }

    pub fn ppid(mut self, ppid: u32) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn policy(mut self, policy: PrPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Decides which stream sends next.
pub trait StreamScheduler: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Picks a stream among those with fragments ready.
    fn select(&mut self, streams: &SendStreams) -> Option<u16>;
}

/// Selects the stream scheduler of new associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamSchedulerKind {
    #[default]
    RoundRobin,
    FirstComeFirstServe,
}

impl StreamSchedulerKind {
    pub fn build(self) -> Box<dyn StreamScheduler> {
        match self {
            StreamSchedulerKind::RoundRobin => Box::<RoundRobin>::default(),
            StreamSchedulerKind::FirstComeFirstServe => Box::new(FirstComeFirstServe),
        }
    }
}

/// Serves streams with data in turn, by ascending stream id.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<u16>,
}

impl StreamScheduler for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&mut self, streams: &SendStreams) -> Option<u16> {
        let mut ready = streams.ready().map(|(id, _)| id).peekable();
        let first = *ready.peek()?;
        let next = match self.last {
            Some(last) => ready.find(|id| *id > last).unwrap_or(first),
            None => first,
        };
        self.last = Some(next);
        Some(next)
    }
}

/// Sends messages in the order the application queued them, regardless of
/// stream.
#[derive(Debug, Default)]
pub struct FirstComeFirstServe;

impl StreamScheduler for FirstComeFirstServe {
    fn name(&self) -> &'static str {
        "first-come-first-serve"
    }

    fn select(&mut self, streams: &SendStreams) -> Option<u16> {
        streams
            .ready()
            .filter_map(|(id, s)| Some((s.head()?.message_id, id)))
            .min()
            .map(|(_, id)| id)
    }
}

/// A complete message reassembled from DATA chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub unordered: bool,
    pub payload: Vec<u8>,
}

/// An inbound stream: fragments awaiting reassembly and complete ordered
/// messages waiting for their turn.
#[derive(Debug, Default)]
struct ReceiveStream {
    expected_ssn: u16,
    /// Kept sorted by TSN
    fragments: Vec<DataChunk>,
    waiting: FxHashMap<u16, InboundMessage>,
}

impl ReceiveStream {
    fn insert_fragment(&mut self, chunk: DataChunk) {
        let position = self
            .fragments
            .iter()
            .position(|f| tsn_lt(chunk.tsn, f.tsn))
            .unwrap_or(self.fragments.len());
        self.fragments.insert(position, chunk);
    }

    /// Pulls one complete run of fragments out of the reassembly buffer.
    fn reassemble(&mut self) -> Option<InboundMessage> {
        for start in 0..self.fragments.len() {
            if !self.fragments[start].beginning {
                continue;
            }
            let mut end = start;
            while !self.fragments[end].ending {
                let next = end + 1;
                if next >= self.fragments.len()
                    || self.fragments[next].tsn != self.fragments[end].tsn.wrapping_add(1)
                    || self.fragments[next].beginning
                {
                    break;
                }
                end = next;
            }
            if self.fragments[end].ending {
                let run: Vec<DataChunk> = self.fragments.drain(start..=end).collect();
                let first = &run[0];
                let mut message = InboundMessage {
                    stream: first.stream,
                    ssn: first.ssn,
                    ppid: first.ppid,
                    unordered: first.unordered,
                    payload: Vec::with_capacity(run.iter().map(|c| c.payload.len()).sum()),
                };
                for chunk in run {
                    message.payload.extend_from_slice(&chunk.payload);
                }
                return Some(message);
            }
        }
        None
    }
}

/// All inbound streams of an association and the messages ready for the
/// application.
#[derive(Debug, Default)]
pub struct ReceiveStreams {
    streams: FxHashMap<u16, ReceiveStream>,
    ready: VecDeque<InboundMessage>,
    buffered_bytes: usize,
}

impl ReceiveStreams {
    /// Accepts a new DATA chunk. Returns the number of messages that became
    /// ready for delivery.
    pub fn receive(&mut self, chunk: DataChunk) -> usize {
        self.buffered_bytes += chunk.payload.len();
        let id = chunk.stream;
        let stream = self.streams.entry(id).or_default();
        stream.insert_fragment(chunk);

        let mut completed = vec![];
        while let Some(message) = stream.reassemble() {
            completed.push(message);
        }

        let before = self.ready.len();
        for message in completed {
            self.place(message);
        }
        self.ready.len() - before
    }

    fn place(&mut self, message: InboundMessage) {
        let Some(stream) = self.streams.get_mut(&message.stream) else {
            return;
        };
        if message.unordered {
            self.ready.push_back(message);
        } else if message.ssn == stream.expected_ssn {
            stream.expected_ssn = stream.expected_ssn.wrapping_add(1);
            self.ready.push_back(message);
            while let Some(next) = stream.waiting.remove(&stream.expected_ssn) {
                stream.expected_ssn = stream.expected_ssn.wrapping_add(1);
                self.ready.push_back(next);
            }
        } else if ssn_gt(message.ssn, stream.expected_ssn) {
            stream.waiting.insert(message.ssn, message);
        } else {
            // An SSN from before a skip or reset
            self.buffered_bytes -= message.payload.len();
        }
    }

    /// Applies a FORWARD-TSN: drops fragments at or below the new cumulative
    /// TSN and moves ordered streams past the skipped SSNs. Returns the
    /// number of messages that became ready.
    pub fn forward(&mut self, new_cum_tsn: u32, skipped: &[SkippedStream]) -> usize {
        let before = self.ready.len();
        let mut freed = 0;
        for stream in self.streams.values_mut() {
            stream.fragments.retain(|f| {
                let keep = !tsn_le(f.tsn, new_cum_tsn);
                if !keep {
                    freed += f.payload.len();
                }
                keep
            });
        }
        self.buffered_bytes -= freed;

        for skip in skipped {
            let stream = self.streams.entry(skip.stream).or_default();
            if !ssn_ge(skip.ssn, stream.expected_ssn) {
                continue;
            }
            let mut flushed: Vec<_> = stream
                .waiting
                .iter()
                .filter(|(ssn, _)| !ssn_gt(**ssn, skip.ssn))
                .map(|(ssn, _)| *ssn)
                .collect();
            flushed.sort_by(|a, b| {
                if ssn_gt(*a, *b) {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                }
            });
            for ssn in flushed {
                if let Some(message) = stream.waiting.remove(&ssn) {
                    self.ready.push_back(message);
                }
            }
            stream.expected_ssn = skip.ssn.wrapping_add(1);
            while let Some(next) = stream.waiting.remove(&stream.expected_ssn) {
                stream.expected_ssn = stream.expected_ssn.wrapping_add(1);
                self.ready.push_back(next);
            }
        }
        self.ready.len() - before
    }

    /// Zeroes the expected SSN of the given streams, or of every stream when
    /// the list is empty.
    pub fn reset(&mut self, streams: &[u16]) {
        if streams.is_empty() {
            for stream in self.streams.values_mut() {
                stream.expected_ssn = 0;
            }
        } else {
            for id in streams {
                self.streams.entry(*id).or_default().expected_ssn = 0;
            }
        }
    }

    /// Takes the oldest ready message, optionally restricted to one stream.
    pub fn take_ready(&mut self, stream: Option<u16>) -> Option<InboundMessage> {
        let position = match stream {
            Some(id) => self.ready.iter().position(|m| m.stream == id)?,
            None => 0,
        };
        let message = self.ready.remove(position)?;
        self.buffered_bytes -= message.payload.len();
        Some(message)
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    /// Bytes held for the application, counted against the receive window
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn expected_ssn(&self, stream: u16) -> u16 {
        self.streams.get(&stream).map_or(0, |s| s.expected_ssn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn data(tsn: u32, stream: u16, ssn: u16, beginning: bool, ending: bool, bytes: &[u8]) -> DataChunk {
        DataChunk {
            tsn,
            stream,
            ssn,
            ppid: 0,
            unordered: false,
            beginning,
            ending,
            immediate: false,
            payload: bytes.to_vec(),
        }
    }

    #[test]
    fn ordered_messages_wait_for_their_turn() {
        let mut streams = ReceiveStreams::default();
        assert_eq!(streams.receive(data(11, 1, 1, true, true, b"second")), 0);
        assert_eq!(streams.receive(data(12, 1, 2, true, true, b"third")), 0);
        assert_eq!(streams.receive(data(10, 1, 0, true, true, b"first")), 3);
        let payloads: Vec<_> = std::iter::from_fn(|| streams.take_ready(None))
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(streams.buffered_bytes(), 0);
        assert_eq!(streams.expected_ssn(1), 3);
    }

    #[test]
    fn fragments_are_reassembled_in_tsn_order() {
        let mut streams = ReceiveStreams::default();
        assert_eq!(streams.receive(data(u32::MAX, 0, 0, true, false, b"ab")), 0);
        assert_eq!(streams.receive(data(1, 0, 0, false, true, b"ef")), 0);
        assert_eq!(streams.buffered_bytes(), 4);
        assert_eq!(streams.receive(data(0, 0, 0, false, false, b"cd")), 1);
        let message = streams.take_ready(Some(0)).unwrap();
        assert_eq!(message.payload, b"abcdef");
    }

    #[test]
    fn unordered_messages_skip_the_line() {
        let mut streams = ReceiveStreams::default();
        let mut chunk = data(20, 3, 0, true, true, b"now");
        chunk.unordered = true;
        streams.receive(data(19, 3, 5, true, true, b"later"));
        assert_eq!(streams.receive(chunk), 1);
        assert_eq!(streams.take_ready(Some(3)).unwrap().payload, b"now");
        assert_eq!(streams.take_ready(Some(3)), None);
    }

    #[test]
    fn forward_tsn_skips_abandoned_messages() {
        let mut streams = ReceiveStreams::default();
        // SSN 0 was abandoned after its first fragment arrived
        streams.receive(data(5, 2, 0, true, false, b"lost"));
        streams.receive(data(8, 2, 1, true, true, b"kept"));
        assert_eq!(streams.forward(7, &[SkippedStream { stream: 2, ssn: 0 }]), 1);
        assert_eq!(streams.take_ready(None).unwrap().payload, b"kept");
        assert_eq!(streams.buffered_bytes(), 0);
        assert_eq!(streams.expected_ssn(2), 2);
    }

    fn send_streams(messages: &[(u16, &[u8])]) -> SendStreams {
        let mut streams = SendStreams::new(17);
        let now = Instant::now();
        for (stream, payload) in messages {
            streams.enqueue(OutboundMessage::new(*stream, *payload), 4, now);
        }
        streams
    }

    #[test]
    fn messages_are_fragmented_with_one_ssn() {
        let mut streams = send_streams(&[(1, b"0123456789"), (1, b"x")]);
        assert_eq!(streams.queued_bytes(), 11);
        assert_eq!(streams.queued_messages(), 2);
        let fragments: Vec<_> = std::iter::from_fn(|| streams.pop(1)).collect();
        assert_eq!(fragments.len(), 4);
        assert!(fragments[0].beginning && !fragments[0].ending);
        assert!(!fragments[1].beginning && !fragments[1].ending);
        assert!(fragments[2].ending);
        assert!(fragments[..3].iter().all(|f| f.ssn == 0));
        assert_eq!(fragments[3].ssn, 1);
        assert_eq!(streams.queued_messages(), 0);
    }

    #[test]
    fn round_robin_alternates_and_keeps_messages_whole() {
        let mut streams = send_streams(&[(1, b"aaaaaa"), (2, b"b"), (1, b"c"), (3, b"d")]);
        let mut scheduler = RoundRobin::default();
        let mut order = vec![];
        while let Some(stream) = streams.select(&mut scheduler) {
            let fragment = streams.pop(stream).unwrap();
            order.push((stream, fragment.payload));
        }
        assert_eq!(
            order,
            vec![
                (1, b"aaaa".to_vec()),
                (1, b"aa".to_vec()),
                (2, b"b".to_vec()),
                (3, b"d".to_vec()),
                (1, b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn first_come_first_serve_follows_queue_order() {
        let mut streams = send_streams(&[(5, b"a"), (2, b"b"), (5, b"c")]);
        let mut scheduler = FirstComeFirstServe;
        let mut order = vec![];
        while let Some(stream) = streams.select(&mut scheduler) {
            order.push(streams.pop(stream).unwrap().payload);
        }
        assert_eq!(order, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn abandoning_removes_whole_messages() {
        let mut streams = SendStreams::new(17);
        let now = Instant::now();
        streams.enqueue(
            OutboundMessage::new(1, b"123456789".to_vec()).policy(PrPolicy::Ttl(Duration::from_millis(5))),
            4,
            now,
        );
        streams.enqueue(OutboundMessage::new(1, b"keep".to_vec()), 4, now);
        let later = now + Duration::from_millis(10);
        let removed = streams.abandon_where(|f| f.expiry.map_or(false, |e| e < later));
        assert_eq!(removed.len(), 3);
        assert_eq!(streams.queued_bytes(), 4);
        assert_eq!(streams.queued_messages(), 1);
        let kept = streams.pop(1).unwrap();
        assert_eq!(kept.payload, b"keep");
        // The dropped message never took a sequence number
        assert_eq!(kept.ssn, 0);
    }

    #[test]
    fn sequence_numbers_are_taken_when_fragments_leave() {
        let mut streams = send_streams(&[(2, b"first"), (2, b"second")]);
        assert!(streams.head(2).unwrap().beginning);
        assert_eq!(streams.stream(2).unwrap().next_ssn(), 0);
        let fragments: Vec<_> = std::iter::from_fn(|| streams.pop(2)).collect();
        assert_eq!(
            fragments.iter().map(|f| f.ssn).collect::<Vec<_>>(),
            vec![0, 0, 1, 1]
        );
        assert_eq!(streams.stream(2).unwrap().next_ssn(), 2);

        let mut unordered = SendStreams::new(17);
        unordered.enqueue(
            OutboundMessage::new(2, b"x".to_vec()).unordered(),
            4,
            Instant::now(),
        );
        assert_eq!(unordered.pop(2).unwrap().ssn, 0);
        assert_eq!(unordered.stream(2).unwrap().next_ssn(), 0);
    }

    #[test]
    fn reset_blocks_stream_until_complete() {
        let mut streams = send_streams(&[(4, b"a"), (4, b"b")]);
        streams.pop(4);
        streams.begin_reset(&[4]);
        let mut scheduler = RoundRobin::default();
        assert_eq!(streams.select(&mut scheduler), None);
        streams.complete_reset(&[4]);
        assert_eq!(streams.stream(4).unwrap().next_ssn(), 0);
        assert_eq!(streams.select(&mut scheduler), Some(4));
        assert_eq!(streams.pop(4).unwrap().ssn, 0);
        assert_eq!(streams.stream(4).unwrap().next_ssn(), 1);
    }
}
