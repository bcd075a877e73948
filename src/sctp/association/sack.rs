//! Selective acknowledgement in both directions: the receiver's record of
//! which TSNs have arrived and the SACKs built from it, and the sender's
//! processing of inbound SACKs against its retransmission queue.

use super::{
    modular_cmp::{tsn_between, tsn_gt, tsn_le, tsn_lt, tsn_max},
    path::{PathId, PathTable},
    queue::QueueEngine,
};
use crate::sctp::sctp_parsing::{GapBlock, Sack};
use std::time::{Duration, Instant};

/// Most duplicate TSNs reported in one SACK
const MAX_DUPLICATES: usize = 32;

/// Whether a received TSN was seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    New,
    Duplicate,
}

/// The TSNs received so far: everything up to the cumulative TSN, plus
/// disjoint blocks beyond it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapList {
    cum_tsn: u32,
    /// Sorted, non-adjacent inclusive ranges, all beyond `cum_tsn + 1`
    blocks: Vec<(u32, u32)>,
}

impl GapList {
    pub fn new(cum_tsn: u32) -> Self {
        Self {
            cum_tsn,
            blocks: vec![],
        }
    }

    pub fn cum_tsn(&self) -> u32 {
        self.cum_tsn
    }

    pub fn has_gaps(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// The highest TSN received
    pub fn highest(&self) -> u32 {
        self.blocks.last().map_or(self.cum_tsn, |block| block.1)
    }

    pub fn contains(&self, tsn: u32) -> bool {
        tsn_le(tsn, self.cum_tsn)
            || self
                .blocks
                .iter()
                .any(|&(start, end)| tsn_between(start, tsn, end))
    }

    /// Records the arrival of a TSN.
    pub fn record(&mut self, tsn: u32) -> Arrival {
        if self.contains(tsn) {
            return Arrival::Duplicate;
        }

        if tsn == self.cum_tsn.wrapping_add(1) {
            self.cum_tsn = tsn;
            self.absorb_leading_block();
            return Arrival::New;
        }

        let index = self
            .blocks
            .iter()
            .position(|&(start, _)| tsn_lt(tsn, start))
            .unwrap_or(self.blocks.len());
        let joins_previous = index > 0 && self.blocks[index - 1].1.wrapping_add(1) == tsn;
        let joins_next = index < self.blocks.len() && tsn.wrapping_add(1) == self.blocks[index].0;

        match (joins_previous, joins_next) {
            (true, true) => {
                let next = self.blocks.remove(index);
                self.blocks[index - 1].1 = next.1;
            }
            (true, false) => self.blocks[index - 1].1 = tsn,
            (false, true) => self.blocks[index].0 = tsn,
            (false, false) => self.blocks.insert(index, (tsn, tsn)),
        }
        Arrival::New
    }

    /// Moves the cumulative TSN forward as a FORWARD-TSN instructs. Returns
    /// false when `new_cum` is not ahead of the current point.
    pub fn forward(&mut self, new_cum: u32) -> bool {
        if !tsn_gt(new_cum, self.cum_tsn) {
            return false;
        }
        self.cum_tsn = new_cum;
        self.blocks.retain(|&(_, end)| tsn_gt(end, new_cum));
        if let Some(first) = self.blocks.first_mut() {
            if tsn_le(first.0, new_cum) {
                first.0 = new_cum.wrapping_add(1);
            }
        }
        self.absorb_leading_block();
        true
    }

    fn absorb_leading_block(&mut self) {
        while let Some(&(start, end)) = self.blocks.first() {
            if start != self.cum_tsn.wrapping_add(1) {
                break;
            }
            self.cum_tsn = end;
            self.blocks.remove(0);
        }
    }

    /// The blocks as offsets from the cumulative TSN. Blocks too far ahead
    /// to express in 16 bits are left out.
    pub fn gap_blocks(&self) -> Vec<GapBlock> {
        self.blocks
            .iter()
            .map(|&(start, end)| {
                (
                    start.wrapping_sub(self.cum_tsn),
                    end.wrapping_sub(self.cum_tsn),
                )
            })
            .take_while(|&(_, end)| end <= u16::MAX as u32)
            .map(|(start, end)| GapBlock {
                start: start as u16,
                end: end as u16,
            })
            .collect()
    }
}

/// Receiver-side SACK state.
#[derive(Debug, Clone)]
pub struct ReceiveTracker {
    pub gaps: GapList,
    duplicates: Vec<u32>,
    /// Packets with DATA since the last SACK
    pub packets_since_sack: u32,
    /// Something happened that must be acknowledged without delay
    pub immediate: bool,
    next_sequence: u32,
}

impl ReceiveTracker {
    pub fn new(peer_initial_tsn: u32) -> Self {
        Self {
            gaps: GapList::new(peer_initial_tsn.wrapping_sub(1)),
            duplicates: vec![],
            packets_since_sack: 0,
            immediate: false,
            next_sequence: 0,
        }
    }

    /// Records a DATA chunk's TSN. Duplicates are remembered for the next
    /// SACK and force it out immediately.
    pub fn record(&mut self, tsn: u32) -> Arrival {
        let arrival = self.gaps.record(tsn);
        match arrival {
            Arrival::Duplicate => {
                if self.duplicates.len() < MAX_DUPLICATES {
                    self.duplicates.push(tsn);
                }
                self.immediate = true;
            }
            Arrival::New if self.gaps.has_gaps() => self.immediate = true,
            Arrival::New => {}
        }
        arrival
    }

    /// A SACK is owed at all
    pub fn owes_sack(&self) -> bool {
        self.packets_since_sack > 0 || self.immediate
    }

    /// Should a SACK go out now instead of after the delay?
    pub fn must_sack_now(&self, sack_frequency: u32) -> bool {
        self.immediate || self.packets_since_sack >= sack_frequency
    }

    /// Builds the next SACK and resets the delayed-ack bookkeeping. Every
    /// duplicate is reported exactly once.
    pub fn build(&mut self, a_rwnd: u32, nr_sack: bool, with_sequence: bool) -> Sack {
        let gap_blocks = self.gaps.gap_blocks();
        let sequence = with_sequence.then(|| {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            sequence
        });
        self.packets_since_sack = 0;
        self.immediate = false;
        Sack {
            cum_tsn_ack: self.gaps.cum_tsn(),
            a_rwnd,
            // Nothing is ever reneged, so every block is non-renegable
            nr_gap_blocks: nr_sack.then(|| gap_blocks.clone()),
            gap_blocks,
            duplicates: std::mem::take(&mut self.duplicates),
            sequence,
        }
    }
}

/// How an inbound SACK relates to what has been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SackCheck {
    Accept,
    /// Older than the current cumulative ack point or out of sequence
    Stale,
    /// Acknowledges a TSN that was never sent
    AcksUnsent,
}

/// Classifies a SACK before it is applied. `last_sequence` is the highest
/// SACK sequence number seen, when sequence checking is enabled.
pub fn check(queue: &QueueEngine, sack: &Sack, last_sequence: Option<u32>) -> SackCheck {
    if let (Some(last), Some(sequence)) = (last_sequence, sack.sequence) {
        if !tsn_gt(sequence, last) {
            return SackCheck::Stale;
        }
    }
    if tsn_lt(sack.cum_tsn_ack, queue.cum_tsn_ack()) {
        return SackCheck::Stale;
    }
    if tsn_gt(sack.cum_tsn_ack, queue.highest_sent()) {
        return SackCheck::AcksUnsent;
    }
    SackCheck::Accept
}

/// What applying a SACK changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SackOutcome {
    pub ctsna_advanced: bool,
    pub newly_acked_bytes: u32,
    /// Messages fully retired by the cumulative ack
    pub retired_chunks: usize,
    /// Karn-safe round-trip measurements, newest per path
    pub rtt_samples: Vec<(PathId, Duration)>,
    /// Paths on which a fast retransmission was triggered, each once
    pub fast_retransmit_paths: Vec<PathId>,
    pub reneged: usize,
}

/// Applies an accepted SACK to the retransmission queue and the paths.
///
/// The cumulative ack retires chunks; gap blocks mark chunks acknowledged;
/// chunks below the highest newly acknowledged TSN that the SACK leaves
/// uncovered collect a missing report, and `fast_retransmit_threshold`
/// reports mark a chunk for fast retransmission.
pub fn apply(
    queue: &mut QueueEngine,
    sack: &Sack,
    paths: &mut PathTable,
    now: Instant,
    fast_retransmit_threshold: u32,
) -> SackOutcome {
    let mut outcome = SackOutcome::default();
    paths.begin_sack();

    let cum = sack.cum_tsn_ack;
    outcome.ctsna_advanced = tsn_gt(cum, queue.cum_tsn_ack());
    for mut unit in queue.retire_through(cum, paths) {
        outcome.retired_chunks += 1;
        if let Some(last) = unit.last_destination {
            paths[last].new_cum_ack = true;
        }
        if !unit.acked && !unit.abandoned {
            unit.acked = true;
            outcome.newly_acked_bytes += unit.len();
            if let Some(last) = unit.last_destination {
                paths[last].newly_acked_bytes += unit.len();
                if unit.transmissions == 1 {
                    record_sample(&mut outcome, last, unit.sent_at, now);
                }
            }
        }
    }

    let covers = |blocks: &[GapBlock], tsn: u32| {
        let offset = tsn.wrapping_sub(cum);
        blocks
            .iter()
            .any(|b| (b.start as u32) <= offset && offset <= (b.end as u32))
    };
    let nr_blocks = sack.nr_gap_blocks.as_deref().unwrap_or(&[]);
    let highest_reported = sack
        .gap_blocks
        .iter()
        .chain(nr_blocks)
        .map(|b| cum.wrapping_add(b.end as u32))
        .fold(cum, tsn_max);

    let mut highest_newly_acked = cum;
    for unit in queue.retransmission.iter_mut() {
        if tsn_gt(unit.tsn, highest_reported) {
            break;
        }
        let nr = covers(nr_blocks, unit.tsn);
        if covers(&sack.gap_blocks, unit.tsn) || nr {
            if nr {
                unit.nr_acked = true;
            }
            if unit.acked {
                continue;
            }
            unit.acked = true;
            unit.needs_retransmit = false;
            if unit.in_flight {
                unit.in_flight = false;
                if let Some(last) = unit.last_destination {
                    let path = &mut paths[last];
                    path.outstanding_bytes = path.outstanding_bytes.saturating_sub(unit.len());
                }
            }
            if unit.abandoned {
                continue;
            }
            highest_newly_acked = tsn_max(highest_newly_acked, unit.tsn);
            outcome.newly_acked_bytes += unit.len();
            if let Some(last) = unit.last_destination {
                paths[last].newly_acked_bytes += unit.len();
                if unit.transmissions == 1 {
                    record_sample(&mut outcome, last, unit.sent_at, now);
                }
            }
        } else if unit.acked && !unit.nr_acked {
            // Reneged: the receiver dropped data it had reported
            unit.acked = false;
            if !unit.abandoned {
                unit.needs_retransmit = true;
                unit.next_destination = unit.last_destination;
                outcome.reneged += 1;
            }
        }
    }

    for unit in queue.retransmission.iter_mut() {
        if unit.acked || unit.abandoned || unit.needs_retransmit || unit.fast_retransmitted {
            continue;
        }
        let Some(last) = unit.last_destination else {
            continue;
        };
        // Inside fast recovery only newly acknowledged data counts
        let reference = if paths[last].in_fast_recovery() {
            highest_newly_acked
        } else {
            highest_reported
        };
        if !tsn_lt(unit.tsn, reference) {
            continue;
        }
        unit.missing_reports += 1;
        if unit.missing_reports >= fast_retransmit_threshold {
            unit.missing_reports = 0;
            unit.fast_retransmitted = true;
            unit.needs_retransmit = true;
            if unit.in_flight {
                unit.in_flight = false;
                let path = &mut paths[last];
                path.outstanding_bytes = path.outstanding_bytes.saturating_sub(unit.len());
            }
            unit.next_destination = Some(if paths[last].active {
                last
            } else {
                paths.retransmission_destination(last)
            });
            if !outcome.fast_retransmit_paths.contains(&last) {
                outcome.fast_retransmit_paths.push(last);
            }
        }
    }

    outcome
}

fn record_sample(outcome: &mut SackOutcome, path: PathId, sent_at: Option<Instant>, now: Instant) {
    let Some(sent_at) = sent_at else {
        return;
    };
    let rtt = now.saturating_duration_since(sent_at);
    match outcome.rtt_samples.iter_mut().find(|(id, _)| *id == path) {
        Some(sample) => sample.1 = sample.1.min(rtt),
        None => outcome.rtt_samples.push((path, rtt)),
    }
}
