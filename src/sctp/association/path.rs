use super::config::Config;
use std::{
    fmt,
    net::IpAddr,
    ops::{Index, IndexMut},
    time::{Duration, Instant},
};

/// A stable handle for a destination in the association's path table. Paths
/// are only removed when the association is torn down, so a `PathId` stays
/// valid for the lifetime of its association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(u16);

impl PathId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn into_inner(self) -> u16 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// Round-trip time and retransmission timeout estimation per RFC 4960
/// section 6.3.1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
    alpha: f64,
    beta: f64,
}

impl RtoEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: config.rto_initial,
            min: config.rto_min,
            max: config.rto_max,
            alpha: config.rto_alpha,
            beta: config.rto_beta,
        }
    }

    /// Folds a fresh measurement into the estimate. Measurements must never
    /// come from retransmitted chunks.
    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar.mul_f64(1.0 - self.beta) + delta.mul_f64(self.beta);
                self.srtt = Some(srtt.mul_f64(1.0 - self.alpha) + rtt.mul_f64(self.alpha));
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min, self.max);
    }

    /// Doubles the timeout after a retransmission timer expiry.
    pub fn back_off(&mut self) {
        self.rto = (self.rto * 2).min(self.max);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }
}

/// One remote transport address of the peer.
#[derive(Debug, Clone)]
pub struct Path {
    pub id: PathId,
    pub address: IpAddr,
    /// Reachable as far as the failure detection knows
    pub active: bool,
    /// A HEARTBEAT-ACK or handshake chunk has arrived from this address
    pub confirmed: bool,
    pub rto: RtoEstimator,
    /// Largest SCTP packet on this path
    pub pmtu: u32,
    cwnd: u32,
    pub ssthresh: u32,
    pub partial_bytes_acked: u32,
    /// Bytes of DATA sent on this path and not yet acknowledged, abandoned
    /// or marked for retransmission
    pub outstanding_bytes: u32,
    /// Consecutive unanswered retransmissions and heartbeats
    pub error_count: u32,
    pub error_threshold: u32,
    /// Exit point of fast recovery, if in it
    pub fast_recovery_exit: Option<u32>,
    pub last_transmission: Option<Instant>,
    /// Bytes acknowledged for this path by the SACK being processed
    pub newly_acked_bytes: u32,
    /// The SACK being processed advanced the cumulative ack over a chunk
    /// last sent on this path
    pub new_cum_ack: bool,
    /// Outstanding bytes when the SACK being processed arrived
    pub outstanding_before_sack: u32,
}

impl Path {
    pub fn new(id: PathId, address: IpAddr, config: &Config) -> Self {
        Self {
            id,
            address,
            active: true,
            confirmed: false,
            rto: RtoEstimator::new(config),
            pmtu: config.pmtu,
            cwnd: config.pmtu,
            ssthresh: config.a_rwnd,
            partial_bytes_acked: 0,
            outstanding_bytes: 0,
            error_count: 0,
            error_threshold: config.path_max_retrans,
            fast_recovery_exit: None,
            last_transmission: None,
            newly_acked_bytes: 0,
            new_cum_ack: false,
            outstanding_before_sack: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Sets the congestion window, never below one MTU.
    pub fn set_cwnd(&mut self, cwnd: u32) {
        self.cwnd = cwnd.max(self.pmtu);
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery_exit.is_some()
    }

    /// Counts a failure. Returns true when this failure took the path down.
    pub fn record_error(&mut self) -> bool {
        self.error_count += 1;
        if self.active && self.error_count >= self.error_threshold {
            self.active = false;
            true
        } else {
            false
        }
    }

    /// Clears the failure count after a successful exchange. Returns true
    /// when the path came back up.
    pub fn record_success(&mut self) -> bool {
        self.error_count = 0;
        self.confirmed = true;
        if self.active {
            false
        } else {
            self.active = true;
            true
        }
    }

    /// Clears the failure count after data sent here was acknowledged. The
    /// path stays down until a HEARTBEAT-ACK confirms it.
    pub fn record_ack(&mut self) {
        self.error_count = 0;
    }

    fn reset_sack_scratch(&mut self) {
        self.newly_acked_bytes = 0;
        self.new_cum_ack = false;
        self.outstanding_before_sack = self.outstanding_bytes;
    }
}

/// The ordered set of destinations with a designated primary.
#[derive(Debug, Clone)]
pub struct PathTable {
    paths: Vec<Path>,
    primary: PathId,
    /// The primary chosen by the application or handshake, which failover
    /// may have moved away from
    preferred: PathId,
}

impl PathTable {
    /// Builds a table whose primary is the first address.
    pub fn new(addresses: impl IntoIterator<Item = IpAddr>, config: &Config) -> Self {
        let mut table = Self {
            paths: vec![],
            primary: PathId(0),
            preferred: PathId(0),
        };
        for address in addresses {
            table.add(address, config);
        }
        table
    }

    /// Adds a destination unless it is already known.
    pub fn add(&mut self, address: IpAddr, config: &Config) -> PathId {
        if let Some(existing) = self.by_address(address) {
            return existing;
        }
        let id = PathId(self.paths.len() as u16);
        self.paths.push(Path::new(id, address, config));
        id
    }

    pub fn get(&self, id: PathId) -> Option<&Path> {
        self.paths.get(id.index())
    }

    pub fn by_address(&self, address: IpAddr) -> Option<PathId> {
        self.paths.iter().find(|p| p.address == address).map(|p| p.id)
    }

    pub fn primary(&self) -> PathId {
        self.primary
    }

    pub fn preferred(&self) -> PathId {
        self.preferred
    }

    /// Makes a path the primary at the application's request.
    pub fn set_primary(&mut self, id: PathId) {
        self.primary = id;
        self.preferred = id;
    }

    /// Moves traffic to another path without changing the preference.
    pub fn switch_primary(&mut self, id: PathId) {
        self.primary = id;
    }

    /// The next active path after `from` in table order, wrapping around.
    /// Returns `from` itself only if no other path is active.
    pub fn next_active_after(&self, from: PathId) -> Option<PathId> {
        let count = self.paths.len();
        (1..=count)
            .map(|offset| &self.paths[(from.index() + offset) % count])
            .find(|p| p.active)
            .map(|p| p.id)
    }

    /// Where to send a retransmission of data last sent on `last`: another
    /// active path if one exists, per RFC 4960 section 6.4.
    pub fn retransmission_destination(&self, last: PathId) -> PathId {
        match self.next_active_after(last) {
            Some(other) => other,
            None => self.primary,
        }
    }

    /// Moves the primary to the next active path. Returns the new primary,
    /// or `None` when every path is down.
    pub fn fail_over(&mut self) -> Option<PathId> {
        let next = self.next_active_after(self.primary)?;
        self.primary = next;
        Some(next)
    }

    pub fn all_inactive(&self) -> bool {
        self.paths.iter().all(|p| !p.active)
    }

    pub fn total_outstanding(&self) -> u32 {
        self.paths.iter().map(|p| p.outstanding_bytes).sum()
    }

    /// Clears the per-SACK counters before a SACK is applied.
    pub fn begin_sack(&mut self) {
        for path in self.paths.iter_mut() {
            path.reset_sack_scratch();
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = PathId> + '_ {
        self.paths.iter().map(|p| p.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> + '_ {
        self.paths.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Path> + '_ {
        self.paths.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Index<PathId> for PathTable {
    type Output = Path;

    fn index(&self, id: PathId) -> &Self::Output {
        &self.paths[id.index()]
    }
}

impl IndexMut<PathId> for PathTable {
    fn index_mut(&mut self, id: PathId) -> &mut Self::Output {
        &mut self.paths[id.index()]
    }
}
