use super::{modular_cmp::tsn_ge, path::Path};
use std::fmt;

/// Congestion control for the paths of one association. An implementation
/// owns the evolution of `cwnd`, `ssthresh` and `partial_bytes_acked`; the
/// association tells it what happened and asks how much it may send.
pub trait CongestionControl: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Sets the starting window once the peer's receive window is known.
    fn init_path(&self, path: &mut Path, peer_rwnd: u32);

    /// Newly acknowledged bytes of data last sent on `path`.
    fn on_bytes_acked(&self, path: &mut Path, acked: u32, ctsna_advanced: bool, peer_rwnd: u32);

    /// A fast retransmission was triggered on `path`. `exit_point` is the
    /// highest TSN outstanding when the loss was detected.
    fn on_fast_retransmit(&self, path: &mut Path, exit_point: u32);

    /// The T3-rtx timer of `path` expired.
    fn on_rtx_timeout(&self, path: &mut Path);

    /// `path` has been idle for an RTO.
    fn on_cwnd_timeout(&self, path: &mut Path);

    /// Leaves fast recovery once the loss point has been acknowledged.
    fn on_cum_ack(&self, path: &mut Path, cum_tsn_ack: u32) {
        if let Some(exit) = path.fast_recovery_exit {
            if tsn_ge(cum_tsn_ack, exit) {
                path.fast_recovery_exit = None;
            }
        }
    }

    /// Bytes of new data `path` may put on the wire, bounded by cwnd and by
    /// `max_burst` packets beyond what is already outstanding.
    fn admissible(&self, path: &Path, max_burst: u32) -> u32 {
        let burst = path
            .outstanding_bytes
            .saturating_add(max_burst.saturating_mul(path.pmtu));
        path.cwnd().min(burst).saturating_sub(path.outstanding_bytes)
    }
}

/// Selects the congestion control of new associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControlKind {
    #[default]
    Rfc4960,
    /// A constant window in bytes, for experiments and tests
    FixedWindow(u32),
}

impl CongestionControlKind {
    pub fn build(self) -> Box<dyn CongestionControl> {
        match self {
            CongestionControlKind::Rfc4960 => Box::new(Rfc4960),
            CongestionControlKind::FixedWindow(window) => Box::new(FixedWindow { window }),
        }
    }
}

/// Slow start, congestion avoidance and fast recovery as described in
/// RFC 4960 section 7.2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc4960;

impl Rfc4960 {
    /// min(4 MTU, max(2 MTU, 4380))
    pub fn initial_cwnd(pmtu: u32) -> u32 {
        (4 * pmtu).min((2 * pmtu).max(4380))
    }

    fn reduced_ssthresh(path: &Path) -> u32 {
        (path.cwnd() / 2).max(2 * path.pmtu)
    }
}

impl CongestionControl for Rfc4960 {
    fn name(&self) -> &'static str {
        "rfc4960"
    }

    fn init_path(&self, path: &mut Path, peer_rwnd: u32) {
        path.set_cwnd(Self::initial_cwnd(path.pmtu));
        path.ssthresh = peer_rwnd;
        path.partial_bytes_acked = 0;
        path.fast_recovery_exit = None;
    }

    fn on_bytes_acked(&self, path: &mut Path, acked: u32, ctsna_advanced: bool, peer_rwnd: u32) {
        if path.in_fast_recovery() || acked == 0 {
            return;
        }
        // Growth stops at the receiver's window, but never shrinks cwnd
        let cap = peer_rwnd.max(path.cwnd());

        if path.cwnd() <= path.ssthresh {
            if ctsna_advanced {
                let grown = path.cwnd().saturating_add(acked).min(cap);
                path.set_cwnd(grown);
            }
        } else {
            path.partial_bytes_acked = path.partial_bytes_acked.saturating_add(acked);
            if path.partial_bytes_acked >= path.cwnd()
                && path.outstanding_before_sack >= path.cwnd()
            {
                path.partial_bytes_acked -= path.cwnd();
                let grown = path.cwnd().saturating_add(path.pmtu).min(cap);
                path.set_cwnd(grown);
            }
        }

        if path.outstanding_bytes == 0 {
            path.partial_bytes_acked = 0;
        }
    }

    fn on_fast_retransmit(&self, path: &mut Path, exit_point: u32) {
        if path.in_fast_recovery() {
            return;
        }
        path.ssthresh = Self::reduced_ssthresh(path);
        path.set_cwnd(path.ssthresh);
        path.partial_bytes_acked = 0;
        path.fast_recovery_exit = Some(exit_point);
    }

    fn on_rtx_timeout(&self, path: &mut Path) {
        path.ssthresh = Self::reduced_ssthresh(path);
        path.set_cwnd(Self::initial_cwnd(path.pmtu));
        path.partial_bytes_acked = 0;
        path.fast_recovery_exit = None;
    }

    fn on_cwnd_timeout(&self, path: &mut Path) {
        let decayed = (path.cwnd() / 2).max(Self::initial_cwnd(path.pmtu));
        if decayed < path.cwnd() {
            path.set_cwnd(decayed);
        }
    }
}

/// Holds cwnd at a constant size regardless of loss.
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow {
    window: u32,
}

impl CongestionControl for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn init_path(&self, path: &mut Path, _peer_rwnd: u32) {
        path.set_cwnd(self.window);
        path.ssthresh = self.window;
    }

    fn on_bytes_acked(&self, _: &mut Path, _: u32, _: bool, _: u32) {}

    fn on_fast_retransmit(&self, path: &mut Path, exit_point: u32) {
        path.fast_recovery_exit.get_or_insert(exit_point);
    }

    fn on_rtx_timeout(&self, path: &mut Path) {
        path.fast_recovery_exit = None;
    }

    fn on_cwnd_timeout(&self, _: &mut Path) {}
}
