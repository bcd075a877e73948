use super::path::PathId;
use rustc_hash::FxHashMap;
use std::{fmt, time::Duration};

/// An opaque handle for a timer registered with the driver. Tokens are never
/// reused within an association, so a late expiry of a canceled timer can be
/// told apart from a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(u64);

impl TimerToken {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// What a timer is for. At most one timer of each kind is armed at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// T1: retransmits INIT or COOKIE-ECHO
    Init,
    /// Discards a passive association whose cookie never came back
    CookieLifetime,
    /// T2: retransmits SHUTDOWN or SHUTDOWN-ACK
    Shutdown,
    /// T5: bounds the whole shutdown procedure
    ShutdownGuard,
    DelayedSack,
    /// Retransmits an unanswered stream reset request
    Reconfig,
    /// Waits for a HEARTBEAT-ACK
    Heartbeat(PathId),
    /// Time until the next HEARTBEAT on a path
    HeartbeatInterval(PathId),
    /// Decays cwnd on a path that has gone idle
    Cwnd(PathId),
    /// T3-rtx
    Retransmission(PathId),
}

/// A request for the driver to arm or disarm a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRequest {
    Start { token: TimerToken, after: Duration },
    Cancel(TimerToken),
}

/// Tracks which timers are armed. Every start and cancel queues a
/// [`TimerRequest`] for the driver; canceling a timer that is not armed
/// queues nothing.
#[derive(Debug, Default)]
pub struct TimerTable {
    next_token: u64,
    armed: FxHashMap<TimerKind, TimerToken>,
    kinds: FxHashMap<TimerToken, TimerKind>,
    requests: Vec<TimerRequest>,
}

impl TimerTable {
    /// Arms a timer, replacing any armed timer of the same kind.
    pub fn start(&mut self, kind: TimerKind, after: Duration) {
        self.stop(kind);
        let token = TimerToken(self.next_token);
        self.next_token += 1;
        self.armed.insert(kind, token);
        self.kinds.insert(token, kind);
        self.requests.push(TimerRequest::Start { token, after });
    }

    /// Arms a timer only if one of the same kind is not already running.
    pub fn start_if_idle(&mut self, kind: TimerKind, after: Duration) {
        if !self.is_armed(kind) {
            self.start(kind, after);
        }
    }

    pub fn stop(&mut self, kind: TimerKind) {
        if let Some(token) = self.armed.remove(&kind) {
            self.kinds.remove(&token);
            self.requests.push(TimerRequest::Cancel(token));
        }
    }

    /// Disarms every timer. Used on entering CLOSED.
    pub fn stop_all(&mut self) {
        let mut tokens: Vec<_> = self.kinds.drain().map(|(token, _)| token).collect();
        tokens.sort();
        self.armed.clear();
        self.requests.extend(tokens.into_iter().map(TimerRequest::Cancel));
    }

    /// Resolves an expired token. Returns `None` for tokens that were canceled
    /// or replaced in the meantime.
    pub fn fire(&mut self, token: TimerToken) -> Option<TimerKind> {
        let kind = self.kinds.remove(&token)?;
        self.armed.remove(&kind);
        Some(kind)
    }

    /// Hands the queued requests to the driver.
    pub fn take_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
