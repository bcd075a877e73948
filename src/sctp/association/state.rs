use std::fmt;

/// The state of the association state machine as described in RFC 4960
/// section 4. A listening endpoint keeps its association in `Closed` until a
/// valid COOKIE-ECHO arrives.
///
/// ```text
///                      -----          -------- (from any state)
///                    /       \      /  rcv ABORT      [ABORT]
///   rcv INIT        |         |    |   ----------  or ----------
///   --------------- |         v    v   delete TCB     snd ABORT
///   generate Cookie  \    +---------+                 delete TCB
///   snd INIT ACK       ---|  CLOSED |
///                         +---------+
///                          /      \      [ASSOCIATE]
///                         /        \     ---------------
///                        |          |    create TCB
///                        |          |    snd INIT
///                        |          |    strt init timer
///         rcv valid      |          |
///       COOKIE  ECHO     |          v
///   (1) ---------------- |      +------------+
///       create TCB       |      | COOKIE-WAIT| (2)
///       snd COOKIE ACK   |      +------------+
///                        |          |
///                        |          |    rcv INIT ACK
///                        |          |    -----------------
///                        |          |    snd COOKIE ECHO
///                        |          |    stop init timer
///                        |          |    strt cookie timer
///                        |          v
///                        |      +--------------+
///                        |      | COOKIE-ECHOED| (3)
///                        |      +--------------+
///                        |          |
///                        |          |    rcv COOKIE ACK
///                        |          |    -----------------
///                        |          |    stop cookie timer
///                        v          v
///                      +---------------+
///                      |  ESTABLISHED  |
///                      +---------------+
///                         |            |
///        [SHUTDOWN]       |            |  rcv SHUTDOWN / check
///   -------------------- |            |  outstanding DATA chunks
///   check outstanding    |            |
///   DATA chunks          v            v
///             +---------+              +----------+
///             |SHUTDOWN-|              | SHUTDOWN-|
///             |PENDING  |              | RECEIVED |
///             +---------+              +----------+
///   No more outstanding |                   | No more outstanding
///   ------------------- |                   | -------------------
///   snd SHUTDOWN        |                   | snd SHUTDOWN ACK
///   strt shutdown timer |                   | strt shutdown timer
///                       v                   v
///             +---------+              +-----------+
///             |SHUTDOWN-|              | SHUTDOWN- |
///             |SENT     |              | ACK-SENT  |
///             +---------+              +-----------+
///   rcv SHUTDOWN ACK    |                   | rcv SHUTDOWN COMPLETE
///   ------------------- |                   | ---------------------
///   stop shutdown timer |                   | stop shutdown timer
///   snd SHUTDOWN        |                   | delete TCB
///     COMPLETE          |                   |
///   delete TCB          v                   v
///                         +---------+
///                         |  CLOSED |
///                         +---------+
/// ```
/// Figure 3: State Transition Diagram of SCTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum State {
    /// No association exists, or a passive endpoint waits for a COOKIE-ECHO.
    #[default]
    Closed,
    /// INIT sent, waiting for INIT-ACK.
    CookieWait,
    /// COOKIE-ECHO sent, waiting for COOKIE-ACK.
    CookieEchoed,
    /// Data flows in both directions.
    Established,
    /// The application asked to close; outstanding data drains first.
    ShutdownPending,
    /// SHUTDOWN sent, waiting for SHUTDOWN-ACK.
    ShutdownSent,
    /// The peer sent SHUTDOWN; our outstanding data drains first.
    ShutdownReceived,
    /// SHUTDOWN-ACK sent, waiting for SHUTDOWN-COMPLETE.
    ShutdownAckSent,
}

impl State {
    /// States in which DATA may be transmitted
    pub fn can_send_data(self) -> bool {
        matches!(
            self,
            State::Established | State::ShutdownPending | State::ShutdownReceived
        )
    }

    /// States in which inbound DATA is accepted
    pub fn can_receive_data(self) -> bool {
        matches!(
            self,
            State::Established | State::ShutdownPending | State::ShutdownSent
        )
    }

    /// Is the association on its way out?
    pub fn is_shutting_down(self) -> bool {
        matches!(
            self,
            State::ShutdownPending
                | State::ShutdownSent
                | State::ShutdownReceived
                | State::ShutdownAckSent
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::CookieWait => "COOKIE_WAIT",
            State::CookieEchoed => "COOKIE_ECHOED",
            State::Established => "ESTABLISHED",
            State::ShutdownPending => "SHUTDOWN_PENDING",
            State::ShutdownSent => "SHUTDOWN_SENT",
            State::ShutdownReceived => "SHUTDOWN_RECEIVED",
            State::ShutdownAckSent => "SHUTDOWN_ACK_SENT",
        };
        f.write_str(name)
    }
}

/// Everything that can move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    RcvInit,
    RcvInitAck,
    RcvValidCookieEcho,
    RcvCookieAck,
    RcvAbort,
    RcvShutdown,
    RcvShutdownAck,
    RcvShutdownComplete,
    Associate,
    OpenPassive,
    Send,
    Close,
    Abort,
    Shutdown,
    NoMoreOutstanding,
    /// INIT or COOKIE-ECHO retransmitted too often
    InitTimeout,
    /// SHUTDOWN or SHUTDOWN-ACK retransmitted too often
    ShutdownTimeout,
    ShutdownGuardTimeout,
    /// The association error counter passed its limit
    RtxTimeout,
    /// Every path failed its heartbeats
    HeartbeatTimeout,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where an event leads from a given state. `None` marks an event the state
/// does not accept.
pub fn transition(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    // Any state may be aborted locally or by the peer
    if matches!(event, Abort | RcvAbort) {
        return Some(Closed);
    }

    let next = match (state, event) {
        (Closed, Associate) => CookieWait,
        (Closed, OpenPassive) => Closed,
        (Closed, RcvInit) => Closed,
        (Closed, RcvValidCookieEcho) => Established,

        (CookieWait, RcvInitAck) => CookieEchoed,
        (CookieWait, RcvValidCookieEcho) => Established,
        (CookieWait | CookieEchoed, Send) => state,
        (CookieWait | CookieEchoed, InitTimeout) => Closed,
        (CookieWait | CookieEchoed, Close | Shutdown) => Closed,

        (CookieEchoed, RcvCookieAck) => Established,
        (CookieEchoed, RcvValidCookieEcho) => Established,

        (Established, Send) => Established,
        (Established, Close | Shutdown) => ShutdownPending,
        (Established, RcvShutdown) => ShutdownReceived,

        (ShutdownPending, NoMoreOutstanding) => ShutdownSent,
        (ShutdownPending, RcvShutdown) => ShutdownReceived,

        (ShutdownReceived, NoMoreOutstanding) => ShutdownAckSent,
        (ShutdownReceived, RcvShutdown) => ShutdownReceived,

        (ShutdownSent, RcvShutdownAck) => Closed,
        (ShutdownSent, RcvShutdown) => ShutdownAckSent,

        (ShutdownAckSent, RcvShutdownComplete) => Closed,
        (ShutdownAckSent, RcvShutdownAck) => Closed,
        (ShutdownAckSent, RcvShutdown) => ShutdownAckSent,

        (
            Established | ShutdownPending | ShutdownReceived | ShutdownSent | ShutdownAckSent,
            RtxTimeout | HeartbeatTimeout,
        ) => Closed,
        (ShutdownPending | ShutdownSent | ShutdownReceived | ShutdownAckSent, ShutdownGuardTimeout) => {
            Closed
        }
        (ShutdownSent | ShutdownAckSent, ShutdownTimeout) => Closed,

        _ => return None,
    };
    Some(next)
}

/// Events that a state does not accept but that arrive in normal operation
/// through retransmission or reordering. They are dropped without aborting.
pub fn is_tolerated(state: State, event: Event) -> bool {
    use Event::*;
    use State::*;
    matches!(
        (state, event),
        // Retransmitted handshake chunks after the handshake finished
        (CookieEchoed | Established | ShutdownPending | ShutdownSent | ShutdownReceived | ShutdownAckSent, RcvInitAck)
            | (Established | ShutdownPending | ShutdownReceived | ShutdownSent, RcvCookieAck)
            | (Established | ShutdownPending | ShutdownSent | ShutdownReceived, RcvValidCookieEcho)
            | (_, RcvInit)
            // Already on the way out
            | (ShutdownPending | ShutdownSent | ShutdownReceived | ShutdownAckSent, Close | Shutdown | Send)
            | (ShutdownPending | ShutdownReceived, NoMoreOutstanding)
            | (Established, NoMoreOutstanding)
            // Stray shutdown chunks for an association that is closing anyway
            | (Closed, RcvShutdownAck | RcvShutdownComplete)
            | (ShutdownSent, RcvShutdownComplete)
    )
}
