use super::{congestion::CongestionControlKind, streams::StreamSchedulerKind};
use std::time::Duration;

/// Tunables for a single association. [`Config::default`] carries the
/// protocol constants of RFC 4960 section 15, 17 streams each way and a
/// 64 KiB receive window.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Streams the peer may open toward us
    pub inbound_streams: u16,
    /// Streams we ask to open toward the peer
    pub outbound_streams: u16,
    /// Receive window advertised to the peer
    pub a_rwnd: u32,
    /// Largest SCTP packet, common header included
    pub pmtu: u32,
    pub valid_cookie_lifetime: Duration,
    pub rto_initial: Duration,
    pub rto_min: Duration,
    pub rto_max: Duration,
    pub rto_alpha: f64,
    pub rto_beta: f64,
    /// Upper bound on the INIT / COOKIE-ECHO retransmission timeout
    pub init_rto_max: Duration,
    pub max_init_retrans: u32,
    /// Consecutive errors across all paths before the peer is declared
    /// unreachable
    pub assoc_max_retrans: u32,
    /// Consecutive errors before a single path is marked inactive
    pub path_max_retrans: u32,
    pub heartbeats: bool,
    pub heartbeat_interval: Duration,
    pub sack_delay: Duration,
    /// Packets carrying DATA received before a SACK is sent without delay
    pub sack_frequency: u32,
    /// Missing reports that trigger a fast retransmission
    pub fast_retransmit_threshold: u32,
    pub max_burst: u32,
    pub shutdown_guard: Duration,
    /// Bytes that may wait in the send streams. Zero disables the limit.
    pub send_queue_limit_bytes: usize,
    /// Messages that may wait in the send streams. Zero disables the limit.
    pub send_queue_limit_messages: usize,
    /// Advertise gap blocks as non-renegable in NR-SACK chunks
    pub nr_sack: bool,
    /// Stamp outgoing SACKs with a sequence number and drop reordered ones
    pub check_sack_seq_number: bool,
    /// Hold back sub-MTU data while data is outstanding
    pub nagle: bool,
    /// Offer and honor partial reliability
    pub forward_tsn: bool,
    /// Switch back to the configured primary once it answers heartbeats again
    pub reactivate_primary_path: bool,
    /// Deliver complete messages as they arrive instead of waiting for a
    /// receive request
    pub deliver_on_arrival: bool,
    pub congestion: CongestionControlKind,
    pub scheduler: StreamSchedulerKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inbound_streams: 17,
            outbound_streams: 17,
            a_rwnd: 65536,
            pmtu: 1500,
            valid_cookie_lifetime: Duration::from_secs(10),
            rto_initial: Duration::from_secs(3),
            rto_min: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            rto_alpha: 0.125,
            rto_beta: 0.25,
            init_rto_max: Duration::from_secs(240),
            max_init_retrans: 8,
            assoc_max_retrans: 10,
            path_max_retrans: 5,
            heartbeats: true,
            heartbeat_interval: Duration::from_secs(30),
            sack_delay: Duration::from_millis(200),
            sack_frequency: 2,
            fast_retransmit_threshold: 3,
            max_burst: 4,
            shutdown_guard: Duration::from_secs(180),
            send_queue_limit_bytes: 0,
            send_queue_limit_messages: 0,
            nr_sack: false,
            check_sack_seq_number: false,
            nagle: false,
            forward_tsn: true,
            reactivate_primary_path: false,
            deliver_on_arrival: true,
            congestion: CongestionControlKind::Rfc4960,
            scheduler: StreamSchedulerKind::RoundRobin,
        }
    }
}
