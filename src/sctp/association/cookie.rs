use std::time::{Duration, Instant};

const SECRET_LENGTH: usize = 16;
const COOKIE_LENGTH: usize = 4 * 4 + 2 * 2 + 4 + 1 + 8 + SECRET_LENGTH;

/// Everything needed to establish an association from a COOKIE-ECHO alone.
/// The cookie is opaque to the peer and bound to the association that made
/// it by a random secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCookie {
    pub local_tag: u32,
    pub peer_tag: u32,
    pub local_initial_tsn: u32,
    pub peer_initial_tsn: u32,
    /// Negotiated streams toward the peer
    pub outbound_streams: u16,
    /// Negotiated streams from the peer
    pub inbound_streams: u16,
    pub peer_rwnd: u32,
    pub peer_forward_tsn: bool,
    /// Milliseconds since the association's epoch
    pub created: u64,
}

/// Why a cookie was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieRejection {
    Malformed,
    /// Not made by this association
    Forged,
    /// Older than the valid lifetime by this much
    Stale(Duration),
}

/// Makes and checks the state cookies of one association.
#[derive(Debug, Clone)]
pub struct CookieJar {
    epoch: Instant,
    secret: [u8; SECRET_LENGTH],
    lifetime: Duration,
}

impl CookieJar {
    pub fn new(epoch: Instant, secret: [u8; SECRET_LENGTH], lifetime: Duration) -> Self {
        Self {
            epoch,
            secret,
            lifetime,
        }
    }

    /// Milliseconds since the epoch, for stamping a cookie
    pub fn stamp(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub fn bake(&self, cookie: &StateCookie) -> Vec<u8> {
        let mut out = Vec::with_capacity(COOKIE_LENGTH);
        out.extend_from_slice(&cookie.local_tag.to_be_bytes());
        out.extend_from_slice(&cookie.peer_tag.to_be_bytes());
        out.extend_from_slice(&cookie.local_initial_tsn.to_be_bytes());
        out.extend_from_slice(&cookie.peer_initial_tsn.to_be_bytes());
        out.extend_from_slice(&cookie.outbound_streams.to_be_bytes());
        out.extend_from_slice(&cookie.inbound_streams.to_be_bytes());
        out.extend_from_slice(&cookie.peer_rwnd.to_be_bytes());
        out.push(cookie.peer_forward_tsn as u8);
        out.extend_from_slice(&cookie.created.to_be_bytes());
        out.extend_from_slice(&self.secret);
        out
    }

    /// Reads back a cookie this jar baked, refusing foreign or expired ones.
    pub fn open(&self, bytes: &[u8], now: Instant) -> Result<StateCookie, CookieRejection> {
        if bytes.len() != COOKIE_LENGTH {
            return Err(CookieRejection::Malformed);
        }
        let u32_at = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u16_at = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);

        let secret_at = COOKIE_LENGTH - SECRET_LENGTH;
        if bytes[secret_at..] != self.secret {
            return Err(CookieRejection::Forged);
        }

        let mut created = [0; 8];
        created.copy_from_slice(&bytes[25..33]);
        let cookie = StateCookie {
            local_tag: u32_at(0),
            peer_tag: u32_at(4),
            local_initial_tsn: u32_at(8),
            peer_initial_tsn: u32_at(12),
            outbound_streams: u16_at(16),
            inbound_streams: u16_at(18),
            peer_rwnd: u32_at(20),
            peer_forward_tsn: bytes[24] != 0,
            created: u64::from_be_bytes(created),
        };

        let age = Duration::from_millis(self.stamp(now).saturating_sub(cookie.created));
        if age > self.lifetime {
            return Err(CookieRejection::Stale(age - self.lifetime));
        }
        Ok(cookie)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(created: u64) -> StateCookie {
        StateCookie {
            local_tag: 0xdead_beef,
            peer_tag: 0x1234_5678,
            local_initial_tsn: 7,
            peer_initial_tsn: u32::MAX,
            outbound_streams: 10,
            inbound_streams: 17,
            peer_rwnd: 65536,
            peer_forward_tsn: true,
            created,
        }
    }

    #[test]
    fn baked_cookie_opens() {
        let epoch = Instant::now();
        let jar = CookieJar::new(epoch, [7; 16], Duration::from_secs(10));
        let bytes = jar.bake(&cookie(0));
        assert_eq!(bytes.len(), COOKIE_LENGTH);
        assert_eq!(jar.open(&bytes, epoch + Duration::from_secs(1)), Ok(cookie(0)));
    }

    #[test]
    fn cookies_from_another_jar_are_forged() {
        let epoch = Instant::now();
        let ours = CookieJar::new(epoch, [7; 16], Duration::from_secs(10));
        let theirs = CookieJar::new(epoch, [8; 16], Duration::from_secs(10));
        let bytes = theirs.bake(&cookie(0));
        assert_eq!(ours.open(&bytes, epoch), Err(CookieRejection::Forged));
        assert_eq!(ours.open(&bytes[1..], epoch), Err(CookieRejection::Malformed));
    }

    #[test]
    fn old_cookies_are_stale() {
        let epoch = Instant::now();
        let jar = CookieJar::new(epoch, [7; 16], Duration::from_secs(10));
        let bytes = jar.bake(&cookie(1000));
        assert_eq!(
            jar.open(&bytes, epoch + Duration::from_secs(13)),
            Err(CookieRejection::Stale(Duration::from_secs(2)))
        );
    }
}
