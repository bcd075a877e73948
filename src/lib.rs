//! An SCTP (RFC 4960) association core with partial reliability
//! (RFC 3758), stream reconfiguration (RFC 6525) and a tokio driver.

pub mod cli;
pub mod logging;
pub mod sctp;

pub use sctp::{
    association::{
        Action, AssocId, Association, Command, Config, Indication, InboundMessage,
        OutboundMessage,
    },
    session::{EndpointSession, Link, Notification, SessionHandle},
    Sctp,
};
