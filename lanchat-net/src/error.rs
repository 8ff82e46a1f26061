use thiserror::Error;

/// Faults surfaced at component boundaries. Nothing in this crate
/// propagates an error past its own boundary: connection faults arrive
/// inside [`crate::ConnectionEvent::Closed`], publish and search
/// failures inside the server and browser stop events, and dial
/// failures as the `Err` of the dialing call.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mdns error: {0}")]
    Mdns(#[from] mdns_sd::Error),

    #[error("connection was declined by server")]
    Declined,

    #[error("service has no reachable address")]
    Unreachable,

    #[error("discovery daemon is gone")]
    DaemonGone,
}
