//! The small set of fatal error categories the daemon can surface.
//! Non-fatal outcomes (parse failures, injection failures, callback panics)
//! are never represented here — they are absorbed into an `ACCEPT` verdict
//! at the point of detection and logged, per the never-fatal policy.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum DesyncError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("netlink initialization failed: {0}")]
    NetlinkInit(String),

    #[error("failed to bind queue {queue}: {reason}")]
    QueueBind { queue: u16, reason: String },

    #[error("control socket error: {0}")]
    ControlSocket(String),

    #[error("firewall rule installation failed: {0}")]
    Firewall(String),
}

pub type Result<T> = std::result::Result<T, DesyncError>;
