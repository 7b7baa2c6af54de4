use thiserror::Error;

/// Errors from the notification bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid channel name `{0}`")]
    InvalidChannel(String),

    /// The dedicated notification connection could not be opened.
    #[error("failed to open notification connection: {0}")]
    Connect(String),

    /// A LISTEN or UNLISTEN command failed.
    #[error("failed to {command} `{channel}`: {reason}")]
    Command {
        command: &'static str,
        channel: String,
        reason: String,
    },

    /// A notification could not be sent.
    #[error("failed to notify `{channel}`: {reason}")]
    Notify { channel: String, reason: String },

    /// A payload could not be encoded or decoded.
    #[error("invalid payload on `{channel}`: {reason}")]
    Payload { channel: String, reason: String },

    /// The notification connection task is gone.
    #[error("notification connection closed")]
    Closed,
}
