use thiserror::Error;

/// Failures of a live session with the remote control surface.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The initial connection could not be opened.
    #[error(
        "cannot connect to Streamlabs at {endpoint}: make sure the app is running \
         and its remote control API is enabled ({source})"
    )]
    CannotConnect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// The session ended (closed locally or the channel terminated) while a
    /// request was outstanding or before it could be sent.
    #[error("session channel closed")]
    ChannelClosed,

    /// A later request with the same identifier took over the pending slot
    /// before a response arrived. The session is still usable.
    #[error("request {id} was superseded by a newer request with the same id")]
    Superseded { id: u64 },

    #[error("session i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Failures of facade commands that go beyond the session itself.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The remote answered a query with its error flag set.
    #[error("remote rejected {method}: {body}")]
    Rejected { method: String, body: String },

    /// A correlated response arrived but its payload did not have the
    /// expected shape.
    #[error("failed to decode {method} result: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no {kind} named '{name}'")]
    UnknownName { kind: &'static str, name: String },
}
