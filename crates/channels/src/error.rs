use std::error::Error as StdError;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed outbound errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel id is not known to the transport.
    #[error("unknown channel: {channel_id}")]
    UnknownChannel { channel_id: String },

    /// Transport is not connected or not configured.
    #[error("channel transport unavailable: {message}")]
    Unavailable { message: String },

    /// Wrapped source error from the platform client.
    #[error("channel operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn unknown_channel(channel_id: impl Into<String>) -> Self {
        Self::UnknownChannel {
            channel_id: channel_id.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
