use thiserror::Error;

/// Command registration and execution errors.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command name must not be empty")]
    EmptyName,

    /// A name or alias is already bound, either to an existing command or
    /// twice within the command being registered.
    #[error("command name or alias '{name}' is already registered")]
    Duplicate { name: String },

    #[error("command '{command}' has no handler")]
    NoHandler { command: String },

    #[error("command '{command}' failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("command '{command}' panicked")]
    Panicked { command: String },
}

impl CommandError {
    #[must_use]
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::Duplicate { name: name.into() }
    }

    #[must_use]
    pub fn handler(command: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Handler {
            command: command.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CommandError>;
