//! Semantic validation of a parsed configuration.

use crate::schema::{NeuronConfig, StorageKind};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "rate_limit.capacity"
    pub path: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.first_error().is_some()
    }

    #[must_use]
    pub fn first_error(&self) -> Option<&Diagnostic> {
        self.diagnostics
            .iter()
            .find(|d| d.severity == Severity::Error)
    }

    fn error(&mut self, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Error,
            path,
            message: message.into(),
        });
    }

    fn warning(&mut self, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity: Severity::Warning,
            path,
            message: message.into(),
        });
    }
}

/// Check value ranges the type system cannot express.
#[must_use]
pub fn validate(config: &NeuronConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    let prefix = &config.commands.prefix;
    if prefix.is_empty() {
        result.error("commands.prefix", "prefix must not be empty");
    } else if prefix.chars().any(char::is_whitespace) {
        result.error("commands.prefix", "prefix must not contain whitespace");
    }

    let rl = &config.rate_limit;
    if !rl.capacity.is_finite() || rl.capacity <= 0.0 {
        result.error("rate_limit.capacity", "capacity must be a positive number");
    }
    if !rl.refill_per_sec.is_finite() || rl.refill_per_sec < 0.0 {
        result.error(
            "rate_limit.refill_per_sec",
            "refill rate must be zero or a positive number",
        );
    } else if rl.refill_per_sec == 0.0 {
        result.warning(
            "rate_limit.refill_per_sec",
            "refill rate is zero; buckets never recover once drained",
        );
    }

    if config.conversation.reply_timeout_secs == 0 {
        result.error("conversation.reply_timeout_secs", "timeout must be at least 1 second");
    }
    if config.dialog.step_timeout_secs == 0 {
        result.error("dialog.step_timeout_secs", "timeout must be at least 1 second");
    }

    if config.storage.kind == StorageKind::File && config.storage.path.as_os_str().is_empty() {
        result.error("storage.path", "file storage requires a path");
    }

    result
}
