use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOutcome {
    /// Authored by a bot; dropped before anything else ran.
    Ignored,
    /// The author's bucket was empty.
    RateLimited,
    /// A middleware stopped the chain.
    Blocked,
    /// A middleware failed; the message went no further.
    MiddlewareFailed,
    /// Consumed by a pending reply wait.
    ReplyDelivered,
    /// Not a command.
    Unhandled,
    /// A command ran to completion.
    Handled,
    /// A command was resolved but the requester lacks a capability.
    Denied,
    /// A command handler returned an error or panicked.
    Failed,
}

impl DispatchOutcome {
    pub const ALL: [Self; 9] = [
        Self::Ignored,
        Self::RateLimited,
        Self::Blocked,
        Self::MiddlewareFailed,
        Self::ReplyDelivered,
        Self::Unhandled,
        Self::Handled,
        Self::Denied,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::RateLimited => "rate_limited",
            Self::Blocked => "blocked",
            Self::MiddlewareFailed => "middleware_failed",
            Self::ReplyDelivered => "reply_delivered",
            Self::Unhandled => "unhandled",
            Self::Handled => "handled",
            Self::Denied => "denied",
            Self::Failed => "failed",
        }
    }

    /// Whether the message was claimed by a command or a pending reply.
    /// A denied command still counts as handled.
    pub fn is_handled(self) -> bool {
        matches!(
            self,
            Self::ReplyDelivered | Self::Handled | Self::Denied | Self::Failed
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-process outcome counters, readable without a metrics recorder.
#[derive(Debug, Default)]
pub struct DispatchStats {
    counts: [AtomicU64; 9],
}

impl DispatchStats {
    pub fn record(&self, outcome: DispatchOutcome) {
        self.counts[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, outcome: DispatchOutcome) -> u64 {
        self.counts[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        DispatchOutcome::ALL.iter().map(|o| self.count(*o)).sum()
    }

    /// `(name, value)` pairs, one per outcome, e.g. `("messages.handled", 3)`.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        DispatchOutcome::ALL
            .iter()
            .map(|o| (format!("messages.{}", o.as_str()), self.count(*o)))
            .collect()
    }
}
