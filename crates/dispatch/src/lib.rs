//! The per-message orchestration point.
//!
//! [`Dispatcher`] composes the rate limiter, middleware pipeline, reply
//! waiter, and command registry, and classifies every inbound message with
//! a [`DispatchOutcome`].

pub mod dispatcher;
pub mod outcome;

pub use {
    dispatcher::{Dispatcher, DispatcherBuilder, PendingExecution, Routed, open_dialog_store},
    outcome::{DispatchOutcome, DispatchStats},
};
