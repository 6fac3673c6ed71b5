//! Metric names and recorder setup for neuron.
//!
//! Crates record through the `metrics` facade behind their own `metrics`
//! feature. With no recorder installed every call is a no-op. The
//! `prometheus` feature installs a Prometheus recorder whose handle can render
//! the text format; serving it is the embedder's concern.
//!
//! ```rust,ignore
//! use neuron_metrics::{counter, dispatch};
//!
//! counter!(dispatch::MESSAGES_TOTAL, "outcome" => "handled").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

pub use metrics::{counter, gauge, histogram};
