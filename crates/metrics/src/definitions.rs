//! Metric name and label definitions.
//!
//! Every metric neuron records is named here so the set of exported series is
//! documented in one place.

/// Inbound message dispatch
pub mod dispatch {
    /// Inbound messages processed, labelled by `outcome`
    pub const MESSAGES_TOTAL: &str = "neuron_dispatch_messages_total";
    /// Time spent routing one message (rate check, middleware, resolution)
    pub const ROUTING_DURATION_SECONDS: &str = "neuron_dispatch_routing_duration_seconds";
    /// Command handlers currently executing
    pub const HANDLERS_IN_FLIGHT: &str = "neuron_dispatch_handlers_in_flight";
}

/// Command resolution and execution
pub mod commands {
    /// Registered top-level commands
    pub const REGISTERED: &str = "neuron_commands_registered";
    /// Command executions, labelled by `command`
    pub const EXECUTIONS_TOTAL: &str = "neuron_command_executions_total";
    /// Capability check denials, labelled by `command`
    pub const DENIALS_TOTAL: &str = "neuron_command_denials_total";
    /// Handler faults, labelled by `command`
    pub const ERRORS_TOTAL: &str = "neuron_command_errors_total";
    /// Handler execution duration in seconds
    pub const EXECUTION_DURATION_SECONDS: &str = "neuron_command_execution_duration_seconds";
}

/// Per-identity rate limiting
pub mod rate_limit {
    /// Consumption attempts that were allowed
    pub const ALLOWED_TOTAL: &str = "neuron_rate_limit_allowed_total";
    /// Consumption attempts that were denied
    pub const DENIED_TOTAL: &str = "neuron_rate_limit_denied_total";
    /// Buckets currently tracked
    pub const BUCKETS: &str = "neuron_rate_limit_buckets";
}

/// Middleware pipeline
pub mod middleware {
    /// Pipelines stopped early by an interceptor
    pub const SHORT_CIRCUITS_TOTAL: &str = "neuron_middleware_short_circuits_total";
    /// Interceptor faults, labelled by `middleware`
    pub const ERRORS_TOTAL: &str = "neuron_middleware_errors_total";
}

/// Reply collectors
pub mod conversation {
    /// Collectors currently waiting for a reply
    pub const COLLECTORS_PENDING: &str = "neuron_conversation_collectors_pending";
    /// Collectors fulfilled by a matching message
    pub const REPLIES_DELIVERED_TOTAL: &str = "neuron_conversation_replies_delivered_total";
    /// Collectors that reached their deadline
    pub const TIMEOUTS_TOTAL: &str = "neuron_conversation_timeouts_total";
    /// Collectors cancelled explicitly
    pub const CANCELLATIONS_TOTAL: &str = "neuron_conversation_cancellations_total";
}

/// Multi-step dialogs
pub mod dialog {
    /// Dialogs started
    pub const STARTED_TOTAL: &str = "neuron_dialogs_started_total";
    /// Dialogs that collected every step
    pub const COMPLETED_TOTAL: &str = "neuron_dialogs_completed_total";
    /// Dialogs cancelled, labelled by `reason`
    pub const CANCELLED_TOTAL: &str = "neuron_dialogs_cancelled_total";
    /// Replies rejected by a step validator
    pub const VALIDATION_REJECTIONS_TOTAL: &str = "neuron_dialog_validation_rejections_total";
    /// Dialogs currently running
    pub const ACTIVE: &str = "neuron_dialogs_active";
}

/// Outbound channel sends
pub mod outbound {
    /// Messages accepted by the transport
    pub const SENT_TOTAL: &str = "neuron_outbound_sent_total";
    /// Sends the transport rejected
    pub const ERRORS_TOTAL: &str = "neuron_outbound_errors_total";
}

/// Common label keys used across metrics
pub mod labels {
    pub const OUTCOME: &str = "outcome";
    pub const COMMAND: &str = "command";
    pub const MIDDLEWARE: &str = "middleware";
    pub const REASON: &str = "reason";
    pub const FLOW: &str = "flow";
}

/// Histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Routing is in-process work: 10µs to 1s
    pub static ROUTING_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
        ]
    });

    /// Handlers may wait on replies: 1ms to 5 minutes
    pub static HANDLER_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
        ]
    });
}
