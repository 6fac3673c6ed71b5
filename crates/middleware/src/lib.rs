//! Ordered request interceptors run before command resolution.
//!
//! Each [`Middleware`] receives the request context and a [`Next`]
//! continuation. Calling `next.run(ctx)` hands control to the following
//! interceptor; returning without calling it stops the chain.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    async_trait::async_trait,
    futures::{FutureExt, future::BoxFuture},
    neuron_channels::RequestContext,
    thiserror::Error,
    tracing::debug,
};

#[cfg(feature = "metrics")]
use neuron_metrics::{counter, labels, middleware as mw_metrics};

/// A request interceptor.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()>;
}

/// Bookkeeping shared by every [`Next`] of one pipeline run.
#[derive(Default)]
struct RunState {
    reached_end: AtomicBool,
    /// Innermost interceptor that returned an error or panicked.
    failed_at: OnceLock<String>,
}

/// Continuation handed to a [`Middleware`]; runs the rest of the chain.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    state: &'a RunState,
}

impl Next<'_> {
    pub async fn run(self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        let Some((current, rest)) = self.rest.split_first() else {
            self.state.reached_end.store(true, Ordering::Release);
            return Ok(());
        };

        let next = Next {
            rest,
            state: self.state,
        };
        let result = match AssertUnwindSafe(current.handle(ctx, next))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("middleware panicked")),
        };
        if result.is_err() {
            let _ = self.state.failed_at.set(current.name().to_string());
        }
        result
    }
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every interceptor passed control on.
    Completed,
    /// An interceptor returned without calling its continuation.
    Halted,
}

#[derive(Debug, Error)]
#[error("middleware '{middleware}' failed: {source}")]
pub struct MiddlewareError {
    pub middleware: String,
    #[source]
    pub source: anyhow::Error,
}

/// Interceptors in registration order.
#[derive(Clone, Default)]
pub struct MiddlewarePipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs after everything already registered.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.chain.push(middleware);
        self
    }

    #[must_use]
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    /// Run the chain for one request, in order, one interceptor at a time.
    pub async fn run(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<PipelineOutcome, MiddlewareError> {
        let state = RunState::default();
        let head = Next {
            rest: &self.chain,
            state: &state,
        };

        if let Err(source) = head.run(ctx).await {
            let middleware = state
                .failed_at
                .get()
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            #[cfg(feature = "metrics")]
            counter!(mw_metrics::ERRORS_TOTAL, labels::MIDDLEWARE => middleware.clone())
                .increment(1);
            return Err(MiddlewareError { middleware, source });
        }

        if state.reached_end.load(Ordering::Acquire) {
            Ok(PipelineOutcome::Completed)
        } else {
            debug!(channel_id = %ctx.message.channel_id, "middleware halted the request");
            #[cfg(feature = "metrics")]
            counter!(mw_metrics::SHORT_CIRCUITS_TOTAL).increment(1);
            Ok(PipelineOutcome::Halted)
        }
    }
}

struct FnMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()> {
        (self.f)(ctx, next).await
    }
}

/// Build a middleware from a closure returning a boxed future:
///
/// ```ignore
/// middleware_fn("log", |ctx, next| Box::pin(async move {
///     tracing::info!(content = %ctx.message.content);
///     next.run(ctx).await
/// }))
/// ```
pub fn middleware_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, anyhow::Result<()>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        f,
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        super::*,
        neuron_channels::RecordingOutbound,
        neuron_common::InboundMessage,
        serde_json::json,
    };

    fn ctx() -> RequestContext {
        RequestContext::new(
            InboundMessage::new("c1", "u1", "!ping"),
            Arc::new(RecordingOutbound::new()),
        )
    }

    /// Records its name, then passes on.
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Trace {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            next.run(ctx).await?;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    struct Stop;

    #[async_trait]
    impl Middleware for Stop {
        fn name(&self) -> &str {
            "stop"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn trace(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(Trace {
            name,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn empty_pipeline_completes() {
        let outcome = MiddlewarePipeline::new().run(&mut ctx()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .with(trace("a", &log))
            .with(trace("b", &log));

        let outcome = pipeline.run(&mut ctx()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(*log.lock().unwrap(), vec![
            "a:before", "b:before", "b:after", "a:after"
        ]);
    }

    #[tokio::test]
    async fn skipping_next_halts_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .with(trace("a", &log))
            .with(Arc::new(Stop))
            .with(trace("never", &log));

        let outcome = pipeline.run(&mut ctx()).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Halted);
        assert_eq!(*log.lock().unwrap(), vec!["a:before", "a:after"]);
    }

    #[tokio::test]
    async fn errors_abort_and_name_the_failing_interceptor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new()
            .with(trace("outer", &log))
            .with(middleware_fn("guard", |_ctx, _next| {
                Box::pin(async { Err(anyhow::anyhow!("not allowed")) })
            }))
            .with(trace("never", &log));

        let err = pipeline.run(&mut ctx()).await.unwrap_err();
        assert_eq!(err.middleware, "guard");
        assert_eq!(*log.lock().unwrap(), vec!["outer:before"]);
    }

    #[tokio::test]
    async fn panics_are_reported_as_failures() {
        let pipeline = MiddlewarePipeline::new().with(middleware_fn("boom", |_ctx, _next| {
            Box::pin(async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
        }));
        let err = pipeline.run(&mut ctx()).await.unwrap_err();
        assert_eq!(err.middleware, "boom");
    }

    #[tokio::test]
    async fn state_flows_to_later_interceptors() {
        let pipeline = MiddlewarePipeline::new()
            .with(middleware_fn("tag", |ctx, next| {
                Box::pin(async move {
                    ctx.state.insert("tagged".into(), json!(true));
                    next.run(ctx).await
                })
            }))
            .with(middleware_fn("check", |ctx, next| {
                Box::pin(async move {
                    anyhow::ensure!(ctx.state.get("tagged") == Some(&json!(true)));
                    next.run(ctx).await
                })
            }));

        let mut ctx = ctx();
        assert_eq!(pipeline.run(&mut ctx).await.unwrap(), PipelineOutcome::Completed);
        assert_eq!(pipeline.names(), vec!["tag", "check"]);
    }
}
