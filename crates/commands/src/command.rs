use std::{future::Future, sync::Arc};

use {async_trait::async_trait, neuron_channels::RequestContext};

/// Runs a resolved command.
///
/// The handler owns the request context for the rest of the dispatch, so it
/// can await replies or start dialogs without borrowing from the dispatcher.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, ctx: RequestContext) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: RequestContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Declarative command definition handed to
/// [`CommandRegistry::register`](crate::CommandRegistry::register).
#[derive(Clone, Default)]
pub struct Command {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: String,
    /// Argument placeholders shown in help, e.g. `["<user>", "[reason]"]`.
    pub usage: Vec<String>,
    pub capabilities: Vec<String>,
    pub subcommands: Vec<Command>,
    pub handler: Option<Arc<dyn CommandHandler>>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn usage(mut self, arg: impl Into<String>) -> Self {
        self.usage.push(arg.into());
        self
    }

    #[must_use]
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    #[must_use]
    pub fn subcommand(mut self, child: Command) -> Self {
        self.subcommands.push(child);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Shorthand for `.handler(handler_fn(f))`.
    #[must_use]
    pub fn run<F, Fut>(self, f: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(handler_fn(f))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("capabilities", &self.capabilities)
            .field("subcommands", &self.subcommands)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Lookup keys are trimmed and lowercased.
pub(crate) fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}
