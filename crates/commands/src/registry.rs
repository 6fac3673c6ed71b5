use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
};

#[cfg(feature = "metrics")]
use std::time::Instant;

use {
    futures::FutureExt,
    neuron_channels::{CapabilitySource, RequestContext},
    neuron_common::CapabilitySet,
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use neuron_metrics::{commands as cmd_metrics, counter, gauge, histogram, labels};

use crate::{
    command::{Command, CommandHandler, normalize_name},
    error::{CommandError, Result},
};

/// Handle to a command stored in a [`CommandRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(usize);

/// A command as stored in the registry. Names are normalized.
pub struct RegisteredCommand {
    name: String,
    aliases: Vec<String>,
    description: String,
    usage: Vec<String>,
    capabilities: Vec<String>,
    subcommands: HashMap<String, CommandId>,
    /// Child ids in registration order, for help output.
    children: Vec<CommandId>,
    handler: Option<Arc<dyn CommandHandler>>,
}

impl RegisteredCommand {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn usage(&self) -> &[String] {
        &self.usage
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_subcommands(&self) -> bool {
        !self.subcommands.is_empty()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }
}

/// Result of walking the command tree for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub id: CommandId,
    /// Normalized names from the top-level command down to the resolved one.
    pub path: Vec<String>,
    pub args: Vec<String>,
}

/// A resolved command the requester may not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub command: String,
    pub missing: Vec<String>,
}

/// What the registry decided to do with a message.
pub enum Route {
    /// No prefix or no matching top-level command.
    NotACommand,
    Denied(Denial),
    Ready(Invocation),
}

/// A resolved, authorized command bound to its request context.
///
/// Owns everything it needs, so it can be moved into a spawned task.
pub struct Invocation {
    command: String,
    handler: Option<Arc<dyn CommandHandler>>,
    ctx: RequestContext,
}

impl Invocation {
    /// Space-joined command path, e.g. `config set`.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Run the handler. Errors and panics are returned, never propagated
    /// as unwinds.
    pub async fn execute(self) -> Result<()> {
        let Self {
            command,
            handler,
            ctx,
        } = self;
        let Some(handler) = handler else {
            #[cfg(feature = "metrics")]
            counter!(cmd_metrics::ERRORS_TOTAL, labels::COMMAND => command.clone()).increment(1);
            return Err(CommandError::NoHandler { command });
        };

        #[cfg(feature = "metrics")]
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await;

        #[cfg(feature = "metrics")]
        {
            counter!(cmd_metrics::EXECUTIONS_TOTAL, labels::COMMAND => command.clone())
                .increment(1);
            histogram!(cmd_metrics::EXECUTION_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
            if !matches!(result, Ok(Ok(()))) {
                counter!(cmd_metrics::ERRORS_TOTAL, labels::COMMAND => command.clone())
                    .increment(1);
            }
        }

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(CommandError::handler(command, source)),
            Err(_) => Err(CommandError::Panicked { command }),
        }
    }
}

/// Command table with prefix parsing and greedy subcommand descent.
///
/// Every command lives once in `arena`; the top-level name/alias index and
/// each parent's subcommand map hold [`CommandId`]s into it.
pub struct CommandRegistry {
    prefix: String,
    arena: Vec<RegisteredCommand>,
    index: HashMap<String, CommandId>,
    top_level: Vec<CommandId>,
}

impl CommandRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            arena: Vec::new(),
            index: HashMap::new(),
            top_level: Vec::new(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register a top-level command and its subcommand tree.
    ///
    /// Fails without touching existing registrations when the name or any
    /// alias is empty or already taken, or when two siblings in the tree
    /// share a name or alias.
    pub fn register(&mut self, command: Command) -> Result<CommandId> {
        let keys = lookup_keys(&command)?;
        if let Some(taken) = keys.iter().find(|key| self.index.contains_key(*key)) {
            return Err(CommandError::duplicate(taken.clone()));
        }
        validate_children(&command)?;

        let id = self.insert(command);
        for key in keys {
            self.index.insert(key, id);
        }
        self.top_level.push(id);

        info!(command = %self.arena[id.0].name, "registered command");
        #[cfg(feature = "metrics")]
        gauge!(cmd_metrics::REGISTERED).set(self.top_level.len() as f64);
        Ok(id)
    }

    fn insert(&mut self, command: Command) -> CommandId {
        let Command {
            name,
            aliases,
            description,
            usage,
            capabilities,
            subcommands,
            handler,
        } = command;

        let id = CommandId(self.arena.len());
        self.arena.push(RegisteredCommand {
            name: normalize_name(&name),
            aliases: aliases.iter().map(|a| normalize_name(a)).collect(),
            description,
            usage,
            capabilities,
            subcommands: HashMap::new(),
            children: Vec::new(),
            handler,
        });

        for child in subcommands {
            let keys: Vec<String> = std::iter::once(&child.name)
                .chain(&child.aliases)
                .map(|k| normalize_name(k))
                .collect();
            let child_id = self.insert(child);
            let parent = &mut self.arena[id.0];
            parent.children.push(child_id);
            for key in keys {
                parent.subcommands.insert(key, child_id);
            }
        }
        id
    }

    pub fn get(&self, id: CommandId) -> Option<&RegisteredCommand> {
        self.arena.get(id.0)
    }

    /// Look up a top-level command by name or alias.
    pub fn find(&self, name: &str) -> Option<CommandId> {
        self.index.get(&normalize_name(name)).copied()
    }

    /// Top-level commands once each, in registration order.
    pub fn commands(&self) -> impl Iterator<Item = &RegisteredCommand> {
        self.top_level.iter().map(|id| &self.arena[id.0])
    }

    /// Split `content` into tokens if it carries the prefix.
    pub fn parse<'a>(&self, content: &'a str) -> Option<Vec<&'a str>> {
        let rest = content.strip_prefix(self.prefix.as_str())?;
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        (!tokens.is_empty()).then_some(tokens)
    }

    /// Resolve `content` to a command, descending through subcommands while
    /// the next token names one.
    pub fn resolve(&self, content: &str) -> Option<Resolution> {
        let tokens = self.parse(content)?;
        let mut id = self.find(tokens[0])?;
        let mut path = vec![self.arena[id.0].name.clone()];
        let mut consumed = 1;

        while let Some(token) = tokens.get(consumed) {
            let Some(&child) = self.arena[id.0].subcommands.get(&normalize_name(token)) else {
                break;
            };
            id = child;
            path.push(self.arena[id.0].name.clone());
            consumed += 1;
        }

        Some(Resolution {
            id,
            path,
            args: tokens[consumed..].iter().map(|t| (*t).to_string()).collect(),
        })
    }

    /// Capabilities `id` requires that `held` lacks. Holding no set at all
    /// lacks everything.
    pub fn missing_capabilities(&self, id: CommandId, held: Option<&CapabilitySet>) -> Vec<String> {
        let Some(command) = self.get(id) else {
            return Vec::new();
        };
        match held {
            Some(held) => held
                .missing(&command.capabilities)
                .into_iter()
                .map(str::to_string)
                .collect(),
            None => command.capabilities.clone(),
        }
    }

    /// Resolve and authorize the message in `ctx`.
    pub fn route(&self, mut ctx: RequestContext, source: &dyn CapabilitySource) -> Route {
        let Some(resolution) = self.resolve(&ctx.message.content) else {
            return Route::NotACommand;
        };
        let command = resolution.path.join(" ");
        let entry = &self.arena[resolution.id.0];

        if !entry.capabilities.is_empty() {
            let held = source.capabilities(&ctx.message);
            let missing = self.missing_capabilities(resolution.id, held.as_ref());
            if !missing.is_empty() {
                debug!(
                    command = %command,
                    author_id = %ctx.message.author_id,
                    ?missing,
                    "command denied"
                );
                #[cfg(feature = "metrics")]
                counter!(cmd_metrics::DENIALS_TOTAL, labels::COMMAND => command.clone())
                    .increment(1);
                return Route::Denied(Denial { command, missing });
            }
        }

        debug!(command = %command, args = ?resolution.args, "resolved command");
        ctx.args = resolution.args;
        ctx.command_path = resolution.path;
        Route::Ready(Invocation {
            command,
            handler: entry.handler.clone(),
            ctx,
        })
    }

    /// One line per command, subcommands included:
    /// `<prefix><path> <usage> - <description>`.
    pub fn help_text(&self) -> String {
        let mut lines = Vec::new();
        for id in &self.top_level {
            self.help_lines(*id, "", &mut lines);
        }
        lines.join("\n")
    }

    fn help_lines(&self, id: CommandId, parent: &str, lines: &mut Vec<String>) {
        let entry = &self.arena[id.0];
        let path = if parent.is_empty() {
            entry.name.clone()
        } else {
            format!("{parent} {}", entry.name)
        };

        let mut line = format!("{}{path}", self.prefix);
        for arg in &entry.usage {
            line.push(' ');
            line.push_str(arg);
        }
        if !entry.description.is_empty() {
            line.push_str(" - ");
            line.push_str(&entry.description);
        }
        lines.push(line);

        for child in &entry.children {
            self.help_lines(*child, &path, lines);
        }
    }
}

/// Normalized name and aliases of `command`, rejecting empties and repeats.
fn lookup_keys(command: &Command) -> Result<Vec<String>> {
    let name = normalize_name(&command.name);
    if name.is_empty() {
        return Err(CommandError::EmptyName);
    }
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(1 + command.aliases.len());
    for key in std::iter::once(name).chain(command.aliases.iter().map(|a| normalize_name(a))) {
        if key.is_empty() {
            return Err(CommandError::EmptyName);
        }
        if !seen.insert(key.clone()) {
            return Err(CommandError::duplicate(key));
        }
        keys.push(key);
    }
    Ok(keys)
}

fn validate_children(command: &Command) -> Result<()> {
    let mut siblings = HashSet::new();
    for child in &command.subcommands {
        for key in lookup_keys(child)? {
            if !siblings.insert(key.clone()) {
                return Err(CommandError::duplicate(key));
            }
        }
        validate_children(child)?;
    }
    Ok(())
}
