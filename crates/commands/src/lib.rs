//! Command resolution: prefix parsing, a case-insensitive name/alias index,
//! greedy subcommand descent, and capability checks.
//!
//! Commands are declared with the [`Command`] builder and stored once in a
//! [`CommandRegistry`]; lookups hand out [`CommandId`] handles.

pub mod command;
pub mod error;
pub mod registry;

pub use {
    command::{Command, CommandHandler, handler_fn},
    error::{CommandError, Result},
    registry::{
        CommandId, CommandRegistry, Denial, Invocation, RegisteredCommand, Resolution, Route,
    },
};
