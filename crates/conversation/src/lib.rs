//! Conversational continuation: reply collectors and persisted multi-step
//! dialogs built on them.

pub mod dialog;
pub mod store;
pub mod store_file;
pub mod store_memory;
pub mod waiter;

pub use {
    dialog::{
        DialogEngine, DialogError, DialogFlow, DialogOutcome, DialogSettings, DialogState,
        DialogStep, StepError,
    },
    store::DialogStore,
    store_file::FileDialogStore,
    store_memory::InMemoryDialogStore,
    waiter::{CollectorId, PendingReply, ReplyFilter, ReplyWaiter, WaitError},
};
