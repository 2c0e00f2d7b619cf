use crate::{IdentityKey, WorkerId};
use thiserror::Error;

/// Errors raised by queue and dispatch operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The identity key is already queued. Callers that checked
    /// `is_already_queued` beforehand may treat this as success.
    #[error("item {0} is already queued")]
    Duplicate(IdentityKey),

    #[error("no worker {0} in the pool")]
    UnknownWorker(WorkerId),
}

/// Errors parsing an administrative command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("not a command: {0:?}")]
    NotACommand(String),

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("command {0} needs a username")]
    MissingUser(&'static str),

    #[error("invalid count {0:?}")]
    InvalidCount(String),
}
