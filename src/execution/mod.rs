//! Job execution.
//!
//! This module provides the dispatcher that starts and supervises runs,
//! and handlers for running external commands and HTTP requests as jobs.

mod command;
mod dispatcher;
mod url;

pub use command::{CommandHandler, CommandHandlerBuilder};
pub use dispatcher::{DispatchOutcome, Dispatcher, PendingRetry, RunningJob};
pub use url::{DEFAULT_REQUEST_TIMEOUT, UrlHandler, UrlHandlerBuilder};
