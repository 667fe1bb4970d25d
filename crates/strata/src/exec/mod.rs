//! Process execution.

mod actions;
mod init;
mod process;

pub use actions::{Action, resolve_action};
pub use init::{Sinit, exit_code};
pub use process::{ProcessCommand, close_fds, start_process};
