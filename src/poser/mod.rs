pub mod client;
pub mod control;
pub mod task;

pub use client::{connect_with_retry, Poser, PoserBuilder, RetryPolicy};
pub use control::{console_commands, PoserCommand, PoserFlags, HELP};
pub use task::PoserTask;
