pub mod args;
pub mod events;

pub use args::{Cli, CliCommand, EventsCliArgs};
pub use events::handle_events_command;
