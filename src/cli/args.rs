use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hark")]
#[command(about = "Voice-trigger webhook relay for meeting bots", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print version information
    Version,
    /// Inspect recent webhook deliveries
    Events(EventsCliArgs),
}

#[derive(ClapArgs, Debug)]
pub struct EventsCliArgs {
    /// ID of a specific webhook event to show in full
    #[arg(short, long)]
    pub id: Option<String>,
    /// Maximum number of results to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
    /// Only show deliveries with this status (pending, sending, retrying,
    /// completed, failed)
    #[arg(short, long)]
    pub status: Option<String>,
}
