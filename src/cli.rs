//! Command-line interface for Parley
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;

/// Parley - Real-time voice conversation with Gemini Live
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Gemini API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Live model to talk to (defaults to the saved setting)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Prebuilt voice for replies (defaults to the saved setting)
    #[arg(long)]
    pub voice: Option<String>,

    /// Remember --model and --voice as the new defaults
    #[arg(long)]
    pub save_defaults: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set parley modules to requested verbosity level
    builder.filter_module("parley", args.log_level());

    // WebSocket and sound server internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("pipewire", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
