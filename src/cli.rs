use crate::command;
use crate::command::image::ImageArgs;
use crate::command::session::SessionArgs;
use crate::command::unit::UnitArgs;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

#[derive(Parser)]
#[command(name = "ai-sandbox")]
#[command(about = "Build a capability-bounded sandbox image and manage the units run from it")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build, render or verify the sandbox image
    Image(ImageArgs),

    /// Start, attach to and tear down individual units
    Unit(UnitArgs),

    /// Per-agent sandbox sessions
    Session(SessionArgs),

    /// Regenerate broken sessions and clean up inactive ones until interrupted
    Monitor {
        /// Seconds between passes (defaults to fleet.monitor_interval)
        #[arg(long)]
        interval: Option<u64>,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Write an example .ai-sandbox.yaml into the current directory
    Init,

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Image(args) => command::image::run(args),
        Commands::Unit(args) => command::unit::run(args),
        Commands::Session(args) => command::session::run(args),
        Commands::Monitor { interval, once } => command::monitor::run(interval, once),
        Commands::Init => crate::config::Config::init(),
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
