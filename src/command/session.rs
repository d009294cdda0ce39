//! Agent session commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::{Context, format_age, short_id};
use crate::fleet::{SandboxRecord, SandboxStatus};

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub command: SessionCommand,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Run a command in the agent's session, provisioning one if needed.
    Run {
        /// Agent the session belongs to
        agent: String,
        /// Image for a new session (defaults to fleet.default_image)
        #[arg(long)]
        image: Option<String>,
        /// Print the session record as JSON instead of the command output
        #[arg(long)]
        json: bool,
        /// Command to run with `sh -c`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Show one session record.
    Status {
        /// Session id
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Stop and remove the agent's active sessions.
    Stop { agent: String },
    /// List all session records.
    List,
    /// Replace sessions whose unit died or failed to provision.
    Regenerate,
    /// Delete inactive session records and their units.
    Cleanup,
}

#[derive(Tabled)]
struct SessionRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "AGENT")]
    agent: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "LAST RUN")]
    last_run: String,
    #[tabled(rename = "UNIT")]
    unit: String,
    #[tabled(rename = "UPDATED")]
    updated: String,
}

fn styled_status(record: &SandboxRecord) -> String {
    let text = if record.is_active {
        record.status.to_string()
    } else {
        format!("{} (inactive)", record.status)
    };
    match record.status {
        SandboxStatus::Running | SandboxStatus::Success => style(text).green().to_string(),
        SandboxStatus::Failed => style(text).red().to_string(),
        SandboxStatus::Pending | SandboxStatus::Regenerating => style(text).yellow().to_string(),
        SandboxStatus::Stopped => style(text).dim().to_string(),
    }
}

pub fn run(args: SessionArgs) -> Result<()> {
    let ctx = Context::load()?;
    let fleet = ctx.fleet()?;

    match args.command {
        SessionCommand::Run {
            agent,
            image,
            json,
            command,
        } => {
            let run = fleet.run_in_session(&agent, &command.join(" "), image.as_deref())?;
            if run.provisioned {
                eprintln!(
                    "{}",
                    style(format!(
                        "Provisioned {} ({})",
                        run.record.container_name,
                        short_id(&run.record.id)
                    ))
                    .dim()
                );
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&run.record)?);
                return Ok(());
            }
            print!("{}", run.output.stdout);
            eprint!("{}", run.output.stderr);
            if run.output.timed_out {
                anyhow::bail!("Command timed out");
            }
            let code = run.output.exit_code.unwrap_or(1);
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        SessionCommand::Status { id, json } => {
            let record = fleet.status(&id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
            Ok(())
        }
        SessionCommand::Stop { agent } => {
            let stopped = fleet.stop(&agent)?;
            if stopped.is_empty() {
                println!("No active sessions for {agent}");
            }
            for record in stopped {
                println!("✓ Stopped {} ({})", record.container_name, short_id(&record.id));
            }
            Ok(())
        }
        SessionCommand::List => {
            let records = fleet.list()?;
            if records.is_empty() {
                println!("No sessions found");
                return Ok(());
            }
            let now = crate::fleet::now_secs();
            let rows: Vec<SessionRow> = records
                .iter()
                .map(|r| SessionRow {
                    id: short_id(&r.id).to_string(),
                    agent: r.agent_id.clone(),
                    status: styled_status(r),
                    last_run: r
                        .last_run
                        .as_ref()
                        .map(|run| run.outcome.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    unit: r
                        .container_id
                        .as_deref()
                        .map(short_id)
                        .unwrap_or("-")
                        .to_string(),
                    updated: format_age(r.updated_at, now),
                })
                .collect();
            let mut table = Table::new(rows);
            table
                .with(Style::blank())
                .modify(Columns::new(0..6), Padding::new(0, 1, 0, 0));
            println!("{table}");
            Ok(())
        }
        SessionCommand::Regenerate => {
            let report = fleet.regenerate_broken()?;
            for (old, new) in &report.regenerated {
                println!("✓ Regenerated {} -> {}", short_id(old), short_id(new));
            }
            for (old, error) in &report.failed {
                println!("✘ {}: {}", short_id(old), error);
            }
            if report.regenerated.is_empty() && report.failed.is_empty() {
                println!("No broken sessions");
            }
            Ok(())
        }
        SessionCommand::Cleanup => {
            let removed = fleet.cleanup_inactive()?;
            println!("✓ Removed {removed} inactive session(s)");
            Ok(())
        }
    }
}

fn print_record(record: &SandboxRecord) {
    println!("{} {}", style("session").bold(), record.id);
    println!("  agent:   {}", record.agent_id);
    println!("  status:  {}", styled_status(record));
    println!("  unit:    {}", record.container_name);
    println!("  image:   {}", record.image);
    if let Some(error) = &record.error {
        println!("  error:   {}", style(error).red());
    }
    if let Some(run) = &record.last_run {
        println!("  last:    {} ({})", run.command, run.outcome);
        for line in run.output.lines() {
            println!("    {line}");
        }
    }
}
