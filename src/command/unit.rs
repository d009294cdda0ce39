//! Commands acting on individual units.

use anyhow::{Context as _, Result, anyhow, bail};
use clap::{Args, Subcommand};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use super::{Context, short_id};
use crate::engine::{Engine, MANAGED_LABEL, Signal, UnitSpec, VolumeMount};
use crate::image::{CAPABILITIES_LABEL, WORKDIR_LABEL};
use crate::unit::{Unit, UnitState};

#[derive(Debug, Args)]
pub struct UnitArgs {
    #[command(subcommand)]
    pub command: UnitCommand,
}

#[derive(Debug, Subcommand)]
pub enum UnitCommand {
    /// Create and start a unit from the sandbox image.
    Start {
        /// Unit name
        name: String,
        /// Image to use instead of the configured one
        #[arg(long)]
        image: Option<String>,
        /// Mount the shared directory into the unit
        #[arg(long)]
        shared: bool,
    },
    /// Run a command in the unit's working directory.
    Exec {
        name: String,
        /// Timeout in seconds (defaults to units.exec_timeout)
        #[arg(long)]
        timeout: Option<u64>,
        /// Command to run with `sh -c`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Write a file into the unit (binary safe).
    Write {
        name: String,
        /// Destination path; relative paths resolve against the workdir
        path: String,
        /// Read contents from this host file instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Print a file from the unit.
    Read {
        name: String,
        path: String,
        /// Write to this host file instead of stdout
        #[arg(long)]
        to: Option<PathBuf>,
    },
    /// Show a unit's lifecycle state.
    Status {
        name: String,
        /// Keep printing transitions until the unit terminates
        #[arg(long)]
        watch: bool,
    },
    /// Signal the keep-alive process, ending the unit.
    Stop {
        name: String,
        #[arg(long, value_enum, default_value_t = Signal::Kill)]
        signal: Signal,
    },
    /// Stop (if needed) and remove a unit.
    Rm { name: String },
    /// List units created by this tool.
    List,
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "CAPABILITIES")]
    capabilities: String,
}

pub fn run(args: UnitArgs) -> Result<()> {
    let ctx = Context::load()?;
    let timeout = ctx.config.units.exec_timeout();

    match args.command {
        UnitCommand::Start {
            name,
            image,
            shared,
        } => start(&ctx, &name, image, shared),
        UnitCommand::Exec {
            name,
            timeout: secs,
            command,
        } => {
            let unit = attach(&ctx, &name)?;
            let timeout = secs.map(Duration::from_secs).unwrap_or(timeout);
            let output = unit.exec(&command.join(" "), timeout)?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            if output.timed_out {
                bail!("Command timed out after {}s", timeout.as_secs());
            }
            let code = output.exit_code.unwrap_or(1);
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        UnitCommand::Write { name, path, from } => {
            let unit = attach(&ctx, &name)?;
            let contents = match from {
                Some(file) => {
                    fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?
                }
                None => {
                    let mut buf = Vec::new();
                    io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            unit.write_file(&path, &contents, timeout)?;
            println!("✓ Wrote {} bytes to {}:{}", contents.len(), name, path);
            Ok(())
        }
        UnitCommand::Read { name, path, to } => {
            let unit = attach(&ctx, &name)?;
            let contents = unit.read_file(&path, timeout)?;
            match to {
                Some(file) => fs::write(&file, &contents)
                    .with_context(|| format!("Failed to write {}", file.display()))?,
                None => io::stdout().write_all(&contents)?,
            }
            Ok(())
        }
        UnitCommand::Status { name, watch } => {
            let unit = attach(&ctx, &name)?;
            println!("{} ({})", unit.name(), short_id(unit.id()));
            println!("  state:   {}", unit.state());
            println!("  workdir: {}", unit.workdir());
            if watch && unit.is_alive() {
                for event in unit.subscribe() {
                    println!("  {} -> {}", event.from, event.to);
                    if event.to.is_terminated() {
                        break;
                    }
                }
            }
            Ok(())
        }
        UnitCommand::Stop { name, signal } => {
            let unit = attach(&ctx, &name)?;
            let state = unit.terminate(signal)?;
            println!("✓ {}: {}", unit.name(), state);
            Ok(())
        }
        UnitCommand::Rm { name } => {
            let unit = attach(&ctx, &name)?;
            unit.destroy()?;
            println!("✓ Removed {}", unit.name());
            Ok(())
        }
        UnitCommand::List => list(ctx.engine.as_ref()),
    }
}

fn attach(ctx: &Context, name: &str) -> Result<Unit> {
    Unit::attach(Arc::clone(&ctx.engine), name)?.ok_or_else(|| anyhow!("Unit '{name}' not found"))
}

fn start(ctx: &Context, name: &str, image: Option<String>, shared: bool) -> Result<()> {
    let image = image.unwrap_or_else(|| ctx.config.image.name().to_string());
    if !ctx.engine.image_exists(&image)? {
        bail!("Image '{image}' does not exist. Run `ai-sandbox image build` first.");
    }
    let workdir = ctx
        .engine
        .image_labels(&image)?
        .remove(WORKDIR_LABEL)
        .unwrap_or_else(|| ctx.config.image.workdir());

    let network = ctx.config.units.network().map(str::to_string);
    if let Some(network) = &network {
        ctx.engine.ensure_network(network)?;
    }

    let mut volumes = Vec::new();
    if shared {
        let host = ctx.config.fleet.shared_dir();
        fs::create_dir_all(&host)?;
        volumes.push(VolumeMount {
            host: host.canonicalize()?,
            target: ctx.config.fleet.shared_dir_target().to_string(),
            read_only: false,
        });
    }

    let mut labels: BTreeMap<String, String> = ctx.config.units.labels();
    labels.insert(MANAGED_LABEL.0.to_string(), MANAGED_LABEL.1.to_string());

    let spec = UnitSpec {
        name: name.to_string(),
        image,
        workdir,
        labels,
        resources: Some(ctx.config.units.resources()),
        network,
        volumes,
    };
    let unit = Unit::create(Arc::clone(&ctx.engine), &spec)?;
    unit.start()?;
    println!("✓ Started {} ({})", unit.name(), short_id(unit.id()));
    Ok(())
}

fn list(engine: &dyn Engine) -> Result<()> {
    let units = engine.list_units(MANAGED_LABEL)?;
    if units.is_empty() {
        println!("No units found");
        return Ok(());
    }

    let rows: Vec<UnitRow> = units
        .into_iter()
        .map(|info| UnitRow {
            state: UnitState::from(info.status).to_string(),
            id: short_id(&info.id).to_string(),
            capabilities: info
                .labels
                .get(CAPABILITIES_LABEL)
                .cloned()
                .unwrap_or_else(|| "-".to_string()),
            name: info.name,
            image: info.image,
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));
    println!("{table}");
    Ok(())
}
