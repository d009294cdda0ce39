//! Image commands.

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use console::style;
use std::time::Duration;

use super::Context;
use crate::config::Config;
use crate::image::build::{self, BuildOptions, VerifyReport};
use crate::spinner::with_spinner;

#[derive(Debug, Args)]
pub struct ImageArgs {
    #[command(subcommand)]
    pub command: ImageCommand,
}

#[derive(Debug, Subcommand)]
pub enum ImageCommand {
    /// Build the image and verify every capability inside a throwaway unit.
    Build {
        /// Skip the capability probes
        #[arg(long)]
        skip_verify: bool,
        /// Timeout in seconds for each probe
        #[arg(long, default_value_t = 60)]
        probe_timeout: u64,
    },
    /// Print the Dockerfile rendered from the configuration.
    Dockerfile,
    /// Probe an already-built image without rebuilding it.
    Verify {
        /// Timeout in seconds for each probe
        #[arg(long, default_value_t = 60)]
        probe_timeout: u64,
    },
    /// Show the image description and its capability set.
    Show,
}

pub fn run(args: ImageArgs) -> Result<()> {
    match args.command {
        ImageCommand::Build {
            skip_verify,
            probe_timeout,
        } => run_build(skip_verify, probe_timeout),
        ImageCommand::Dockerfile => {
            let image = Config::load()?.sandbox_image()?;
            image.validate()?;
            print!("{}", image.render_dockerfile()?);
            Ok(())
        }
        ImageCommand::Verify { probe_timeout } => run_verify(probe_timeout),
        ImageCommand::Show => run_show(),
    }
}

fn run_build(skip_verify: bool, probe_timeout: u64) -> Result<()> {
    let ctx = Context::load()?;
    let image = ctx.config.sandbox_image()?;
    let opts = BuildOptions {
        skip_verify,
        probe_timeout: Duration::from_secs(probe_timeout),
    };

    let msg = format!("Building {} using {}", image.name, ctx.engine.name());
    let report = with_spinner(&msg, || build::build(&ctx.engine, &image, &opts))?;

    println!(
        "✓ Built {} with capabilities {}",
        style(&report.image).bold(),
        report.capabilities
    );
    match &report.verified {
        Some(verified) => print_probes(verified),
        None => println!("  {}", style("verification skipped").dim()),
    }
    Ok(())
}

fn run_verify(probe_timeout: u64) -> Result<()> {
    let ctx = Context::load()?;
    let image = ctx.config.sandbox_image()?;
    if !ctx.engine.image_exists(&image.name)? {
        bail!(
            "Image '{}' does not exist. Run `ai-sandbox image build` first.",
            image.name
        );
    }

    let msg = format!("Verifying {}", image.name);
    let report = with_spinner(&msg, || {
        build::verify(&ctx.engine, &image, Duration::from_secs(probe_timeout))
    })?;
    print_probes(&report);
    if !report.passed() {
        bail!("Verification failed: {}", report.failed().join(", "));
    }
    Ok(())
}

fn run_show() -> Result<()> {
    let image = Config::load()?.sandbox_image()?;
    println!("{:<14}{}", style("name").bold(), image.name);
    println!("{:<14}{}", style("base").bold(), image.base);
    println!("{:<14}{}", style("packages").bold(), image.packages.join(" "));
    println!(
        "{:<14}{}",
        style("capabilities").bold(),
        image.capability_set_label()
    );
    println!("{:<14}{}", style("workdir").bold(), image.workdir);
    println!(
        "{:<14}{}",
        style("keep-alive").bold(),
        image.keepalive.command().join(" ")
    );
    if let Err(e) = image.validate() {
        println!("{} {e}", style("invalid:").red().bold());
    }
    Ok(())
}

fn print_probes(report: &VerifyReport) {
    for probe in &report.probes {
        let mark = if probe.passed {
            style("✓").green()
        } else {
            style("✘").red()
        };
        println!("  {mark} {:<20} {}", probe.name, style(&probe.detail).dim());
    }
}
