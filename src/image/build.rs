//! All-or-nothing image builds.
//!
//! A build either produces an image whose every declared capability has been
//! exercised inside a real unit, or leaves no image behind under its tag.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Capability, SandboxImage, ValidationError};
use crate::engine::{Engine, MANAGED_LABEL, UnitSpec};
use crate::unit::{Unit, random_hex};

const PROBE_FILE: &str = ".ai-sandbox-probe";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Skip running the capability probes after the engine build.
    pub skip_verify: bool,
    /// Timeout for each probe command.
    pub probe_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            skip_verify: false,
            probe_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid image description: {0}")]
    Invalid(#[from] ValidationError),
    #[error("image build failed: {0:#}")]
    EngineBuild(anyhow::Error),
    #[error("image verification failed: {}", .failed.join(", "))]
    Verification { failed: Vec<String> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub name: String,
    pub command: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub probes: Vec<ProbeResult>,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.probes.iter().all(|p| p.passed)
    }

    pub fn failed(&self) -> Vec<String> {
        self.probes
            .iter()
            .filter(|p| !p.passed)
            .map(|p| p.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image: String,
    pub capabilities: String,
    /// `None` when verification was skipped.
    pub verified: Option<VerifyReport>,
}

/// Shell probe proving a capability's tool exists and works.
fn probe_command(capability: Capability) -> String {
    let smoke = match capability {
        Capability::Transfer => "curl --version".to_string(),
        Capability::ProcessInspection => "ps -o pid= -p 1".to_string(),
        Capability::FileSearch => "find . -maxdepth 0".to_string(),
        Capability::TextSearch => format!(
            "printf 'needle\\n' > {PROBE_FILE} && grep -q needle {PROBE_FILE}; rc=$?; rm -f {PROBE_FILE}; exit $rc"
        ),
        // Exercised through the safe-write round trip instead.
        Capability::EncodeDecode => "base64 --help".to_string(),
    };
    format!("command -v {} >/dev/null && {smoke}", capability.binary())
}

/// Build `image` through `engine`. On any failure after the engine build
/// starts, the tag is removed again.
pub fn build(
    engine: &Arc<dyn Engine>,
    image: &SandboxImage,
    opts: &BuildOptions,
) -> Result<BuildReport, BuildError> {
    image.validate()?;

    let dockerfile = image.render_dockerfile()?;
    let context_dir = tempfile::Builder::new()
        .prefix("ai-sandbox-build-")
        .tempdir()
        .context("Failed to create temporary build directory")?;
    fs::write(context_dir.path().join("Dockerfile"), &dockerfile)
        .context("Failed to write Dockerfile")?;

    info!(
        image = %image.name,
        base = %image.base,
        packages = ?image.packages,
        engine = engine.name(),
        "build:start"
    );

    if let Err(e) = engine.build_image(&image.name, context_dir.path()) {
        warn!(image = %image.name, error = %e, "build:engine build failed");
        discard(engine.as_ref(), &image.name);
        return Err(BuildError::EngineBuild(e));
    }

    let capabilities = image.capability_set_label();
    if opts.skip_verify {
        info!(image = %image.name, "build:done (verification skipped)");
        return Ok(BuildReport {
            image: image.name.clone(),
            capabilities,
            verified: None,
        });
    }

    match verify(engine, image, opts.probe_timeout) {
        Ok(report) if report.passed() => {
            info!(image = %image.name, probes = report.probes.len(), "build:done");
            Ok(BuildReport {
                image: image.name.clone(),
                capabilities,
                verified: Some(report),
            })
        }
        Ok(report) => {
            let failed = report.failed();
            warn!(image = %image.name, ?failed, "build:verification failed");
            discard(engine.as_ref(), &image.name);
            Err(BuildError::Verification { failed })
        }
        Err(e) => {
            warn!(image = %image.name, error = %e, "build:verification errored");
            discard(engine.as_ref(), &image.name);
            Err(BuildError::Verification {
                failed: vec![format!("{e:#}")],
            })
        }
    }
}

fn discard(engine: &dyn Engine, tag: &str) {
    if let Err(e) = engine.remove_image(tag) {
        warn!(image = tag, error = %e, "build:failed to remove image");
    }
}

/// Start a throwaway unit from `image` and exercise every declared capability.
/// The unit is always destroyed afterwards.
pub fn verify(
    engine: &Arc<dyn Engine>,
    image: &SandboxImage,
    timeout: Duration,
) -> Result<VerifyReport> {
    let spec = UnitSpec {
        name: format!("ai-sandbox-verify-{}", random_hex(4)?),
        image: image.name.clone(),
        workdir: image.workdir.clone(),
        labels: BTreeMap::from([
            (MANAGED_LABEL.0.to_string(), MANAGED_LABEL.1.to_string()),
            ("ai-sandbox.role".to_string(), "verify".to_string()),
        ]),
        ..Default::default()
    };
    let unit = Unit::create(Arc::clone(engine), &spec)?;
    let result = unit.start().and_then(|()| run_probes(&unit, image, timeout));

    if let Err(e) = unit.destroy() {
        warn!(unit = unit.name(), error = %e, "verify:failed to destroy probe unit");
    }
    result
}

fn run_probes(unit: &Unit, image: &SandboxImage, timeout: Duration) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();

    let workdir_probe =
        format!("test -d . && test -w . && touch {PROBE_FILE} && rm -f {PROBE_FILE}");
    report.probes.push(run_probe(unit, "workdir", &workdir_probe, timeout)?);

    for capability in &image.capabilities {
        let command = probe_command(*capability);
        report
            .probes
            .push(run_probe(unit, capability.as_str(), &command, timeout)?);
    }

    if image.capabilities.contains(&Capability::EncodeDecode) {
        report.probes.push(safe_write_probe(unit, timeout));
    }

    Ok(report)
}

fn run_probe(unit: &Unit, name: &str, command: &str, timeout: Duration) -> Result<ProbeResult> {
    let output = unit.exec(command, timeout)?;
    let passed = output.success();
    debug!(probe = name, passed, exit_code = ?output.exit_code, "verify:probe");
    let detail = if passed {
        output.stdout.lines().next().unwrap_or_default().to_string()
    } else if output.timed_out {
        "timed out".to_string()
    } else {
        output.stderr.trim().to_string()
    };
    Ok(ProbeResult {
        name: name.to_string(),
        command: command.to_string(),
        passed,
        detail,
    })
}

fn safe_write_probe(unit: &Unit, timeout: Duration) -> ProbeResult {
    let payload: Vec<u8> = (0..=255u8).collect();
    let round_trip = unit
        .write_file(PROBE_FILE, &payload, timeout)
        .and_then(|()| unit.read_file(PROBE_FILE, timeout));
    let _ = unit.exec(&format!("rm -f {PROBE_FILE}"), timeout);

    let (passed, detail) = match round_trip {
        Ok(back) if back == payload => (true, format!("{} bytes", payload.len())),
        Ok(back) => (false, format!("got {} bytes back, content differs", back.len())),
        Err(e) => (false, format!("{e:#}")),
    };
    ProbeResult {
        name: "safe-write".to_string(),
        command: format!("write_file/read_file {PROBE_FILE}"),
        passed,
        detail,
    }
}
