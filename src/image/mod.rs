//! Sandbox image description.
//!
//! A [`SandboxImage`] is everything needed to produce the image: the base
//! environment, the ordered package list, the capabilities those packages must
//! provide, the working directory and the keep-alive command. The Dockerfile is
//! rendered from it and never edited by hand.

pub mod build;

use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

/// Image label holding the comma-joined capability set.
pub const CAPABILITIES_LABEL: &str = "ai-sandbox.capabilities";
/// Image label holding the declared working directory.
pub const WORKDIR_LABEL: &str = "ai-sandbox.workdir";

// Debian policy: lowercase alphanumerics plus `+ - .`, at least two chars,
// starting with an alphanumeric.
static PACKAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.\-]+$").expect("valid regex"));

static SAFE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/[A-Za-z0-9._/\-]*$").expect("valid regex"));

const DOCKERFILE_TEMPLATE: &str = r#"FROM {{ base }}

LABEL {{ capabilities_label }}="{{ capabilities }}"
LABEL {{ workdir_label }}="{{ workdir }}"

ARG DEBIAN_FRONTEND=noninteractive
RUN apt-get update \
    && apt-get install -y --no-install-recommends \
{%- for package in packages %}
        {{ package }} \
{%- endfor %}
    && rm -rf /var/lib/apt/lists/*

RUN mkdir -p {{ workdir }} && chmod 0777 {{ workdir }}
WORKDIR {{ workdir }}

CMD {{ cmd }}
"#;

/// A tool the sandbox must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Upload/download against remote endpoints
    Transfer,
    /// Listing and measuring processes and memory
    ProcessInspection,
    /// Locating files by name or pattern
    FileSearch,
    /// Pattern matching within file contents
    TextSearch,
    /// Binary-to-text encoding used by safe file writes
    EncodeDecode,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Transfer,
        Capability::ProcessInspection,
        Capability::FileSearch,
        Capability::TextSearch,
        Capability::EncodeDecode,
    ];

    /// Debian package that provides this capability.
    pub fn package(&self) -> &'static str {
        match self {
            Capability::Transfer => "curl",
            Capability::ProcessInspection => "procps",
            Capability::FileSearch => "findutils",
            Capability::TextSearch => "grep",
            Capability::EncodeDecode => "coreutils",
        }
    }

    /// Binary whose presence proves the capability.
    pub fn binary(&self) -> &'static str {
        match self {
            Capability::Transfer => "curl",
            Capability::ProcessInspection => "ps",
            Capability::FileSearch => "find",
            Capability::TextSearch => "grep",
            Capability::EncodeDecode => "base64",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Transfer => "transfer",
            Capability::ProcessInspection => "process-inspection",
            Capability::FileSearch => "file-search",
            Capability::TextSearch => "text-search",
            Capability::EncodeDecode => "encode-decode",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid base image '{0}'")]
    InvalidBase(String),
    #[error("no packages listed")]
    NoPackages,
    #[error("invalid package name '{0}'")]
    InvalidPackage(String),
    #[error("package '{0}' is listed more than once")]
    DuplicatePackage(String),
    #[error("capability '{0}' is required but not declared")]
    UndeclaredCapability(Capability),
    #[error("capability '{capability}' requires package '{package}', which is not listed")]
    MissingCapability {
        capability: Capability,
        package: &'static str,
    },
    #[error("working directory '{0}' must be an absolute path of [A-Za-z0-9._/-]")]
    InvalidWorkdir(String),
    #[error("keep-alive interval must be at least one second")]
    ZeroInterval,
}

/// Base environment identity: `name:tag`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub name: String,
    pub tag: String,
}

impl BaseImage {
    /// Parse `name[:tag]`. A missing tag means `latest`; a colon followed by a
    /// path (`host:5000/img`) is a registry port, not a tag.
    pub fn parse(reference: &str) -> Result<Self, ValidationError> {
        let reference = reference.trim();
        let invalid = || ValidationError::InvalidBase(reference.to_string());
        if reference.is_empty() || reference.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (reference, "latest"),
        };
        if name.is_empty() || tag.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// The foreground process of every unit: an unbounded sleep/wake loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
}

impl KeepAlive {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Exec-form command. `sh` stays PID 1 so a signal to the unit ends it.
    pub fn command(&self) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("while :; do sleep {}; done", self.interval.as_secs()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxImage {
    /// Tag the image is built as.
    pub name: String,
    pub base: BaseImage,
    /// Installed in this order.
    pub packages: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub workdir: String,
    pub keepalive: KeepAlive,
}

impl SandboxImage {
    /// The stock image with every capability.
    pub fn default_for(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: BaseImage {
                name: "python".to_string(),
                tag: "3.10-slim-bookworm".to_string(),
            },
            packages: Capability::ALL
                .iter()
                .map(|c| c.package().to_string())
                .collect(),
            capabilities: Capability::ALL.to_vec(),
            workdir: "/workspace".to_string(),
            keepalive: KeepAlive::new(Duration::from_secs(3600)),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.packages.is_empty() {
            return Err(ValidationError::NoPackages);
        }

        let mut seen = HashSet::new();
        for package in &self.packages {
            if !PACKAGE_NAME.is_match(package) {
                return Err(ValidationError::InvalidPackage(package.clone()));
            }
            if !seen.insert(package.as_str()) {
                return Err(ValidationError::DuplicatePackage(package.clone()));
            }
        }

        if let Some(required) = Capability::ALL
            .iter()
            .find(|c| !self.capabilities.contains(*c))
        {
            return Err(ValidationError::UndeclaredCapability(*required));
        }

        for capability in &self.capabilities {
            let package = capability.package();
            if !seen.contains(package) {
                return Err(ValidationError::MissingCapability {
                    capability: *capability,
                    package,
                });
            }
        }

        if !SAFE_PATH.is_match(&self.workdir) {
            return Err(ValidationError::InvalidWorkdir(self.workdir.clone()));
        }
        if self.keepalive.interval.as_secs() == 0 {
            return Err(ValidationError::ZeroInterval);
        }
        Ok(())
    }

    /// Capabilities in declaration order, comma-joined. Two images with the
    /// same label value provide the same tools.
    pub fn capability_set_label(&self) -> String {
        capability_label(&self.capabilities)
    }

    pub fn render_dockerfile(&self) -> Result<String> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);

        let cmd = serde_json::to_string(&self.keepalive.command())?;
        env.render_str(
            DOCKERFILE_TEMPLATE,
            context! {
                base => self.base.to_string(),
                capabilities_label => CAPABILITIES_LABEL,
                capabilities => self.capability_set_label(),
                workdir_label => WORKDIR_LABEL,
                workdir => &self.workdir,
                packages => &self.packages,
                cmd => cmd,
            },
        )
        .context("Failed to render Dockerfile")
    }
}

/// Canonical label value for a capability set.
pub fn capability_label(capabilities: &[Capability]) -> String {
    let mut sorted: Vec<Capability> = capabilities.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
