use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::engine::ResourceLimits;
use crate::image::{BaseImage, KeepAlive, SandboxImage};

const PROJECT_CONFIG_NAMES: [&str; 2] = [".ai-sandbox.yaml", ".ai-sandbox.yml"];

/// Container runtime hosting the units
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl SandboxRuntime {
    /// Name of the runtime's CLI binary.
    pub fn binary(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
        }
    }
}

/// Description of the sandbox image to build
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct ImageConfig {
    /// Tag of the built image. Default: "ai-sandbox:latest"
    #[serde(default)]
    pub name: Option<String>,

    /// Base environment, `name:tag`. Default: "python:3.10-slim-bookworm"
    #[serde(default)]
    pub base: Option<String>,

    /// Packages installed in order. "<global>" expands to the global list.
    /// Default: curl, procps, findutils, grep, coreutils
    #[serde(default)]
    pub packages: Option<Vec<String>>,

    /// Working directory of every unit. Default: /workspace
    #[serde(default)]
    pub workdir: Option<String>,

    /// Seconds the keep-alive process sleeps between wake-ups. Default: 3600
    #[serde(default)]
    pub keepalive_interval: Option<u64>,
}

/// Settings applied to every unit created from the image
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct UnitConfig {
    /// Per-command timeout in seconds. Default: 60
    #[serde(default)]
    pub exec_timeout: Option<u64>,

    /// Network to attach units to. Empty string disables. Default: sandbox_network
    #[serde(default)]
    pub network: Option<String>,

    /// Extra labels. Default: {"com.example.type": "sandbox"}
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,

    /// Memory limit, e.g. "2g". Default: 2g
    #[serde(default)]
    pub memory: Option<String>,

    /// Default: 100000
    #[serde(default)]
    pub cpu_period: Option<u64>,

    /// Default: 50000 (half a CPU with the default period)
    #[serde(default)]
    pub cpu_quota: Option<u64>,

    /// Default: 50
    #[serde(default)]
    pub pids_limit: Option<u32>,
}

/// Settings for agent sessions managed by the fleet
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct FleetConfig {
    /// Image used for new sessions. Default: the configured image name
    #[serde(default)]
    pub default_image: Option<String>,

    /// Host directory shared with every session. Default: ./shared_files
    #[serde(default)]
    pub shared_dir: Option<PathBuf>,

    /// Mount point of the shared directory inside units. Default: /share_area
    #[serde(default)]
    pub shared_dir_target: Option<String>,

    /// Seconds between monitor passes. Default: 30
    #[serde(default)]
    pub monitor_interval: Option<u64>,

    /// Session record file. Default: $XDG_STATE_HOME/ai-sandbox/sandboxes.json
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

/// Configuration, merged from the global and project files
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Container runtime. Default: docker
    #[serde(default)]
    pub runtime: Option<SandboxRuntime>,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub units: UnitConfig,

    #[serde(default)]
    pub fleet: FleetConfig,
}

impl ImageConfig {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("ai-sandbox:latest")
    }

    /// Working directory units fall back to when an image carries no label.
    pub fn workdir(&self) -> String {
        self.workdir
            .clone()
            .unwrap_or_else(|| SandboxImage::default_for(self.name()).workdir)
    }
}

impl UnitConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout.unwrap_or(60))
    }

    pub fn network(&self) -> Option<&str> {
        match self.network.as_deref() {
            Some(n) if n.trim().is_empty() => None,
            Some(n) => Some(n),
            None => Some("sandbox_network"),
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone().unwrap_or_else(|| {
            BTreeMap::from([("com.example.type".to_string(), "sandbox".to_string())])
        })
    }

    pub fn resources(&self) -> ResourceLimits {
        let defaults = ResourceLimits::default();
        ResourceLimits {
            memory: self.memory.clone().unwrap_or(defaults.memory),
            cpu_period: self.cpu_period.unwrap_or(defaults.cpu_period),
            cpu_quota: self.cpu_quota.unwrap_or(defaults.cpu_quota),
            pids_limit: self.pids_limit.unwrap_or(defaults.pids_limit),
        }
    }
}

impl FleetConfig {
    pub fn shared_dir(&self) -> PathBuf {
        self.shared_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("shared_files"))
    }

    pub fn shared_dir_target(&self) -> &str {
        self.shared_dir_target.as_deref().unwrap_or("/share_area")
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval.unwrap_or(30))
    }
}

/// Find the nearest project config by walking upward from `start_dir`.
pub fn find_project_config(start_dir: &Path) -> Option<PathBuf> {
    let start = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());

    for dir in start.ancestors() {
        for name in PROJECT_CONFIG_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "config:found project config");
                return Some(candidate);
            }
        }
    }
    None
}

impl Config {
    /// Load and merge global and project configurations.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let global_config = Self::load_global()?.unwrap_or_default();
        let project_config = Self::load_project()?.unwrap_or_default();
        let config = global_config.merge(project_config);
        debug!(
            runtime = ?config.runtime(),
            image = config.image.name(),
            "config:loaded"
        );
        Ok(config)
    }

    pub fn runtime(&self) -> SandboxRuntime {
        self.runtime.unwrap_or_default()
    }

    /// The stock image with the configured fields laid over it. The
    /// capability set is always the full one.
    pub fn sandbox_image(&self) -> anyhow::Result<SandboxImage> {
        let mut image = SandboxImage::default_for(self.image.name());
        if let Some(base) = &self.image.base {
            image.base = BaseImage::parse(base)?;
        }
        if let Some(packages) = &self.image.packages {
            image.packages = packages.clone();
        }
        if let Some(workdir) = &self.image.workdir {
            image.workdir = workdir.clone();
        }
        if let Some(secs) = self.image.keepalive_interval {
            image.keepalive = KeepAlive::new(Duration::from_secs(secs));
        }
        Ok(image)
    }

    /// Image used for new fleet sessions.
    pub fn session_image(&self) -> &str {
        self.fleet
            .default_image
            .as_deref()
            .unwrap_or_else(|| self.image.name())
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        Ok(Some(config))
    }

    /// Load the global configuration file from the XDG config directory.
    fn load_global() -> anyhow::Result<Option<Self>> {
        if let Some(home_dir) = home::home_dir() {
            for name in ["config.yaml", "config.yml"] {
                let path = home_dir.join(".config/ai-sandbox").join(name);
                if path.exists() {
                    return Self::load_from_path(&path);
                }
            }
        }
        Ok(None)
    }

    /// Load the nearest `.ai-sandbox.yaml` above the current directory.
    fn load_project() -> anyhow::Result<Option<Self>> {
        let start_dir = std::env::current_dir().unwrap_or_default();
        match find_project_config(&start_dir) {
            Some(path) => Self::load_from_path(&path),
            None => Ok(None),
        }
    }

    /// Merge a project config into a global config.
    /// Project config takes precedence. For packages, "<global>" expands to global items.
    fn merge(self, project: Self) -> Self {
        fn merge_vec_with_placeholder(
            global: Option<Vec<String>>,
            project: Option<Vec<String>>,
        ) -> Option<Vec<String>> {
            match (global, project) {
                (Some(global_items), Some(project_items)) => {
                    if project_items.iter().any(|s| s == "<global>") {
                        let mut result = Vec::new();
                        for item in project_items {
                            if item == "<global>" {
                                result.extend(global_items.clone());
                            } else {
                                result.push(item);
                            }
                        }
                        Some(result)
                    } else {
                        Some(project_items)
                    }
                }
                (global, project) => project.or(global),
            }
        }

        /// Per-field override: `project.field.or(global.field)`.
        macro_rules! merge_options {
            ($ty:ident, $global:expr, $project:expr, $($field:ident),+ $(,)?) => {
                $ty {
                    $($field: $project.$field.or($global.$field),)+
                    ..Default::default()
                }
            };
        }

        let mut image = merge_options!(
            ImageConfig,
            self.image,
            project.image,
            name,
            base,
            workdir,
            keepalive_interval,
        );
        image.packages = merge_vec_with_placeholder(self.image.packages, project.image.packages);

        Config {
            runtime: project.runtime.or(self.runtime),
            image,
            units: merge_options!(
                UnitConfig,
                self.units,
                project.units,
                exec_timeout,
                network,
                labels,
                memory,
                cpu_period,
                cpu_quota,
                pids_limit,
            ),
            fleet: merge_options!(
                FleetConfig,
                self.fleet,
                project.fleet,
                default_image,
                shared_dir,
                shared_dir_target,
                monitor_interval,
                state_file,
            ),
        }
    }

    /// Write an example `.ai-sandbox.yaml` into the current directory.
    pub fn init() -> anyhow::Result<()> {
        let config_path = PathBuf::from(".ai-sandbox.yaml");

        if config_path.exists() {
            return Err(anyhow::anyhow!(
                ".ai-sandbox.yaml already exists. Remove it first if you want to regenerate it."
            ));
        }

        fs::write(&config_path, EXAMPLE_CONFIG)?;
        println!("Created .ai-sandbox.yaml");
        Ok(())
    }
}

const EXAMPLE_CONFIG: &str = r#"# ai-sandbox project configuration
# For global settings, edit ~/.config/ai-sandbox/config.yaml
# All options below are commented out - uncomment to override defaults.

# Container runtime: docker (default) or podman
# runtime: docker

#-------------------------------------------------------------------------------
# Image
#-------------------------------------------------------------------------------

# image:
#   name: ai-sandbox:latest
#   base: python:3.10-slim-bookworm
#   # Installed in this order. "<global>" expands to the global list.
#   packages: [curl, procps, findutils, grep, coreutils]
#   workdir: /workspace
#   keepalive_interval: 3600

#-------------------------------------------------------------------------------
# Units
#-------------------------------------------------------------------------------

# units:
#   exec_timeout: 60
#   network: sandbox_network
#   labels:
#     com.example.type: sandbox
#   memory: 2g
#   cpu_period: 100000
#   cpu_quota: 50000
#   pids_limit: 50

#-------------------------------------------------------------------------------
# Agent sessions
#-------------------------------------------------------------------------------

# fleet:
#   default_image: ai-sandbox:latest
#   shared_dir: ./shared_files
#   shared_dir_target: /share_area
#   monitor_interval: 30
"#;
