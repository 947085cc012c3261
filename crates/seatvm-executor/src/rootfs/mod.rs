//! Turning a container image into a bootable ext4 root filesystem.

pub mod builder;

pub use builder::ImageBuilder;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

/// Where the guest kernel finds the injected entrypoint.
pub const INIT_PATH: &str = "/sbin/seat-init";

/// Workload command handed to the entrypoint, one argument per line.
pub const COMMAND_FILE: &str = "/etc/seat-init/command";

/// Shell entrypoint injected unless a binary is supplied.
pub const INIT_SCRIPT: &str = include_str!("seat-init.sh");

pub const DEFAULT_IMAGE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Smallest image mkfs.ext4 formats without complaint.
const MIN_IMAGE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Validate,
    Tooling,
    SourceImage,
    Allocate,
    Mount,
    Populate,
    InjectInit,
    VerifyTools,
    Unmount,
    Publish,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Validate => "config validation",
            BuildStage::Tooling => "tooling check",
            BuildStage::SourceImage => "source image",
            BuildStage::Allocate => "image allocation",
            BuildStage::Mount => "mount",
            BuildStage::Populate => "filesystem export",
            BuildStage::InjectInit => "init injection",
            BuildStage::VerifyTools => "boot tool verification",
            BuildStage::Unmount => "unmount",
            BuildStage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ImageBuildError {
    #[error("Invalid image build config: {0}")]
    InvalidConfig(String),

    #[error("Missing tool: {0}")]
    MissingTool(String),

    #[error("Image build failed during {stage}: {message}")]
    Stage { stage: BuildStage, message: String },
}

impl ImageBuildError {
    pub fn stage(stage: BuildStage, err: impl fmt::Display) -> Self {
        ImageBuildError::Stage {
            stage,
            message: format!("{err:#}"),
        }
    }

    /// The pipeline stage that failed.
    pub fn failed_stage(&self) -> BuildStage {
        match self {
            ImageBuildError::InvalidConfig(_) => BuildStage::Validate,
            ImageBuildError::MissingTool(_) => BuildStage::Tooling,
            ImageBuildError::Stage { stage, .. } => *stage,
        }
    }
}

/// What to install at [`INIT_PATH`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InitSource {
    /// The embedded shell entrypoint.
    #[default]
    Script,
    /// A prebuilt static init binary such as `seatvm-guest-init`.
    Binary { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuildConfig {
    /// Container image reference, e.g. `seatvm/workspace:latest`.
    pub image: String,
    pub output: PathBuf,
    #[serde(default = "default_size")]
    pub size_bytes: u64,
    /// Directory with a Dockerfile, used when the image is not present locally.
    #[serde(default)]
    pub build_context: Option<PathBuf>,
    #[serde(default)]
    pub init: InitSource,
    /// Written to `/etc/resolv.conf` when non-empty.
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
    /// Scratch location. Defaults to the output's directory so publishing is a rename.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_size() -> u64 {
    DEFAULT_IMAGE_SIZE
}

impl ImageBuildConfig {
    pub fn new(image: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            output: output.into(),
            size_bytes: DEFAULT_IMAGE_SIZE,
            build_context: None,
            init: InitSource::default(),
            nameservers: Vec::new(),
            scratch_dir: None,
        }
    }

    pub fn validate(&self) -> Result<(), ImageBuildError> {
        if self.image.trim().is_empty() {
            return Err(ImageBuildError::InvalidConfig(
                "image reference is required".to_string(),
            ));
        }
        if self.output.as_os_str().is_empty() {
            return Err(ImageBuildError::InvalidConfig(
                "output path is required".to_string(),
            ));
        }
        if self.output.is_dir() {
            return Err(ImageBuildError::InvalidConfig(format!(
                "output {} is a directory",
                self.output.display()
            )));
        }
        if self.size_bytes < MIN_IMAGE_SIZE {
            return Err(ImageBuildError::InvalidConfig(format!(
                "image size {} is below the {} byte minimum",
                self.size_bytes, MIN_IMAGE_SIZE
            )));
        }
        if let InitSource::Binary { path } = &self.init {
            if !path.is_file() {
                return Err(ImageBuildError::InvalidConfig(format!(
                    "init binary {} not found",
                    path.display()
                )));
            }
        }
        Ok(())
    }
}
