//! The `.mfapp` application manifest: window, runtime, pipeline and
//! asset declarations.
//!
//! A manifest is ordinary JSON with no source-location requirements, so
//! it deserialises through serde rather than the compiler's located
//! parser.

use std::fs;
use std::path::Path;

use failure::Fail;
use serde::{Deserialize, Serialize};

use crate::cartridge::{WindowConfig, WINDOW_FULLSCREEN, WINDOW_RESIZABLE, WINDOW_VSYNC};
use crate::engine::{BindingDesc, KernelDesc, PipelineDesc, ResourceDesc};
use crate::tensor::Dtype;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Manifest {
    #[serde(default)]
    pub window: WindowDesc,
    pub runtime: RuntimeDesc,
    #[serde(default)]
    pub pipeline: PipelineManifest,
    #[serde(default)]
    pub assets: Vec<AssetDesc>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WindowDesc {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub resizable: bool,
    #[serde(default = "default_true")]
    pub vsync: bool,
    #[serde(default)]
    pub fullscreen: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuntimeDesc {
    pub entry: String,
    /// Worker count; 0 picks the CPU count.
    #[serde(default)]
    pub threads: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PipelineManifest {
    #[serde(default)]
    pub resources: Vec<ResourceManifest>,
    #[serde(default)]
    pub kernels: Vec<KernelManifest>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ResourceManifest {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KernelManifest {
    pub id: String,
    pub entry: String,
    #[serde(default = "default_frequency")]
    pub frequency: u32,
    #[serde(default)]
    pub bindings: Vec<BindingManifest>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BindingManifest {
    pub port: String,
    pub resource: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AssetDesc {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Fail)]
pub enum ManifestError {
    #[fail(display = "cannot read manifest: {}", _0)]
    Io(String),
    #[fail(display = "malformed manifest: {}", _0)]
    Parse(String),
}

impl Manifest {
    pub fn from_str(source: &str) -> Result<Manifest, ManifestError> {
        serde_json::from_str(source).map_err(|e| ManifestError::Parse(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Manifest, ManifestError> {
        let source =
            fs::read_to_string(path).map_err(|e| ManifestError::Io(format!("{}: {}", path.display(), e)))?;
        Manifest::from_str(&source)
    }

    /// The engine-facing pipeline description.
    pub fn pipeline_desc(&self) -> PipelineDesc {
        PipelineDesc {
            resources: self
                .pipeline
                .resources
                .iter()
                .map(|r| ResourceDesc {
                    name: r.name.clone(),
                    dtype: r.dtype,
                    shape: r.shape.clone(),
                })
                .collect(),
            kernels: self
                .pipeline
                .kernels
                .iter()
                .map(|k| KernelDesc {
                    id: k.id.clone(),
                    entry: k.entry.clone(),
                    frequency: k.frequency,
                    bindings: k
                        .bindings
                        .iter()
                        .map(|b| BindingDesc {
                            port: b.port.clone(),
                            resource: b.resource.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Header window configuration for cartridges.
    pub fn window_config(&self) -> WindowConfig {
        let mut flags = 0;
        if self.window.resizable {
            flags |= WINDOW_RESIZABLE;
        }
        if self.window.vsync {
            flags |= WINDOW_VSYNC;
        }
        if self.window.fullscreen {
            flags |= WINDOW_FULLSCREEN;
        }
        WindowConfig {
            width: self.window.width,
            height: self.window.height,
            flags,
        }
    }
}

impl Default for WindowDesc {
    fn default() -> Self {
        WindowDesc {
            title: default_title(),
            width: default_width(),
            height: default_height(),
            resizable: false,
            vsync: true,
            fullscreen: false,
        }
    }
}

fn default_title() -> String {
    "MathFlow App".to_string()
}

fn default_width() -> u32 {
    800
}

fn default_height() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

fn default_frequency() -> u32 {
    1
}
