//! Model descriptors.
//!
//! A descriptor is an immutable JSON record shipped in the catalog
//! directory. Fields hearth does not interpret are kept verbatim in the
//! `extra` maps so they survive a save/load cycle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LocalAIError;
use crate::paths::model_dir;

/// A downloadable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique id, also the name of the model's storage directory.
    pub id: String,
    /// Display name of the model.
    pub name: String,
    /// Where to fetch the model from, in order of preference.
    #[serde(default)]
    pub sources: Vec<DownloadSource>,
    /// Engine settings used when launching the inference server.
    #[serde(default)]
    pub settings: EngineSettings,
    /// Sampling parameters sent with every completion request.
    #[serde(default)]
    pub parameters: SamplingParameters,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One place a model file can be downloaded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSource {
    /// Download URL.
    pub url: String,
    /// File name to store the download under.
    pub filename: String,
    /// Expected SHA256 checksum (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Engine-side settings. Unset fields fall back to supervisor defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_len: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ngl: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    /// Artifact file name inside the model directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llama_model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cont_batching: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_threads: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Sampling parameters. Unset fields fall back to the chat configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelDescriptor {
    /// Parse and validate a descriptor. `origin` is only used in errors.
    pub fn from_json(raw: &str, origin: &Path) -> Result<Self, LocalAIError> {
        let invalid = |message: String| LocalAIError::InvalidDescriptor {
            path: origin.to_path_buf(),
            message,
        };

        let descriptor: Self = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;

        if descriptor.id.trim().is_empty() {
            return Err(invalid("empty model id".to_string()));
        }
        if !is_plain_file_name(&descriptor.id) {
            return Err(invalid(format!("model id '{}' is not a plain name", descriptor.id)));
        }
        match descriptor.artifact_file_name() {
            None => return Err(invalid("no download source or model file name".to_string())),
            Some(name) if !is_plain_file_name(name) => {
                return Err(invalid(format!("model file '{}' is not a plain name", name)));
            }
            Some(_) => {}
        }

        Ok(descriptor)
    }

    /// Read a descriptor file.
    pub async fn load(path: &Path) -> Result<Self, LocalAIError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw, path)
    }

    /// The source `use` downloads from.
    pub fn primary_source(&self) -> Option<&DownloadSource> {
        self.sources.first()
    }

    /// Name of the model's main file on disk.
    pub fn artifact_file_name(&self) -> Option<&str> {
        self.settings
            .llama_model_path
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.primary_source().map(|s| s.filename.as_str()))
    }

    /// Where the artifact lives under the model storage root.
    pub fn artifact_path(&self, models_root: &Path) -> Option<PathBuf> {
        self.artifact_file_name()
            .map(|name| model_dir(models_root, &self.id).join(name))
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}
