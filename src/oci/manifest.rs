use crate::constants::{MEDIA_TYPE_COSIGN, MEDIA_TYPE_DOCKER_MANIFEST_LIST};
use oci_spec::image::MediaType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content descriptor shared by v2 manifests and manifest lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Docker schema v2 or OCI image manifest.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ManifestV2 {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl ManifestV2 {
    /// Signature images carry only cosign payloads, never filesystem layers.
    pub fn is_signature_image(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(|l| l.media_type == MEDIA_TYPE_COSIGN)
    }
}

/// Docker manifest list or OCI image index.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ManifestList {
    /// Parses `body` as a multi-platform list. The media type may come from the
    /// document itself or from the response content type.
    pub fn parse(body: &[u8], content_type: Option<&str>) -> Option<Self> {
        let list: ManifestList = serde_json::from_slice(body).ok()?;
        let declared = list.media_type.as_deref().or(content_type)?;
        if is_manifest_list_type(declared) {
            Some(list)
        } else {
            None
        }
    }
}

pub fn is_manifest_list_type(media_type: &str) -> bool {
    let media_type = media_type.split(';').next().unwrap_or_default().trim();
    media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
        || media_type == MediaType::ImageIndex.to_string()
}

/// Docker schema v1 (signed) manifest.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ManifestV1 {
    #[serde(rename = "schemaVersion", default)]
    pub schema_version: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub architecture: String,
    /// Layers, top-most first
    #[serde(rename = "fsLayers", default)]
    pub fs_layers: Vec<FsLayer>,
    /// One entry per layer, top-most first
    #[serde(default)]
    pub history: Vec<V1History>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct V1History {
    #[serde(rename = "v1Compatibility", default)]
    pub v1_compatibility: String,
}

/// The JSON document embedded in each `v1Compatibility` string.
#[derive(Debug, Default, Deserialize)]
pub struct V1Compatibility {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub config: Option<V1ContainerConfig>,
    #[serde(default)]
    pub container_config: Option<V1ContainerConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct V1ContainerConfig {
    #[serde(rename = "User", default)]
    pub user: Option<String>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
}

/// Image metadata recovered from a schema v1 history.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct V1Metadata {
    pub author: String,
    pub env_vars: Vec<String>,
    /// Build commands, base layer first
    pub commands: Vec<String>,
    pub labels: HashMap<String, String>,
    pub run_as_root: bool,
}

impl ManifestV1 {
    /// Layer digests reordered base-first.
    pub fn layers_base_first(&self) -> Vec<String> {
        self.fs_layers
            .iter()
            .rev()
            .map(|l| l.blob_sum.clone())
            .collect()
    }

    /// The `"id"` field of the top-most history entry.
    pub fn top_history_id(&self) -> Option<String> {
        let top = self.history.first()?;
        let compat: V1Compatibility = serde_json::from_str(&top.v1_compatibility).ok()?;
        compat.id.filter(|id| !id.is_empty())
    }

    pub fn metadata(&self) -> V1Metadata {
        let entries: Vec<V1Compatibility> = self
            .history
            .iter()
            .map(|h| serde_json::from_str(&h.v1_compatibility).unwrap_or_default())
            .collect();

        let mut meta = V1Metadata::default();

        if let Some(top) = entries.first() {
            meta.author = top.author.clone().unwrap_or_default();
            if let Some(ref config) = top.config {
                meta.env_vars = config.env.clone().unwrap_or_default();
                meta.labels = config.labels.clone().unwrap_or_default();
                meta.run_as_root = is_root_user(config.user.as_deref().unwrap_or_default());
            } else {
                meta.run_as_root = true;
            }
        }

        meta.commands = entries
            .iter()
            .rev()
            .map(|e| {
                e.container_config
                    .as_ref()
                    .and_then(|c| c.cmd.as_ref())
                    .map(|cmd| normalize_command(&cmd.join(" ")))
                    .unwrap_or_default()
            })
            .collect();

        meta
    }
}

/// Image configuration blob referenced by a schema v2 / OCI manifest.
#[derive(Debug, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub config: Option<V1ContainerConfig>,
    #[serde(default)]
    pub history: Vec<ConfigHistory>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigHistory {
    #[serde(default)]
    pub created_by: Option<String>,
}

impl ImageConfig {
    pub fn metadata(&self) -> V1Metadata {
        let mut meta = V1Metadata {
            author: self.author.clone().unwrap_or_default(),
            run_as_root: true,
            ..Default::default()
        };
        if let Some(ref config) = self.config {
            meta.env_vars = config.env.clone().unwrap_or_default();
            meta.labels = config.labels.clone().unwrap_or_default();
            meta.run_as_root = is_root_user(config.user.as_deref().unwrap_or_default());
        }
        // config history is already oldest-first
        meta.commands = self
            .history
            .iter()
            .map(|h| normalize_command(h.created_by.as_deref().unwrap_or_default()))
            .collect();
        meta
    }
}

fn is_root_user(user: &str) -> bool {
    let name = user.split(':').next().unwrap_or_default().trim();
    name.is_empty() || name == "root" || name == "0"
}

/// Strips the builder's no-op shell prefix and folds runs of whitespace.
pub fn normalize_command(cmd: &str) -> String {
    let folded = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
    for prefix in ["/bin/sh -c #(nop) ", "/bin/sh -c "] {
        if let Some(rest) = folded.strip_prefix(prefix) {
            return rest.trim().to_string();
        }
    }
    folded
}
