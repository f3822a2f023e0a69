//! Manifest resolution.
//!
//! Turns `(registry, repository, tag-or-digest)` into one [`ImageDescriptor`]
//! regardless of which manifest generation the registry serves:
//!
//! 1. cosign signature tags on quay.io get a dedicated signature request
//! 2. schema v2 negotiation, descending into a manifest list / OCI index
//! 3. the config blob of a v2 manifest, for image metadata
//! 4. schema v1, which fills whatever the v2 path left empty
//!
//! Layers are always reported base-first.

use crate::constants::{COSIGN_SIGNATURE_TAG_SUFFIX, QUAY_REGISTRY_URL};
use crate::error::{Result, ScanError};
use crate::logging::ScanEvent;
use crate::oci::manifest::{Descriptor, ImageConfig, ManifestList, ManifestV1, ManifestV2, V1Metadata};
use crate::oci::registry::{ManifestRequestKind, ManifestResponse, RegistryTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unified view of an image, whatever manifest schema described it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    /// Content id without the algorithm prefix
    pub id: String,
    /// Digest of the manifest that was actually used
    pub digest: String,
    /// Layer digests, base layer first
    pub layers: Vec<String>,
    pub layer_sizes: HashMap<String, i64>,
    pub author: String,
    pub run_as_root: bool,
    pub env_vars: Vec<String>,
    pub commands: Vec<String>,
    pub labels: HashMap<String, String>,
    pub repo_tags: Vec<String>,
    pub is_signature_image: bool,
    #[serde(skip)]
    pub raw_manifest: Vec<u8>,
}

impl ImageDescriptor {
    pub fn is_valid(&self) -> bool {
        !self.id.is_empty() && !self.layers.is_empty()
    }

    /// Known size of a layer, if the manifest declared one
    pub fn layer_size(&self, digest: &str) -> Option<i64> {
        self.layer_sizes.get(digest).copied()
    }

    fn apply_metadata(&mut self, meta: V1Metadata, user_known: bool) {
        if self.author.is_empty() {
            self.author = meta.author;
        }
        if self.env_vars.is_empty() {
            self.env_vars = meta.env_vars;
        }
        if self.commands.is_empty() {
            self.commands = meta.commands;
        }
        if self.labels.is_empty() {
            self.labels = meta.labels;
        }
        if !user_known {
            self.run_as_root = meta.run_as_root;
        }
    }
}

/// Whether `tag` looks like a cosign signature tag (`sha256-<hex>.sig`).
pub fn is_signature_tag(tag: &str) -> bool {
    tag.len() >= COSIGN_SIGNATURE_TAG_SUFFIX.len() && tag.ends_with(COSIGN_SIGNATURE_TAG_SUFFIX)
}

/// The tag cosign stores signatures under for an image digest.
///
/// `sha256:5e94...` becomes `sha256-5e94....sig`
pub fn signature_tag_for_digest(digest: &str) -> String {
    format!("{}{}", digest.replacen(':', "-", 1), COSIGN_SIGNATURE_TAG_SUFFIX)
}

pub fn is_quay_registry(endpoint: &str) -> bool {
    endpoint
        .get(..QUAY_REGISTRY_URL.len())
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(QUAY_REGISTRY_URL))
}

/// Picks one child of a manifest list: linux/amd64, else the first linux
/// entry, else the first entry.
pub fn select_platform(manifests: &[Descriptor]) -> Option<&Descriptor> {
    let is_linux = |d: &&Descriptor| d.platform.as_ref().map_or(false, |p| p.os == "linux");

    manifests
        .iter()
        .find(|d| {
            d.platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| manifests.iter().find(is_linux))
        .or_else(|| manifests.first())
}

/// Strips an algorithm prefix such as `sha256:` from an image id.
pub fn normalize_image_id(id: &str) -> String {
    if id.starts_with("sha") {
        if let Some((_, hex)) = id.split_once(':') {
            return hex.to_string();
        }
    }
    id.to_string()
}

/// Builds a descriptor from a schema v2 / OCI manifest body.
pub fn build_v2_descriptor(digest: &str, body: &[u8]) -> Result<ImageDescriptor> {
    let manifest: ManifestV2 =
        serde_json::from_slice(body).map_err(|e| ScanError::protocol(digest, e))?;
    if manifest.schema_version != 2 {
        return Err(ScanError::protocol(
            digest,
            format!("unexpected manifest schema version: {}", manifest.schema_version),
        ));
    }

    tracing::debug!(
        layers = manifest.layers.len(),
        digest = %digest,
        "v2 manifest parsed"
    );

    let mut descriptor = ImageDescriptor {
        id: manifest.config.digest.clone(),
        digest: digest.to_string(),
        is_signature_image: manifest.is_signature_image(),
        ..Default::default()
    };
    for layer in &manifest.layers {
        descriptor.layers.push(layer.digest.clone());
        descriptor.layer_sizes.insert(layer.digest.clone(), layer.size);
    }

    Ok(descriptor)
}

/// Resolves `name:reference` on the registry behind `transport`.
pub async fn resolve(
    transport: &dyn RegistryTransport,
    name: &str,
    reference: &str,
) -> Result<ImageDescriptor> {
    resolve_with_kind(transport, name, reference, ManifestRequestKind::SchemaV2).await
}

pub async fn resolve_with_kind(
    transport: &dyn RegistryTransport,
    name: &str,
    reference: &str,
    kind: ManifestRequestKind,
) -> Result<ImageDescriptor> {
    let requested = format!("{}:{}", name, reference);
    let mut reference = reference.to_string();
    let mut descriptor = ImageDescriptor::default();
    let mut raw_manifest = None;
    let mut fetch_error = None;
    let mut signature_special_case = false;
    let mut user_known = false;

    if is_signature_tag(&reference) && is_quay_registry(transport.endpoint()) {
        match transport
            .manifest(name, &reference, ManifestRequestKind::CosignSignature)
            .await
        {
            Ok(resp) => match build_v2_descriptor(&resp.digest, &resp.body) {
                Ok(d) => {
                    descriptor = d;
                    raw_manifest = Some(resp.body.to_vec());
                    signature_special_case = true;
                }
                Err(e) => tracing::debug!(error = %e, "Signature manifest not usable"),
            },
            Err(e) => tracing::debug!(error = %e, "Signature manifest request failed"),
        }
    }

    if !signature_special_case {
        match fetch_schema_v2(transport, name, &mut reference, kind).await {
            Ok(resp) => {
                match build_v2_descriptor(&resp.digest, &resp.body) {
                    Ok(d) => {
                        descriptor = d;
                        if !descriptor.is_signature_image && !descriptor.id.is_empty() {
                            user_known = apply_config_metadata(transport, name, &mut descriptor).await;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "Failed to get manifest schema v2"),
                }
                raw_manifest = Some(resp.body.to_vec());
            }
            Err(e) => {
                tracing::warn!(error = %e, image = %requested, "Schema v2 manifest request failed");
                fetch_error = Some(e);
            }
        }
    }

    // Some registries answer a v1 request with v2 content, so the declared
    // schema version decides whether the body is usable.
    match transport
        .manifest(name, &reference, ManifestRequestKind::SchemaV1)
        .await
    {
        Ok(resp) => match serde_json::from_slice::<ManifestV1>(&resp.body) {
            Ok(v1) if v1.schema_version <= 1 => {
                tracing::debug!(
                    layers = v1.fs_layers.len(),
                    digest = %resp.digest,
                    "v1 manifest parsed"
                );
                merge_schema_v1(&mut descriptor, &v1, &resp.digest, user_known);
                if raw_manifest.is_none() {
                    raw_manifest = Some(resp.body.to_vec());
                }
            }
            Ok(v1) => {
                tracing::debug!(schema = v1.schema_version, "v1 request returned a newer schema")
            }
            Err(e) => tracing::debug!(error = %e, "Failed to parse manifest schema v1"),
        },
        Err(e) => tracing::debug!(error = %e, "Get manifest v1 failed"),
    }

    descriptor.id = normalize_image_id(&descriptor.id);
    if !descriptor.is_valid() {
        tracing::error!(image = %requested, id = %descriptor.id, layers = descriptor.layers.len(), "Get metadata failed");
        return Err(fetch_error.unwrap_or_else(|| {
            ScanError::protocol(&requested, "manifest yields no image id or no layers")
        }));
    }

    descriptor.raw_manifest = raw_manifest.unwrap_or_default();

    tracing::info!(
        "{}",
        ScanEvent::ImageResolved {
            reference: requested,
            digest: descriptor.digest.clone(),
            layers: descriptor.layers.len(),
        }
    );

    Ok(descriptor)
}

/// Fetches the v2 manifest, descending into a manifest list when needed.
/// `reference` is replaced by the selected child digest.
async fn fetch_schema_v2(
    transport: &dyn RegistryTransport,
    name: &str,
    reference: &mut String,
    kind: ManifestRequestKind,
) -> Result<ManifestResponse> {
    let resp = transport.manifest(name, reference, kind).await?;

    let list = match ManifestList::parse(&resp.body, resp.content_type.as_deref()) {
        Some(list) => list,
        None => return Ok(resp),
    };
    let child = match select_platform(&list.manifests) {
        Some(child) => child,
        None => return Ok(resp),
    };

    tracing::debug!(
        os = child.platform.as_ref().map(|p| p.os.as_str()).unwrap_or_default(),
        arch = child.platform.as_ref().map(|p| p.architecture.as_str()).unwrap_or_default(),
        digest = %child.digest,
        "Selected manifest list entry"
    );

    *reference = child.digest.clone();
    let child_resp = transport.manifest(name, reference, kind).await?;
    Ok(ManifestResponse {
        digest: reference.clone(),
        ..child_resp
    })
}

/// Fills metadata from the image config blob; returns whether it did.
async fn apply_config_metadata(
    transport: &dyn RegistryTransport,
    name: &str,
    descriptor: &mut ImageDescriptor,
) -> bool {
    let config = match transport.blob(name, &descriptor.id).await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!(error = %e, "Image config blob unavailable");
            return false;
        }
    };
    match serde_json::from_slice::<ImageConfig>(&config) {
        Ok(config) => {
            descriptor.apply_metadata(config.metadata(), false);
            true
        }
        Err(e) => {
            tracing::debug!(error = %e, "Image config blob not parseable");
            false
        }
    }
}

fn merge_schema_v1(
    descriptor: &mut ImageDescriptor,
    v1: &ManifestV1,
    digest: &str,
    user_known: bool,
) {
    if descriptor.layers.is_empty() {
        descriptor.layers = v1.layers_base_first();
    }

    // no config in v1, so the top history entry stands in for the image id
    if descriptor.id.is_empty() {
        descriptor.id = v1
            .top_history_id()
            .or_else(|| v1.fs_layers.first().map(|l| l.blob_sum.clone()))
            .unwrap_or_default();
    }
    if descriptor.digest.is_empty() {
        descriptor.digest = digest.to_string();
    }

    descriptor.apply_metadata(v1.metadata(), user_known);
}
