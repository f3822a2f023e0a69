//! Image reference parsing for the on-demand CLI.
//!
//! Accepts either the combined `registry/repository:tag` form or separate
//! registry / repository / tag values, and applies Docker Hub defaults.

use crate::constants::{DOCKERHUB_HOSTS, DOCKERHUB_REGISTRY_URL};
use crate::error::{Result, ScanError};
use crate::oci::registry::normalize_endpoint;

const DEFAULT_TAG: &str = "latest";

/// A registry image reference resolved to something the resolver can fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry base URL, e.g. `https://registry.hub.docker.com`
    pub registry: String,
    /// Repository path, e.g. `library/nginx`
    pub repository: String,
    /// Tag or `alg:hex` digest
    pub reference: String,
}

impl ImageReference {
    /// Parses `nginx`, `nginx:1.25`, `quay.io/org/app:v1` or
    /// `ghcr.io/org/app@sha256:...`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ScanError::Input("empty image reference".to_string()));
        }

        let (name_tag, digest) = match input.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(ScanError::Input(format!(
                        "invalid digest in reference '{}': expected algorithm:hex",
                        input
                    )));
                }
                (name, Some(digest))
            }
            None => (input, None),
        };

        // a colon only separates a tag when it follows the last slash
        let last_segment_start = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                (&name_tag[..colon], Some(&name_tag[colon + 1..]))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first, rest)
            }
            _ => ("", name),
        };

        let reference = digest
            .or(tag)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_TAG);
        Self::from_parts(registry, repository, reference)
    }

    /// Builds a reference from separate CLI values.
    pub fn from_parts(registry: &str, repository: &str, reference: &str) -> Result<Self> {
        let repository = repository.trim().trim_matches('/');
        if repository.is_empty() {
            return Err(ScanError::Input("repository is required".to_string()));
        }
        let reference = match reference.trim() {
            "" => DEFAULT_TAG,
            r => r,
        };

        let registry = match registry.trim() {
            "" => DOCKERHUB_REGISTRY_URL.to_string(),
            r => normalize_endpoint(r),
        };

        let repository = if is_docker_hub(&registry) && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        };

        Ok(Self {
            registry,
            repository,
            reference: reference.to_string(),
        })
    }

    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

pub fn is_docker_hub(registry: &str) -> bool {
    let host = registry
        .split_once("://")
        .map_or(registry, |(_, rest)| rest)
        .trim_end_matches('/');
    DOCKERHUB_HOSTS.iter().any(|h| host.eq_ignore_ascii_case(h))
}
