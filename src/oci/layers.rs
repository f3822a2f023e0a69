use crate::error::{Result, ScanError};
use crate::oci::manifest::ManifestV2;
use crate::oci::registry::{ManifestRequestKind, RegistryTransport};
use crate::oci::resolver::signature_tag_for_digest;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One downloaded layer blob.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub digest: String,
    /// Size declared by the manifest, when known
    pub declared_size: Option<i64>,
    pub data: Bytes,
}

/// All layers of one image, base layer first.
#[derive(Debug, Clone, Default)]
pub struct LayerSet {
    layers: Vec<LayerBlob>,
}

impl LayerSet {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<&Bytes> {
        self.layers
            .iter()
            .find(|l| l.digest == digest)
            .map(|l| &l.data)
    }

    pub fn digests(&self) -> impl Iterator<Item = &str> {
        self.layers.iter().map(|l| l.digest.as_str())
    }

    pub fn total_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.data.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerBlob> {
        self.layers.iter()
    }

    pub fn into_inner(self) -> Vec<LayerBlob> {
        self.layers
    }
}

/// Downloads every layer in `digests` with at most `concurrency` requests in
/// flight. The first failure to complete aborts the whole set; fetches still
/// in flight are dropped at that point.
pub async fn fetch_layers(
    transport: &dyn RegistryTransport,
    name: &str,
    digests: &[String],
    sizes: &HashMap<String, i64>,
    concurrency: usize,
) -> Result<LayerSet> {
    let mut fetched = stream::iter(digests.iter().cloned().enumerate())
        .map(|(index, digest): (usize, String)| async move {
            let data = transport.blob(name, &digest).await.map_err(|e| {
                tracing::error!(layer = %digest, error = %e, "Layer fetch failed");
                match e {
                    ScanError::Transport { .. } | ScanError::Protocol { .. } => e,
                    other => ScanError::protocol(format!("{}@{}", name, digest), other),
                }
            })?;
            crate::log_layer_fetch!(digest, data.len());
            let declared_size = sizes.get(&digest).copied();
            Ok::<_, ScanError>((
                index,
                LayerBlob {
                    digest,
                    declared_size,
                    data,
                },
            ))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect::<Vec<_>>()
        .await?;

    // completion order -> manifest order
    fetched.sort_unstable_by_key(|(index, _)| *index);
    let layers: Vec<LayerBlob> = fetched.into_iter().map(|(_, blob)| blob).collect();

    tracing::debug!(image = %name, layers = layers.len(), "All layers fetched");
    Ok(LayerSet { layers })
}

/// Cosign signature artifacts attached to an image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureData {
    /// Signature manifest as served by the registry
    pub manifest: String,
    /// Layer digest -> signed payload text
    pub payloads: HashMap<String, String>,
}

/// Looks up the signature artifact of `digest` under its derived `.sig` tag
/// and downloads every payload it carries.
pub async fn get_signature_data(
    transport: &dyn RegistryTransport,
    name: &str,
    digest: &str,
) -> Result<SignatureData> {
    let tag = signature_tag_for_digest(digest);
    let resp = transport
        .manifest(name, &tag, ManifestRequestKind::CosignSignature)
        .await?;

    let manifest: ManifestV2 =
        serde_json::from_slice(&resp.body).map_err(|e| ScanError::protocol(&tag, e))?;
    let manifest_text = String::from_utf8_lossy(&resp.body).into_owned();

    let mut payloads = HashMap::with_capacity(manifest.layers.len());
    for layer in &manifest.layers {
        let blob = transport.blob(name, &layer.digest).await?;
        payloads.insert(
            layer.digest.clone(),
            String::from_utf8_lossy(&blob).into_owned(),
        );
    }

    tracing::debug!(image = %name, tag = %tag, payloads = payloads.len(), "Signature data retrieved");
    Ok(SignatureData {
        manifest: manifest_text,
        payloads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::registry::ManifestResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct BlobStore {
        blobs: HashMap<String, Bytes>,
        fail: Option<String>,
        delays: HashMap<String, Duration>,
        requested: Mutex<Vec<String>>,
        completed: Mutex<Vec<String>>,
        manifests: HashMap<String, Bytes>,
    }

    impl BlobStore {
        fn new(digests: &[&str]) -> Self {
            Self {
                blobs: digests
                    .iter()
                    .map(|d| (d.to_string(), Bytes::from(format!("data-{}", d))))
                    .collect(),
                fail: None,
                // later layers finish first so ordering is really exercised
                delays: HashMap::from([("sha256:L0".to_string(), Duration::from_millis(20))]),
                requested: Mutex::new(Vec::new()),
                completed: Mutex::new(Vec::new()),
                manifests: HashMap::new(),
            }
        }
    }

    #[async_trait]
    impl RegistryTransport for BlobStore {
        fn endpoint(&self) -> &str {
            "https://registry.test"
        }

        async fn manifest(
            &self,
            name: &str,
            reference: &str,
            _kind: ManifestRequestKind,
        ) -> Result<ManifestResponse> {
            let body = self
                .manifests
                .get(reference)
                .cloned()
                .ok_or_else(|| ScanError::protocol(format!("{}:{}", name, reference), "404"))?;
            Ok(ManifestResponse {
                digest: "sha256:sigmanifest".to_string(),
                content_type: None,
                body,
            })
        }

        async fn blob(&self, _name: &str, digest: &str) -> Result<Bytes> {
            self.requested.lock().push(digest.to_string());
            if let Some(delay) = self.delays.get(digest) {
                tokio::time::sleep(*delay).await;
            }
            if self.fail.as_deref() == Some(digest) {
                return Err(ScanError::transport("https://registry.test", "connection reset"));
            }
            let blob = self
                .blobs
                .get(digest)
                .cloned()
                .ok_or_else(|| ScanError::protocol(digest, "blob unknown"))?;
            self.completed.lock().push(digest.to_string());
            Ok(blob)
        }

        async fn ping(&self) -> Result<u16> {
            Ok(200)
        }
    }

    fn digests() -> Vec<String> {
        vec!["sha256:L0".into(), "sha256:L1".into(), "sha256:L2".into()]
    }

    #[tokio::test]
    async fn test_fetch_preserves_base_first_order() {
        let store = BlobStore::new(&["sha256:L0", "sha256:L1", "sha256:L2"]);
        let sizes = HashMap::from([("sha256:L1".to_string(), 7)]);

        let set = fetch_layers(&store, "library/alpine", &digests(), &sizes, 4)
            .await
            .unwrap();

        let order: Vec<&str> = set.digests().collect();
        assert_eq!(order, vec!["sha256:L0", "sha256:L1", "sha256:L2"]);
        assert_eq!(set.get("sha256:L2").unwrap().as_ref(), b"data-sha256:L2");
        assert_eq!(set.iter().nth(1).unwrap().declared_size, Some(7));
        assert_eq!(set.iter().next().unwrap().declared_size, None);
    }

    #[tokio::test]
    async fn test_single_layer_failure_aborts_the_set() {
        let mut store = BlobStore::new(&["sha256:L0", "sha256:L1", "sha256:L2"]);
        store.fail = Some("sha256:L1".to_string());

        let result = fetch_layers(&store, "library/alpine", &digests(), &HashMap::new(), 4).await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), crate::error::ScanErrorCode::RegistryApi);
    }

    #[tokio::test]
    async fn test_failure_cancels_slower_layers_in_flight() {
        let mut store = BlobStore::new(&["sha256:L0", "sha256:L1", "sha256:L2"]);
        store.fail = Some("sha256:L1".to_string());
        store.delays = HashMap::from([
            ("sha256:L0".to_string(), Duration::from_millis(1500)),
            ("sha256:L2".to_string(), Duration::from_millis(300)),
        ]);

        let started = std::time::Instant::now();
        let result = fetch_layers(&store, "org/app", &digests(), &HashMap::new(), 4).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        assert!(elapsed < Duration::from_millis(250), "abort took {:?}", elapsed);

        // the dropped fetches never get to finish
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(store.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_runs_inside_spawned_task() {
        let store = std::sync::Arc::new(BlobStore::new(&["sha256:L0", "sha256:L1", "sha256:L2"]));
        let handle = tokio::spawn(async move {
            let digests = digests();
            let sizes = HashMap::new();
            fetch_layers(store.as_ref(), "org/app", &digests, &sizes, 2)
                .await
                .map(|set| set.len())
        });
        assert_eq!(handle.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sequential_fetch_stops_at_first_failure() {
        let mut store = BlobStore::new(&["sha256:L0", "sha256:L1", "sha256:L2"]);
        store.fail = Some("sha256:L1".to_string());

        assert!(fetch_layers(&store, "repo", &digests(), &HashMap::new(), 1)
            .await
            .is_err());
        assert!(!store.requested.lock().contains(&"sha256:L2".to_string()));
    }

    #[tokio::test]
    async fn test_get_signature_data_collects_payloads() {
        let mut store = BlobStore::new(&["sha256:p1"]);
        let tag = signature_tag_for_digest("sha256:abc");
        store.manifests.insert(
            tag,
            Bytes::from_static(
                br#"{"schemaVersion":2,"config":{"digest":"sha256:c"},"layers":[{"mediaType":"application/vnd.dev.cosign.simplesigning.v1+json","digest":"sha256:p1","size":9}]}"#,
            ),
        );

        let data = get_signature_data(&store, "org/app", "sha256:abc").await.unwrap();
        assert!(data.manifest.contains("simplesigning"));
        assert_eq!(
            data.payloads.get("sha256:p1").map(String::as_str),
            Some("data-sha256:p1")
        );
    }

    #[tokio::test]
    async fn test_get_signature_data_missing_tag() {
        let store = BlobStore::new(&[]);
        assert!(get_signature_data(&store, "org/app", "sha256:none").await.is_err());
    }
}
