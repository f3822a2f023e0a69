//! Scan requests and their dispatch.
//!
//! Every request the scanner can serve is one variant of [`ScanRequest`]; all
//! of them run through [`dispatch`], which turns failures into a
//! [`ScanResult`] carrying an error code instead of surfacing them.

use crate::constants::DEFAULT_LAYER_CONCURRENCY;
use crate::cvedb::{DatabaseLoader, Snapshot};
use crate::error::{Result, ScanError, ScanErrorCode};
use crate::oci::{
    check_reachable, fetch_layers, get_signature_data, resolve, ImageDescriptor, LayerSet,
    RegistryClient, RegistryTransport, SignatureData,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageScanRequest {
    pub registry: String,
    pub repository: String,
    pub tag: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Report which layer introduced each finding
    #[serde(default)]
    pub scan_layers: bool,
    /// Findings inherited from this image are left out of the result
    #[serde(default)]
    pub base_image: Option<String>,
    /// Also collect cosign signature payloads for the image
    #[serde(default)]
    pub with_signatures: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppPackage {
    pub app_name: String,
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanRequest {
    Image(ImageScanRequest),
    AppPackage {
        packages: Vec<AppPackage>,
    },
    RawData {
        /// Serialized package inventory, e.g. a dpkg status file
        data: String,
    },
    Function {
        function_id: String,
        #[serde(default)]
        region: String,
        /// Deployment package manifest
        data: String,
    },
}

impl ScanRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::AppPackage { .. } => "app_package",
            Self::RawData { .. } => "raw_data",
            Self::Function { .. } => "function",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub name: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub package_name: String,
    #[serde(default)]
    pub package_version: String,
    #[serde(default)]
    pub fixed_version: String,
    /// Digest of the layer that introduced the package
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub error: ScanErrorCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub db_version: String,
    pub db_create_time: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub image: Option<ImageDescriptor>,
    #[serde(default)]
    pub signature: Option<SignatureData>,
    pub vulnerabilities: Vec<Vulnerability>,
    #[serde(default)]
    pub scanned_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl ScanResult {
    fn failed(err: &ScanError) -> Self {
        Self {
            error: err.code(),
            error_message: err.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error == ScanErrorCode::None
    }
}

/// What a matcher is asked to inspect.
pub enum MatchInput<'a> {
    Image {
        descriptor: &'a ImageDescriptor,
        layers: &'a LayerSet,
    },
    Packages(&'a [AppPackage]),
    RawData(&'a str),
    Function {
        function_id: &'a str,
        data: &'a str,
    },
}

/// The vulnerability matching engine.
pub trait VulnerabilityMatcher: Send + Sync {
    fn find(&self, db: &Snapshot, input: MatchInput<'_>) -> Result<Vec<Vulnerability>>;
}

/// Matcher used when no engine is linked in: every input comes back clean.
#[derive(Debug, Default)]
pub struct NoFindings;

impl VulnerabilityMatcher for NoFindings {
    fn find(&self, db: &Snapshot, _input: MatchInput<'_>) -> Result<Vec<Vulnerability>> {
        tracing::debug!(db_version = %db.version, "No matching engine configured");
        Ok(Vec::new())
    }
}

/// Opens registry connections for image scans.
pub trait TransportFactory: Send + Sync {
    fn connect(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RegistryTransport>>;
}

#[derive(Debug, Default)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn connect(
        &self,
        registry: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RegistryTransport>> {
        let client = RegistryClient::new(registry)?.with_credentials(username, password);
        Ok(Arc::new(client))
    }
}

/// Everything a scan needs, built once at startup.
pub struct ScannerContext {
    pub loader: Arc<DatabaseLoader>,
    pub matcher: Arc<dyn VulnerabilityMatcher>,
    pub transports: Arc<dyn TransportFactory>,
    pub layer_concurrency: usize,
}

impl ScannerContext {
    pub fn new(loader: Arc<DatabaseLoader>) -> Self {
        Self {
            loader,
            matcher: Arc::new(NoFindings),
            transports: Arc::new(HttpTransportFactory),
            layer_concurrency: DEFAULT_LAYER_CONCURRENCY,
        }
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn VulnerabilityMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }
}

/// Runs one request. Scan failures are reported inside the result; the
/// returned error only covers writing `output`.
pub async fn dispatch(
    ctx: &ScannerContext,
    request: &ScanRequest,
    output: Option<&Path>,
) -> Result<ScanResult> {
    let start = Instant::now();
    tracing::info!(kind = request.kind(), "Scan request received");

    let mut result = match ctx.loader.current() {
        None => ScanResult::failed(&ScanError::Database {
            path: String::new(),
            reason: "no database loaded".to_string(),
        }),
        Some(db) => {
            let outcome = match request {
                ScanRequest::Image(req) => scan_image(ctx, &db, req).await,
                ScanRequest::AppPackage { packages } => {
                    find_all(ctx, &db, MatchInput::Packages(packages))
                }
                ScanRequest::RawData { data } => find_all(ctx, &db, MatchInput::RawData(data)),
                ScanRequest::Function {
                    function_id, data, ..
                } => find_all(
                    ctx,
                    &db,
                    MatchInput::Function {
                        function_id,
                        data,
                    },
                ),
            };
            let mut result = outcome.unwrap_or_else(|e| {
                tracing::error!(kind = request.kind(), error = %e, "Scan failed");
                ScanResult::failed(&e)
            });
            result.db_version = db.version.clone();
            result.db_create_time = db.create_time.clone();
            result
        }
    };
    result.scanned_at = Utc::now();
    result.elapsed_ms = start.elapsed().as_millis() as u64;

    if let Some(output) = output {
        fs::write(output, serde_json::to_vec_pretty(&result)?)?;
        tracing::debug!(output = %output.display(), "Scan result written");
    }

    Ok(result)
}

fn find_all(ctx: &ScannerContext, db: &Snapshot, input: MatchInput<'_>) -> Result<ScanResult> {
    Ok(ScanResult {
        vulnerabilities: ctx.matcher.find(db, input)?,
        ..Default::default()
    })
}

async fn scan_image(
    ctx: &ScannerContext,
    db: &Snapshot,
    req: &ImageScanRequest,
) -> Result<ScanResult> {
    if req.repository.is_empty() {
        return Err(ScanError::Input("image scan without repository".to_string()));
    }
    let transport = ctx
        .transports
        .connect(&req.registry, &req.username, &req.password)?;
    check_reachable(transport.as_ref()).await?;

    let mut descriptor = resolve(transport.as_ref(), &req.repository, &req.tag).await?;

    let mut result = ScanResult {
        registry: transport.endpoint().to_string(),
        repository: req.repository.clone(),
        tag: req.tag.clone(),
        ..Default::default()
    };

    if !descriptor.is_signature_image {
        let layers = fetch_layers(
            transport.as_ref(),
            &req.repository,
            &descriptor.layers,
            &descriptor.layer_sizes,
            ctx.layer_concurrency,
        )
        .await?;
        tracing::info!(
            image = %req.repository,
            layers = layers.len(),
            bytes = layers.total_bytes(),
            "Image content retrieved"
        );

        let mut found = ctx.matcher.find(
            db,
            MatchInput::Image {
                descriptor: &descriptor,
                layers: &layers,
            },
        )?;

        if let Some(ref base) = req.base_image {
            let base_layers = base_image_layers(transport.as_ref(), base).await;
            found.retain(|v| v.layer.as_ref().map_or(true, |l| !base_layers.contains(l)));
        }
        if !req.scan_layers {
            found.iter_mut().for_each(|v| v.layer = None);
        }
        result.vulnerabilities = found;

        if req.with_signatures {
            match get_signature_data(transport.as_ref(), &req.repository, &descriptor.digest).await
            {
                Ok(sig) => result.signature = Some(sig),
                Err(e) => tracing::debug!(error = %e, "No signature data for image"),
            }
        }
    }

    // the raw manifest is only needed while resolving
    descriptor.raw_manifest.clear();
    result.image = Some(descriptor);
    Ok(result)
}

/// Layers of the base image; lookup failures leave the result unfiltered.
async fn base_image_layers(transport: &dyn RegistryTransport, base: &str) -> HashSet<String> {
    let (repository, tag) = match base.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (base, "latest"),
    };
    match resolve(transport, repository, tag).await {
        Ok(descriptor) => descriptor.layers.into_iter().collect(),
        Err(e) => {
            tracing::warn!(base_image = %base, error = %e, "Base image lookup failed");
            HashSet::new()
        }
    }
}

/// Short summary for on-demand runs, keyed by severity.
pub fn severity_counts(result: &ScanResult) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for v in &result.vulnerabilities {
        let severity = if v.severity.is_empty() {
            "Unknown".to_string()
        } else {
            v.severity.clone()
        };
        *counts.entry(severity).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct CountingMatcher;

    impl VulnerabilityMatcher for CountingMatcher {
        fn find(&self, _db: &Snapshot, input: MatchInput<'_>) -> Result<Vec<Vulnerability>> {
            match input {
                MatchInput::Packages(packages) => Ok(packages
                    .iter()
                    .map(|p| Vulnerability {
                        name: format!("CVE-{}", p.module_name),
                        severity: "High".to_string(),
                        package_name: p.module_name.clone(),
                        package_version: p.version.clone(),
                        ..Default::default()
                    })
                    .collect()),
                MatchInput::RawData(_) => Err(ScanError::Input("unsupported data".to_string())),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn context_with_db(dir: &TempDir) -> ScannerContext {
        let snapshot = Snapshot {
            version: "1.5".to_string(),
            create_time: "2024-01-01".to_string(),
            ..Default::default()
        };
        fs::write(
            dir.path().join(crate::constants::CVE_DB_FILE_NAME),
            serde_json::to_vec(&snapshot).unwrap(),
        )
        .unwrap();
        let loader = Arc::new(DatabaseLoader::default());
        loader.reload(dir.path()).unwrap();
        ScannerContext::new(loader).with_matcher(Arc::new(CountingMatcher))
    }

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"kind":"app_package","packages":[{"app_name":"jar","module_name":"log4j","version":"2.14"}]}"#;
        let req: ScanRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.kind(), "app_package");

        let json = r#"{"kind":"image","registry":"quay.io","repository":"org/app","tag":"v1"}"#;
        match serde_json::from_str::<ScanRequest>(json).unwrap() {
            ScanRequest::Image(img) => {
                assert_eq!(img.repository, "org/app");
                assert!(!img.scan_layers);
                assert!(img.base_image.is_none());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_without_database() {
        let ctx = ScannerContext::new(Arc::new(DatabaseLoader::default()));
        let req = ScanRequest::RawData {
            data: String::new(),
        };
        let result = dispatch(&ctx, &req, None).await.unwrap();
        assert_eq!(result.error, ScanErrorCode::DatabaseUnavailable);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_dispatch_packages_writes_result() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with_db(&dir);
        let req = ScanRequest::AppPackage {
            packages: vec![AppPackage {
                app_name: "jar".to_string(),
                module_name: "log4j".to_string(),
                version: "2.14".to_string(),
                file_name: String::new(),
            }],
        };
        let output = dir.path().join("result.json");

        let result = dispatch(&ctx, &req, Some(&output)).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.db_version, "1.5");
        assert_eq!(result.vulnerabilities[0].name, "CVE-log4j");
        assert_eq!(severity_counts(&result).get("High"), Some(&1));

        let written: ScanResult = serde_json::from_slice(&fs::read(&output).unwrap()).unwrap();
        assert_eq!(written.vulnerabilities, result.vulnerabilities);
    }

    #[tokio::test]
    async fn test_matcher_error_becomes_error_code() {
        let dir = TempDir::new().unwrap();
        let ctx = context_with_db(&dir);
        let req = ScanRequest::RawData {
            data: "x".to_string(),
        };
        let result = dispatch(&ctx, &req, None).await.unwrap();
        assert_eq!(result.error, ScanErrorCode::Internal);
        assert!(result.error_message.contains("unsupported data"));
        assert_eq!(result.db_version, "1.5");
    }
}
