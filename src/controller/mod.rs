//! Controller session: registration protocol, inbound listener and the
//! coordinator that keeps the scanner joined.

use crate::constants::HTTP_TIMEOUT_SECS;
use crate::cvedb::{Snapshot, VulnerabilityRecord};
use crate::error::{Result, ScanError};
use crate::scan::ScanResult;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod coordinator;
pub mod listener;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorState, Event};
pub use listener::{Listener, SessionNotice};

/// Payload of one register call, built fresh for every attempt. The database
/// travels as a shared snapshot and is only expanded while the request body
/// is serialized.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationRecord {
    pub scanner_id: String,
    pub advertise_address: String,
    pub advertise_port: u16,
    pub database_version: String,
    pub database_create_time: String,
    #[serde(serialize_with = "serialize_database")]
    database: Option<Arc<Snapshot>>,
}

impl RegistrationRecord {
    pub fn new(scanner_id: &str, address: &str, port: u16, db: &Arc<Snapshot>) -> Self {
        Self {
            scanner_id: scanner_id.to_string(),
            advertise_address: address.to_string(),
            advertise_port: port,
            database_version: db.version.clone(),
            database_create_time: db.create_time.clone(),
            database: Some(db.clone()),
        }
    }

    /// Number of vulnerability entries the record still carries.
    pub fn database_len(&self) -> usize {
        self.database.as_ref().map_or(0, |db| db.len())
    }

    /// Drops the database payload once the controller holds its own copy.
    pub fn release_database(&mut self) {
        self.database = None;
    }
}

fn serialize_database<S: Serializer>(
    db: &Option<Arc<Snapshot>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match db {
        Some(db) => db.vulnerabilities.serialize(serializer),
        None => HashMap::<String, VulnerabilityRecord>::new().serialize(serializer),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeregisterRequest {
    pub id: String,
}

#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn register(&self, record: &RegistrationRecord) -> Result<()>;
    async fn deregister(&self, scanner_id: &str) -> Result<()>;
}

/// Controller client speaking HTTP/JSON.
pub struct HttpControllerClient {
    pub endpoint: String,
    client: Client,
    credentials: Option<(String, String)>,
}

impl HttpControllerClient {
    pub fn new(address: &str, port: u16) -> Result<Self> {
        let endpoint = if address.contains("://") {
            format!("{}:{}", address.trim_end_matches('/'), port)
        } else {
            format!("https://{}:{}", address, port)
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ScanError::transport(&endpoint, e))?;
        Ok(Self {
            endpoint,
            client,
            credentials: None,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.endpoint, path);
        let mut rb = self.client.post(&url).json(body);
        if let Some((ref user, ref pass)) = self.credentials {
            rb = rb.basic_auth(user, Some(pass));
        }

        let response = rb
            .send()
            .await
            .map_err(|e| ScanError::transport(&self.endpoint, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let err_text = response.text().await.unwrap_or_default();
            return Err(ScanError::transport(
                &self.endpoint,
                format!("{} returned {} - {}", path, status, err_text),
            ));
        }
        Ok(())
    }

    /// Submits an on-demand scan result.
    pub async fn submit_result(&self, result: &ScanResult) -> Result<()> {
        if self.credentials.is_none() {
            return Err(ScanError::Input(
                "controller credentials are required to submit results".to_string(),
            ));
        }
        self.post("/v1/scan/result", result).await
    }
}

#[async_trait]
impl ControllerClient for HttpControllerClient {
    async fn register(&self, record: &RegistrationRecord) -> Result<()> {
        self.post("/v1/scanner/register", record).await
    }

    async fn deregister(&self, scanner_id: &str) -> Result<()> {
        self.post(
            "/v1/scanner/deregister",
            &DeregisterRequest {
                id: scanner_id.to_string(),
            },
        )
        .await
    }
}
