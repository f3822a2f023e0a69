use crate::constants::{
    DEFAULT_CONTROLLER_PORT, DEFAULT_CONTROLLER_REST_PORT, DEFAULT_DB_DIR, DEFAULT_SCANNER_PORT,
};
use crate::error::{Result, ScanError};
use crate::oci::ImageReference;
use crate::scan::ImageScanRequest;
use clap::Parser;
use std::path::PathBuf;

/// Registry image scanner
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "regscan")]
#[command(about = "Resolve and scan registry images, or serve scans for a controller")]
pub struct Args {
    /// Vulnerability database directory
    #[arg(short = 'd', long = "db-dir", env = "REGSCAN_DB_DIR", default_value = DEFAULT_DB_DIR)]
    pub db_dir: PathBuf,

    /// Controller join address
    #[arg(short = 'j', long = "join", env = "REGSCAN_JOIN")]
    pub join: Option<String>,

    /// Controller join port
    #[arg(long = "join-port", env = "REGSCAN_JOIN_PORT")]
    pub join_port: Option<u16>,

    /// Advertise address
    #[arg(short = 'a', long = "adv", env = "REGSCAN_ADV")]
    pub adv: Option<String>,

    /// Advertise port
    #[arg(long = "adv-port", env = "REGSCAN_ADV_PORT")]
    pub adv_port: Option<u16>,

    /// Scanner license; runs a single on-demand scan
    #[arg(long, env = "REGSCAN_LICENSE")]
    pub license: Option<String>,

    /// Image to scan as `registry/repository:tag`; overrides the separate fields
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long)]
    pub registry: Option<String>,

    #[arg(long)]
    pub repository: Option<String>,

    #[arg(long, default_value = "latest")]
    pub tag: String,

    #[arg(long = "registry-username", env = "REGSCAN_REGISTRY_USERNAME")]
    pub registry_username: Option<String>,

    #[arg(long = "registry-password", env = "REGSCAN_REGISTRY_PASSWORD")]
    pub registry_password: Option<String>,

    /// Report findings per layer
    #[arg(long = "scan-layers")]
    pub scan_layers: bool,

    /// Leave out findings inherited from this base image
    #[arg(long = "base-image")]
    pub base_image: Option<String>,

    /// Controller REST API username
    #[arg(long = "ctrl-username", env = "REGSCAN_CTRL_USERNAME")]
    pub ctrl_username: Option<String>,

    /// Controller REST API password
    #[arg(long = "ctrl-password", env = "REGSCAN_CTRL_PASSWORD")]
    pub ctrl_password: Option<String>,

    /// Skip the startup delay before joining
    #[arg(long = "no-wait")]
    pub no_wait: bool,

    /// More debug output
    #[arg(short = 'x', long)]
    pub verbose: bool,

    /// Export the database as JSON to this file and exit
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Print the database version and exit
    #[arg(short = 'v', long = "db-version")]
    pub db_version: bool,

    /// Emit logs as JSON
    #[arg(long = "json-logs", env = "REGSCAN_JSON_LOGS")]
    pub json_logs: bool,
}

/// Where on-demand results are submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub join: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnDemandConfig {
    pub request: ImageScanRequest,
    pub submit: Option<Submission>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub join: String,
    pub join_port: u16,
    /// Empty when it has to be derived from the route to the controller
    pub advertise_address: String,
    pub advertise_port: u16,
    pub startup_delay: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    DbVersion,
    Export(PathBuf),
    OnDemand(OnDemandConfig),
    Daemon(DaemonConfig),
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl Args {
    /// Picks the run mode and checks the inputs it needs.
    pub fn mode(&self) -> Result<Mode> {
        if self.db_version {
            return Ok(Mode::DbVersion);
        }
        if let Some(ref output) = self.output {
            return Ok(Mode::Export(output.clone()));
        }
        if non_empty(&self.license).is_some() {
            return self.on_demand().map(Mode::OnDemand);
        }

        let join = non_empty(&self.join).ok_or_else(|| {
            ScanError::Input("a controller join address (-j) or a license is required".to_string())
        })?;
        Ok(Mode::Daemon(DaemonConfig {
            join: join.to_string(),
            join_port: self.join_port.unwrap_or(DEFAULT_CONTROLLER_PORT),
            advertise_address: non_empty(&self.adv).unwrap_or_default().to_string(),
            advertise_port: self.adv_port.unwrap_or(DEFAULT_SCANNER_PORT),
            startup_delay: !self.no_wait,
        }))
    }

    fn on_demand(&self) -> Result<OnDemandConfig> {
        let (reference, scan_layers) = match non_empty(&self.image) {
            Some(image) => (ImageReference::parse(image)?, true),
            None => {
                let repository = non_empty(&self.repository).ok_or_else(|| {
                    ScanError::Input(
                        "missing the repository name and tag of the image to be scanned"
                            .to_string(),
                    )
                })?;
                if self.tag.trim().is_empty() {
                    return Err(ScanError::Input("image tag must not be empty".to_string()));
                }
                let reference = ImageReference::from_parts(
                    non_empty(&self.registry).unwrap_or_default(),
                    repository,
                    &self.tag,
                )?;
                (reference, self.scan_layers)
            }
        };

        let request = ImageScanRequest {
            registry: reference.registry,
            repository: reference.repository,
            tag: reference.reference,
            username: self.registry_username.clone().unwrap_or_default(),
            password: self.registry_password.clone().unwrap_or_default(),
            scan_layers,
            base_image: non_empty(&self.base_image).map(str::to_string),
            with_signatures: false,
        };

        let submit = match (
            non_empty(&self.join),
            non_empty(&self.ctrl_username),
            non_empty(&self.ctrl_password),
        ) {
            (Some(join), Some(user), Some(pass)) => Some(Submission {
                join: join.to_string(),
                port: self.join_port.unwrap_or(DEFAULT_CONTROLLER_REST_PORT),
                username: user.to_string(),
                password: pass.to_string(),
            }),
            _ => None,
        };

        Ok(OnDemandConfig { request, submit })
    }
}
