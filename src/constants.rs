// Centralized constants for the scanner to avoid magic numbers

/// Wait between failed controller register attempts
pub const REGISTER_RETRY_INTERVAL_SECS: u64 = 10;

/// Wait between failed database load attempts
pub const DB_RETRY_INTERVAL_SECS: u64 = 4;

/// Database load attempts for on-demand and export modes
pub const ON_DEMAND_DB_ATTEMPTS: u32 = 3;

/// Delay before the first registration so the scanner address propagates
pub const STARTUP_DELAY_SECS: u64 = 15;

/// Timeout for a single registry or controller HTTP request
pub const HTTP_TIMEOUT_SECS: u64 = 60;

/// Upper bound on concurrent layer downloads for one image
pub const DEFAULT_LAYER_CONCURRENCY: usize = 4;

/// File name of the vulnerability database inside the database directory
pub const CVE_DB_FILE_NAME: &str = "cvedb";

/// Default database directory
pub const DEFAULT_DB_DIR: &str = "./dbgen/";

/// Default port the scanner's inbound listener advertises
pub const DEFAULT_SCANNER_PORT: u16 = 18402;

/// Default controller registration port
pub const DEFAULT_CONTROLLER_PORT: u16 = 18400;

/// Default controller REST port used for on-demand result submission
pub const DEFAULT_CONTROLLER_REST_PORT: u16 = 10443;

pub const DOCKERHUB_REGISTRY_URL: &str = "https://registry.hub.docker.com";

/// Host names that all refer to Docker Hub
pub const DOCKERHUB_HOSTS: [&str; 4] = [
    "registry.hub.docker.com",
    "index.docker.io",
    "registry-1.docker.io",
    "docker.io",
];

/// The only registry where signature tags are probed with a dedicated request
pub const QUAY_REGISTRY_URL: &str = "https://quay.io";

pub const COSIGN_SIGNATURE_TAG_SUFFIX: &str = ".sig";

pub const MEDIA_TYPE_COSIGN: &str = "application/vnd.dev.cosign.simplesigning.v1+json";

pub const MEDIA_TYPE_DOCKER_MANIFEST_V2: &str =
    "application/vnd.docker.distribution.manifest.v2+json";

pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

pub const MEDIA_TYPE_DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

pub const MEDIA_TYPE_DOCKER_MANIFEST_V1: &str =
    "application/vnd.docker.distribution.manifest.v1+json";

/// Response header carrying the canonical manifest digest
pub const DOCKER_CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";
