pub mod config;
pub mod constants;
pub mod controller;
pub mod cvedb;
pub mod error;
pub mod host;
pub mod logging;
pub mod oci;
pub mod scan;
