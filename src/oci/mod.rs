//! Registry access: manifest negotiation, image resolution and layer retrieval.

pub mod layers;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod utils;

pub use layers::{fetch_layers, get_signature_data, LayerBlob, LayerSet, SignatureData};
pub use reference::ImageReference;
pub use registry::{
    check_reachable, ManifestRequestKind, ManifestResponse, RegistryClient, RegistryTransport,
};
pub use resolver::{
    is_signature_tag, resolve, select_platform, signature_tag_for_digest, ImageDescriptor,
};
