//! The push DAG: deferred steps joined through declared predecessors.
//!
//! ```text
//! AuthenticatePush ─┬──► PushBaseLayers ──┐
//!                   ├──► PushAppLayers  ──┤
//!                   └──► PushConfigBlob ──┼──► PushManifest (per tag)
//!                                         │
//!                          BuildImage ────┘
//! ```

mod authenticate;
mod build_image;
mod push_blob;
mod push_config;
mod push_layers;
mod push_manifest;
mod runtime;

pub use runtime::{all_of, Step, StepPool};

pub(crate) use authenticate::authenticate_push;
pub(crate) use build_image::build_image;
pub(crate) use push_blob::PushTaskSet;
pub(crate) use push_config::push_config;
pub(crate) use push_layers::push_layers;
pub(crate) use push_manifest::push_manifest;
