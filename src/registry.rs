//! Open Container / "Docker" registry client
//!
//! ## Specs
//!
//! * Registry: https://github.com/opencontainers/distribution-spec/blob/v1.0.1/spec.md
//! * Token auth: https://distribution.github.io/distribution/spec/auth/token/

mod auth;
mod client;
mod www_authenticate;

pub use auth::Authorization;
pub use client::RegistryClient;

pub(crate) use auth::authenticate;
pub(crate) use client::MountOutcome;
