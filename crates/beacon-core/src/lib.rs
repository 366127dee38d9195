//! `beacon-core`: shared data model and collaborator contracts for the
//! widget execution platform.
//!
//! The scheduler and coordinator only talk to the outside world through the
//! traits defined here: [`InstanceStore`], [`DefinitionSource`],
//! [`SecretCodec`] and [`NotificationPublisher`].

pub mod backend_config;
pub mod codec;
pub mod config;
pub mod error;
pub mod publish;
pub mod store;
pub mod types;

pub use backend_config::BackendConfig;
pub use codec::{decrypt_secret_params, encrypt_secret_params, SecretCodec};
pub use config::BeaconConfig;
pub use error::{BeaconError, Result};
pub use publish::NotificationPublisher;
pub use store::{DefinitionSource, ExecutionOutcome, InstanceStore};
pub use types::*;
