//! kwatch core library: object identity, change notifications, the
//! `Resource` accessor capability, and startup configuration.
//!
//! Public API surface:
//! - [`types`]: keys, kind tags, change kinds and notifications
//! - [`resource`]: [`Resource`] capability and [`GenericObject`]
//! - [`config`]: [`EngineConfig`] load / validate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod resource;
pub mod types;

pub use config::{BackoffConfig, EngineConfig, RelistConfig};
pub use error::ConfigError;
pub use resource::{GenericObject, Resource};
pub use types::{ChangeKind, ChangeNotification, KindTag, ObjectKey, ParseKeyError};
