//! # amp-settings
//!
//! Configuration for the amp realtime client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **Settings file**: `$AMP_SETTINGS` or `~/.amp/client.json`, deep-merged
//!    over the defaults
//! 3. **Environment variables**: `AMP_*` overrides
//!
//! There is no process-wide settings instance; each client is built from the
//! [`ClientSettings`] value handed to it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
