//! # mightypie-settings
//!
//! Layered configuration for the MightyPie bus client.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`BusSettings::default()`]
//! 2. **User file**: `~/.mightypie/bus.json` (deep-merged over defaults)
//! 3. **Environment variables**: `NATS_*` / `MIGHTYPIE_*` overrides (highest priority)
//!
//! The server address and auth token have no compiled default. They normally
//! arrive through `NATS_SERVER_URL` / `NATS_AUTH_TOKEN`, which the desktop
//! launcher exports before starting the UI process.
//!
//! # Usage
//!
//! ```no_run
//! use mightypie_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("stream: {}", settings.stream.name);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_with, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
