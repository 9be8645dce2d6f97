//! hearthvault: a peer-to-peer family vault engine.
//!
//! Devices on one LAN jointly maintain a searchable index of each member's
//! watched folders, exchange metadata and file bytes on demand, and flag
//! duplicates and missing backups. Shells (mobile/desktop UI) link this
//! library, drive the [`state::Engine`] capability surface and subscribe to
//! its event stream.

pub mod config;
pub mod errors;
pub mod logging;
mod macros;
pub mod models;
pub mod protocol;
pub mod server;
pub mod services;
pub mod state;
pub mod store;
pub mod utils;

pub use errors::{ErrorKind, Result};
pub use state::{Engine, ThisDeviceInfo};
