//! Xenray: configures, launches and supervises a local xray-compatible
//! proxy backend. The library owns profile persistence, wire-config
//! assembly, process lifecycle and the auto-reconnect flow; the `xenray`
//! binary exposes them on the command line.

pub mod config;
pub mod error;
pub mod link;
pub mod model;
pub mod process;
pub mod reconnect;
pub mod store;
pub mod validate;

pub use error::{Error, Result};
pub use model::{
    Chain, ConnectionMode, CurrentConnection, FailReason, Profile, ProfileConfig,
    ReconnectEvent, RoutingRules, RoutingToggles, ServerConfig, Subscription, TestOutcome,
};
pub use process::{BackendStatus, XrayManager};
pub use reconnect::AutoReconnectService;
pub use store::ConfigStore;
