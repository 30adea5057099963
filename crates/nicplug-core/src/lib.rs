// nicplug-core: Pure types, naming, config, errors
// No internal nicplug dependencies: this is the foundation crate.

pub mod audit;
pub mod config;
pub mod error;
pub mod iface;
pub mod instance;
pub mod lifecycle;
pub mod naming;
pub mod network;
pub mod request;
pub mod retry;
pub mod status;
pub mod template;
pub mod time;

pub use error::{HotplugError, Result};
