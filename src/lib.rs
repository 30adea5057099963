//! # nicplug: network interface hotplug for virtual machines
//!
//! Facade crate that re-exports the nicplug workspace crates so consumers
//! can depend on a single `nicplug` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | nicplug-core | Interface model, status merging, lifecycle, naming, config, errors |
//! | [`controller`] | nicplug-controller | Patch planning, delivery strategies, observer, simulated cluster |
//! | [`cli`] | nicplug-cli | `nicplugctl` commands, logging, tables |

pub use nicplug_cli as cli;
pub use nicplug_controller as controller;
pub use nicplug_core as core;

pub use nicplug_controller::HotplugController;
pub use nicplug_core::{HotplugError, Result};
