// nicplug-cli: Clap commands, UI, logging
// Depends on nicplug-core, nicplug-controller

pub mod commands;
pub mod display;
pub mod logging;
pub mod output;
pub mod ui;

pub use commands::run;
