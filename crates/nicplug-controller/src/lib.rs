// nicplug-controller: Diff engine, delivery strategies, convergence observer
// Depends on nicplug-core (types). Talks to the cluster only through `backend`.

pub mod backend;
pub mod controller;
pub mod observer;
pub mod patch;
pub mod sim;
pub mod strategy;

pub use controller::HotplugController;
