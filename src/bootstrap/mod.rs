//! Module bootstrapping.
//!
//! Modules are declared in a [`ModuleRegistry`] (dependencies, loader sources
//! and which modules each context needs). The [`Bootstrapper`] loads requested
//! modules depth-first through their dependencies, loading each at most once
//! even under concurrent requests, then runs one initialization pass in the
//! order modules finished loading. Other code waits on
//! [`Bootstrapper::wait_for_module`] instead of depending on a module directly.

mod bootstrapper;
mod error;
mod loader;
mod registry;

pub use bootstrapper::{BootstrapReport, Bootstrapper, LoadingStatus, ModuleState};
pub use error::{BootstrapError, LoadError};
pub use loader::ModuleLoader;
pub use registry::{ContextRule, ModuleRegistry, BUS, GATEWAY, SYNC};
