//! Client-side resiliency layer: a request gateway with retries, caching and an
//! offline queue; versioned stores kept in sync across execution contexts and
//! with a remote authority; a dependency-ordered module bootstrapper; and the
//! event bus that lets modules coordinate without referencing each other.

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod event;
pub mod gateway;
pub mod logging;
pub mod modules;
pub mod runtime;
pub mod sync;

pub use config::Config;
pub use event::EventBus;
pub use runtime::Runtime;
