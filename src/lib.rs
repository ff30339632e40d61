#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
pub mod encoding;
pub mod engine;
mod error;
pub mod hash;
mod scope;
pub mod storage;
mod task;

pub use crate::core::{Arg, Arguments, BoundArguments, Hash32, IntoArg, Value};
pub use crate::encoding::Pipeline;
pub use crate::engine::{Node, Operation, compute_all};
pub use crate::error::*;
pub use crate::scope::{Scope, ScopeGuard, ScopeOptions, ScopeStack};
pub use crate::storage::{Chain, FileStorage, MemoryStorage, Storage};
pub use crate::task::{
    Constant, Forward, Resolver, TaskBuilder, TaskDescriptor, TaskInstance, constant,
};

/// Installs a `tracing` subscriber printing to stderr, filtered by `RUST_LOG`
/// and defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
