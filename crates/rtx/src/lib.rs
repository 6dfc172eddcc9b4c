//! Ray tracing scene management: instance slots, BLAS sharing, per instance object bindings,
//! transform synchronization and the TLAS lifecycle.

mod binding;
mod blas;
mod config;
mod context;
mod error;
mod geometry;
pub mod instance;
mod load;
mod plugin;
mod slots;
#[cfg(test)]
mod test_support;
mod tlas;
mod transform;

pub use binding::*;
pub use blas::*;
pub use config::*;
pub use context::*;
pub use error::*;
pub use geometry::*;
pub use load::*;
pub use plugin::*;
pub use slots::*;
pub use tlas::*;
pub use transform::*;
