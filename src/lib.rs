//! GPU capability layer for the ray tracing scene manager.
//!
//! Nothing in here talks to a graphics API directly. Backends implement [`RtDevice`];
//! everything else (access tracking, staging rings, deferred destruction, job dispatch)
//! is written against that trait.

mod access;
pub mod buffer;
mod device;
mod dispose;
#[cfg(any(test, feature = "headless"))]
pub mod headless;
mod task;

pub use access::*;
pub use ash;
pub use device::*;
pub use dispose::DeferredDestroyer;
pub use task::*;
