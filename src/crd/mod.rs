//! Custom resource definitions for the `pvpool.puppet.com` API group.

mod checkout;
mod condition;
mod pool;

pub use checkout::*;
pub use condition::*;
pub use pool::*;

/// API group served by this controller.
pub const GROUP: &str = "pvpool.puppet.com";

/// API version of the storage types.
pub const VERSION: &str = "v1alpha1";
