//! Shared helpers.

pub mod decimal;
pub mod sync;

pub use sync::lock;
