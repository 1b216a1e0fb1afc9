//! Observable state containers shared between the core and its consumers.

mod observable;

pub use observable::{Observable, Observer, ObserverId};
