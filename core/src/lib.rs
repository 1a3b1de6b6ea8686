//! Data Guard convergence core.
//!
//! Drives two database instances into a primary/standby pair through an
//! ordered pipeline of guarded remote steps, then reports whether redo is
//! actually shipping and applying.

pub mod convergence;
pub mod infrastructure;
pub mod pipeline;
pub mod provision;
pub mod runlog;
pub mod settings;
pub mod template;
pub mod types;
pub mod verify;
