//! Typed progress events and their supervisor-facing conversion.

pub mod types;

pub use types::*;
