//! Shared types for the conformance test interpreter
//!
//! Contains the document value model every test document is expressed in,
//! the crate-independent error type, and logging setup. Engine-internal
//! types (entities, operations, matchers) live in the `interpreter` crate.

pub mod errors;
pub mod logging;
pub mod types;

pub use errors::*;
pub use types::*;
