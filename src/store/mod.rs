//! Shared store of published action and task values
//!
//! Every unit of work publishes its output (and optionally a typed result)
//! here once it completes; parameters read from it lazily.

pub mod result;
pub mod value_store;

pub use result::*;
pub use value_store::*;
