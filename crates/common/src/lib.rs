pub mod dto;
pub mod error;
pub mod observability;

#[cfg(test)]
mod tests;

pub use dto::*;
pub use error::{Error, Result};
pub use observability::{init_tracing, GenerationId};
