pub mod builder;
pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod grid;
pub mod pipeline;
pub mod render;
pub mod table;
pub mod types;
pub mod workspace;

pub use error::PipelineError;
pub use types::{ListingRecord, Metric, TransactionKind};
