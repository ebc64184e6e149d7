//! recall: offline semantic retrieval over notes and documents.

pub mod audit;
pub mod config;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod records;
pub mod semantic;

#[cfg(test)]
mod tests;

pub use error::{RecallError, Result};
