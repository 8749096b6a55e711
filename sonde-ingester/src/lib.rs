pub mod config;
pub mod ingester;

pub use ingester::{Ingester, IngesterSettings};
