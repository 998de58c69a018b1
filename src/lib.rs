pub mod config;
pub mod error;
pub mod filter;
pub mod frame;
pub mod ingestor;
pub mod publisher;
pub mod queue;
pub mod supervisor;
