pub mod aggregator;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod executor;
pub mod reporter;
pub mod shutdown;
pub mod simulator;
pub mod stats;
pub mod storage;
pub mod time_slice;
