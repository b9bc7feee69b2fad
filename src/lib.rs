pub mod aggregator;
pub mod api;
pub mod cli;
pub mod conf;
pub mod hub;
pub mod record;
pub mod source;
pub mod stats;
