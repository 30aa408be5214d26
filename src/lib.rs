pub mod alb_log;
pub mod cli;
pub mod config;
pub mod index;
pub mod ingest;
pub mod replicate;
pub mod s3;
pub mod store;
pub mod utils;
pub mod waf;
