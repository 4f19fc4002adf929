pub mod activity;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod merge;
pub mod orchestration;
pub mod record;
pub mod session;
pub mod source;
pub mod stats;
pub mod supervisor;
pub mod util;
