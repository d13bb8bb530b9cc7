#![forbid(unsafe_code)]

pub mod assets;
pub mod cache;
pub mod client;
pub mod config;
pub mod feed;
pub mod format;
pub mod materialize;
pub mod pipeline;
pub mod query;
pub mod ratelimit;
pub mod render;
pub mod scanner;
pub mod search;
pub mod store;
