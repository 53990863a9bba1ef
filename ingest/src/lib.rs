pub mod api;
pub mod config;
pub mod dedup;
pub mod event;
pub mod freshness;
pub mod ingestor;
pub mod key;
pub mod retry;
pub mod stores;
pub mod time;
