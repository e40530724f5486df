pub mod config;
pub mod engine;
pub mod feed;
pub mod flags;
pub mod limits;
pub mod manifest;
pub mod model;
pub mod observability;
pub mod store;
pub mod wal;
