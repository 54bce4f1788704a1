pub mod api;
pub mod config;
pub mod migrate;
pub mod remote;
pub mod storage;
pub mod token_provider;
pub mod worker;
