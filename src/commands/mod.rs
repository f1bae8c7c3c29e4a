pub mod cache;
pub mod chain;
pub mod config;
pub mod fingerprint;
