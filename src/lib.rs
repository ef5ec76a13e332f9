//! shellcache library
//!
//! A versioned cache of HTTP responses that sits between a client and the
//! network. Each request is classified and served by a fetch strategy against
//! the active generation; new versions are installed alongside the old one and
//! swap in once no caller depends on it.

pub mod cache;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod control;
pub mod gateway;
pub mod lifecycle;
pub mod request;
pub mod strategy;
pub mod telemetry;
pub mod transport;

mod lock;

#[cfg(test)]
mod testing;
