//! Session protocol server for the eheart simulation engine.
//!
//! Each TCP connection owns one [`session::Session`], which binds one model
//! to one engine and answers a strictly sequential stream of JSON requests.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
