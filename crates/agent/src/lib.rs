//! Flag sync agent: wires the sync core to HTTP collaborators and serves
//! health and metrics endpoints

pub mod api;
pub mod config;
pub mod http;
