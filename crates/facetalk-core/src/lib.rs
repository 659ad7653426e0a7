//! Core types, config, errors, wire protocol, and session model for facetalk.

pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
