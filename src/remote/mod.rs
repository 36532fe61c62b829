// ABOUTME: Remote workspace API access
// ABOUTME: Versioned client, endpoint helpers, payload models and the pluggable transport

pub mod client;
pub mod endpoints;
pub mod models;
pub mod transport;
