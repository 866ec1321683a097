//! Ergonomic high-level client bundling discovery, registration, and the
//! session machine behind a handful of methods (spec.md §1 "primary
//! consumer-facing surface").

pub mod client;

pub use client::{RemotePlayClient, RemotePlayClientError};
