//! REST API module for external integrations
//!
//! Provides a read-only HTTP API over ServiceMeshControlPlane status.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
