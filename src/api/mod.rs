//! HTTP API Module
//!
//! Provides a read-only REST API for node status and cluster membership.

mod http;

pub use http::{HealthResponse, HttpServer, MemberEntry, MembersResponse};
