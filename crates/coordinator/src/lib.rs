//! Coordinator - gRPC rendezvous for multi-process training groups
//!
//! The server side holds the membership registry and the round table that
//! completes collectives. Each training process connects with a
//! [`GrpcProcessGroup`], which implements `runtime_core::ProcessGroup`
//! so the rest of the stack never sees the transport.

pub mod client;
pub mod middleware;
pub mod server;
pub mod service;

pub mod proto {
    tonic::include_proto!("coordinator");
}

pub use client::GrpcProcessGroup;
pub use server::{CoordinatorServer, ServerConfig};
pub use service::CoordinatorService;
