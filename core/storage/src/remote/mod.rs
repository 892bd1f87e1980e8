//! Signed-in storage: credentials, authenticated transport and the
//! queue-backed remote provider.
//!
//! Layering, bottom up:
//! - [`http`]: the `HttpBackend` seam and response decoding
//! - [`auth`]: the token authority, sole owner of credentials
//! - [`client`]: authenticated requests with single-flight refresh on 401
//! - [`adapter`]: the `StorageProvider` over the API, with offline queueing

pub mod adapter;
pub mod auth;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod http;
pub mod queue;
pub mod wire;

pub use adapter::{export_payload, RemoteStorageAdapter};
pub use auth::TokenAuthority;
pub use client::TransportClient;
pub use config::ClientConfig;
pub use connectivity::{Connectivity, ConnectivityMonitor, ConnectivityObserver};
pub use http::{HttpBackend, HttpRequest, HttpResponse, Method, ReqwestBackend};
pub use queue::{DrainOutcome, DrainReport, OfflineQueue, QueuedOperation};
pub use wire::RegisterRequest;
