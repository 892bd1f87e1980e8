//! Storage backends for TarotSync.
//!
//! Every backend implements [`StorageProvider`] with the same semantics:
//! - [`LocalAdapter`] keeps data in an on-device key-value store
//! - [`RemoteStorageAdapter`] talks to the API and queues writes offline
//!
//! The router that switches between them lives in `tarotsync-sync`.

pub mod file;
pub mod kv;
pub mod local;
pub mod memory;
pub mod provider;
pub mod remote;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use file::FileStore;
pub use kv::KeyValueStore;
pub use local::LocalAdapter;
pub use memory::MemoryStore;
pub use provider::StorageProvider;
pub use remote::{
    ClientConfig, Connectivity, ConnectivityMonitor, ConnectivityObserver, HttpBackend,
    RegisterRequest, RemoteStorageAdapter, ReqwestBackend, TokenAuthority, TransportClient,
};
