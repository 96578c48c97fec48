//! Host records and the store that holds them.

mod models;
mod store;

pub use models::{
    HealthCheck, HostAuthentication, HostRecord, HostResourceItem, HostResources, HostState,
    ServiceHealth, VirtualMachine,
};
pub use store::{HostStore, JsonFileHostStore, MemoryHostStore, StoreError, StoreResult};
