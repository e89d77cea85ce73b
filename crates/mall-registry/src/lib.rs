pub mod client;
pub mod etcd;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod ttl;

pub use client::{Lease, RegistryClient};
pub use etcd::EtcdRegistryStore;
pub use mem::MemRegistryStore;
pub use traits::RegistryStore;
pub use ttl::LeaseReaper;
