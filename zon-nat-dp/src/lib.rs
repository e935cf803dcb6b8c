//! Dataplane of the zon-nat service translator: header codec, checksum
//! maintenance, the backend registry, the session cache and the two
//! direction procedures that tie them together.

pub mod checksum;
pub mod frame;
pub mod headers;
pub mod maps;
pub mod notify;
pub mod proxy;
pub mod registry;
pub mod selector;
pub mod sessions;
pub mod stats;
pub mod subnet;

pub use checksum::ChecksumMode;
pub use frame::FrameBuilder;
pub use headers::{HeaderError, Headers, L4Proto};
pub use notify::{MissEvent, MissNotifier};
pub use proxy::{Proxy, ProxyConfig, Verdict};
pub use registry::{BackendRegistry, RegistryError};
pub use selector::{SelectionMode, Selector};
pub use sessions::SessionCache;
pub use stats::Stats;
