//! # Server Discovery
//!
//! Which Connection Manager to talk to.
//!
//! ## Components
//! - **Endpoint**: address, transport kind, last load and quality of one server
//! - **Directory**: seed and learned servers with fading bad marks, persisted through an [`EndpointStore`]
//! - **Selector**: concurrent load probes with a bounded window and retry backoff

pub mod directory;
pub mod endpoint;
pub mod selector;

pub use directory::{Directory, EndpointStore, FileEndpointStore, MemoryEndpointStore};
pub use endpoint::{Endpoint, Quality};
pub use selector::{LoadProbe, Selector, StaticLoadProbe, UdpLoadProbe};
