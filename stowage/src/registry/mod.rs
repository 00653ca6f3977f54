//! OCI distribution client, the transport it runs on, and transfer progress.

pub mod client;
pub mod progress;
pub mod transport;

pub use client::{FetchedManifest, RegistryClient, RegistryError};
pub use transport::{HttpTransportProvider, Transport, TransportError, TransportProvider};
