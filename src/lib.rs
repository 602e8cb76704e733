//! Forwarding request engine for an HTTP/HTTPS proxy.
//!
//! This crate owns the parts of a proxy that are hard to get right: the
//! upstream connection state machine, the HTTPS CONNECT tunnel loop, and the
//! parallel range-prefetch pipeline that splits one origin response into
//! concurrent byte-range sub-requests and reassembles them in order. HTTP
//! parsing, the listening socket, routing, and DNS resolution are supplied by
//! the embedding process through the traits in [`iface`].

pub mod config;
pub mod error;
pub mod iface;
pub mod orchestrator;
pub mod range;
pub mod session;
pub mod tunnel;
pub mod wire;

pub use config::EngineConfig;
pub use error::EngineError;
pub use iface::{Dialer, HostPolicy, Resolver};
pub use orchestrator::{Orchestrator, SessionDirective};
pub use session::{UpstreamDescriptor, UpstreamSession};
pub use wire::{RawRequest, RawResponse};
