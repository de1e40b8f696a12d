//! Concrete transports and the factory that picks one from a server's
//! configured [`crate::config::TransportKind`].

pub mod adapters;
pub mod factory;

pub use factory::build;
