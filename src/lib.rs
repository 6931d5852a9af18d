//! Multi-agent coordination fabric: an in-process typed message bus, a
//! Contract-Net negotiation manager, and a concurrent capability
//! registry.
//!
//! These three pieces are interdependent by design: the registry holds
//! the data CNP uses to rank bidders, and CNP's lifecycle notifications
//! flow over the bus. Everything else a host-side agent framework needs
//! — behavior trees, script execution, world I/O — is an external
//! collaborator that only ever calls into this crate's public types.

pub mod bus;
pub use bus::*;

pub mod capability;
pub use capability::*;

pub mod cnp;
pub use cnp::*;

pub mod conversation;
pub use conversation::*;

pub mod error;
pub use error::*;

pub mod identity;
pub use identity::*;

pub mod listener;

pub mod message;
pub use message::*;

pub mod registry;
pub use registry::*;
