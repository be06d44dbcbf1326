//! `jobforge-core`: identifiers and error primitives shared by every jobforge crate.
//!
//! Nothing in here touches storage, threads or the network.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, PersonId};
