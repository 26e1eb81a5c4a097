//! An OCI Distribution client for pulling and pushing content to an OCI
//! compliant remote store.
//!
//! Content is addressed by digest end to end: every blob and manifest this
//! client retrieves is re-hashed and verified against the digest it was
//! requested by, and everything it pushes is addressed by the digest of
//! the bytes actually sent.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod client;
pub mod digest;
pub mod errors;
pub mod manifest;
mod reference;
pub mod secrets;
mod token_cache;

#[doc(inline)]
pub use client::Client;
#[doc(inline)]
pub use reference::{ParseError, Reference};
#[doc(inline)]
pub use token_cache::RegistryOperation;
