//! Core domain model for NimbusFS.
//!
//! This crate holds the provider-independent heart of the filesystem:
//! the cached item entity ([`domain::Inode`]) and its hydration state
//! machine, validated identifier newtypes, the offline-change record,
//! configuration, and the port traits the adapter crates implement
//! (`nimbus-graph` for the cloud side, `nimbus-store` for persistence).
//!
//! Nothing in here performs I/O; every network or disk effect lives
//! behind a port.

pub mod config;
pub mod domain;
pub mod ports;

pub use config::Config;
pub use domain::{
    change::{ChangeOp, ChangeRecord},
    errors::DomainError,
    ids::{ContentHash, DeltaLink, ETag, ItemId},
    item::{Inode, ItemKind, ItemState},
};
