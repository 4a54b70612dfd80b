//! FUSE bridge for NimbusFS.
//!
//! Translates the kernel's userspace-filesystem protocol onto the
//! `nimbus-vfs` engine: metadata from the inode graph, bytes through
//! the content cache, mutations into the upload manager or — while
//! offline — the durable change log.

pub mod error;
pub mod filesystem;
pub mod inode_map;
pub mod mount;
pub mod xattr;

pub use error::errno_for;
pub use filesystem::NimbusFs;
pub use inode_map::{InodeMap, ROOT_INO};
pub use mount::{mount_and_serve, mount_options};
