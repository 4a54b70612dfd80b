//! Port traits implemented by the adapter crates.

pub mod remote;

pub use remote::{
    ChildrenPage, ChunkOutcome, CloudProvider, DeltaPage, MetadataPatch, RemoteError,
    RemoteErrorKind, RemoteItem, SessionHandle, TokenSource,
};
