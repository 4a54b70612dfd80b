//! Domain entities and value types.

pub mod change;
pub mod errors;
pub mod ids;
pub mod item;

pub use change::{ChangeOp, ChangeRecord};
pub use errors::DomainError;
pub use ids::{ContentHash, DeltaLink, ETag, ItemId};
pub use item::{Inode, ItemKind, ItemState};
