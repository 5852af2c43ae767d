//! Shared plumbing for the policy control plane.
//!
//! This crate provides the small building blocks used by the policy engine
//! and the DNS proxy:
//!
//! - [`RefCountedMap`]: shared values keyed by name, removed with their
//!   last reference
//! - [`ChangeBuffer`]: per-key buffer of pending insert/delete operations,
//!   deduplicated so that the last operation for a key wins
//! - [`VersionedCell`]: holder of an immutable snapshot tagged with a
//!   monotonically increasing [`Version`]
//!
//! # Example
//!
//! ```
//! use policy_common::{ChangeBuffer, ChangeOp};
//!
//! let mut buffer: ChangeBuffer<u32, &str> = ChangeBuffer::new();
//! buffer.push_insert(101, "allow");
//! buffer.push_delete(101);
//!
//! let drained = buffer.take();
//! assert_eq!(drained.ops().get(&101), Some(&ChangeOp::Delete));
//! ```

mod change_buffer;
mod ref_map;
mod versioned;

pub use change_buffer::{ChangeBuffer, ChangeOp};
pub use ref_map::{RefCountedMap, RefMapError};
pub use versioned::{Version, Versioned, VersionedCell};
