//! Versioned model state.
//!
//! - [`SlotValue`] / [`Bounds`]: what a slot holds
//! - [`VersionedSlot`]: current value, shadow copy, dirty bits
//! - [`StateStore`]: the ordered set of slots and the edit-session protocol

mod slot;
mod store;
mod value;

pub use slot::{EditHandle, SlotId, VersionedSlot};
pub use store::StateStore;
pub use value::{Bounds, SlotKind, SlotValue};
