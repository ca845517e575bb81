mod index;

pub use crate::index::{IdxError, SlotIndex};
