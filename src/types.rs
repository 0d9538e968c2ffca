//! Small shared types.

pub mod byte_order;

pub use self::byte_order::{ByteOrder, NATIVE_BYTE_ORDER, PERSISTED_BYTE_ORDER};
