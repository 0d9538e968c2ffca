/// Byte order / endianness.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    /// Big Endian
    Big,
    /// Little Endian
    Little,
}

/// Byte order of the host.
#[cfg(target_endian = "big")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Big;

/// Byte order of the host.
#[cfg(target_endian = "little")]
pub const NATIVE_BYTE_ORDER: ByteOrder = ByteOrder::Little;

/// Byte order of raw bytes in persisted records, whatever the host.
pub const PERSISTED_BYTE_ORDER: ByteOrder = ByteOrder::Little;

impl ByteOrder {
    /// Whether data in this byte order must be swapped before the host can read it.
    pub fn needs_swap(self) -> bool {
        self != NATIVE_BYTE_ORDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_never_swaps() {
        assert!(!NATIVE_BYTE_ORDER.needs_swap());
    }

    #[test]
    fn persisted_swaps_only_on_big_endian_hosts() {
        assert_eq!(ByteOrder::Little, PERSISTED_BYTE_ORDER);
        assert_eq!(
            cfg!(target_endian = "big"),
            PERSISTED_BYTE_ORDER.needs_swap()
        );
        assert_ne!(ByteOrder::Big.needs_swap(), ByteOrder::Little.needs_swap());
    }
}
