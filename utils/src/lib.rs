#![doc = include_str!("../Readme.md")]

use std::mem::size_of;

use bytes::{Buf, BytesMut};

/// Emit a `tracing::debug!` event when the calling crate's `tracing` feature
/// is enabled; a silent no-op otherwise.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::debug!($($arg)*);
    };
}

/// Emit a `tracing::trace!` event when the calling crate's `tracing` feature
/// is enabled; a silent no-op otherwise.
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "tracing")]
        ::tracing::trace!($($arg)*);
    };
}

/// Safe extensions to methods from [`bytes::BytesMut`].
pub trait ByteParsing {
    /// Split at the given delimiter.
    ///
    /// Return the split off bytes without the delimiter
    fn delimited(&mut self, delimiter: u8) -> Option<BytesMut>;

    /// Split a whole buffer into a sequence of NUL-delimited strings.
    ///
    /// A trailing NUL is treated as a terminator, not a separator: `"a\0b\0"`
    /// decodes to `["a", "b"]`. A missing trailing NUL on the last field is
    /// tolerated: `"a"` decodes to `["a"]`. Empty input decodes to an empty
    /// list. Consecutive NULs decode to empty strings: `"\0\0"` decodes to
    /// `["", ""]`.
    fn split_cstrings(self) -> Vec<BytesMut>;

    /// Bounds checked variant of [`bytes::BytesMut::split_to`]
    fn safe_split_to(&mut self, at: usize) -> Option<BytesMut>;

    /// Bounds checked variant of [`bytes::BytesMut::split_off`]
    fn safe_split_off(&mut self, at: usize) -> Option<BytesMut>;

    /// Bounds checked variant of [`bytes::BytesMut::get_u8`]
    fn safe_get_u8(&mut self) -> Option<u8>;

    /// Bounds checked variant of [`bytes::BytesMut::get_u32`]
    fn safe_get_u32(&mut self) -> Option<u32>;
}

impl ByteParsing for BytesMut {
    fn delimited(&mut self, delimiter: u8) -> Option<BytesMut> {
        let index = self.iter().position(|&b| b == delimiter)?;

        let off = self.split_to(index);
        self.advance(1);

        Some(off)
    }

    fn split_cstrings(mut self) -> Vec<BytesMut> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut strings = Vec::new();
        while let Some(field) = self.delimited(0) {
            strings.push(field);
        }

        if !self.is_empty() {
            strings.push(self);
        }

        strings
    }

    fn safe_split_to(&mut self, at: usize) -> Option<Self> {
        if at > self.len() {
            return None;
        }
        Some(self.split_to(at))
    }

    fn safe_split_off(&mut self, at: usize) -> Option<Self> {
        if at > self.capacity() {
            return None;
        }
        Some(self.split_off(at))
    }

    fn safe_get_u8(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        Some(self.get_u8())
    }

    fn safe_get_u32(&mut self) -> Option<u32> {
        if self.len() < size_of::<u32>() {
            return None;
        }
        Some(self.get_u32())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_cstrings_empty() {
        assert_eq!(BytesMut::new().split_cstrings(), Vec::<BytesMut>::new());
    }

    #[test]
    fn test_split_cstrings_trailing_nul_is_terminator() {
        let input = BytesMut::from("a\0b\0");
        assert_eq!(
            input.split_cstrings(),
            vec![BytesMut::from("a"), BytesMut::from("b")]
        );
    }

    #[test]
    fn test_split_cstrings_missing_trailing_nul_tolerated() {
        let input = BytesMut::from("a");
        assert_eq!(input.split_cstrings(), vec![BytesMut::from("a")]);
    }

    #[test]
    fn test_split_cstrings_consecutive_nuls_are_empty_strings() {
        let input = BytesMut::from("\0\0");
        assert_eq!(
            input.split_cstrings(),
            vec![BytesMut::new(), BytesMut::new()]
        );
    }
}
