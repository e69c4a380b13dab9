/// The negotiated ceiling on a single milter frame's payload size.
///
/// This is not itself a field on the wire: the base `OPTNEG` packet only
/// carries version, capabilities and protocol (see [`super::OptNeg`]). Each
/// peer instead derives its own effective frame-size ceiling from the
/// negotiated protocol version and local configuration, and both sides are
/// expected to respect whichever value they settled on when sizing their
/// codec's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSize {
    /// 64 KiB, the historical default (milter protocol version 2).
    SixtyFourKb,
    /// 256 KiB.
    TwoFiftySixKb,
    /// 1 MiB, the largest size understood by this implementation.
    OneMb,
}

impl DataSize {
    const SIXTY_FOUR_KB: u32 = 64 * 1024;
    const TWO_FIFTY_SIX_KB: u32 = 256 * 1024;
    const ONE_MB: u32 = 1024 * 1024;

    /// The size in bytes of this `DataSize`.
    #[must_use]
    pub fn bytes(self) -> u32 {
        match self {
            Self::SixtyFourKb => Self::SIXTY_FOUR_KB,
            Self::TwoFiftySixKb => Self::TWO_FIFTY_SIX_KB,
            Self::OneMb => Self::ONE_MB,
        }
    }

    /// Pick the largest supported `DataSize` that does not exceed `offered`.
    ///
    /// A filter must never advertise a size larger than what the MTA
    /// offered; this always clamps down to the nearest supported value.
    #[must_use]
    pub fn negotiate(offered: u32) -> Self {
        if offered >= Self::ONE_MB {
            Self::OneMb
        } else if offered >= Self::TWO_FIFTY_SIX_KB {
            Self::TwoFiftySixKb
        } else {
            Self::SixtyFourKb
        }
    }

    /// The default `DataSize` for a given negotiated milter protocol version.
    ///
    /// Version 2 implementations historically only ever saw 64 KiB frames;
    /// version 6 and later tolerate the full 1 MiB.
    #[must_use]
    pub fn default_for_version(version: u32) -> Self {
        if version >= 6 {
            Self::OneMb
        } else {
            Self::SixtyFourKb
        }
    }
}

impl Default for DataSize {
    fn default() -> Self {
        Self::SixtyFourKb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_clamps_down() {
        assert_eq!(DataSize::negotiate(100), DataSize::SixtyFourKb);
        assert_eq!(DataSize::negotiate(64 * 1024), DataSize::SixtyFourKb);
        assert_eq!(DataSize::negotiate(200 * 1024), DataSize::SixtyFourKb);
        assert_eq!(DataSize::negotiate(256 * 1024), DataSize::TwoFiftySixKb);
        assert_eq!(DataSize::negotiate(512 * 1024), DataSize::TwoFiftySixKb);
        assert_eq!(DataSize::negotiate(1024 * 1024), DataSize::OneMb);
        assert_eq!(DataSize::negotiate(10 * 1024 * 1024), DataSize::OneMb);
    }

    #[test]
    fn test_floors_at_sixty_four_kb_even_when_offered_less() {
        // Nothing smaller than 64 KiB is supported, so a stingy offer still
        // gets the smallest known size rather than an invalid zero-size one.
        assert_eq!(DataSize::negotiate(0), DataSize::SixtyFourKb);
        assert_eq!(DataSize::negotiate(1), DataSize::SixtyFourKb);
    }

    #[test]
    fn test_default_for_version() {
        assert_eq!(DataSize::default_for_version(2), DataSize::SixtyFourKb);
        assert_eq!(DataSize::default_for_version(6), DataSize::OneMb);
    }
}
