use std::ops::{BitOr, BitOrAssign};

/// Cell level mask.
///
/// Each bit `i` marks that the cell has a separate hash at level `i + 1`.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct LevelMask(u8);

impl LevelMask {
    /// Empty mask.
    pub const EMPTY: Self = LevelMask(0);
    /// Max value of the level (and the mask).
    pub const MAX_LEVEL: u8 = 3;

    /// Constructs new level mask, truncating extra bits.
    #[inline(always)]
    pub const fn new(mask: u8) -> Self {
        Self(mask & 0b111)
    }

    /// Returns `true` if there are no levels in mask.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Creates a sufficient mask for the specified level.
    ///
    /// NOTE: levels > 3 has no effect (mask will always be `0b111`).
    #[inline(always)]
    pub const fn from_level(level: u8) -> Self {
        Self(match level {
            0 => 0,
            1 => 1,
            2 => 3,
            _ => 7,
        })
    }

    /// Counts presented higher hashes.
    pub const fn level(self) -> u8 {
        (self.0 & 1) + ((self.0 >> 1) & 1) + ((self.0 >> 2) & 1)
    }

    /// Computes hash index for the specified level.
    pub const fn hash_index(self, level: u8) -> u8 {
        Self(self.0 & Self::from_level(level).0).level()
    }

    /// Returns `true` if the cell has a separate hash at the specified level.
    ///
    /// Level 0 is always significant.
    pub const fn contains(self, level: u8) -> bool {
        level == 0 || (level <= Self::MAX_LEVEL && self.0 & (1 << (level - 1)) != 0)
    }

    /// Keeps only the levels below the specified one.
    #[inline(always)]
    pub const fn apply(self, level: u8) -> Self {
        Self(self.0 & Self::from_level(level).0)
    }

    /// Creates a new mask, shifted by the offset.
    #[inline(always)]
    pub const fn virtualize(self, offset: u8) -> Self {
        Self(self.0 >> offset)
    }

    /// Returns the underlying bits.
    #[inline(always)]
    pub const fn to_byte(self) -> u8 {
        self.0
    }
}

impl PartialEq<u8> for LevelMask {
    #[inline]
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl BitOr for LevelMask {
    type Output = Self;

    #[inline(always)]
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for LevelMask {
    #[inline(always)]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<LevelMask> for u8 {
    #[inline(always)]
    fn from(m: LevelMask) -> u8 {
        m.0
    }
}

impl std::fmt::Debug for LevelMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{:03b}", self.0))
    }
}
