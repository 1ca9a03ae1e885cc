//! Fixed-width bit-sets for year and month membership.
//!
//! A [`BitSet`] stores membership for positions `0..WIDTH` in a single
//! `u32`. Positions outside that range are silently dropped on insert;
//! callers that need to know about drops use the `*_checked` encoders.
//!
//! Two concrete sets are used throughout the tile pipeline:
//!
//! - [`YearMask`]: 32 bits, bit `i` = year `base_year + i` for a
//!   [`YearWindow`].
//! - [`MonthMask`]: 12 bits, bit `i` = month `i + 1`.

use std::ops::{BitOr, BitOrAssign, RangeInclusive};

use serde::{Deserialize, Serialize};

/// A set of small non-negative integers packed into a `u32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BitSet<const WIDTH: u32> {
    bits: u32,
}

impl<const WIDTH: u32> BitSet<WIDTH> {
    /// Mask of all valid bits for this width.
    pub const VALID_BITS: u32 = if WIDTH >= 32 {
        u32::MAX
    } else {
        (1u32 << WIDTH) - 1
    };

    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Builds a set from raw bits, discarding bits beyond `WIDTH`.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits: bits & Self::VALID_BITS,
        }
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bits
    }

    /// Inserts `pos`. Returns `false` (and leaves the set unchanged) when
    /// `pos` is outside `0..WIDTH`.
    pub const fn insert(&mut self, pos: u32) -> bool {
        if pos >= WIDTH {
            return false;
        }
        self.bits |= 1 << pos;
        true
    }

    #[must_use]
    pub const fn contains(self, pos: u32) -> bool {
        pos < WIDTH && self.bits & (1 << pos) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    /// Number of members.
    #[must_use]
    pub const fn len(self) -> u32 {
        self.bits.count_ones()
    }

    /// Iterates members in ascending order.
    pub fn positions(self) -> impl Iterator<Item = u32> {
        (0..WIDTH).filter(move |&pos| self.contains(pos))
    }
}

impl<const WIDTH: u32> BitOr for BitSet<WIDTH> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl<const WIDTH: u32> BitOrAssign for BitSet<WIDTH> {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

/// Years a location received tickets in, relative to a [`YearWindow`].
pub type YearMask = BitSet<32>;

/// Months (1-12) a location received tickets in.
pub type MonthMask = BitSet<12>;

/// The 32-year window a [`YearMask`] is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearWindow {
    base_year: i32,
}

impl Default for YearWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_YEAR)
    }
}

impl YearWindow {
    /// First year of the default window.
    pub const DEFAULT_BASE_YEAR: i32 = 2008;

    #[must_use]
    pub const fn new(base_year: i32) -> Self {
        Self { base_year }
    }

    #[must_use]
    pub const fn base_year(self) -> i32 {
        self.base_year
    }

    /// Inclusive range of years representable in this window.
    #[must_use]
    pub const fn range(self) -> RangeInclusive<i32> {
        self.base_year..=self.base_year + 31
    }

    const fn position(self, year: i32) -> Option<u32> {
        let offset = year - self.base_year;
        if offset < 0 || offset > 31 {
            None
        } else {
            #[allow(clippy::cast_sign_loss)]
            Some(offset as u32)
        }
    }

    /// Encodes `years`, dropping any outside [`Self::range`].
    #[must_use]
    pub fn encode<I: IntoIterator<Item = i32>>(self, years: I) -> YearMask {
        self.encode_checked(years).0
    }

    /// Encodes `years` and returns the values that fell outside the window.
    #[must_use]
    pub fn encode_checked<I: IntoIterator<Item = i32>>(self, years: I) -> (YearMask, Vec<i32>) {
        let mut mask = YearMask::empty();
        let mut rejected = Vec::new();
        for year in years {
            match self.position(year) {
                Some(pos) => {
                    mask.insert(pos);
                }
                None => rejected.push(year),
            }
        }
        (mask, rejected)
    }

    /// Decodes a mask into a sorted list of years.
    #[must_use]
    pub fn decode(self, mask: YearMask) -> Vec<i32> {
        #[allow(clippy::cast_possible_wrap)]
        mask.positions()
            .map(|pos| self.base_year + pos as i32)
            .collect()
    }

    #[must_use]
    pub const fn includes(self, mask: YearMask, year: i32) -> bool {
        match self.position(year) {
            Some(pos) => mask.contains(pos),
            None => false,
        }
    }
}

/// Encodes calendar months (1-12), dropping anything else.
#[must_use]
pub fn encode_month_mask<I: IntoIterator<Item = u8>>(months: I) -> MonthMask {
    encode_month_mask_checked(months).0
}

/// Encodes calendar months and returns the values outside 1-12.
#[must_use]
pub fn encode_month_mask_checked<I: IntoIterator<Item = u8>>(months: I) -> (MonthMask, Vec<u8>) {
    let mut mask = MonthMask::empty();
    let mut rejected = Vec::new();
    for month in months {
        if (1..=12).contains(&month) {
            mask.insert(u32::from(month - 1));
        } else {
            rejected.push(month);
        }
    }
    (mask, rejected)
}

/// Decodes a month mask into sorted calendar months.
#[must_use]
pub fn decode_month_mask(mask: MonthMask) -> Vec<u8> {
    #[allow(clippy::cast_possible_truncation)]
    mask.positions().map(|pos| pos as u8 + 1).collect()
}

#[must_use]
pub fn month_mask_includes(mask: MonthMask, month: u8) -> bool {
    (1..=12).contains(&month) && mask.contains(u32::from(month - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn year_decode_is_sorted_unique_and_in_range() {
        let window = YearWindow::default();
        let years = [2019, 2008, 2019, 1999, 2039, 2040, 2024];
        let decoded = window.decode(window.encode(years));
        assert_eq!(decoded, vec![2008, 2019, 2024, 2039]);
    }

    #[test]
    fn year_membership_matches_input() {
        let window = YearWindow::new(2010);
        let years = [2010, 2015, 2041];
        let mask = window.encode(years);
        for year in window.range() {
            assert_eq!(
                window.includes(mask, year),
                years.contains(&year),
                "membership mismatch for {year}"
            );
        }
        assert!(!window.includes(mask, 2009));
        assert!(!window.includes(mask, 2042));
    }

    #[test]
    fn encode_checked_reports_dropped_years() {
        let window = YearWindow::new(2000);
        let (mask, rejected) = window.encode_checked([1999, 2000, 2032]);
        assert_eq!(window.decode(mask), vec![2000]);
        assert_eq!(rejected, vec![1999, 2032]);
    }

    #[test]
    fn month_mask_drops_out_of_range() {
        let (mask, rejected) = encode_month_mask_checked([0, 1, 12, 13, 6]);
        assert_eq!(decode_month_mask(mask), vec![1, 6, 12]);
        assert_eq!(rejected, vec![0, 13]);
        assert!(month_mask_includes(mask, 12));
        assert!(!month_mask_includes(mask, 2));
        assert!(!month_mask_includes(mask, 0));
    }

    #[test]
    fn from_bits_truncates_to_width() {
        let mask = MonthMask::from_bits(u32::MAX);
        assert_eq!(mask.len(), 12);
        assert_eq!(mask.bits(), 0x0FFF);
    }

    #[test]
    fn union_is_bitwise_or() {
        let a = YearMask::from_bits(0b0101);
        let b = YearMask::from_bits(0b1001);
        assert_eq!((a | b).bits(), 0b1101);
        let mut c = a;
        c |= b;
        assert_eq!(c, a.union(b));
    }
}
