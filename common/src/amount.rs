//! A Lightning amount newtype denominated in millisatoshis.
//!
//! Note that we don't impl `From<u64>` or [`FromStr`] because we want calling
//! code to be explicit about what the input unit is: use [`Amount::from_msat`]
//! or [`Amount::from_sat`].
//!
//! The [`Display`] impl prints the contained millisatoshi value without a
//! unit suffix; callers append `" msat"` where a unit is wanted.
//!
//! [`FromStr`]: std::str::FromStr

use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

/// A non-negative Lightning amount, internally represented in millisatoshis.
///
/// - Checked constructors reject values above [`Amount::MAX`].
/// - `Add`/`Sub` saturate rather than wrap; protocol code that needs to
///   detect underflow uses [`Amount::checked_sub`].
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd,
)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    /// Zero millisatoshis.
    pub const ZERO: Self = Self(0);

    /// 21 million BTC in millisatoshis; no valid Lightning amount exceeds
    /// this.
    pub const MAX: Self = Self(21_000_000 * 100_000_000 * 1_000);

    /// Construct an [`Amount`] from a millisatoshi value.
    pub const fn from_msat(msat: u64) -> Self {
        Self(msat)
    }

    /// Construct an [`Amount`] from a satoshi value.
    pub const fn from_sat(sat: u64) -> Self {
        Self(sat * 1_000)
    }

    /// The contained millisatoshi value.
    pub const fn msat(self) -> u64 {
        self.0
    }

    /// The whole-satoshi part, truncating any sub-satoshi remainder.
    pub const fn sats_floor(self) -> u64 {
        self.0 / 1_000
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn min(self, rhs: Self) -> Self {
        Self(self.0.min(rhs.0))
    }
}

impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
