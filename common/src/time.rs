use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// - Internally represented by a non-negative [`i64`] to ease
///   interoperability with platforms which don't support unsigned ints.
/// - Can represent any time from January 1st, 1970 00:00:00.000 UTC to
///   roughly 292 million years in the future.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Returns the contained [`i64`].
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let timestamp_u64 = u64::try_from(timestamp.0)
            .expect("Non-negative invariant was violated");
        UNIX_EPOCH + Duration::from_millis(timestamp_u64)
    }
}

impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        system_time
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .map(i64::try_from)
            .context("Current time is before January 1st, 1970")?
            .map(Self)
            .context("Current time is more than 292 million years past epoch")
    }
}

impl TryFrom<i64> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(inner: i64) -> anyhow::Result<Self> {
        if inner >= 0 {
            Ok(Self(inner))
        } else {
            Err(anyhow!("Timestamp must be non-negative"))
        }
    }
}

/// Construct a [`TimestampMs`] from a [`u32`]. Useful in tests.
impl From<u32> for TimestampMs {
    fn from(inner: u32) -> Self {
        Self(i64::from(inner))
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = i64::deserialize(deserializer)?;
        Self::try_from(inner).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negative_timestamps_are_rejected() {
        assert!(TimestampMs::try_from(-1i64).is_err());
        assert!(serde_json::from_str::<TimestampMs>("-1").is_err());
        assert_eq!(
            serde_json::from_str::<TimestampMs>("150").unwrap(),
            TimestampMs::from(150u32),
        );
    }

    #[test]
    fn systemtime_roundtrip() {
        let now = TimestampMs::now();
        let system_time = SystemTime::from(now);
        assert_eq!(TimestampMs::try_from(system_time).unwrap(), now);
    }
}
