//! NTP 64-bit fixed-point timestamps

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// NTP epoch offset from Unix epoch (seconds from 1900 to 1970)
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Length of one NTP era in seconds
const ERA_SECONDS: u64 = 1 << 32;

/// NTP timestamp (64-bit: 32 seconds + 32 fraction)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NtpTimestamp {
    /// Seconds since NTP epoch (Jan 1, 1900)
    pub seconds: u32,
    /// Fractional part of seconds (1/2^32 resolution)
    pub fraction: u32,
}

impl NtpTimestamp {
    /// The zero timestamp, used for unset fields
    pub const ZERO: Self = Self {
        seconds: 0,
        fraction: 0,
    };

    /// Create from current system time
    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    /// Create from a system time
    ///
    /// Times before the Unix epoch clamp to the epoch.
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);

        let seconds = since_unix.as_secs() + NTP_EPOCH_OFFSET;
        let nanos = since_unix.subsec_nanos();
        // Convert nanoseconds to NTP fraction (2^32 / 10^9)
        #[allow(clippy::cast_possible_truncation, reason = "NTP fraction fits in u32")]
        let fraction = ((u64::from(nanos) << 32) / 1_000_000_000) as u32;

        Self {
            #[allow(clippy::cast_possible_truncation, reason = "Seconds wrap per NTP era")]
            seconds: seconds as u32,
            fraction,
        }
    }

    /// Convert to system time
    ///
    /// Seconds values below the Unix epoch offset are read as NTP era 1
    /// (after February 2036).
    #[must_use]
    pub fn to_system_time(&self) -> SystemTime {
        let mut secs = u64::from(self.seconds);
        if secs < NTP_EPOCH_OFFSET {
            secs += ERA_SECONDS;
        }
        let since_unix = Duration::new(secs - NTP_EPOCH_OFFSET, self.subsec_nanos());
        UNIX_EPOCH.checked_add(since_unix).unwrap_or(UNIX_EPOCH)
    }

    /// Create from 64-bit NTP timestamp
    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        Self {
            #[allow(clippy::cast_possible_truncation, reason = "Seconds shift fits in u32")]
            seconds: (value >> 32) as u32,
            #[allow(clippy::cast_possible_truncation, reason = "Fraction fits in u32")]
            fraction: value as u32,
        }
    }

    /// Convert to 64-bit NTP timestamp
    #[must_use]
    pub fn to_u64(&self) -> u64 {
        (u64::from(self.seconds) << 32) | u64::from(self.fraction)
    }

    /// Encode to 8 bytes
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        self.to_u64().to_be_bytes()
    }

    /// Decode from 8 bytes
    #[must_use]
    pub fn decode(buf: [u8; 8]) -> Self {
        Self::from_u64(u64::from_be_bytes(buf))
    }

    /// Shift by a signed number of milliseconds
    #[must_use]
    pub fn offset_millis(&self, millis: i64) -> Self {
        // 2^32 units per second
        let units = (i128::from(millis) << 32) / 1000;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "NTP arithmetic wraps modulo 2^64"
        )]
        let shifted = (i128::from(self.to_u64()) + units) as u64;
        Self::from_u64(shifted)
    }

    /// Difference in microseconds
    #[must_use]
    pub fn diff_micros(&self, other: &Self) -> i64 {
        let self_micros =
            (i64::from(self.seconds) * 1_000_000) + ((i64::from(self.fraction) * 1_000_000) >> 32);
        let other_micros = (i64::from(other.seconds) * 1_000_000)
            + ((i64::from(other.fraction) * 1_000_000) >> 32);
        self_micros - other_micros
    }

    fn subsec_nanos(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation, reason = "Result is below 10^9")]
        let nanos = ((u64::from(self.fraction) * 1_000_000_000) >> 32) as u32;
        nanos
    }
}

impl From<SystemTime> for NtpTimestamp {
    fn from(time: SystemTime) -> Self {
        Self::from_system_time(time)
    }
}
