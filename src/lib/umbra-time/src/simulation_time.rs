//! A span of simulated time.
//!
//! The simulated clock advances only when events fire, in integer ticks of
//! one nanosecond. A tick is the scheduler's smallest distinguishable delay;
//! "at least one tick" is how "due now" tasks are kept strictly in the
//! future.

use std::str::FromStr;
use std::time::Duration;

pub const SIMTIME_ONE_NANOSECOND: u64 = 1;
pub const SIMTIME_ONE_MICROSECOND: u64 = 1_000;
pub const SIMTIME_ONE_MILLISECOND: u64 = 1_000_000;
pub const SIMTIME_ONE_SECOND: u64 = 1_000_000_000;
pub const SIMTIME_MAX: u64 = u64::MAX - 1;

/// An interval of simulated time, counted in nanosecond ticks.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash, Default)]
pub struct SimulationTime(u64);

impl SimulationTime {
    pub const MAX: SimulationTime = SimulationTime(SIMTIME_MAX);
    pub const ZERO: SimulationTime = SimulationTime(0);
    pub const SECOND: SimulationTime = SimulationTime(SIMTIME_ONE_SECOND);
    pub const MILLISECOND: SimulationTime = SimulationTime(SIMTIME_ONE_MILLISECOND);
    pub const MICROSECOND: SimulationTime = SimulationTime(SIMTIME_ONE_MICROSECOND);
    pub const NANOSECOND: SimulationTime = SimulationTime(SIMTIME_ONE_NANOSECOND);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / SIMTIME_ONE_SECOND
    }

    pub fn as_millis(&self) -> u64 {
        self.0 / SIMTIME_ONE_MILLISECOND
    }

    pub fn as_micros(&self) -> u64 {
        self.0 / SIMTIME_ONE_MICROSECOND
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / SIMTIME_ONE_SECOND as f64
    }

    fn from_ticks(ticks: u64) -> Option<Self> {
        if ticks > SIMTIME_MAX {
            return None;
        }
        Some(Self(ticks))
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).and_then(Self::from_ticks)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).and_then(Self::from_ticks)
    }

    pub fn checked_mul(self, other: u64) -> Option<Self> {
        self.0.checked_mul(other).and_then(Self::from_ticks)
    }

    pub fn checked_div(self, other: u64) -> Option<Self> {
        self.0.checked_div(other).and_then(Self::from_ticks)
    }

    pub fn checked_rem(self, other: Self) -> Option<Self> {
        self.0.checked_rem(other.0).and_then(Self::from_ticks)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(std::cmp::min(self.0.saturating_add(other.0), SIMTIME_MAX))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn try_from_secs(s: u64) -> Option<Self> {
        Self::SECOND.checked_mul(s)
    }

    pub fn from_secs(s: u64) -> Self {
        Self::try_from_secs(s).unwrap()
    }

    pub fn try_from_millis(s: u64) -> Option<Self> {
        Self::MILLISECOND.checked_mul(s)
    }

    pub fn from_millis(s: u64) -> Self {
        Self::try_from_millis(s).unwrap()
    }

    pub fn try_from_micros(s: u64) -> Option<Self> {
        Self::MICROSECOND.checked_mul(s)
    }

    pub fn from_micros(s: u64) -> Self {
        Self::try_from_micros(s).unwrap()
    }

    pub fn try_from_nanos(s: u64) -> Option<Self> {
        Self::from_ticks(s)
    }

    pub fn from_nanos(s: u64) -> Self {
        Self::try_from_nanos(s).unwrap()
    }

    pub fn subsec_nanos(&self) -> u32 {
        (self.0 % SIMTIME_ONE_SECOND).try_into().unwrap()
    }

    /// May panic if the duration doesn't fit; a span of more than ~580
    /// simulated years has no business on the event queue.
    pub fn from_duration(val: Duration) -> Self {
        Self::from_ticks(val.as_nanos().try_into().unwrap()).unwrap()
    }
}

impl std::ops::Add<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn add(self, other: Self) -> Self::Output {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for SimulationTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn sub(self, other: Self) -> Self::Output {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::SubAssign<SimulationTime> for SimulationTime {
    fn sub_assign(&mut self, rhs: SimulationTime) {
        *self = *self - rhs;
    }
}

impl std::ops::Mul<u64> for SimulationTime {
    type Output = SimulationTime;

    fn mul(self, other: u64) -> Self::Output {
        self.checked_mul(other).unwrap()
    }
}

impl std::ops::Div<u64> for SimulationTime {
    type Output = SimulationTime;

    fn div(self, other: u64) -> Self::Output {
        self.checked_div(other).unwrap()
    }
}

impl std::ops::Rem<SimulationTime> for SimulationTime {
    type Output = SimulationTime;

    fn rem(self, other: SimulationTime) -> Self::Output {
        self.checked_rem(other).unwrap()
    }
}

impl From<SimulationTime> for Duration {
    fn from(val: SimulationTime) -> Self {
        Duration::from_nanos(val.0)
    }
}

impl TryFrom<Duration> for SimulationTime {
    type Error = ();

    fn try_from(val: Duration) -> Result<Self, Self::Error> {
        let nanos: u64 = val.as_nanos().try_into().map_err(|_| ())?;
        Self::from_ticks(nanos).ok_or(())
    }
}

/// Parses `"5s"`, `"10ms"`, `"250us"`, `"100ns"`, or a bare integer meaning
/// seconds. Whitespace between the value and the suffix is allowed.
impl FromStr for SimulationTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (value, suffix) = s.split_at(split);
        let value: u64 = value
            .parse()
            .map_err(|_| format!("invalid time value '{s}'"))?;

        let unit = match suffix.trim() {
            "" | "s" | "sec" | "second" | "seconds" => Self::SECOND,
            "ms" | "millisecond" | "milliseconds" => Self::MILLISECOND,
            "us" | "microsecond" | "microseconds" => Self::MICROSECOND,
            "ns" | "nanosecond" | "nanoseconds" => Self::NANOSECOND,
            other => return Err(format!("unknown time unit '{other}'")),
        };

        unit.checked_mul(value)
            .ok_or_else(|| format!("time value '{s}' is out of range"))
    }
}

impl std::fmt::Display for SimulationTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 % SIMTIME_ONE_SECOND == 0 {
            write!(f, "{}s", self.as_secs())
        } else if self.0 % SIMTIME_ONE_MILLISECOND == 0 {
            write!(f, "{}ms", self.as_millis())
        } else if self.0 % SIMTIME_ONE_MICROSECOND == 0 {
            write!(f, "{}us", self.as_micros())
        } else {
            write!(f, "{}ns", self.as_nanos())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arithmetic() {
        let t = SimulationTime::SECOND + SimulationTime::from_millis(500);
        assert_eq!(t.as_millis(), 1500);
        assert_eq!(t - SimulationTime::from_millis(500), SimulationTime::SECOND);
        assert_eq!(SimulationTime::from_micros(3).as_nanos(), 3000);
    }

    #[test]
    fn test_checked_overflow() {
        assert_eq!(SimulationTime::MAX.checked_add(SimulationTime::SECOND), None);
        assert_eq!(
            SimulationTime::ZERO.checked_sub(SimulationTime::NANOSECOND),
            None
        );
        assert_eq!(
            SimulationTime::MAX.saturating_add(SimulationTime::SECOND),
            SimulationTime::MAX
        );
    }

    #[test]
    fn test_duration_round_trip() {
        let t = SimulationTime::from_millis(1234);
        let d: Duration = t.into();
        assert_eq!(SimulationTime::try_from(d).unwrap(), t);
    }

    #[test]
    fn test_parse() {
        assert_eq!("2s".parse::<SimulationTime>().unwrap(), SimulationTime::from_secs(2));
        assert_eq!(
            "10ms".parse::<SimulationTime>().unwrap(),
            SimulationTime::from_millis(10)
        );
        assert_eq!(
            "250 us".parse::<SimulationTime>().unwrap(),
            SimulationTime::from_micros(250)
        );
        assert_eq!(
            "100ns".parse::<SimulationTime>().unwrap(),
            SimulationTime::from_nanos(100)
        );
        assert_eq!("5".parse::<SimulationTime>().unwrap(), SimulationTime::from_secs(5));
        assert!("5 parsecs".parse::<SimulationTime>().is_err());
        assert!("".parse::<SimulationTime>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(SimulationTime::from_secs(3).to_string(), "3s");
        assert_eq!(SimulationTime::from_millis(10).to_string(), "10ms");
        assert_eq!(SimulationTime::from_nanos(7).to_string(), "7ns");
    }
}
