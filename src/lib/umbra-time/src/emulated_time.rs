//! An instant on the simulated timeline.

use crate::simulation_time::{SimulationTime, SIMTIME_ONE_SECOND};

/// An instant in simulated time, represented as nanoseconds since the Unix
/// epoch. Guests observe a recent wall-clock date even though no real time
/// passes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, PartialOrd, Ord, Hash)]
pub struct EmulatedTime(u64);

/// Nanoseconds from the Unix epoch to 2000-01-01 00:00:00 UTC.
const SIMULATION_START_NANOS: u64 = 946_684_800 * SIMTIME_ONE_SECOND;

impl EmulatedTime {
    /// The simulated timeline starts at 00:00:00 UTC on 1 January 2000.
    pub const SIMULATION_START: Self = Self(SIMULATION_START_NANOS);
    pub const UNIX_EPOCH: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX - 1);
    pub const MIN: Self = Self(0);

    /// The instant `val` time units after the simulation began.
    pub fn from_abs_simtime(val: SimulationTime) -> Self {
        Self::SIMULATION_START + val
    }

    /// The interval since the simulation began.
    pub fn to_abs_simtime(self) -> SimulationTime {
        self.duration_since(&Self::SIMULATION_START)
    }

    /// Panics if `earlier` is after `self`.
    pub fn duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier).unwrap()
    }

    pub fn checked_duration_since(&self, earlier: &EmulatedTime) -> Option<SimulationTime> {
        let d = self.0.checked_sub(earlier.0)?;
        SimulationTime::try_from_nanos(d)
    }

    pub fn saturating_duration_since(&self, earlier: &EmulatedTime) -> SimulationTime {
        self.checked_duration_since(earlier)
            .unwrap_or(SimulationTime::ZERO)
    }

    pub fn checked_add(&self, duration: SimulationTime) -> Option<EmulatedTime> {
        let sum = self.0.checked_add(duration.as_nanos())?;
        (sum <= Self::MAX.0).then_some(Self(sum))
    }

    pub fn checked_sub(&self, duration: SimulationTime) -> Option<EmulatedTime> {
        self.0.checked_sub(duration.as_nanos()).map(Self)
    }

    pub fn saturating_add(&self, duration: SimulationTime) -> EmulatedTime {
        self.checked_add(duration).unwrap_or(EmulatedTime::MAX)
    }

    pub fn saturating_sub(&self, duration: SimulationTime) -> EmulatedTime {
        self.checked_sub(duration)
            .unwrap_or(EmulatedTime::SIMULATION_START)
    }
}

impl std::ops::Add<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn add(self, other: SimulationTime) -> Self {
        self.checked_add(other).unwrap()
    }
}

impl std::ops::AddAssign<SimulationTime> for EmulatedTime {
    fn add_assign(&mut self, rhs: SimulationTime) {
        *self = *self + rhs;
    }
}

impl std::ops::Sub<SimulationTime> for EmulatedTime {
    type Output = EmulatedTime;

    fn sub(self, other: SimulationTime) -> Self {
        self.checked_sub(other).unwrap()
    }
}

impl std::ops::Sub<EmulatedTime> for EmulatedTime {
    type Output = SimulationTime;

    fn sub(self, other: EmulatedTime) -> Self::Output {
        self.duration_since(&other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abs_simtime_round_trip() {
        let t = SimulationTime::from_secs(42);
        assert_eq!(EmulatedTime::from_abs_simtime(t).to_abs_simtime(), t);
        assert_eq!(
            EmulatedTime::from_abs_simtime(SimulationTime::ZERO),
            EmulatedTime::SIMULATION_START
        );
    }

    #[test]
    fn test_duration_since() {
        let a = EmulatedTime::SIMULATION_START;
        let b = a + SimulationTime::from_millis(10);
        assert_eq!(b.duration_since(&a), SimulationTime::from_millis(10));
        assert_eq!(a.checked_duration_since(&b), None);
        assert_eq!(a.saturating_duration_since(&b), SimulationTime::ZERO);
    }
}
