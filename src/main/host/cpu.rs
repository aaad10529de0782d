use std::time::Duration;

use umbra_time::emulated_time::EmulatedTime;
use umbra_time::simulation_time::SimulationTime;

/// Models the simulated host's CPU as a debt of simulated time owed for
/// native guest execution. Each guest burst charges the debt with the wall
/// time it consumed, scaled by the ratio of the machine's clock rate to the
/// host's configured rate; the debt drains as the virtual clock advances.
/// While debt above the reporting minimum is outstanding, the scheduler
/// holds back the host's next event, which is how slow guests fall behind
/// fast ones on the shared timeline.
pub struct Cpu {
    /// Hz granted to the simulated host.
    simulated_frequency: u64,
    /// Hz of the machine the simulator runs on.
    native_frequency: u64,
    /// Debts at or below this are not surfaced; None never surfaces any.
    min_reported_delay: Option<SimulationTime>,
    /// When set, each charge is snapped to this grid, half rounding up.
    granularity: Option<SimulationTime>,
    /// Simulated time still owed for past guest bursts.
    debt: SimulationTime,
    /// Where the virtual clock stood when the debt was last drained.
    clock: EmulatedTime,
}

impl Cpu {
    pub fn new(
        simulated_frequency: u64,
        native_frequency: u64,
        min_reported_delay: Option<SimulationTime>,
        granularity: Option<SimulationTime>,
    ) -> Self {
        assert!(simulated_frequency > 0);
        assert!(native_frequency > 0);
        if let Some(granularity) = granularity {
            assert!(granularity.is_positive());
        }

        Self {
            simulated_frequency,
            native_frequency,
            min_reported_delay,
            granularity,
            debt: SimulationTime::ZERO,
            clock: EmulatedTime::MIN,
        }
    }

    /// Drain the debt by however far the virtual clock has advanced.
    pub fn advance_to(&mut self, now: EmulatedTime) {
        let drained = now.saturating_duration_since(&self.clock);
        self.debt = self.debt.saturating_sub(drained);
        self.clock = std::cmp::max(self.clock, now);
    }

    /// Charge the debt for `native` wall time spent executing guest code.
    pub fn add_delay(&mut self, native: Duration) {
        let charge = self.charge_for(native);
        self.debt = self.debt.saturating_add(charge);
    }

    /// The outstanding delay before this CPU is ready to run again.
    pub fn delay(&self) -> SimulationTime {
        match self.min_reported_delay {
            Some(min) if self.debt > min => self.debt,
            _ => SimulationTime::ZERO,
        }
    }

    fn charge_for(&self, native: Duration) -> SimulationTime {
        // a host clocked slower than the machine takes proportionally longer
        // to do the same work; u128 keeps the product from overflowing
        let scaled = native
            .as_nanos()
            .saturating_mul(u128::from(self.native_frequency))
            / u128::from(self.simulated_frequency);
        let mut charge = u64::try_from(scaled).unwrap_or(u64::MAX);

        if let Some(granularity) = self.granularity {
            let grid = granularity.as_nanos();
            charge = charge.saturating_add(grid / 2) / grid * grid;
        }

        SimulationTime::try_from_nanos(charge).unwrap_or(SimulationTime::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GHZ: u64 = 1_000_000_000;

    fn matched_rates() -> Cpu {
        Cpu::new(GHZ, GHZ, Some(SimulationTime::NANOSECOND), None)
    }

    #[test]
    fn charge_matches_native_time_at_equal_rates() {
        let mut cpu = matched_rates();
        assert_eq!(cpu.delay(), SimulationTime::ZERO);

        cpu.add_delay(Duration::from_millis(250));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(250));
    }

    #[test]
    fn debt_accumulates_monotonically() {
        let mut cpu = matched_rates();

        let mut last = SimulationTime::ZERO;
        for _ in 0..4 {
            cpu.add_delay(Duration::from_micros(700));
            assert!(cpu.delay() >= last);
            last = cpu.delay();
        }
        assert_eq!(last, SimulationTime::from_micros(2800));
    }

    #[test]
    fn advancing_clock_drains_debt() {
        let mut cpu = matched_rates();
        cpu.advance_to(EmulatedTime::SIMULATION_START);

        cpu.add_delay(Duration::from_millis(40));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(40));

        cpu.advance_to(EmulatedTime::SIMULATION_START + SimulationTime::from_millis(15));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(25));

        // moving to or past the end of the debt leaves nothing outstanding
        cpu.advance_to(EmulatedTime::SIMULATION_START + SimulationTime::from_millis(40));
        assert_eq!(cpu.delay(), SimulationTime::ZERO);
        cpu.advance_to(EmulatedTime::SIMULATION_START + SimulationTime::from_secs(9));
        assert_eq!(cpu.delay(), SimulationTime::ZERO);
    }

    #[test]
    fn slower_host_pays_more_per_burst() {
        // the machine runs at twice the simulated host's clock rate
        let mut cpu = Cpu::new(
            GHZ + GHZ / 2,
            3 * GHZ,
            Some(SimulationTime::NANOSECOND),
            None,
        );
        cpu.add_delay(Duration::from_millis(10));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(20));
    }

    #[test]
    fn faster_host_pays_less_per_burst() {
        let mut cpu = Cpu::new(2 * GHZ, GHZ, Some(SimulationTime::NANOSECOND), None);
        cpu.add_delay(Duration::from_millis(10));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(5));
    }

    #[test]
    fn small_debts_stay_hidden_below_the_minimum() {
        let mut cpu = Cpu::new(GHZ, GHZ, Some(SimulationTime::MILLISECOND), None);

        cpu.add_delay(Duration::from_micros(600));
        assert_eq!(cpu.delay(), SimulationTime::ZERO);

        // once the total crosses the minimum, the whole debt surfaces
        cpu.add_delay(Duration::from_micros(600));
        assert_eq!(cpu.delay(), SimulationTime::from_micros(1200));
    }

    #[test]
    fn never_reports_without_a_minimum() {
        let mut cpu = Cpu::new(GHZ, GHZ, None, None);
        cpu.add_delay(Duration::from_secs(2));
        assert_eq!(cpu.delay(), SimulationTime::ZERO);
    }

    #[test]
    fn charges_snap_to_the_grid() {
        let mut cpu = Cpu::new(
            GHZ,
            GHZ,
            Some(SimulationTime::NANOSECOND),
            Some(SimulationTime::MILLISECOND),
        );

        // below half a grid step rounds down
        cpu.add_delay(Duration::from_micros(2400));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(2));

        // half a grid step and above rounds up
        cpu.add_delay(Duration::from_micros(2500));
        assert_eq!(cpu.delay(), SimulationTime::from_millis(5));
    }
}
