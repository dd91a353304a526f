use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sunroute_core::dimmer::{Dimmer, firing_delay_us};
use sunroute_core::grid::{Grid, Source};
use sunroute_core::pid::{DerivativeMode, Pid, PidTunings, ProportionalMode};
use sunroute_core::relay::{Relay, RelayKind, auto_switch};
use sunroute_core::scheduler::{Task, TaskManager};
use sunroute_hardware::SimBoard;
use sunroute_traits::clock::test_clock::TestClock;
use sunroute_traits::{Clock, Measurement};

proptest! {
    #[test]
    fn effective_duty_is_clamped_then_limited(
        d in 0.0f32..=1.0,
        min in 0.0f32..=1.0,
        max in 0.0f32..=1.0,
        limit in 0.0f32..=1.0,
    ) {
        let mut dimmer = Dimmer::new("d", Arc::new(SimBoard::default()));
        dimmer.begin(25, 10_000).unwrap();
        dimmer.set_duty_cycle_min(min);
        dimmer.set_duty_cycle_max(max);
        dimmer.set_duty_cycle_limit(limit);
        dimmer.set_duty_cycle(d);
        let expected = if d <= 0.0 { 0.0 } else { d.max(min).min(max).min(limit) };
        prop_assert_eq!(dimmer.live_duty(), expected);
    }

    #[test]
    fn firing_delay_never_grows_with_duty(a in 0.0f32..=1.0, b in 0.0f32..=1.0, semi in 6_000u32..14_000) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(firing_delay_us(lo, semi) >= firing_delay_us(hi, semi));
        prop_assert!(firing_delay_us(hi, semi) <= semi);
    }

    #[test]
    fn arbitration_picks_best_fresh_source(
        records in proptest::collection::vec((proptest::option::of(-5_000.0f32..5_000.0), 0u64..20_000), 4),
    ) {
        let clock = TestClock::new();
        let mut grid = Grid::new(Arc::new(clock.clone()));
        clock.advance(Duration::from_secs(30));
        let now = clock.now();
        for s in Source::PRIORITY {
            grid.set_expiration(s, Duration::from_secs(10));
        }
        for (s, (power, age_ms)) in Source::PRIORITY.iter().zip(&records) {
            let m = Measurement { power: *power, ..Measurement::default() };
            grid.update(*s, m, now - Duration::from_millis(*age_ms));
        }
        let expected = Source::PRIORITY
            .iter()
            .zip(&records)
            .filter(|(s, _)| **s != Source::Output)
            .find_map(|(s, (power, age))| (*age < 10_000).then_some(*power).flatten().map(|p| (*s, p)));
        let m = grid.resolve_at(now);
        prop_assert_eq!(m.power, expected.map(|(_, p)| p));
        prop_assert_eq!(m.power_source, expected.map(|(s, _)| s));
    }

    #[test]
    fn pid_output_stays_within_limits(
        kp in 0.0f32..5.0,
        ki in 0.0f32..5.0,
        kd in 0.0f32..5.0,
        inputs in proptest::collection::vec(-10_000.0f32..10_000.0, 1..100),
        on_input in any::<bool>(),
    ) {
        let mut pid = Pid::new(PidTunings {
            kp,
            ki,
            kd,
            out_min: -300.0,
            out_max: 4_000.0,
            p_mode: if on_input { ProportionalMode::OnInput } else { ProportionalMode::OnError },
            d_mode: DerivativeMode::OnError,
            ..PidTunings::default()
        });
        let t0 = Instant::now();
        for (i, x) in inputs.iter().enumerate() {
            let out = pid.compute(*x, t0 + Duration::from_millis(500 * (i as u64 + 1)));
            prop_assert!((-300.0..=4_000.0).contains(&out), "out={}", out);
            prop_assert!((-300.0..=4_000.0).contains(&pid.integral()));
        }
    }

    #[test]
    fn auto_switch_flips_at_most_one_relay(
        loads in proptest::collection::vec(1u16..3_000, 1..5),
        powers in proptest::collection::vec(-8_000.0f32..8_000.0, 1..30),
    ) {
        let board = SimBoard::default();
        let mut relays: Vec<Relay> = loads
            .iter()
            .enumerate()
            .map(|(i, load)| {
                let mut r = Relay::new(format!("r{i}"));
                r.begin(&board, 20 + i32::try_from(i).unwrap(), RelayKind::NormallyOpen).unwrap();
                r.set_load(*load);
                r.set_tolerance(0.05);
                r
            })
            .collect();
        let now = Instant::now();
        for vgp in powers {
            let before: u64 = relays.iter().map(Relay::switch_count).sum();
            let t = auto_switch(&mut relays, vgp, now);
            let after: u64 = relays.iter().map(Relay::switch_count).sum();
            prop_assert_eq!(after - before, u64::from(t.is_some()));
        }
    }

    #[test]
    fn single_relay_never_chatters(load in 1u16..3_000, tol in 0.0f32..0.5, vgp in -8_000.0f32..8_000.0) {
        let board = SimBoard::default();
        let mut r = Relay::new("r");
        r.begin(&board, 20, RelayKind::NormallyOpen).unwrap();
        r.set_load(load);
        r.set_tolerance(tol);
        let mut relays = [r];
        let now = Instant::now();
        let first = auto_switch(&mut relays, vgp, now);
        let second = auto_switch(&mut relays, vgp, now);
        prop_assert!(first.is_none() || second.is_none());
    }

    #[test]
    fn forever_task_respects_its_interval(
        interval_ms in 1u64..500,
        steps in proptest::collection::vec(0u64..200, 1..100),
    ) {
        let clock = TestClock::new();
        let body_clock = clock.clone();
        let runs = Arc::new(Mutex::new(Vec::new()));
        let log = runs.clone();
        let mut tm: TaskManager<()> = TaskManager::new("prop", Arc::new(clock.clone()));
        tm.add(
            Task::new("t", move |_: &mut ()| log.lock().unwrap().push(body_clock.now()))
                .every(Duration::from_millis(interval_ms)),
        );
        for step in steps {
            tm.loop_once(&mut ());
            clock.advance_ms(step);
        }
        let runs = runs.lock().unwrap();
        prop_assert!(!runs.is_empty());
        for w in runs.windows(2) {
            prop_assert!(w[1].duration_since(w[0]) >= Duration::from_millis(interval_ms));
        }
    }
}
