//! Reference scenarios for firing, arbitration, relay switching and the
//! fail-safe stop.
use std::sync::Arc;
use std::time::{Duration, Instant};
use sunroute_core::dimmer::{Dimmer, firing_delay_us, table_delay_us};
use sunroute_core::grid::{Grid, GridMetrics, Source};
use sunroute_core::output::{OutputConfig, RouterOutput};
use sunroute_core::pid::Pid;
use sunroute_core::relay::{Relay, RelayKind, Transition, auto_switch};
use sunroute_core::router::{DiversionController, DivertOutcome};
use sunroute_hardware::SimBoard;
use sunroute_traits::clock::test_clock::TestClock;
use sunroute_traits::{Clock, Measurement};

#[test]
fn half_duty_fires_near_the_middle_of_the_table() {
    let semi = 10_000;
    let delay = firing_delay_us(0.5, semi);
    let bracket = (0..79)
        .find(|&i| {
            let (hi, lo) = (table_delay_us(i, semi).unwrap(), table_delay_us(i + 1, semi).unwrap());
            lo <= delay && delay <= hi
        })
        .expect("delay inside the table");
    assert!((38..=40).contains(&bracket), "bracket={bracket} delay={delay}");
}

#[test]
fn remote_meter_outranks_local_when_external_is_absent() {
    let clock = TestClock::new();
    let mut grid = Grid::new(Arc::new(clock.clone()));
    for s in Source::PRIORITY {
        grid.set_expiration(s, Duration::from_secs(10));
    }
    grid.update(Source::Local, Measurement::with_power_voltage(-300.0, 229.0), clock.now());
    clock.advance_ms(1_000);
    grid.update(Source::Remote, Measurement::with_power_voltage(-700.0, 232.0), clock.now());
    clock.advance_ms(1_000);

    let m = grid.resolve();
    assert_eq!(m.power, Some(-700.0));
    assert_eq!(m.power_source, Some(Source::Remote));
    assert_eq!(m.voltage, Some(232.0));

    // Local ages out first; the remote record holds until its own expiry.
    clock.advance_ms(8_500);
    assert_eq!(grid.record(Source::Local), None);
    assert_eq!(grid.resolve().power_source, Some(Source::Remote));
    clock.advance_ms(1_000);
    assert!(grid.resolve().is_empty());
}

fn pool_relay(board: &SimBoard) -> Relay {
    let mut r = Relay::new("pool");
    r.begin(board, 27, RelayKind::NormallyOpen).unwrap();
    r.set_load(1_000);
    r.set_tolerance(0.05);
    r
}

#[test]
fn relay_turns_on_past_the_tolerance_band() {
    let board = SimBoard::default();
    let now = Instant::now();

    let mut relays = [pool_relay(&board)];
    assert_eq!(auto_switch(&mut relays, -1_040.0, now), None);
    assert!(!relays[0].is_on());

    assert_eq!(
        auto_switch(&mut relays, -1_050.0, now),
        Some(Transition { index: 0, on: true })
    );
    assert!(relays[0].is_on());
    assert_eq!(auto_switch(&mut relays, -1_050.0, now), None, "no chatter on repeat");
    assert_eq!(board.pin(27).unwrap().pulses(), 1);
}

#[test]
fn missing_metrics_stop_every_output() {
    let board: Arc<SimBoard> = Arc::new(SimBoard::default());
    let mut outputs: Vec<RouterOutput> = [25, 26]
        .into_iter()
        .map(|pin| {
            let mut d = Dimmer::new(format!("o{pin}"), board.clone());
            d.begin(pin, 10_000).unwrap();
            RouterOutput::new(format!("o{pin}"), d, OutputConfig {
                calibrated_resistance: 52.9,
                ..OutputConfig::default()
            })
        })
        .collect();
    let mut ctl = DiversionController::new(Pid::default());
    let now = Instant::now();
    let exporting = GridMetrics {
        power: Some(-1_500.0),
        voltage: Some(230.0),
        ..GridMetrics::default()
    };
    for i in 0..10 {
        ctl.run(&mut outputs, &exporting, now + Duration::from_millis(500 * i));
    }
    assert!(outputs.iter().any(|o| o.dimmer().is_on()));

    let outcome = ctl.run(&mut outputs, &GridMetrics::default(), now + Duration::from_secs(6));
    assert_eq!(outcome, DivertOutcome::Stopped);
    assert!(outputs.iter().all(|o| o.duty_cycle() == 0.0));
    assert_eq!(ctl.pid().integral(), 0.0);

    // Idempotent.
    ctl.no_divert(&mut outputs);
    assert!(outputs.iter().all(|o| o.duty_cycle() == 0.0));
    assert_eq!(ctl.pid().output(), 0.0);
}
