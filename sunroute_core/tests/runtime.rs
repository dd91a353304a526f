//! End-to-end passes of the composed router against the simulated board.
use rstest::rstest;
use std::sync::Arc;
use sunroute_config::{Config, load_toml};
use sunroute_core::error::BuildError;
use sunroute_core::mocks::{FixedTemperature, ScriptedMeter};
use sunroute_core::runtime::task_names;
use sunroute_core::zero_cross::Edge;
use sunroute_core::{MeterSource, OutputState, Router, Source};
use sunroute_hardware::SimBoard;
use sunroute_traits::Measurement;
use sunroute_traits::clock::test_clock::TestClock;

const BASE: &str = r#"
[pid]
kp = 1.0
ki = 0.0
kd = 0.0
p_mode = "error"
out_min_w = -1000.0
out_max_w = 10000.0
interval_ms = 100

[[outputs]]
name = "water"
dimmer_pin = 25
resistance_ohm = 52.9
"#;

struct Rig {
    router: Router,
    clock: TestClock,
    meter: ScriptedMeter,
}

impl Rig {
    fn new(cfg: &str, first: Option<Measurement>) -> Self {
        Self::with_config(load_toml(cfg).unwrap(), first)
    }

    fn with_config(config: Config, first: Option<Measurement>) -> Self {
        let clock = TestClock::new();
        let meter = ScriptedMeter::new([first]);
        let router = Router::builder()
            .with_board(Arc::new(SimBoard::default()))
            .with_clock(Arc::new(clock.clone()))
            .with_config(config)
            .with_grid_meter(Source::Local, MeterSource::Direct(Box::new(meter.clone())))
            .with_time_of_week(|| None)
            .try_build()
            .unwrap();
        let mut rig = Self { router, clock, meter };
        for _ in 0..3 {
            rig.edge();
        }
        rig
    }

    fn edge(&mut self) {
        if let Some(zcd) = self.router.context().zero_cross() {
            zcd.isr().on_edge(Edge::Rising);
        }
        self.clock.advance_ms(10);
    }

    /// Advance `ms` of mains time, one scheduler pass per half cycle.
    fn run_ms(&mut self, ms: u64) {
        for _ in 0..ms / 10 {
            self.edge();
            self.router.loop_once();
        }
    }

    fn duty(&self, output: &str) -> f32 {
        self.router.context().output(output).unwrap().dimmer().live_duty()
    }
}

#[test]
fn export_is_routed_into_the_output() {
    let mut rig = Rig::new(BASE, Some(Measurement::with_power_voltage(-500.0, 230.0)));
    rig.run_ms(1_000);

    let ctx = rig.router.context();
    assert_eq!(ctx.semi_period(), 10_000);
    assert!((rig.duty("water") - 0.5).abs() < 1e-3, "duty={}", rig.duty("water"));
    assert_eq!(ctx.output("water").unwrap().state(), OutputState::Routing);
    assert!((ctx.routed_power() - 500.0).abs() < 1.0);
    assert!(ctx.counters().divert_runs > 0);
    assert_eq!(ctx.counters().stops, 0);
}

#[test]
fn importing_leaves_the_output_idle() {
    let mut rig = Rig::new(BASE, Some(Measurement::with_power_voltage(300.0, 230.0)));
    rig.run_ms(500);
    assert_eq!(rig.duty("water"), 0.0);
    assert_eq!(
        rig.router.context().output("water").unwrap().state(),
        OutputState::Idle
    );
}

#[test]
fn lost_meter_stops_routing() {
    let cfg = format!("{BASE}\n[grid.expiration]\nlocal_ms = 1000\n");
    let mut rig = Rig::new(&cfg, Some(Measurement::with_power_voltage(-500.0, 230.0)));
    rig.run_ms(500);
    assert!(rig.duty("water") > 0.0);

    for _ in 0..20 {
        rig.meter.push(None);
    }
    rig.run_ms(2_000);

    let ctx = rig.router.context();
    assert_eq!(ctx.metrics().power, None);
    assert_eq!(rig.duty("water"), 0.0);
    assert!(ctx.counters().stops > 0);
    assert_eq!(ctx.diversion().pid().integral(), 0.0);
}

#[test]
fn no_metrics_zeroes_manual_outputs_without_diverting() {
    let cfg = r#"
[[outputs]]
name = "water"
dimmer_pin = 25
auto_dimmer = false
"#;
    let mut rig = Rig::new(cfg, None);
    let now = rig.router.context().now();
    assert!(
        rig.router
            .context_mut()
            .output_mut("water")
            .unwrap()
            .try_set_duty_cycle(60.0, now)
    );
    rig.run_ms(600);

    let ctx = rig.router.context();
    assert_eq!(ctx.output("water").unwrap().duty_cycle(), 0.0);
    assert_eq!(ctx.counters().divert_runs, 0);
    assert_eq!(ctx.counters().stops, 0);
    assert_eq!(rig.router.tasks().task(task_names::DIVERT).unwrap().iterations(), 0);
}

#[test]
fn measurement_trigger_runs_diversion_early() {
    let cfg = format!("{BASE}\n").replace("interval_ms = 100", "trigger = \"measure\"");
    let mut rig = Rig::new(&cfg, Some(Measurement::with_power_voltage(-500.0, 230.0)));
    rig.run_ms(300);
    assert!((rig.duty("water") - 0.5).abs() < 1e-3);

    rig.meter.push(Some(Measurement::with_power_voltage(-800.0, 230.0)));
    rig.run_ms(300);
    // Well before the 2 s fallback interval.
    assert!((rig.duty("water") - 0.8).abs() < 1e-3, "duty={}", rig.duty("water"));
}

#[test]
fn relay_switches_on_virtual_grid_power() {
    let cfg = format!(
        "{BASE}\n[[relays]]\nname = \"pool\"\npin = 27\nnominal_load_w = 1000\ntolerance_pct = 5.0\n"
    );
    let mut rig = Rig::new(&cfg, Some(Measurement::with_power_voltage(-2_000.0, 230.0)));
    rig.run_ms(300);

    let ctx = rig.router.context();
    assert!(ctx.relays()[0].is_on());
    assert_eq!(ctx.counters().relay_switches, 1);
    // Only one transition until the relay interval elapses again.
    rig.run_ms(1_000);
    assert_eq!(rig.router.context().counters().relay_switches, 1);
}

#[test]
fn calibration_pauses_diversion() {
    let mut rig = Rig::new(BASE, Some(Measurement::with_power_voltage(-500.0, 230.0)));
    rig.run_ms(300);
    assert!(rig.router.context_mut().begin_calibration(None));
    rig.run_ms(600);

    let ctx = rig.router.context();
    assert!(ctx.is_calibration_running());
    assert!(!ctx.output("water").unwrap().config().auto_dimmer);
    let divert_runs = ctx.counters().divert_runs;
    rig.run_ms(1_000);
    assert_eq!(rig.router.context().counters().divert_runs, divert_runs);
}

#[test]
fn hot_load_is_not_heated() {
    let cfg = BASE.replace("resistance_ohm = 52.9", "resistance_ohm = 52.9\ndimmer_temp_limit_c = 60.0");
    let clock = TestClock::new();
    let meter = ScriptedMeter::new([Some(Measurement::with_power_voltage(-500.0, 230.0))]);
    let mut router = Router::builder()
        .with_board(Arc::new(SimBoard::default()))
        .with_clock(Arc::new(clock.clone()))
        .with_config(load_toml(&cfg).unwrap())
        .with_grid_meter(Source::Local, MeterSource::Direct(Box::new(meter)))
        .with_temperature_sensor("water", Box::new(FixedTemperature(Some(72.0))))
        .with_time_of_week(|| None)
        .try_build()
        .unwrap();
    for _ in 0..100 {
        if let Some(zcd) = router.context().zero_cross() {
            zcd.isr().on_edge(Edge::Rising);
        }
        clock.advance_ms(10);
        router.loop_once();
    }

    let ctx = router.context();
    let water = ctx.output("water").unwrap();
    assert_eq!(water.temperature(ctx.now()), Some(72.0));
    assert!(water.is_temperature_limit_reached(ctx.now()));
    assert_eq!(water.dimmer().live_duty(), 0.0);
}

#[test]
fn shutdown_releases_outputs() {
    let mut rig = Rig::new(BASE, Some(Measurement::with_power_voltage(-500.0, 230.0)));
    rig.run_ms(500);
    rig.router.shutdown();
    let o = rig.router.context().output("water").unwrap();
    assert!(!o.dimmer().is_enabled());
    assert_eq!(o.state(), OutputState::Disabled);
}

#[rstest]
#[case::board(None, Some(Config::default()), "missing board")]
#[case::config(Some(()), None, "missing config")]
fn builder_reports_missing_parts(
    #[case] board: Option<()>,
    #[case] config: Option<Config>,
    #[case] expected: &str,
) {
    let mut b = Router::builder();
    if board.is_some() {
        b = b.with_board(Arc::new(SimBoard::default()));
    }
    if let Some(c) = config {
        b = b.with_config(c);
    }
    let err = b.try_build().expect_err("builder should fail");
    assert!(err.downcast_ref::<BuildError>().is_some());
    assert_eq!(err.to_string(), expected);
}

#[test]
fn builder_rejects_invalid_config() {
    let cfg = load_toml("[grid]\nnominal_frequency_hz = 55\n").unwrap();
    let err = Router::builder()
        .with_board(Arc::new(SimBoard::default()))
        .with_config(cfg)
        .try_build()
        .expect_err("invalid config");
    match err.downcast_ref::<BuildError>() {
        Some(BuildError::InvalidConfig(msg)) => assert!(msg.contains("grid.nominal_frequency_hz")),
        other => panic!("expected InvalidConfig, got: {other:?}"),
    }
}

#[test]
fn builder_rejects_meter_on_unknown_output() {
    let err = Router::builder()
        .with_board(Arc::new(SimBoard::default()))
        .with_config(load_toml(BASE).unwrap())
        .with_output_meter("pool", MeterSource::Direct(Box::new(ScriptedMeter::default())))
        .try_build()
        .expect_err("unknown output");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(msg)) if msg.contains("pool")
    ));
}

#[test]
fn frequency_falls_back_to_nominal() {
    let rig = Rig::new(BASE, None);
    assert!((rig.router.context().frequency() - 50.0).abs() < f32::EPSILON);
    assert_eq!(rig.router.tasks().len(), 7);
}
