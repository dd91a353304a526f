//! `run`: drive the router against the simulated house.
//!
//! The loop stands in for the firmware main loop and its interrupts: each
//! iteration is one mains half-cycle. It raises a zero-cross edge, lets the
//! armed firing timers expire, advances simulated time and runs one
//! scheduler pass, then feeds the routed power back into the house model.
use eyre::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sunroute_config::Config;
use sunroute_core::dimmer::FiringChannel;
use sunroute_core::output::OutputMetrics;
use sunroute_core::relay::Relay;
use sunroute_core::runtime::Counters;
use sunroute_core::zero_cross::{Edge, ZeroCrossDetector};
use sunroute_core::{MeterSource, Router, RouterContext, Source};
use sunroute_hardware::sim::TimerProbe;
use sunroute_hardware::{House, SimBoard, SimClock, SimMeter, SimTemperature};

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub duration: Duration,
    pub solar_w: f32,
    pub house_w: f32,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct OutputSummary {
    pub name: String,
    pub state: &'static str,
    pub duty: f32,
    pub power_w: f32,
}

#[derive(Debug, Clone)]
pub struct RelaySummary {
    pub name: String,
    pub on: bool,
    pub switches: u64,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub simulated: Duration,
    pub passes: u64,
    pub interrupted: bool,
    pub grid_w: f32,
    pub routed_w: f32,
    pub routed_wh: f64,
    pub exported_wh: f64,
    pub imported_wh: f64,
    pub outputs: Vec<OutputSummary>,
    pub relays: Vec<RelaySummary>,
    pub counters: Counters,
}

/// Power drawn by every load the router controls, relays included.
fn controlled_power(ctx: &RouterContext) -> f32 {
    let relays: f32 = ctx.relays().iter().map(Relay::power).sum();
    // A bypass relay puts the full load on the mains.
    let voltage = ctx.grid().voltage().unwrap_or(0.0);
    let bypass: f32 = ctx
        .outputs()
        .iter()
        .filter(|o| o.bypass_relay().is_some_and(Relay::is_on))
        .map(|o| OutputMetrics::theoretical(1.0, voltage, o.config().calibrated_resistance).power)
        .sum();
    ctx.routed_power() + relays + bypass
}

fn half_cycle(ctx: &RouterContext, nominal_hz: u8) -> Duration {
    match ctx.semi_period() {
        0 => {
            let hz = if nominal_hz == 0 { 50 } else { u32::from(nominal_hz) };
            Duration::from_micros(u64::from(1_000_000 / (2 * hz)))
        }
        us => Duration::from_micros(u64::from(us)),
    }
}

fn summarize(router: &Router, house: &House, clock: &SimClock) -> Summary {
    let ctx = router.context();
    let voltage = ctx.grid().voltage().unwrap_or(0.0);
    let now = ctx.now();
    Summary {
        simulated: clock.elapsed(),
        passes: 0,
        interrupted: false,
        grid_w: house.grid_power(),
        routed_w: controlled_power(ctx),
        routed_wh: 0.0,
        exported_wh: 0.0,
        imported_wh: 0.0,
        outputs: ctx
            .outputs()
            .iter()
            .map(|o| OutputSummary {
                name: o.name().to_string(),
                state: o.state().as_str(),
                duty: o.duty_cycle(),
                power_w: o.routed_power(voltage, now),
            })
            .collect(),
        relays: ctx
            .relays()
            .iter()
            .map(|r| RelaySummary {
                name: r.name().to_string(),
                on: r.is_on(),
                switches: r.switch_count(),
            })
            .collect(),
        counters: ctx.counters(),
    }
}

pub fn simulate(config: Config, opts: &RunOptions, stop: &AtomicBool) -> Result<Summary> {
    let nominal_hz = config.grid.nominal_frequency_hz;
    let board = Arc::new(SimBoard::default());
    let clock = SimClock::new();
    let house = House::new(opts.solar_w, opts.house_w);

    let mut builder = Router::builder()
        .with_board(board.clone())
        .with_clock(Arc::new(clock.clone()))
        .with_grid_meter(Source::Local, MeterSource::Direct(Box::new(SimMeter::new(house.clone()))));
    if let Some(celsius) = opts.temperature {
        for o in &config.outputs {
            builder = builder.with_temperature_sensor(o.name.clone(), Box::new(SimTemperature::new(Some(celsius))));
        }
    }
    let mut router = builder.with_config(config).try_build()?;

    // Timers are handed out in output order as each dimmer starts.
    let firing: Vec<(Arc<TimerProbe>, Arc<FiringChannel>)> = board
        .timers()
        .into_iter()
        .zip(
            router
                .context()
                .outputs()
                .iter()
                .filter(|o| o.dimmer().is_enabled())
                .map(|o| o.dimmer().channel()),
        )
        .collect();
    tracing::info!(
        outputs = router.context().outputs().len(),
        dimmers = firing.len(),
        relays = router.context().relays().len(),
        duration_s = opts.duration.as_secs(),
        "simulation started"
    );

    let mut passes = 0u64;
    let (mut routed_wh, mut exported_wh, mut imported_wh) = (0.0f64, 0.0f64, 0.0f64);
    let mut interrupted = false;
    while clock.elapsed() < opts.duration {
        if stop.load(Ordering::Acquire) {
            interrupted = true;
            tracing::warn!(elapsed_ms = clock.elapsed().as_millis(), "simulation interrupted");
            break;
        }
        if let Some(isr) = router.context().zero_cross().map(ZeroCrossDetector::isr) {
            isr.on_edge(Edge::Rising);
        }
        for (timer, channel) in &firing {
            if timer.expire().is_some() {
                channel.on_timer_expired();
            }
        }
        let step = half_cycle(router.context(), nominal_hz);
        clock.advance(step);
        router.loop_once();
        passes += 1;

        let routed = controlled_power(router.context());
        house.set_routed(routed);
        let hours = step.as_secs_f64() / 3_600.0;
        let grid = f64::from(house.grid_power());
        routed_wh += f64::from(routed) * hours;
        exported_wh += (-grid).max(0.0) * hours;
        imported_wh += grid.max(0.0) * hours;
    }

    let mut summary = summarize(&router, &house, &clock);
    summary.passes = passes;
    summary.interrupted = interrupted;
    summary.routed_wh = routed_wh;
    summary.exported_wh = exported_wh;
    summary.imported_wh = imported_wh;
    router.shutdown();
    tracing::info!(
        passes,
        routed_wh,
        exported_wh,
        divert_runs = summary.counters.divert_runs,
        "simulation finished"
    );
    Ok(summary)
}

pub fn print_summary(s: &Summary, json: bool) {
    if json {
        let outputs: Vec<_> = s
            .outputs
            .iter()
            .map(|o| {
                serde_json::json!({
                    "name": o.name,
                    "state": o.state,
                    "duty": o.duty,
                    "power_w": o.power_w,
                })
            })
            .collect();
        let relays: Vec<_> = s
            .relays
            .iter()
            .map(|r| serde_json::json!({ "name": r.name, "on": r.on, "switches": r.switches }))
            .collect();
        let c = &s.counters;
        let v = serde_json::json!({
            "simulated_ms": u64::try_from(s.simulated.as_millis()).unwrap_or(u64::MAX),
            "passes": s.passes,
            "interrupted": s.interrupted,
            "grid_w": s.grid_w,
            "routed_w": s.routed_w,
            "routed_wh": s.routed_wh,
            "exported_wh": s.exported_wh,
            "imported_wh": s.imported_wh,
            "outputs": outputs,
            "relays": relays,
            "counters": {
                "meter_reads": c.meter_reads,
                "divert_runs": c.divert_runs,
                "pid_resets": c.pid_resets,
                "stops": c.stops,
                "relay_switches": c.relay_switches,
            },
        });
        println!("{v}");
        return;
    }

    println!(
        "simulation complete: {:.1} s in {} passes{}",
        s.simulated.as_secs_f64(),
        s.passes,
        if s.interrupted { " (interrupted)" } else { "" }
    );
    println!("grid: {:.0} W, routed: {:.0} W", s.grid_w, s.routed_w);
    println!(
        "energy: routed {:.2} Wh, exported {:.2} Wh, imported {:.2} Wh",
        s.routed_wh, s.exported_wh, s.imported_wh
    );
    for o in &s.outputs {
        println!(
            "output {}: {} duty={:.1}% power={:.0} W",
            o.name,
            o.state,
            o.duty * 100.0,
            o.power_w
        );
    }
    for r in &s.relays {
        println!(
            "relay {}: {} switches={}",
            r.name,
            if r.on { "on" } else { "off" },
            r.switches
        );
    }
    let c = &s.counters;
    println!(
        "counters: meter_reads={} divert_runs={} pid_resets={} stops={} relay_switches={}",
        c.meter_reads, c.divert_runs, c.pid_resets, c.stops, c.relay_switches
    );
}
