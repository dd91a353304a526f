#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse and validation errors are fine; panics are not.
    if let Ok(cfg) = sunroute_config::load_toml(data) {
        let _ = cfg.validate();
        for o in &cfg.outputs {
            let _ = sunroute_config::parse_hhmm(&o.auto_bypass.start_time);
            let _ = o.auto_bypass.week_days.iter().map(|d| sunroute_config::week_day_index(d)).count();
        }
    }
});
