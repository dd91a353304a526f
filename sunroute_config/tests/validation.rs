use rstest::rstest;
use sunroute_config::{PidTrigger, RelayKind, TermMode, load_toml};

const FULL: &str = r#"
[grid]
nominal_frequency_hz = 50
power_delta_w = 2.5

[grid.expiration]
external_ms = 5000
remote_ms = 3000
local_ms = 3000
output_ms = 3000

[zcd]
pin = 35
online_timeout_ms = 100

[pid]
setpoint_w = 0
kp = 0.1
ki = 0.3
kd = 0.05
out_min_w = -300
out_max_w = 4000
p_mode = "input"
d_mode = "error"
trigger = "measure"
interval_ms = 250

[[outputs]]
name = "tank"
dimmer_pin = 25
duty_limit = 0.8
resistance_ohm = 26.5
bypass_relay = { pin = 32, type = "nc" }

[outputs.auto_bypass]
enabled = true
start_temp_c = 45
stop_temp_c = 55
start_time = "22:00"
stop_time = "06:00"
week_days = ["mon", "tue", "wed", "thu", "fri"]

[[outputs]]
name = "floor"
dimmer_pin = 26

[[relays]]
name = "pool"
pin = 13
nominal_load_w = 1000
tolerance_pct = 5

[scheduler]
profiling = true
relay_interval_ms = 10000

[logging]
level = "debug"
rotation = "daily"
"#;

#[test]
fn full_document_parses_and_validates() {
    let cfg = load_toml(FULL).expect("parse TOML");
    cfg.validate().expect("valid config");

    assert_eq!(cfg.grid.expiration.external_ms, 5000);
    assert_eq!(cfg.pid.trigger, PidTrigger::Measure);
    assert_eq!(cfg.pid.p_mode, TermMode::Input);
    assert_eq!(cfg.outputs.len(), 2);
    assert_eq!(cfg.outputs[0].bypass_relay.map(|r| r.kind), Some(RelayKind::Nc));
    assert!((cfg.outputs[0].duty_limit - 0.8).abs() < f32::EPSILON);
    // Unspecified fields fall back to defaults.
    assert!((cfg.outputs[1].duty_max - 1.0).abs() < f32::EPSILON);
    assert!(cfg.outputs[1].auto_dimmer);
    assert_eq!(cfg.relays[0].nominal_load_w, 1000);
    assert!(cfg.scheduler.profiling);
}

#[rstest]
#[case("[grid]\nnominal_frequency_hz = 55\n", "grid.nominal_frequency_hz")]
#[case("[pid]\nout_min_w = 100\nout_max_w = 100\n", "pid.out_min_w must be < pid.out_max_w")]
#[case("[pid]\nkp = -1\n", "pid.kp")]
#[case("[pid]\nnoise_pct = 100\n", "pid.noise_pct")]
#[case("[[outputs]]\nname = \"a\"\nduty_min = 0.6\nduty_max = 0.4\n", "duty_min must be <= duty_max")]
#[case("[[outputs]]\nname = \"a\"\nduty_limit = 1.5\n", "must be in [0.0, 1.0]")]
#[case("[[outputs]]\nname = \"a\"\n[[outputs]]\nname = \"a\"\n", "duplicated")]
#[case("[[outputs]]\nname = \"a\"\ndimmer_pin = 35\n", "already in use")]
#[case("[[relays]]\nname = \"r\"\ntolerance_pct = 150\n", "tolerance_pct")]
#[case("[[relays]]\nname = \"r\"\npin = 4\n[[relays]]\nname = \"s\"\npin = 4\n", "already in use")]
#[case("[scheduler]\nrelay_interval_ms = 0\n", "scheduler.relay_interval_ms")]
#[case("[scheduler]\nutc_offset_min = 900\n", "scheduler.utc_offset_min")]
#[case("[meters]\nsample_rate_hz = 0\n", "meters.sample_rate_hz must be > 0")]
#[case("[logging]\nrotation = \"weekly\"\n", "logging.rotation")]
fn rejects_invalid_values(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("should be rejected");
    assert!(
        err.to_string().contains(needle),
        "expected '{needle}' in '{err}'"
    );
}

#[test]
fn rejects_bad_auto_bypass_window() {
    let toml = r#"
[[outputs]]
name = "tank"

[outputs.auto_bypass]
enabled = true
start_time = "25:00"
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("bad time");
    assert!(err.to_string().contains("HH:MM"));
}

#[test]
fn rejects_unknown_week_day() {
    let toml = r#"
[[outputs]]
name = "tank"

[outputs.auto_bypass]
enabled = true
week_days = ["mon", "someday"]
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("bad day");
    assert!(err.to_string().contains("someday"));
}

#[test]
fn disabled_auto_bypass_is_not_checked() {
    let toml = r#"
[[outputs]]
name = "tank"

[outputs.auto_bypass]
enabled = false
start_time = "garbage"
"#;
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("disabled window is ignored");
}

#[rstest]
#[case("[[relays]]\nname = \"r\"\npin = 35\n", "relays.r: pin 35 is already in use")]
#[case(
    "[[outputs]]\nname = \"a\"\nbypass_relay = { pin = 35 }\n",
    "outputs.a: bypass_relay.pin 35 is already in use"
)]
fn rejects_outputs_on_zero_cross_pin(#[case] toml: &str, #[case] needle: &str) {
    let cfg = load_toml(toml).expect("parse TOML");
    let err = cfg.validate().expect_err("zero-cross pin is reserved");
    assert!(err.to_string().contains(needle), "expected '{needle}' in '{err}'");
}

#[test]
fn zero_cross_pin_is_free_when_detection_disabled() {
    let toml = "[zcd]\nenabled = false\n[[outputs]]\nname = \"a\"\ndimmer_pin = 35\n";
    let cfg = load_toml(toml).expect("parse TOML");
    cfg.validate().expect("pin 35 is unused");
}

#[test]
fn unknown_relay_type_fails_to_parse() {
    let toml = "[[relays]]\nname = \"r\"\ntype = \"latching\"\n";
    assert!(load_toml(toml).is_err());
}

#[test]
fn loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.toml");
    std::fs::write(&path, FULL).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    let cfg = load_toml(&text).unwrap();
    assert_eq!(cfg.outputs[0].name, "tank");
}

#[test]
fn shipped_sample_is_valid() {
    let cfg = load_toml(include_str!("../../etc/sunroute.toml")).expect("sample parses");
    cfg.validate().expect("sample validates");
    assert_eq!(cfg.outputs[0].bypass_relay.map(|b| b.pin), Some(32));
    assert_eq!(cfg.relays[0].nominal_load_w, 800);
}
