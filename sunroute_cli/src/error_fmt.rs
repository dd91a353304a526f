//! Human-readable error descriptions and structured JSON error formatting.

use sunroute_core::error::{BuildError, RouterError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingBoard => {
                "What happened: No board was provided to the router.\nLikely causes: The GPIO backend failed to initialize or was not wired into the builder.\nHow to fix: Ensure the board is created successfully and passed via with_board(...).".to_string()
            }
            BuildError::MissingConfig => {
                "What happened: No configuration was provided to the router.\nLikely causes: The config file was not loaded before building.\nHow to fix: Pass --config with a valid TOML file.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. See etc/sunroute.toml for a sample."
            ),
        };
    }

    if let Some(re) = err.downcast_ref::<RouterError>() {
        return match re {
            RouterError::InvalidPin(pin) => format!(
                "What happened: GPIO {pin} cannot be used for this function.\nLikely causes: The pin is input-only, reserved, or missing on this board.\nHow to fix: Pick another pin in [[outputs]], [[relays]] or [zcd]."
            ),
            RouterError::TimerUnavailable => {
                "What happened: No firing timer is left for a dimmer.\nLikely causes: More dimmed outputs than hardware timers.\nHow to fix: Reduce the number of outputs with a dimmer_pin.".to_string()
            }
            RouterError::Config(msg) => format!(
                "What happened: Self-check found problems ({msg}).\nLikely causes: Pins already claimed, not capable of the requested function, or wiring errors.\nHow to fix: Fix the listed entries in the config and rerun self-check."
            ),
            RouterError::Hardware(msg) | RouterError::HardwareFault(msg) => format!(
                "What happened: Hardware error ({msg}).\nLikely causes: Missing GPIO permissions or a disconnected peripheral.\nHow to fix: Check wiring and run with access to the GPIO device."
            ),
            RouterError::State(_) => format!(
                "What happened: {re}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if let Some(te) = err.downcast_ref::<toml::de::Error>() {
        return format!(
            "What happened: The config file is not valid TOML ({}).\nLikely causes: A typo, a wrong value type, or an unknown enum value.\nHow to fix: Fix the reported line and rerun.",
            te.message()
        );
    }

    if let Some(io) = err.downcast_ref::<std::io::Error>()
        && io.kind() == std::io::ErrorKind::NotFound
    {
        return format!(
            "What happened: {err}.\nLikely causes: The path passed to --config does not exist.\nHow to fix: Pass --config with the path to your TOML file."
        );
    }

    // Generic fallback
    let msg = err.to_string();
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable short name of the error class, used in JSON output.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingBoard => "missing_board",
            BuildError::MissingConfig => "missing_config",
            BuildError::InvalidConfig(_) => "invalid_config",
        };
    }
    if let Some(re) = err.downcast_ref::<RouterError>() {
        return match re {
            RouterError::Config(_) => "self_check",
            RouterError::InvalidPin(_) | RouterError::TimerUnavailable => "pin",
            RouterError::Hardware(_) | RouterError::HardwareFault(_) => "hardware",
            RouterError::State(_) => "state",
        };
    }
    if err.downcast_ref::<toml::de::Error>().is_some() {
        return "config_parse";
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "io";
    }
    "error"
}

/// Exit codes: 3 for configuration problems, 4 for a failed self-check,
/// 5 for hardware errors, 1 otherwise.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    match reason_name(err) {
        "invalid_config" | "missing_config" | "config_parse" | "io" => 3,
        "self_check" | "pin" => 4,
        "hardware" | "missing_board" => 5,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "message": humanize(err),
    })
    .to_string()
}
