//! `self-check`: build the router on the configured board and list what
//! could not be claimed.
use eyre::Result;
use std::sync::Arc;
use sunroute_config::Config;
use sunroute_core::error::RouterError;
use sunroute_core::Router;
use sunroute_traits::Board;

#[cfg(all(feature = "hardware", target_os = "linux"))]
pub fn board() -> Result<Arc<dyn Board>> {
    let board = sunroute_hardware::gpio::GpioBoard::new()
        .map_err(|e| eyre::Report::new(RouterError::Hardware(e.to_string())))?;
    Ok(Arc::new(board))
}

#[cfg(not(all(feature = "hardware", target_os = "linux")))]
pub fn board() -> Result<Arc<dyn Board>> {
    Ok(Arc::new(sunroute_hardware::SimBoard::default()))
}

/// Problems found after building; empty when every configured part started.
pub fn problems(config: &Config, router: &Router) -> Vec<String> {
    let ctx = router.context();
    let mut problems = Vec::new();
    if config.zcd.enabled && ctx.zero_cross().is_none_or(|z| !z.is_enabled()) {
        problems.push(format!("zero-cross detector on gpio {} did not start", config.zcd.pin));
    }
    for (cfg, output) in config.outputs.iter().zip(ctx.outputs()) {
        if !cfg.enabled {
            continue;
        }
        if let Some(pin) = cfg.dimmer_pin
            && !output.dimmer().is_enabled()
        {
            problems.push(format!("output '{}': dimmer on gpio {pin} did not start", cfg.name));
        }
        if let Some(b) = cfg.bypass_relay
            && !output.bypass_relay().is_some_and(|r| r.is_enabled())
        {
            problems.push(format!("output '{}': bypass relay on gpio {} did not start", cfg.name, b.pin));
        }
    }
    for (cfg, relay) in config.relays.iter().zip(ctx.relays()) {
        if let Some(pin) = cfg.pin
            && !relay.is_enabled()
        {
            problems.push(format!("relay '{}': gpio {pin} did not start", cfg.name));
        }
    }
    problems
}

pub fn self_check(config: Config, json: bool) -> Result<()> {
    let router = Router::builder()
        .with_board(board()?)
        .with_config(config.clone())
        .try_build()?;
    let problems = problems(&config, &router);
    if !problems.is_empty() {
        for p in &problems {
            tracing::warn!(problem = %p, "self-check");
        }
        return Err(eyre::Report::new(RouterError::Config(problems.join("; "))));
    }
    if json {
        println!(
            "{}",
            serde_json::json!({
                "ok": true,
                "outputs": config.outputs.len(),
                "relays": config.relays.len(),
                "zero_cross": config.zcd.enabled,
            })
        );
    } else {
        println!(
            "self-check ok: {} output(s), {} relay(s)",
            config.outputs.len(),
            config.relays.len()
        );
    }
    Ok(())
}
