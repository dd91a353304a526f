//! Maps `Box<dyn Error>` from trait boundaries to typed `RouterError`.
//!
//! The traits in `sunroute_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our typed error enum, with an optional
//! feature-gated path for `sunroute_hardware::HwError` downcasting.

use crate::error::RouterError;

/// Map a trait-boundary error to a typed `RouterError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> RouterError {
    #[cfg(feature = "hardware-errors")]
    {
        use sunroute_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::InvalidPin(pin) => RouterError::InvalidPin(*pin),
                HwError::PinInUse(pin) => RouterError::InvalidPin(i32::from(*pin)),
                HwError::TimerExhausted => RouterError::TimerUnavailable,
                other => RouterError::HardwareFault(other.to_string()),
            };
        }
    }

    // Fallback: string-based detection
    let s = e.to_string();
    if s.to_lowercase().contains("timer") {
        RouterError::TimerUnavailable
    } else {
        RouterError::Hardware(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_errors_fall_back_to_message() {
        let e = std::io::Error::other("bus glitch");
        assert_eq!(map_hw_error(&e), RouterError::Hardware("bus glitch".into()));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_errors_map_precisely() {
        use sunroute_hardware::error::HwError;
        assert_eq!(map_hw_error(&HwError::InvalidPin(40)), RouterError::InvalidPin(40));
        assert_eq!(map_hw_error(&HwError::TimerExhausted), RouterError::TimerUnavailable);
    }
}
