use std::time::Duration;

use crate::config::DEFAULT_RUN_TIMEOUT_SECS;
use crate::error::ApiError;

const TOOL_CALL_MARGIN_MIN: Duration = Duration::from_millis(200);
const TOOL_CALL_MARGIN_MAX: Duration = Duration::from_secs(2);
const TOOL_CALL_MARGIN_FRACTION: f64 = 0.05;
const TOOL_CALL_MARGIN_THRESHOLD: Duration = Duration::from_secs(2);

pub(crate) fn parse_run_timeout(timeout_secs: Option<u64>) -> Result<Duration, ApiError> {
    let value = timeout_secs.unwrap_or(DEFAULT_RUN_TIMEOUT_SECS);
    if value == 0 {
        return Err(ApiError::BadRequest(
            "timeout must be a positive number of seconds".to_string(),
        ));
    }
    Ok(Duration::from_secs(value))
}

/// MCP clients enforce their own RPC deadline (often 60 s). Returning
/// slightly before the requested timeout keeps the boundary clean:
/// protocol failures surface as MCP errors, Engine failures as tool
/// output.
pub(crate) fn apply_tool_call_margin(duration: Duration) -> Duration {
    if duration < TOOL_CALL_MARGIN_THRESHOLD {
        return duration;
    }
    let mut margin = duration.mul_f64(TOOL_CALL_MARGIN_FRACTION);
    if margin < TOOL_CALL_MARGIN_MIN {
        margin = TOOL_CALL_MARGIN_MIN;
    }
    if margin > TOOL_CALL_MARGIN_MAX {
        margin = TOOL_CALL_MARGIN_MAX;
    }
    duration.saturating_sub(margin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_applies_when_absent() {
        assert_eq!(
            parse_run_timeout(None).unwrap(),
            Duration::from_secs(DEFAULT_RUN_TIMEOUT_SECS)
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(parse_run_timeout(Some(0)).is_err());
    }

    #[test]
    fn margin_leaves_short_timeouts_alone() {
        let short = Duration::from_secs(1);
        assert_eq!(apply_tool_call_margin(short), short);
    }

    #[test]
    fn margin_is_bounded_on_both_ends() {
        let medium = Duration::from_secs(10);
        assert_eq!(apply_tool_call_margin(medium), Duration::from_millis(9500));

        let long = Duration::from_secs(600);
        assert_eq!(apply_tool_call_margin(long), Duration::from_secs(598));
    }
}
