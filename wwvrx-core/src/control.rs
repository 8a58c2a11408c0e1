//! Control plane: line-oriented `SET_`/`GET_`/`STATUS` commands with range
//! validation, a rolling-second rate limiter, and parameter-file
//! persistence.
//!
//! The control plane owns the authoritative `TunableParams` copy. Accepted
//! writes are persisted, echoed on the telemetry bus by the caller, and
//! handed back as `(ParamId, value)` so the pipeline can forward the new
//! snapshot to the owning detector task.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::config::{ParamId, TunableParams};
use crate::errors::ControlError;
use crate::params_file;

/// Commands per rolling second, per source.
const RATE_LIMIT: u32 = 10;
/// Wire lines longer than this are rejected outright.
const MAX_LINE_LEN: usize = 256;

/// What a handled line asks the pipeline to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    /// Nothing further (GET, or an error)
    None,
    /// Forward the accepted value to the owning detector
    Apply(ParamId, f64),
    /// Caller substitutes a live status line
    Status,
}

/// Response line plus the follow-up action.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub response: String,
    pub action: ControlAction,
}

impl ControlReply {
    fn ok(response: String, action: ControlAction) -> Self {
        Self { response, action }
    }

    fn err(e: ControlError) -> Self {
        Self {
            response: format!("ERR {e}"),
            action: ControlAction::None,
        }
    }
}

pub struct ControlPlane {
    params: TunableParams,
    param_path: Option<PathBuf>,
    /// Timestamps of admitted commands within the rolling window
    admitted: VecDeque<f64>,
    persist_failures: u64,
}

impl ControlPlane {
    pub fn new(params: TunableParams, param_path: Option<PathBuf>) -> Self {
        Self {
            params,
            param_path,
            admitted: VecDeque::with_capacity(RATE_LIMIT as usize + 1),
            persist_failures: 0,
        }
    }

    /// Startup with the `reload` flag: read the file, fall back per-key.
    /// Returns the warnings for logging.
    pub fn new_with_reload(param_path: PathBuf) -> (Self, Vec<String>) {
        let loaded = match params_file::load(&param_path) {
            Ok(l) => l,
            Err(e) => params_file::LoadedParams {
                params: TunableParams::default(),
                warnings: vec![format!("parameter file unreadable: {e}")],
            },
        };
        (
            Self::new(loaded.params, Some(param_path)),
            loaded.warnings,
        )
    }

    pub fn params(&self) -> &TunableParams {
        &self.params
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    /// Handle one command line. `now_ms` drives the rate limiter.
    pub fn handle_line(&mut self, line: &str, now_ms: f64) -> ControlReply {
        if line.len() > MAX_LINE_LEN {
            return ControlReply::err(ControlError::Syntax(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        let line = line.trim();
        if line.is_empty() {
            return ControlReply::err(ControlError::Syntax("empty command".into()));
        }

        if !self.admit(now_ms) {
            return ControlReply::err(ControlError::RateLimited { limit: RATE_LIMIT });
        }

        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");

        if command == "STATUS" {
            return ControlReply::ok("OK STATUS".into(), ControlAction::Status);
        }

        if let Some(token) = command.strip_prefix("SET_") {
            let id = match ParamId::from_command(token) {
                Some(id) => id,
                None => return ControlReply::err(ControlError::UnknownCommand(command.into())),
            };
            let value_text = match parts.next() {
                Some(v) => v,
                None => {
                    return ControlReply::err(ControlError::Syntax(format!(
                        "{command} requires a value"
                    )))
                }
            };
            if parts.next().is_some() {
                return ControlReply::err(ControlError::Syntax("trailing arguments".into()));
            }
            let value: f64 = match value_text.parse() {
                Ok(v) => v,
                Err(_) => {
                    return ControlReply::err(ControlError::Syntax(format!(
                        "not a number: {value_text}"
                    )))
                }
            };
            let spec = id.spec();
            if id.set(&mut self.params, value).is_err() {
                return ControlReply::err(ControlError::OutOfRange {
                    name: spec.name,
                    min: spec.min,
                    max: spec.max,
                });
            }
            self.persist();
            return ControlReply::ok(
                format!("OK {}={:.3}", spec.name, value),
                ControlAction::Apply(id, value),
            );
        }

        if let Some(token) = command.strip_prefix("GET_") {
            let id = match ParamId::from_command(token) {
                Some(id) => id,
                None => return ControlReply::err(ControlError::UnknownCommand(command.into())),
            };
            if parts.next().is_some() {
                return ControlReply::err(ControlError::Syntax("trailing arguments".into()));
            }
            let spec = id.spec();
            return ControlReply::ok(
                format!("OK {}={:.3}", spec.name, id.get(&self.params)),
                ControlAction::None,
            );
        }

        ControlReply::err(ControlError::UnknownCommand(command.into()))
    }

    /// Rolling-window admission: exactly `RATE_LIMIT` per second.
    fn admit(&mut self, now_ms: f64) -> bool {
        while let Some(&front) = self.admitted.front() {
            if now_ms - front >= 1000.0 {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.admitted.len() >= RATE_LIMIT as usize {
            return false;
        }
        self.admitted.push_back(now_ms);
        true
    }

    /// Write-through to the parameter file. Persistence failures are
    /// counted, not fatal: the in-memory state is already updated.
    fn persist(&mut self) {
        if let Some(path) = &self.param_path {
            if params_file::store(path, &self.params).is_err() {
                self.persist_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> ControlPlane {
        ControlPlane::new(TunableParams::default(), None)
    }

    #[test]
    fn test_set_in_range() {
        let mut cp = plane();
        let reply = cp.handle_line("SET_TICK_THRESHOLD 3.0", 0.0);
        assert_eq!(reply.response, "OK threshold_mult=3.000");
        assert_eq!(
            reply.action,
            ControlAction::Apply(ParamId::TickThreshold, 3.0)
        );
        assert_eq!(cp.params().tick.threshold_mult, 3.0);
    }

    #[test]
    fn test_set_out_of_range_leaves_state() {
        let mut cp = plane();
        cp.handle_line("SET_TICK_THRESHOLD 3.0", 0.0);
        for (i, bad) in ["10.0", "0.0"].iter().enumerate() {
            let reply = cp.handle_line(&format!("SET_TICK_THRESHOLD {bad}"), 100.0 * (i as f64 + 1.0));
            assert!(reply.response.starts_with("ERR RANGE"), "{}", reply.response);
            assert_eq!(reply.action, ControlAction::None);
        }
        assert_eq!(cp.params().tick.threshold_mult, 3.0);
    }

    #[test]
    fn test_get_returns_last_written() {
        let mut cp = plane();
        cp.handle_line("SET_SYNC_LOCKED_THRESHOLD 0.8", 0.0);
        let reply = cp.handle_line("GET_SYNC_LOCKED_THRESHOLD", 100.0);
        assert_eq!(reply.response, "OK locked_threshold=0.800");
    }

    #[test]
    fn test_unknown_and_syntax_errors() {
        let mut cp = plane();
        assert!(cp
            .handle_line("SET_BOGUS 1.0", 0.0)
            .response
            .starts_with("ERR UNKNOWN"));
        assert!(cp
            .handle_line("FROB", 10.0)
            .response
            .starts_with("ERR UNKNOWN"));
        assert!(cp
            .handle_line("SET_TICK_THRESHOLD", 20.0)
            .response
            .starts_with("ERR SYNTAX"));
        assert!(cp
            .handle_line("SET_TICK_THRESHOLD abc", 30.0)
            .response
            .starts_with("ERR SYNTAX"));
        assert!(cp
            .handle_line("SET_TICK_THRESHOLD 2.0 extra", 40.0)
            .response
            .starts_with("ERR SYNTAX"));
        assert!(cp.handle_line("", 50.0).response.starts_with("ERR SYNTAX"));
    }

    #[test]
    fn test_oversized_line_rejected() {
        let mut cp = plane();
        let line = "SET_TICK_THRESHOLD ".to_string() + &"9".repeat(300);
        assert!(cp.handle_line(&line, 0.0).response.starts_with("ERR SYNTAX"));
    }

    #[test]
    fn test_rate_limiter_admits_ten_per_rolling_second() {
        let mut cp = plane();
        for i in 0..10 {
            let reply = cp.handle_line("GET_TICK_THRESHOLD", i as f64 * 10.0);
            assert!(reply.response.starts_with("OK"), "command {i}");
        }
        let reply = cp.handle_line("GET_TICK_THRESHOLD", 500.0);
        assert!(reply.response.starts_with("ERR RATE_LIMIT"));

        // One second after the first command, one slot frees up
        let reply = cp.handle_line("GET_TICK_THRESHOLD", 1001.0);
        assert!(reply.response.starts_with("OK"));
        let reply = cp.handle_line("GET_TICK_THRESHOLD", 1002.0);
        assert!(reply.response.starts_with("ERR RATE_LIMIT"));
    }

    #[test]
    fn test_status_action() {
        let mut cp = plane();
        let reply = cp.handle_line("STATUS", 0.0);
        assert_eq!(reply.action, ControlAction::Status);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wwvrx-ctrl-{}.ini", std::process::id()));
        let mut cp = ControlPlane::new(TunableParams::default(), Some(path.clone()));
        cp.handle_line("SET_TICK_THRESHOLD 3.0", 0.0);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("threshold_multiplier=3.000"));

        let (cp2, warnings) = ControlPlane::new_with_reload(path.clone());
        assert!(warnings.is_empty());
        assert_eq!(cp2.params().tick.threshold_mult, 3.0);
        std::fs::remove_file(&path).ok();
    }
}
