//! Budget gate: spend and prompt-count ceilings checked before every agent
//! invocation. Pure functions over the execution state and config.

use crate::session::{ExecutionState, FsdConfig};

/// Conservative per-prompt cost used when the agent reports no real cost.
pub const PER_PROMPT_ESTIMATE_USD: f64 = 0.50;

/// Fraction of `max_cost` at which a non-fatal warning is raised.
pub const WARN_FRACTION: f64 = 0.8;

/// Outcome of a budget check.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetCheck {
    /// `false` means the caller must not issue another agent invocation.
    pub ok: bool,
    /// Blocking reason when `ok` is false, warning text when close to the limit.
    pub message: Option<String>,
}

impl BudgetCheck {
    pub fn is_warning(&self) -> bool {
        self.ok && self.message.is_some()
    }
}

/// Spend used for gating: real reported cost supersedes the estimate once it
/// is larger; otherwise `prompt_count × PER_PROMPT_ESTIMATE_USD`.
pub fn estimated_cost(state: &ExecutionState) -> f64 {
    let estimate = f64::from(state.prompt_count) * PER_PROMPT_ESTIMATE_USD;
    state.total_cost.max(estimate)
}

/// Check spend against `config.max_cost`.
pub fn check_budget(state: &ExecutionState, config: &FsdConfig) -> BudgetCheck {
    let spent = estimated_cost(state);
    if spent >= config.max_cost {
        return BudgetCheck {
            ok: false,
            message: Some(format!(
                "budget exceeded: ${spent:.2} of ${:.2} spent; stopping before the next agent call",
                config.max_cost
            )),
        };
    }
    if spent >= config.max_cost * WARN_FRACTION {
        return BudgetCheck {
            ok: true,
            message: Some(format!(
                "budget warning: ${spent:.2} of ${:.2} spent ({:.0}%)",
                config.max_cost,
                if config.max_cost > 0.0 {
                    spent / config.max_cost * 100.0
                } else {
                    100.0
                }
            )),
        };
    }
    BudgetCheck {
        ok: true,
        message: None,
    }
}

/// Check the session-wide prompt ceiling.
pub fn check_prompt_limit(state: &ExecutionState, config: &FsdConfig) -> BudgetCheck {
    if state.prompt_count >= config.max_total_prompts {
        BudgetCheck {
            ok: false,
            message: Some(format!(
                "prompt limit reached: {} of {} prompts used",
                state.prompt_count, config.max_total_prompts
            )),
        }
    } else {
        BudgetCheck {
            ok: true,
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(prompts: u32, cost: f64) -> ExecutionState {
        let mut s = ExecutionState::new();
        s.prompt_count = prompts;
        s.total_cost = cost;
        s
    }

    fn config(max_cost: f64) -> FsdConfig {
        FsdConfig {
            max_cost,
            ..FsdConfig::default()
        }
    }

    #[test]
    fn fresh_session_is_ok_without_message() {
        let check = check_budget(&ExecutionState::new(), &config(10.0));
        assert!(check.ok);
        assert!(check.message.is_none());
    }

    #[test]
    fn warns_at_eighty_percent() {
        // 16 prompts * 0.50 = 8.00 of 10.00
        let check = check_budget(&state(16, 0.0), &config(10.0));
        assert!(check.ok);
        assert!(check.is_warning());
        assert!(check.message.unwrap().contains("80%"));
    }

    #[test]
    fn blocks_at_limit() {
        let check = check_budget(&state(20, 0.0), &config(10.0));
        assert!(!check.ok);
        assert!(check.message.unwrap().contains("budget exceeded"));
    }

    #[test]
    fn real_cost_supersedes_smaller_estimate() {
        // one prompt estimated at 0.50, but it really cost 12
        let check = check_budget(&state(1, 12.0), &config(10.0));
        assert!(!check.ok);
        assert!((estimated_cost(&state(1, 12.0)) - 12.0).abs() < f64::EPSILON);
    }

    #[test]
    fn prompt_limit_blocks_at_ceiling() {
        let cfg = FsdConfig {
            max_total_prompts: 3,
            ..FsdConfig::default()
        };
        assert!(check_prompt_limit(&state(2, 0.0), &cfg).ok);
        let blocked = check_prompt_limit(&state(3, 0.0), &cfg);
        assert!(!blocked.ok);
        assert!(blocked.message.unwrap().contains("3 of 3"));
    }

    proptest! {
        #[test]
        fn block_iff_estimate_reaches_max(prompts in 0u32..200, cost in 0.0f64..100.0, max in 0.5f64..100.0) {
            let s = state(prompts, cost);
            let c = config(max);
            let spent = estimated_cost(&s);
            let check = check_budget(&s, &c);
            prop_assert_eq!(check.ok, spent < max);
            prop_assert_eq!(check.is_warning(), spent >= 0.8 * max && spent < max);
            if spent < 0.8 * max {
                prop_assert!(check.message.is_none());
            }
        }
    }
}
