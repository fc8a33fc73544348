//! Ramp-up calculator: a pure function mapping elapsed time to a target
//! concurrency for the four supported strategies.

use std::time::Duration;

use crate::duration::parse_duration_string;
use crate::errors::AppError;
use crate::model::{PhaseMode, RampUpStrategy, RampUpType};

const DEFAULT_STEP_PHASES: u32 = 3;

#[derive(Debug, Clone)]
struct Phase {
    duration: Duration,
    concurrency: u32,
}

/// A validated, pre-parsed ramp-up strategy ready for repeated `target_at`
/// calls without re-parsing duration strings on every tick.
#[derive(Debug, Clone)]
pub struct RampUpCalculator {
    strategy_type: RampUpType,
    total_duration: Duration,
    max_concurrency: u32,
    phases: Vec<Phase>,
}

impl RampUpCalculator {
    /// Builds a calculator from a strategy, validating as it goes. Callers
    /// that need the "fall back to immediate on invalid input at runtime"
    /// behaviour described in the spec should use [`RampUpCalculator::or_immediate`].
    pub fn new(strategy: &RampUpStrategy, max_concurrency: u32) -> Result<Self, AppError> {
        let total_duration = parse_duration_string(&strategy.duration)
            .map_err(|e| AppError::Validation(format!("ramp_up_strategy.duration: {e}")))?;

        let phases = match strategy.strategy_type {
            RampUpType::Immediate | RampUpType::Linear => Vec::new(),
            RampUpType::Step => {
                let n = if strategy.phases.is_empty() {
                    DEFAULT_STEP_PHASES
                } else {
                    strategy.phases.len() as u32
                };
                if n == 0 {
                    return Err(AppError::Validation("step strategy requires N > 0 phases".into()));
                }
                let phase_duration = Duration::from_secs_f64(total_duration.as_secs_f64() / n as f64);
                (1..=n)
                    .map(|k| Phase {
                        duration: phase_duration,
                        concurrency: ((k as f64 * max_concurrency as f64) / n as f64).round() as u32,
                    })
                    .collect()
            }
            RampUpType::Custom => {
                if strategy.phases.is_empty() {
                    return Err(AppError::Validation(
                        "custom ramp-up strategy requires at least one phase".into(),
                    ));
                }
                let mut phases = Vec::with_capacity(strategy.phases.len());
                for p in &strategy.phases {
                    let duration = parse_duration_string(&p.duration)
                        .map_err(|e| AppError::Validation(format!("phase duration: {e}")))?;
                    if p.concurrency > max_concurrency {
                        return Err(AppError::Validation(format!(
                            "phase concurrency {} exceeds plan concurrency {}",
                            p.concurrency, max_concurrency
                        )));
                    }
                    phases.push(Phase {
                        duration,
                        concurrency: p.concurrency,
                    });
                }
                phases
            }
        };

        Ok(RampUpCalculator {
            strategy_type: strategy.strategy_type,
            total_duration,
            max_concurrency,
            phases,
        })
    }

    /// As [`RampUpCalculator::new`], but falls back to `immediate` on any
    /// validation error instead of propagating it — the behaviour the spec
    /// requires from the orchestrator at runtime (creation-time callers
    /// should still use `new` so they see the error).
    pub fn or_immediate(strategy: &RampUpStrategy, max_concurrency: u32) -> Self {
        Self::new(strategy, max_concurrency).unwrap_or_else(|_| {
            Self::new(&RampUpStrategy::immediate(), max_concurrency)
                .expect("immediate strategy always validates")
        })
    }

    pub fn target_at(&self, elapsed: Duration) -> u32 {
        match self.strategy_type {
            RampUpType::Immediate => self.max_concurrency,
            RampUpType::Linear => {
                if self.total_duration.is_zero() {
                    return self.max_concurrency;
                }
                let ratio = (elapsed.as_secs_f64() / self.total_duration.as_secs_f64()).min(1.0);
                (self.max_concurrency as f64 * ratio).floor() as u32
            }
            RampUpType::Step | RampUpType::Custom => {
                let mut cumulative = Duration::ZERO;
                for phase in &self.phases {
                    cumulative += phase.duration;
                    if elapsed <= cumulative {
                        return phase.concurrency;
                    }
                }
                self.max_concurrency
            }
        }
    }

    pub fn is_complete(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration
    }

    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }
}

/// Synthesises the equal-duration phases a `step` strategy expands to, for
/// callers (e.g. the phase orchestrator) that need explicit phase boundaries
/// rather than just the target-at-elapsed function.
pub fn synthesize_step_phases(strategy: &RampUpStrategy, max_concurrency: u32) -> Vec<(Duration, u32, PhaseMode)> {
    let total = parse_duration_string(&strategy.duration).unwrap_or(Duration::ZERO);
    let n = if strategy.phases.is_empty() {
        DEFAULT_STEP_PHASES
    } else {
        strategy.phases.len() as u32
    };
    let phase_duration = Duration::from_secs_f64(total.as_secs_f64() / n.max(1) as f64);
    (1..=n)
        .map(|k| {
            (
                phase_duration,
                ((k as f64 * max_concurrency as f64) / n as f64).round() as u32,
                PhaseMode::Parallel,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RampPhase, RampUpStrategy};

    fn strategy(kind: RampUpType, duration: &str, phases: Vec<RampPhase>) -> RampUpStrategy {
        RampUpStrategy {
            strategy_type: kind,
            duration: duration.to_string(),
            phases,
        }
    }

    #[test]
    fn immediate_always_max() {
        let calc = RampUpCalculator::new(&strategy(RampUpType::Immediate, "0s", vec![]), 50).unwrap();
        assert_eq!(calc.target_at(Duration::ZERO), 50);
        assert_eq!(calc.target_at(Duration::from_secs(100)), 50);
    }

    #[test]
    fn linear_s3_scenario() {
        let calc = RampUpCalculator::new(&strategy(RampUpType::Linear, "10s", vec![]), 100).unwrap();
        assert_eq!(calc.target_at(Duration::ZERO), 0);
        assert_eq!(calc.target_at(Duration::from_secs(5)), 50);
        assert_eq!(calc.target_at(Duration::from_secs(10)), 100);
        assert_eq!(calc.target_at(Duration::from_secs(15)), 100);
    }

    #[test]
    fn linear_is_monotonic() {
        let calc = RampUpCalculator::new(&strategy(RampUpType::Linear, "20s", vec![]), 37).unwrap();
        let mut last = 0;
        for s in 0..=25 {
            let t = calc.target_at(Duration::from_secs(s));
            assert!(t >= last, "t={s} target {t} < previous {last}");
            last = t;
        }
    }

    #[test]
    fn step_default_three_phases() {
        let calc = RampUpCalculator::new(&strategy(RampUpType::Step, "9s", vec![]), 90).unwrap();
        assert_eq!(calc.target_at(Duration::from_millis(500)), 30);
        assert_eq!(calc.target_at(Duration::from_secs(4)), 60);
        assert_eq!(calc.target_at(Duration::from_secs(7)), 90);
    }

    #[test]
    fn custom_walks_phases_cumulatively() {
        let phases = vec![
            RampPhase { duration: "2s".into(), concurrency: 10, mode: PhaseMode::Parallel },
            RampPhase { duration: "3s".into(), concurrency: 20, mode: PhaseMode::Parallel },
        ];
        let calc = RampUpCalculator::new(&strategy(RampUpType::Custom, "5s", phases), 20).unwrap();
        assert_eq!(calc.target_at(Duration::from_secs(1)), 10);
        assert_eq!(calc.target_at(Duration::from_secs(2)), 10);
        assert_eq!(calc.target_at(Duration::from_millis(2001)), 20);
        assert_eq!(calc.target_at(Duration::from_secs(10)), 20);
    }

    #[test]
    fn custom_boundary_is_right_continuous() {
        let phases = vec![
            RampPhase { duration: "2s".into(), concurrency: 10, mode: PhaseMode::Parallel },
            RampPhase { duration: "2s".into(), concurrency: 15, mode: PhaseMode::Parallel },
        ];
        let calc = RampUpCalculator::new(&strategy(RampUpType::Custom, "4s", phases), 15).unwrap();
        // At the exact boundary elapsed == cumulative, phase i's value still applies.
        assert_eq!(calc.target_at(Duration::from_secs(2)), 10);
    }

    #[test]
    fn custom_requires_phases() {
        let err = RampUpCalculator::new(&strategy(RampUpType::Custom, "5s", vec![]), 10);
        assert!(err.is_err());
    }

    #[test]
    fn or_immediate_falls_back_on_invalid() {
        let calc = RampUpCalculator::or_immediate(&strategy(RampUpType::Custom, "5s", vec![]), 42);
        assert_eq!(calc.target_at(Duration::ZERO), 42);
    }

    #[test]
    fn is_complete_matches_total_duration() {
        let calc = RampUpCalculator::new(&strategy(RampUpType::Linear, "10s", vec![]), 10).unwrap();
        assert!(!calc.is_complete(Duration::from_secs(9)));
        assert!(calc.is_complete(Duration::from_secs(10)));
    }
}
