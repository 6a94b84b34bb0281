//! Attempt and cost budget enforcement for a single loop invocation.
//!
//! The guardian enforces two independent ceilings (attempt count and abstract
//! cost) and derives a graduated [`EscalationLevel`] from whichever ceiling is
//! closer to breach. Cost is charged when an attempt is authorized, not when
//! its outcome is recorded.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Budget limits and thresholds (`[budget]` in `.ralph/config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// The guardian is opt-in.
    pub enabled: bool,
    pub max_attempts: u32,
    /// Total budget in abstract cost units.
    pub budget_limit: f64,
    pub cost_per_attempt: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub exceeded_threshold: f64,
    /// Relax the cost ceiling. `max_attempts` is still enforced.
    pub allow_budget_overflow: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 10,
            budget_limit: 100.0,
            cost_per_attempt: 10.0,
            warning_threshold: 0.5,
            critical_threshold: 0.8,
            exceeded_threshold: 0.9,
            allow_budget_overflow: false,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("budget.max_attempts must be > 0"));
        }
        if !self.budget_limit.is_finite() || self.budget_limit <= 0.0 {
            return Err(anyhow!("budget.budget_limit must be a finite value > 0"));
        }
        if !self.cost_per_attempt.is_finite() || self.cost_per_attempt < 0.0 {
            return Err(anyhow!("budget.cost_per_attempt must be a finite value >= 0"));
        }
        let ordered = 0.0 < self.warning_threshold
            && self.warning_threshold <= self.critical_threshold
            && self.critical_threshold <= self.exceeded_threshold;
        if !ordered || !self.exceeded_threshold.is_finite() {
            return Err(anyhow!(
                "budget thresholds must satisfy 0 < warning <= critical <= exceeded (got {}, {}, {})",
                self.warning_threshold,
                self.critical_threshold,
                self.exceeded_threshold
            ));
        }
        Ok(())
    }
}

/// Graduated warning state. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    Normal,
    Warning,
    Critical,
    Exceeded,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EscalationLevel::Normal => "NORMAL",
            EscalationLevel::Warning => "WARNING",
            EscalationLevel::Critical => "CRITICAL",
            EscalationLevel::Exceeded => "EXCEEDED",
        };
        f.write_str(label)
    }
}

/// Mutable consumption counters, owned by the guardian.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetState {
    pub total_cost: f64,
    /// Authorized attempts (succeeded + failed + in flight).
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    /// Time since guardian creation, as of the last mutation.
    pub elapsed: Duration,
    pub level: EscalationLevel,
}

/// Immutable record of one authorized attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    /// 1-based, monotonic for the guardian's lifetime.
    pub attempt_number: u32,
    pub cost: f64,
    pub remaining_budget: f64,
    pub remaining_attempts: u32,
    pub escalation_level: EscalationLevel,
    /// Cost charged beyond `budget_limit` (only with overflow allowed).
    pub overage: f64,
}

/// Point-in-time report of budget consumption.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSummary {
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub cost_used: f64,
    pub budget_limit: f64,
    /// Cost consumed as a percentage of `budget_limit`.
    pub percent_used: f64,
    pub overage: f64,
    pub elapsed_secs: f64,
    pub level: EscalationLevel,
}

impl fmt::Display for BudgetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Budget report")?;
        writeln!(
            f,
            "  attempts: {}/{} (succeeded {}, failed {})",
            self.attempts_used, self.max_attempts, self.successes, self.failures
        )?;
        writeln!(
            f,
            "  cost:     {:.2}/{:.2} ({:.1}% used)",
            self.cost_used, self.budget_limit, self.percent_used
        )?;
        if self.overage > 0.0 {
            writeln!(f, "  overage:  {:.2}", self.overage)?;
        }
        writeln!(f, "  elapsed:  {:.1}s", self.elapsed_secs)?;
        write!(f, "  level:    {}", self.level)
    }
}

/// Which ceiling caused a denial.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    MaxAttempts { max_attempts: u32 },
    InsufficientBudget { remaining: f64, required: f64 },
    Threshold { usage: f64, threshold: f64 },
}

/// Authorization denial, carrying a snapshot of the guardian state.
#[derive(Debug, Clone, PartialEq)]
pub struct BudgetExceeded {
    pub reason: DenialReason,
    pub summary: BudgetSummary,
}

impl fmt::Display for BudgetExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            DenialReason::MaxAttempts { max_attempts } => {
                write!(f, "maximum attempts reached ({max_attempts})")
            }
            DenialReason::InsufficientBudget {
                remaining,
                required,
            } => write!(
                f,
                "insufficient budget (remaining {remaining:.2}, required {required:.2})"
            ),
            DenialReason::Threshold { usage, threshold } => write!(
                f,
                "budget usage {:.1}% reached the exceeded threshold ({:.1}%)",
                usage * 100.0,
                threshold * 100.0
            ),
        }
    }
}

/// Invoked with the new level whenever the escalation level changes.
pub type EscalationCallback = Box<dyn FnMut(EscalationLevel, &BudgetState)>;

pub struct BudgetGuardian {
    config: BudgetConfig,
    state: BudgetState,
    records: Vec<AttemptRecord>,
    started: Instant,
    on_escalation: Option<EscalationCallback>,
}

impl fmt::Debug for BudgetGuardian {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetGuardian")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl BudgetGuardian {
    pub fn new(config: BudgetConfig) -> Self {
        let mut guardian = Self {
            config,
            state: BudgetState {
                total_cost: 0.0,
                attempts: 0,
                successes: 0,
                failures: 0,
                elapsed: Duration::ZERO,
                level: EscalationLevel::Normal,
            },
            records: Vec::new(),
            started: Instant::now(),
            on_escalation: None,
        };
        guardian.state.level = guardian.compute_level();
        guardian
    }

    pub fn with_escalation_callback(mut self, callback: EscalationCallback) -> Self {
        self.on_escalation = Some(callback);
        self
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn state(&self) -> &BudgetState {
        &self.state
    }

    /// Every attempt authorized so far, in order.
    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn level(&self) -> EscalationLevel {
        self.state.level
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.state.attempts)
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.config.budget_limit - self.state.total_cost).max(0.0)
    }

    /// Live wall-clock time since the guardian was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// `max(cost_used / budget_limit, attempts_used / max_attempts)`.
    pub fn usage_fraction(&self) -> f64 {
        let cost = if self.config.budget_limit <= 0.0 {
            1.0
        } else {
            self.state.total_cost / self.config.budget_limit
        };
        let attempts = if self.config.max_attempts == 0 {
            1.0
        } else {
            f64::from(self.state.attempts) / f64::from(self.config.max_attempts)
        };
        cost.max(attempts)
    }

    /// Authorize one attempt and charge `cost_per_attempt`.
    ///
    /// Denied attempts create no record and charge nothing.
    pub fn authorize_attempt(&mut self) -> Result<AttemptRecord, BudgetExceeded> {
        if let Some(reason) = self.denial_reason() {
            debug!(?reason, attempts = self.state.attempts, "attempt denied");
            return Err(BudgetExceeded {
                reason,
                summary: self.summary(),
            });
        }

        let cost = self.config.cost_per_attempt;
        self.state.attempts += 1;
        self.state.total_cost += cost;
        self.touch();
        let level = self.refresh_level();

        let record = AttemptRecord {
            attempt_number: self.state.attempts,
            cost,
            remaining_budget: self.remaining_budget(),
            remaining_attempts: self.remaining_attempts(),
            escalation_level: level,
            overage: self.overage(),
        };
        debug!(
            attempt = record.attempt_number,
            remaining_budget = record.remaining_budget,
            level = %level,
            "attempt authorized"
        );
        self.records.push(record.clone());
        Ok(record)
    }

    pub fn record_success(&mut self) {
        self.state.successes += 1;
        self.touch();
        self.refresh_level();
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.state.failures += 1;
        debug!(attempt = self.state.attempts, reason, "attempt failed");
        self.touch();
        self.refresh_level();
    }

    /// Snapshot of the current consumption. Does not mutate state.
    pub fn summary(&self) -> BudgetSummary {
        let percent_used = if self.config.budget_limit <= 0.0 {
            100.0
        } else {
            self.state.total_cost / self.config.budget_limit * 100.0
        };
        BudgetSummary {
            attempts_used: self.state.attempts,
            max_attempts: self.config.max_attempts,
            successes: self.state.successes,
            failures: self.state.failures,
            cost_used: self.state.total_cost,
            budget_limit: self.config.budget_limit,
            percent_used,
            overage: self.overage(),
            elapsed_secs: self.state.elapsed.as_secs_f64(),
            level: self.state.level,
        }
    }

    fn overage(&self) -> f64 {
        (self.state.total_cost - self.config.budget_limit).max(0.0)
    }

    fn touch(&mut self) {
        self.state.elapsed = self.started.elapsed();
    }

    fn denial_reason(&self) -> Option<DenialReason> {
        if self.state.attempts >= self.config.max_attempts {
            return Some(DenialReason::MaxAttempts {
                max_attempts: self.config.max_attempts,
            });
        }
        if self.config.allow_budget_overflow {
            return None;
        }
        if self.projected_over_limit() {
            return Some(DenialReason::InsufficientBudget {
                remaining: self.remaining_budget(),
                required: self.config.cost_per_attempt,
            });
        }
        let usage = self.usage_fraction();
        if usage >= self.config.exceeded_threshold {
            return Some(DenialReason::Threshold {
                usage,
                threshold: self.config.exceeded_threshold,
            });
        }
        None
    }

    fn projected_over_limit(&self) -> bool {
        self.state.total_cost + self.config.cost_per_attempt > self.config.budget_limit
    }

    fn compute_level(&self) -> EscalationLevel {
        if self.state.attempts >= self.config.max_attempts
            || (!self.config.allow_budget_overflow && self.projected_over_limit())
        {
            return EscalationLevel::Exceeded;
        }
        let usage = self.usage_fraction();
        if usage >= self.config.exceeded_threshold {
            EscalationLevel::Exceeded
        } else if usage >= self.config.critical_threshold {
            EscalationLevel::Critical
        } else if usage >= self.config.warning_threshold {
            EscalationLevel::Warning
        } else {
            EscalationLevel::Normal
        }
    }

    fn refresh_level(&mut self) -> EscalationLevel {
        let level = self.compute_level();
        if level != self.state.level {
            debug!(from = %self.state.level, to = %level, "escalation level changed");
            self.state.level = level;
            if let Some(callback) = self.on_escalation.as_mut() {
                callback(level, &self.state);
            }
        }
        level
    }
}
