//! Per-run resource counters.
//!
//! A counter is incremented first and then compared with its ceiling, so
//! with a limit of N the (N+1)th attempt is the one rejected: N operations
//! are admitted and the run fails on the next.

use serde::Serialize;
use thiserror::Error;

use crate::config::ExecutionLimits;
use crate::models::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetCounter {
    DbQueries,
    ApiCalls,
    EmailsSent,
    StepsExecuted,
}

impl BudgetCounter {
    /// The kind-specific counter charged for a step, if any.
    pub fn for_step(kind: StepType) -> Option<Self> {
        if kind.is_data_access() {
            Some(Self::DbQueries)
        } else if kind.is_external_call() {
            Some(Self::ApiCalls)
        } else if kind.is_email() {
            Some(Self::EmailsSent)
        } else {
            None
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::DbQueries => "database queries",
            Self::ApiCalls => "API calls",
            Self::EmailsSent => "emails",
            Self::StepsExecuted => "steps executed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("too many {} (max: {limit})", .counter.label())]
pub struct BudgetExceeded {
    pub counter: BudgetCounter,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionBudget {
    #[serde(skip)]
    limits: ExecutionLimits,
    pub db_queries: u32,
    pub api_calls: u32,
    pub emails_sent: u32,
    pub steps_executed: u32,
}

impl ExecutionBudget {
    pub fn new(limits: &ExecutionLimits) -> Self {
        Self {
            limits: limits.clone(),
            db_queries: 0,
            api_calls: 0,
            emails_sent: 0,
            steps_executed: 0,
        }
    }

    pub fn charge(&mut self, counter: BudgetCounter) -> Result<(), BudgetExceeded> {
        let (count, limit) = match counter {
            BudgetCounter::DbQueries => (&mut self.db_queries, self.limits.max_db_queries),
            BudgetCounter::ApiCalls => (&mut self.api_calls, self.limits.max_api_calls),
            BudgetCounter::EmailsSent => (&mut self.emails_sent, self.limits.max_emails),
            BudgetCounter::StepsExecuted => (&mut self.steps_executed, self.limits.max_steps),
        };
        *count = count.saturating_add(1);
        if *count > limit {
            return Err(BudgetExceeded { counter, limit });
        }
        Ok(())
    }

    pub fn used(&self, counter: BudgetCounter) -> u32 {
        match counter {
            BudgetCounter::DbQueries => self.db_queries,
            BudgetCounter::ApiCalls => self.api_calls,
            BudgetCounter::EmailsSent => self.emails_sent,
            BudgetCounter::StepsExecuted => self.steps_executed,
        }
    }
}
