//! Monthly spending budgets for metered external services.

use super::ServiceKind;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Percentage thresholds that raise budget alerts. Reaching 100% is always
/// `budget_exceeded`, independent of these values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub warning_pct: f64,
    pub elevated_pct: f64,
    pub critical_pct: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_pct: 50.0,
            elevated_pct: 75.0,
            critical_pct: 90.0,
        }
    }
}

/// Alert flags for the user's total monthly budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetAlerts {
    pub warning: bool,
    pub elevated: bool,
    pub critical: bool,
    pub budget_exceeded: bool,
}

impl BudgetAlerts {
    fn evaluate(pct: f64, thresholds: &AlertThresholds) -> Self {
        Self {
            warning: pct >= thresholds.warning_pct,
            elevated: pct >= thresholds.elevated_pct,
            critical: pct >= thresholds.critical_pct,
            budget_exceeded: pct >= 100.0,
        }
    }

    /// Names of the flags set in `self` but not in `previous`.
    pub fn newly_raised(&self, previous: &BudgetAlerts) -> Vec<&'static str> {
        let mut raised = Vec::new();
        if self.warning && !previous.warning {
            raised.push("warning");
        }
        if self.elevated && !previous.elevated {
            raised.push("elevated");
        }
        if self.critical && !previous.critical {
            raised.push("critical");
        }
        if self.budget_exceeded && !previous.budget_exceeded {
            raised.push("budget_exceeded");
        }
        raised
    }
}

/// Which ceiling refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaType {
    /// The user's total monthly budget across all services.
    MonthlyBudget,
    /// The user's sub-budget for one service.
    ServiceBudget,
}

impl fmt::Display for QuotaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaType::MonthlyBudget => f.write_str("monthly_budget"),
            QuotaType::ServiceBudget => f.write_str("service_budget"),
        }
    }
}

/// Spend against one service within the period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceBudget {
    /// `None` when the service has no dedicated sub-budget.
    pub limit_usd: Option<f64>,
    pub spent_usd: f64,
    pub budget_exceeded: bool,
}

impl ServiceBudget {
    pub fn remaining_usd(&self) -> Option<f64> {
        self.limit_usd.map(|limit| (limit - self.spent_usd).max(0.0))
    }

    fn recompute(&mut self) {
        self.budget_exceeded = match self.limit_usd {
            Some(limit) => self.spent_usd >= limit,
            None => false,
        };
    }
}

/// A user's budget for the current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyApiBudget {
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub period_start: DateTime<Utc>,
    pub total_budget_usd: f64,
    pub spent_usd: f64,
    pub remaining_usd: f64,
    pub service_budgets: BTreeMap<ServiceKind, ServiceBudget>,
    pub alerts: BudgetAlerts,
}

impl MonthlyApiBudget {
    pub fn new(
        user_id: impl Into<String>,
        total_budget_usd: f64,
        service_limits: &BTreeMap<ServiceKind, f64>,
        thresholds: &AlertThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let service_budgets = service_limits
            .iter()
            .map(|(service, limit)| {
                let mut budget = ServiceBudget {
                    limit_usd: Some(*limit),
                    ..Default::default()
                };
                budget.recompute();
                (*service, budget)
            })
            .collect();

        let mut budget = Self {
            user_id: user_id.into(),
            period_start: month_start(now),
            total_budget_usd,
            spent_usd: 0.0,
            remaining_usd: total_budget_usd.max(0.0),
            service_budgets,
            alerts: BudgetAlerts::default(),
        };
        budget.recompute(thresholds);
        budget
    }

    /// Share of the total budget spent, in percent.
    pub fn utilization_pct(&self) -> f64 {
        if self.total_budget_usd > 0.0 {
            (self.spent_usd / self.total_budget_usd) * 100.0
        } else if self.spent_usd > 0.0 {
            f64::INFINITY
        } else {
            // A zero budget is exhausted before the first call.
            100.0
        }
    }

    /// Add `cost_usd` to the total and to `service`, then recompute every flag.
    /// Returns the alert flags raised by this charge.
    pub fn charge(
        &mut self,
        service: ServiceKind,
        cost_usd: f64,
        thresholds: &AlertThresholds,
    ) -> Vec<&'static str> {
        let previous = self.alerts;
        self.spent_usd += cost_usd;
        self.service_budgets.entry(service).or_default().spent_usd += cost_usd;
        self.recompute(thresholds);
        self.alerts.newly_raised(&previous)
    }

    pub fn recompute(&mut self, thresholds: &AlertThresholds) {
        self.remaining_usd = (self.total_budget_usd - self.spent_usd).max(0.0);
        self.alerts = BudgetAlerts::evaluate(self.utilization_pct(), thresholds);
        for budget in self.service_budgets.values_mut() {
            budget.recompute();
        }
    }

    /// The ceiling that blocks further calls to `service`, if any.
    pub fn exceeded_quota(&self, service: ServiceKind) -> Option<QuotaType> {
        if self.alerts.budget_exceeded {
            return Some(QuotaType::MonthlyBudget);
        }
        match self.service_budgets.get(&service) {
            Some(budget) if budget.budget_exceeded => Some(QuotaType::ServiceBudget),
            _ => None,
        }
    }

    /// Start a fresh period. Limits are kept, spend and flags are cleared.
    pub fn reset(&mut self, now: DateTime<Utc>, thresholds: &AlertThresholds) {
        self.period_start = month_start(now);
        self.spent_usd = 0.0;
        for budget in self.service_budgets.values_mut() {
            budget.spent_usd = 0.0;
        }
        self.service_budgets
            .retain(|_, budget| budget.limit_usd.is_some());
        self.recompute(thresholds);
    }
}

/// First instant of the calendar month containing `now`, UTC.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    first_of_month(now.year(), now.month()).unwrap_or(now)
}

/// First instant of the calendar month after the one containing `now`, UTC.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    first_of_month(year, month).unwrap_or(now)
}

fn first_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&midnight))
}
