//! Per-user spend accounting against monthly budgets.
//!
//! Each user's ledger sits under its own `DashMap` key, scoped to the tenant,
//! so recording usage for one user never blocks another. A ledger only
//! changes through [`CostTracker::reserve`], [`CostTracker::record_usage`],
//! the explicit reset entry points and budget overrides.

use crate::config::BudgetConfig;
use crate::error::OrchestrationError;
use crate::models::{next_month_start, MonthlyApiBudget, QuotaType, ServiceKind, UsageRecord};
use crate::services::metrics;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type LedgerKey = (String, String);

fn ledger_key(tenant_id: &str, user_id: &str) -> LedgerKey {
    (tenant_id.to_string(), user_id.to_string())
}

#[derive(Debug, Clone)]
struct UserLedger {
    budget: MonthlyApiBudget,
    usage: Vec<UsageRecord>,
    /// Cost held for calls that passed the check but are not billed yet.
    held_usd: f64,
    held_by_service: BTreeMap<ServiceKind, f64>,
    in_flight: usize,
}

impl UserLedger {
    fn new(budget: MonthlyApiBudget) -> Self {
        Self {
            budget,
            usage: Vec::new(),
            held_usd: 0.0,
            held_by_service: BTreeMap::new(),
            in_flight: 0,
        }
    }

    /// The ceiling that blocks another call to `service`, counting held cost
    /// as already spent.
    fn blocking_quota(&self, service: ServiceKind) -> Option<QuotaType> {
        if let Some(quota_type) = self.budget.exceeded_quota(service) {
            return Some(quota_type);
        }
        if self.in_flight == 0 {
            return None;
        }
        if self.budget.spent_usd + self.held_usd >= self.budget.total_budget_usd {
            return Some(QuotaType::MonthlyBudget);
        }
        let held = self.held_by_service.get(&service).copied().unwrap_or(0.0);
        match self.budget.service_budgets.get(&service) {
            Some(sub) => match sub.limit_usd {
                Some(limit) if held > 0.0 && sub.spent_usd + held >= limit => {
                    Some(QuotaType::ServiceBudget)
                }
                _ => None,
            },
            None => None,
        }
    }

    fn hold(&mut self, service: ServiceKind, amount: f64) {
        self.in_flight += 1;
        self.held_usd += amount;
        *self.held_by_service.entry(service).or_default() += amount;
    }

    fn release(&mut self, service: ServiceKind, amount: f64) {
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.held_usd = 0.0;
            self.held_by_service.clear();
            return;
        }
        self.held_usd = (self.held_usd - amount).max(0.0);
        if let Some(held) = self.held_by_service.get_mut(&service) {
            *held = (*held - amount).max(0.0);
        }
    }
}

/// Cost held against a user's budget for one call in flight.
///
/// Settle it with [`BudgetReservation::settle`] once the call has an outcome.
/// Dropping it unsettled releases the hold without billing anything.
#[must_use = "an unsettled reservation releases its hold when dropped"]
pub struct BudgetReservation {
    tracker: Arc<CostTracker>,
    key: LedgerKey,
    service: ServiceKind,
    amount_usd: f64,
    settled: bool,
}

impl BudgetReservation {
    pub fn amount_usd(&self) -> f64 {
        self.amount_usd
    }

    /// Release the hold and bill `record`, in one step under the ledger lock.
    pub fn settle(mut self, record: UsageRecord) -> MonthlyApiBudget {
        self.settled = true;
        self.tracker
            .apply(record, Some((self.service, self.amount_usd)))
    }
}

impl Drop for BudgetReservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(mut ledger) = self.tracker.ledgers.get_mut(&self.key) {
            ledger.release(self.service, self.amount_usd);
        }
        tracing::debug!(
            tenant_id = %self.key.0,
            user_id = %self.key.1,
            service = %self.service,
            "Released unbilled budget hold"
        );
    }
}

pub struct CostTracker {
    ledgers: DashMap<LedgerKey, UserLedger>,
    config: BudgetConfig,
    prices: HashMap<ServiceKind, f64>,
}

impl CostTracker {
    /// `prices` is the cost charged per call to each service.
    pub fn new(config: BudgetConfig, prices: HashMap<ServiceKind, f64>) -> Self {
        Self {
            ledgers: DashMap::new(),
            config,
            prices,
        }
    }

    pub fn cost_of(&self, service: ServiceKind) -> f64 {
        self.prices.get(&service).copied().unwrap_or(0.0)
    }

    fn default_budget(&self, user_id: &str) -> MonthlyApiBudget {
        MonthlyApiBudget::new(
            user_id,
            self.config.monthly_budget_usd,
            &self.config.service_budgets_usd,
            &self.config.alert_thresholds,
            Utc::now(),
        )
    }

    fn refuse(&self, user_id: &str, service: ServiceKind, quota_type: QuotaType) -> OrchestrationError {
        tracing::warn!(
            user_id = %user_id,
            service = %service,
            quota_type = %quota_type,
            "Budget exhausted, refusing billable call"
        );
        metrics::record_quota_denial(service.as_str(), &quota_type.to_string());
        OrchestrationError::QuotaExceeded {
            service,
            quota_type,
            reset_time: next_month_start(Utc::now()),
        }
    }

    /// Refuse with `QuotaExceeded` when the user's total budget or their
    /// sub-budget for `service` is spent or held by calls in flight. Does not
    /// record anything.
    pub fn ensure_within_budget(
        &self,
        tenant_id: &str,
        user_id: &str,
        service: ServiceKind,
    ) -> Result<(), OrchestrationError> {
        let blocking = match self.ledgers.get(&ledger_key(tenant_id, user_id)) {
            Some(ledger) => ledger.blocking_quota(service),
            None => self.default_budget(user_id).exceeded_quota(service),
        };

        match blocking {
            None => Ok(()),
            Some(quota_type) => Err(self.refuse(user_id, service, quota_type)),
        }
    }

    /// Check the budget and hold `amount_usd` against it under the same
    /// ledger lock, so concurrent calls cannot all pass on the same headroom.
    pub fn reserve(
        self: &Arc<Self>,
        tenant_id: &str,
        user_id: &str,
        service: ServiceKind,
        amount_usd: f64,
    ) -> Result<BudgetReservation, OrchestrationError> {
        let key = ledger_key(tenant_id, user_id);
        let mut ledger = self
            .ledgers
            .entry(key.clone())
            .or_insert_with(|| UserLedger::new(self.default_budget(user_id)));

        if let Some(quota_type) = ledger.blocking_quota(service) {
            drop(ledger);
            return Err(self.refuse(user_id, service, quota_type));
        }
        ledger.hold(service, amount_usd);
        drop(ledger);

        Ok(BudgetReservation {
            tracker: Arc::clone(self),
            key,
            service,
            amount_usd,
            settled: false,
        })
    }

    /// Append `record` and charge its cost, atomically for the user.
    /// Returns the budget after the charge.
    pub fn record_usage(&self, record: UsageRecord) -> MonthlyApiBudget {
        self.apply(record, None)
    }

    fn apply(&self, record: UsageRecord, release: Option<(ServiceKind, f64)>) -> MonthlyApiBudget {
        let thresholds = self.config.alert_thresholds;
        let mut ledger = self
            .ledgers
            .entry(ledger_key(&record.tenant_id, &record.user_id))
            .or_insert_with(|| UserLedger::new(self.default_budget(&record.user_id)));

        if let Some((service, amount)) = release {
            ledger.release(service, amount);
        }
        let raised = ledger
            .budget
            .charge(record.service, record.cost_usd, &thresholds);
        let budget = ledger.budget.clone();

        tracing::debug!(
            user_id = %record.user_id,
            tenant_id = %record.tenant_id,
            service = %record.service,
            operation = %record.operation,
            cost_usd = record.cost_usd,
            outcome = ?record.outcome,
            spent_usd = budget.spent_usd,
            "Recorded API usage"
        );
        metrics::record_cost(record.service.as_str(), record.cost_usd);
        ledger.usage.push(record);
        drop(ledger);

        for level in raised {
            tracing::warn!(
                user_id = %budget.user_id,
                alert = level,
                spent_usd = budget.spent_usd,
                total_budget_usd = budget.total_budget_usd,
                utilization_pct = budget.utilization_pct(),
                "Budget alert threshold crossed"
            );
            metrics::record_budget_alert(level);
        }

        budget
    }

    /// Current budget for the user. Pure read: an unknown user gets the
    /// default budget without a ledger being created.
    pub fn get_budget_status(&self, tenant_id: &str, user_id: &str) -> MonthlyApiBudget {
        match self.ledgers.get(&ledger_key(tenant_id, user_id)) {
            Some(ledger) => ledger.budget.clone(),
            None => self.default_budget(user_id),
        }
    }

    /// Override the monthly total and per-service ceilings for one user.
    /// Spend already recorded this period is carried over.
    pub fn set_user_budget(
        &self,
        tenant_id: &str,
        user_id: &str,
        total_budget_usd: f64,
        service_budgets_usd: BTreeMap<ServiceKind, f64>,
    ) -> MonthlyApiBudget {
        let thresholds = self.config.alert_thresholds;
        let mut ledger = self
            .ledgers
            .entry(ledger_key(tenant_id, user_id))
            .or_insert_with(|| UserLedger::new(self.default_budget(user_id)));

        let previous = &ledger.budget;
        let mut budget = MonthlyApiBudget::new(
            user_id,
            total_budget_usd,
            &service_budgets_usd,
            &thresholds,
            previous.period_start,
        );
        budget.spent_usd = previous.spent_usd;
        for (service, spent) in &previous.service_budgets {
            budget.service_budgets.entry(*service).or_default().spent_usd = spent.spent_usd;
        }
        budget.recompute(&thresholds);

        tracing::info!(
            tenant_id = %tenant_id,
            user_id = %user_id,
            total_budget_usd,
            "Budget override applied"
        );
        ledger.budget = budget.clone();
        budget
    }

    /// Start a new period for one user. Safe to call repeatedly; usage
    /// history is kept.
    pub fn reset(&self, tenant_id: &str, user_id: &str) {
        if let Some(mut ledger) = self.ledgers.get_mut(&ledger_key(tenant_id, user_id)) {
            ledger.budget.reset(Utc::now(), &self.config.alert_thresholds);
            tracing::info!(tenant_id = %tenant_id, user_id = %user_id, "Budget period reset");
        }
    }

    /// Reset every tracked user. Returns the number of ledgers reset.
    pub fn reset_all(&self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for mut ledger in self.ledgers.iter_mut() {
            ledger.budget.reset(now, &self.config.alert_thresholds);
            count += 1;
        }
        tracing::info!(users = count, "Budget period reset for all users");
        count
    }

    pub fn usage_records(&self, tenant_id: &str, user_id: &str) -> Vec<UsageRecord> {
        self.ledgers
            .get(&ledger_key(tenant_id, user_id))
            .map(|ledger| ledger.usage.clone())
            .unwrap_or_default()
    }

    pub fn total_usage_records(&self) -> usize {
        self.ledgers.iter().map(|ledger| ledger.usage.len()).sum()
    }
}
