//! Usage metering: the debit path for billable actions.
//!
//! Called synchronously *before* the billable work (an external AI call) is
//! dispatched. If `authorized` comes back false the caller must not perform
//! the work — debiting after the fact would reopen the double-spend race
//! this subsystem exists to close, so there is deliberately no "charge
//! later" API here.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ledger::LedgerStore;

/// The billable actions of the product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillableAction {
    /// AI analysis of an uploaded document.
    Analysis,
    /// AI improvement/rewrite pass.
    Improvement,
    /// Tailoring a document to a specific job posting.
    JobTailoring,
    /// LinkedIn profile analysis.
    LinkedinAnalysis,
}

impl BillableAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Improvement => "improvement",
            Self::JobTailoring => "job_tailoring",
            Self::LinkedinAnalysis => "linkedin_analysis",
        }
    }

    /// Default credit cost. Improvement and tailoring run heavier prompts.
    #[must_use]
    pub fn default_cost(&self) -> i64 {
        match self {
            Self::Analysis => 1,
            Self::Improvement => 2,
            Self::JobTailoring => 2,
            Self::LinkedinAnalysis => 1,
        }
    }
}

impl std::fmt::Display for BillableAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-action cost table with optional overrides over the defaults.
#[derive(Debug, Clone, Default)]
pub struct ActionCosts {
    overrides: HashMap<BillableAction, i64>,
}

impl ActionCosts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the cost of one action.
    #[must_use]
    pub fn with_cost(mut self, action: BillableAction, cost: i64) -> Self {
        self.overrides.insert(action, cost);
        self
    }

    /// Cost of an action in credits.
    #[must_use]
    pub fn cost(&self, action: BillableAction) -> i64 {
        self.overrides
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_cost())
    }
}

/// Result of a charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChargeOutcome {
    /// Whether the caller may perform the billable work.
    pub authorized: bool,
    /// Balance after the charge (unchanged when unauthorized).
    pub balance: i64,
    /// Credits this action costs.
    pub cost: i64,
}

/// Meters billable actions against the ledger.
pub struct UsageMeter<L: LedgerStore> {
    ledger: Arc<L>,
    costs: ActionCosts,
}

impl<L: LedgerStore> UsageMeter<L> {
    #[must_use]
    pub fn new(ledger: Arc<L>, costs: ActionCosts) -> Self {
        Self { ledger, costs }
    }

    /// Charge for an action. Atomic: either the full cost is debited and
    /// the action is authorized, or nothing changes. An unauthorized
    /// outcome is never retried with a smaller amount.
    pub async fn charge(&self, user_id: &str, action: BillableAction) -> Result<ChargeOutcome> {
        let cost = self.costs.cost(action);
        self.charge_cost(user_id, cost, action.as_str()).await
    }

    /// Charge an explicit cost under a free-form label.
    pub async fn charge_cost(
        &self,
        user_id: &str,
        cost: i64,
        label: &str,
    ) -> Result<ChargeOutcome> {
        let outcome = self.ledger.debit(user_id, cost, label).await?;

        if !outcome.applied {
            tracing::info!(
                target: "tollgate::metering",
                user_id = %user_id,
                action = %label,
                cost,
                balance = outcome.balance,
                "Action rejected: insufficient credits"
            );
        }

        Ok(ChargeOutcome {
            authorized: outcome.applied,
            balance: outcome.balance,
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;

    fn meter() -> (Arc<InMemoryLedgerStore>, UsageMeter<InMemoryLedgerStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let meter = UsageMeter::new(ledger.clone(), ActionCosts::new());
        (ledger, meter)
    }

    #[tokio::test]
    async fn test_fresh_user_not_authorized() {
        let (_, meter) = meter();
        let outcome = meter.charge("u1", BillableAction::Improvement).await.unwrap();
        assert!(!outcome.authorized);
        assert_eq!(outcome.balance, 0);
        assert_eq!(outcome.cost, 2);
    }

    #[tokio::test]
    async fn test_charge_debits_full_cost() {
        let (ledger, meter) = meter();
        ledger.grant("u1", 5, "pay_1", "starter").await.unwrap();

        let outcome = meter.charge("u1", BillableAction::Improvement).await.unwrap();
        assert!(outcome.authorized);
        assert_eq!(outcome.balance, 3);

        let outcome = meter.charge("u1", BillableAction::Analysis).await.unwrap();
        assert!(outcome.authorized);
        assert_eq!(outcome.balance, 2);
    }

    #[tokio::test]
    async fn test_rejection_changes_nothing() {
        let (ledger, meter) = meter();
        ledger.grant("u1", 1, "pay_1", "starter").await.unwrap();

        // Costs 2, only 1 available: rejected outright, never partially
        // debited or silently downgraded.
        let outcome = meter.charge("u1", BillableAction::JobTailoring).await.unwrap();
        assert!(!outcome.authorized);
        assert_eq!(outcome.balance, 1);
        assert_eq!(ledger.balance("u1").await.unwrap(), 1);
        assert_eq!(ledger.entries("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cost_overrides() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let meter = UsageMeter::new(
            ledger.clone(),
            ActionCosts::new().with_cost(BillableAction::Analysis, 3),
        );
        ledger.grant("u1", 5, "pay_1", "starter").await.unwrap();

        let outcome = meter.charge("u1", BillableAction::Analysis).await.unwrap();
        assert!(outcome.authorized);
        assert_eq!(outcome.cost, 3);
        assert_eq!(outcome.balance, 2);

        // Untouched actions keep their defaults.
        assert_eq!(meter.costs.cost(BillableAction::Improvement), 2);
    }

    #[tokio::test]
    async fn test_debit_entries_carry_action_label() {
        let (ledger, meter) = meter();
        ledger.grant("u1", 5, "pay_1", "starter").await.unwrap();
        meter.charge("u1", BillableAction::LinkedinAnalysis).await.unwrap();

        let entries = ledger.entries("u1", 1).await.unwrap();
        assert_eq!(entries[0].reason, "linkedin_analysis");
        assert_eq!(entries[0].amount, -1);
    }

    #[tokio::test]
    async fn test_concurrent_charges_never_overspend() {
        let (ledger, meter) = meter();
        ledger.grant("u1", 3, "pay_1", "starter").await.unwrap();
        let meter = Arc::new(meter);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let meter = meter.clone();
            handles.push(tokio::spawn(async move {
                meter.charge("u1", BillableAction::Improvement).await.unwrap()
            }));
        }

        let mut authorized = 0;
        for handle in handles {
            if handle.await.unwrap().authorized {
                authorized += 1;
            }
        }

        // Two tabs, six clicks, 3 credits at cost 2: exactly one goes through.
        assert_eq!(authorized, 1);
        assert_eq!(ledger.balance("u1").await.unwrap(), 1);
    }
}
