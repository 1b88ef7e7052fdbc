//! ResourceLedger: the energy budget gating admission and synthesis
//!
//! `authorize` debits all-or-nothing; a refusal is backpressure, not an error.
//! The balance never goes negative.

use chrono::{DateTime, Utc};
use reverie_core::{LedgerEntry, LedgerReason};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Serializable view of the ledger, used by continuity snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balance: f64,
    pub history: Vec<LedgerEntry>,
    #[serde(default)]
    pub total_debited: f64,
    #[serde(default)]
    pub total_credited: f64,
}

#[derive(Debug, Clone)]
pub struct ResourceLedger {
    balance: f64,
    history: VecDeque<LedgerEntry>,
    history_capacity: usize,
    total_debited: f64,
    total_credited: f64,
}

impl ResourceLedger {
    pub fn new(initial_balance: f64, history_capacity: usize) -> Self {
        let balance = if initial_balance.is_finite() { initial_balance.max(0.0) } else { 0.0 };
        Self {
            balance,
            history: VecDeque::new(),
            history_capacity,
            total_debited: 0.0,
            total_credited: 0.0,
        }
    }

    /// Debit `cost` iff the balance covers it. Returns whether the debit happened.
    pub fn authorize(&mut self, cost: f64, reason: LedgerReason, at: DateTime<Utc>) -> bool {
        if !cost.is_finite() || cost < 0.0 {
            warn!("Refusing ledger debit with invalid cost {} ({:?})", cost, reason);
            return false;
        }
        if self.balance < cost {
            debug!("Ledger refused {:?}: cost {:.2} > balance {:.2}", reason, cost, self.balance);
            return false;
        }
        self.balance -= cost;
        self.total_debited += cost;
        self.record(-cost, reason, at);
        true
    }

    /// Credit `amount`. No upper bound; non-finite or negative amounts are ignored.
    pub fn credit(&mut self, amount: f64, reason: LedgerReason, at: DateTime<Utc>) {
        if !amount.is_finite() || amount < 0.0 {
            warn!("Ignoring ledger credit with invalid amount {} ({:?})", amount, reason);
            return;
        }
        self.balance += amount;
        self.total_credited += amount;
        self.record(amount, reason, at);
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    pub fn history(&self) -> Vec<LedgerEntry> {
        self.history.iter().cloned().collect()
    }

    pub fn total_debited(&self) -> f64 {
        self.total_debited
    }

    pub fn total_credited(&self) -> f64 {
        self.total_credited
    }

    pub fn state(&self) -> LedgerState {
        LedgerState {
            balance: self.balance,
            history: self.history(),
            total_debited: self.total_debited,
            total_credited: self.total_credited,
        }
    }

    /// Rebuild from a snapshot. The caller validates the balance first.
    pub fn from_state(state: LedgerState, history_capacity: usize) -> Self {
        let mut history: VecDeque<LedgerEntry> = state.history.into();
        while history.len() > history_capacity {
            history.pop_front();
        }
        Self {
            balance: state.balance,
            history,
            history_capacity,
            total_debited: state.total_debited,
            total_credited: state.total_credited,
        }
    }

    fn record(&mut self, delta: f64, reason: LedgerReason, timestamp: DateTime<Utc>) {
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() == self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(LedgerEntry { delta, reason, timestamp });
    }
}
