//! Credit ledger gateway
//!
//! Pre-flight balance checks and post-success debits against the external
//! credit service.
//!
//! # Invariants
//!
//! - a debit is only requested for output that already exists in durable
//!   storage; the orchestrator enforces generate -> store -> debit
//! - each debit carries an idempotency key (`{item_id}:{attempt}`) and the
//!   gateway never sends the same key twice once it has settled
//! - a successful debit does not imply the balance was sufficient; the
//!   server re-validates and may reject

use crate::error::CreditError;
use async_trait::async_trait;
use atelier_asset::UserId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A debit sent to the credit service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitRequest {
    /// Account to charge
    pub user: UserId,
    /// Units to charge
    pub units: u64,
    /// Human-readable reason
    pub reason: String,
    /// Deduplication key
    pub idempotency_key: String,
}

/// Service acknowledgement of a debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitReceipt {
    /// Balance after the debit, when the service reports it
    pub balance_after: Option<u64>,
}

/// External credit service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CreditService: Send + Sync {
    /// Current balance for a user
    async fn balance(&self, user: &UserId) -> Result<u64, CreditError>;

    /// Charge a user
    async fn debit(&self, request: &DebitRequest) -> Result<DebitReceipt, CreditError>;
}

/// One settled debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Deduplication key
    pub idempotency_key: String,
    /// Units estimated from the analysis before generation
    pub units_requested: u64,
    /// Units actually charged, for outputs actually produced
    pub units_consumed: u64,
    /// Reason sent to the service
    pub reason: String,
    /// When the debit settled
    pub settled_at: DateTime<Utc>,
    /// Balance reported by the service
    pub balance_after: Option<u64>,
}

/// Outcome of a pre-flight check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceCheck {
    /// Units the work needs
    pub required: u64,
    /// Units the user has
    pub available: u64,
}

impl BalanceCheck {
    /// Whether the balance covers the requirement
    #[inline]
    #[must_use]
    pub fn is_sufficient(&self) -> bool {
        self.available >= self.required
    }
}

/// Gateway to the credit service for one user
#[derive(Clone)]
pub struct CreditLedgerGateway {
    service: Arc<dyn CreditService>,
    user: UserId,
    settled: Arc<DashMap<String, CreditTransaction>>,
}

impl std::fmt::Debug for CreditLedgerGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedgerGateway")
            .field("user", &self.user)
            .field("settled", &self.settled.len())
            .finish_non_exhaustive()
    }
}

impl CreditLedgerGateway {
    /// Create a gateway for `user`
    #[must_use]
    pub fn new(service: Arc<dyn CreditService>, user: UserId) -> Self {
        Self {
            service,
            user,
            settled: Arc::new(DashMap::new()),
        }
    }

    /// User this gateway charges
    #[inline]
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Fetch the balance and compare it to `units`
    ///
    /// # Errors
    /// Returns `CreditError` if the service cannot be reached
    pub async fn check_balance(&self, units: u64) -> Result<BalanceCheck, CreditError> {
        let available = self.service.balance(&self.user).await?;
        tracing::debug!(user_id = %self.user, required = units, available, "balance checked");
        Ok(BalanceCheck {
            required: units,
            available,
        })
    }

    /// Whether the user can afford `units`
    ///
    /// # Errors
    /// Returns `CreditError` if the service cannot be reached
    pub async fn has_sufficient_balance(&self, units: u64) -> Result<bool, CreditError> {
        Ok(self.check_balance(units).await?.is_sufficient())
    }

    /// Charge for produced output
    ///
    /// A key that already settled returns the earlier transaction without
    /// contacting the service.
    ///
    /// # Errors
    /// Returns `CreditError` if the service rejects or cannot be reached
    pub async fn debit(
        &self,
        idempotency_key: &str,
        units_requested: u64,
        units_consumed: u64,
        reason: &str,
    ) -> Result<CreditTransaction, CreditError> {
        if let Some(existing) = self.settled.get(idempotency_key) {
            tracing::debug!(key = idempotency_key, "debit already settled, skipping");
            return Ok(existing.value().clone());
        }

        let request = DebitRequest {
            user: self.user.clone(),
            units: units_consumed,
            reason: reason.to_string(),
            idempotency_key: idempotency_key.to_string(),
        };
        let receipt = self.service.debit(&request).await?;

        let transaction = CreditTransaction {
            idempotency_key: idempotency_key.to_string(),
            units_requested,
            units_consumed,
            reason: request.reason,
            settled_at: Utc::now(),
            balance_after: receipt.balance_after,
        };
        if units_consumed != units_requested {
            tracing::info!(
                key = idempotency_key,
                units_requested,
                units_consumed,
                "billed for actual outputs"
            );
        }
        self.settled
            .insert(idempotency_key.to_string(), transaction.clone());
        Ok(transaction)
    }

    /// Every settled transaction, oldest first
    #[must_use]
    pub fn transactions(&self) -> Vec<CreditTransaction> {
        let mut all: Vec<_> = self.settled.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|t| t.settled_at);
        all
    }

    /// Sum of units charged through this gateway
    #[must_use]
    pub fn total_debited(&self) -> u64 {
        self.settled.iter().map(|e| e.value().units_consumed).sum()
    }
}

/// In-process credit account
///
/// Used by the command-line driver and in tests. Re-validates the balance
/// on every debit, as a real service would.
#[derive(Debug)]
pub struct MemoryCreditService {
    balance: Mutex<u64>,
    keys: DashMap<String, DebitReceipt>,
}

impl MemoryCreditService {
    /// Create an account holding `balance`
    #[must_use]
    pub fn new(balance: u64) -> Self {
        Self {
            balance: Mutex::new(balance),
            keys: DashMap::new(),
        }
    }

    /// Current balance
    #[must_use]
    pub fn current(&self) -> u64 {
        *self.balance.lock()
    }

    /// Add credits
    pub fn top_up(&self, units: u64) {
        let mut balance = self.balance.lock();
        *balance = balance.saturating_add(units);
    }
}

#[async_trait]
impl CreditService for MemoryCreditService {
    async fn balance(&self, _user: &UserId) -> Result<u64, CreditError> {
        Ok(self.current())
    }

    async fn debit(&self, request: &DebitRequest) -> Result<DebitReceipt, CreditError> {
        if let Some(receipt) = self.keys.get(&request.idempotency_key) {
            return Ok(receipt.value().clone());
        }
        let receipt = {
            let mut balance = self.balance.lock();
            if *balance < request.units {
                return Err(CreditError::InsufficientBalance {
                    requested: request.units,
                    available: *balance,
                });
            }
            *balance -= request.units;
            DebitReceipt {
                balance_after: Some(*balance),
            }
        };
        self.keys
            .insert(request.idempotency_key.clone(), receipt.clone());
        Ok(receipt)
    }
}
