//! The single write path for stock.
//!
//! ```text
//! MovementRequest (already validated: magnitude, kind)
//!   ↓
//! 1. Product exists and is active, actor exists and is active
//!   ↓
//! 2. begin: lock the product row, read its balance
//!   ↓
//! 3. next_balance(balance, signed) -> InsufficientStock when negative
//!   ↓
//! 4. append movement, apply delta to the balance (conditional on the read)
//!   ↓
//! 5. commit both, or roll back both
//! ```
//!
//! The balance is re-read after the lock is held, so two issues racing on the
//! same product are checked one after the other against the real balance.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use stockledger_core::{MovementId, ProductId, UserId};
use stockledger_inventory::{MovementError, MovementKind, MovementRequest, RawMovementInput, next_balance};

use crate::store::{StockStore, StockTransaction, StoreError};

/// Default wait for a product's write lock before reporting `Busy`.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(2000);

/// Outcome of a committed movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedMovement {
    pub movement_id: MovementId,
    pub new_balance: i64,
}

#[derive(Debug)]
pub struct MovementService<S: ?Sized> {
    store: Arc<S>,
    lock_wait: Duration,
}

impl<S: ?Sized> Clone for MovementService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            lock_wait: self.lock_wait,
        }
    }
}

impl<S: StockStore + ?Sized> MovementService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn lock_wait(&self) -> Duration {
        self.lock_wait
    }

    /// Validate loose boundary input, then record it.
    pub async fn record_raw(&self, raw: &RawMovementInput) -> Result<RecordedMovement, MovementError> {
        let request = MovementRequest::parse(raw)?;
        self.record(&request).await
    }

    /// Record from individual fields; magnitude is validated here.
    pub async fn record_movement(
        &self,
        product_id: ProductId,
        actor_id: UserId,
        kind: MovementKind,
        magnitude: i64,
        note: Option<String>,
    ) -> Result<RecordedMovement, MovementError> {
        let request = MovementRequest::new(product_id, actor_id, kind, magnitude, note)?;
        self.record(&request).await
    }

    /// Apply one movement to the ledger and the balance as a single unit.
    ///
    /// On any error nothing was persisted.
    #[instrument(
        skip(self, request),
        fields(
            product_id = %request.product_id(),
            actor_id = %request.actor_id(),
            kind = request.kind().as_str(),
            magnitude = request.magnitude().get(),
        )
    )]
    pub async fn record(&self, request: &MovementRequest) -> Result<RecordedMovement, MovementError> {
        let result = self.record_inner(request).await;
        match &result {
            Ok(recorded) => info!(
                movement_id = %recorded.movement_id,
                new_balance = recorded.new_balance,
                "movement recorded"
            ),
            Err(err @ MovementError::Storage(_)) => error!(error = %err, "movement failed"),
            Err(err) => warn!(error = %err, "movement rejected"),
        }
        result
    }

    async fn record_inner(&self, request: &MovementRequest) -> Result<RecordedMovement, MovementError> {
        self.check_preconditions(request).await?;

        let mut tx = match self.store.begin(request.product_id(), self.lock_wait).await {
            Ok(tx) => tx,
            Err(StoreError::NotFound(_)) => return Err(MovementError::ProductInactiveOrMissing),
            Err(err) => return Err(err.into()),
        };

        match apply(tx.as_mut(), request).await {
            Ok(recorded) => Ok(recorded),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn check_preconditions(&self, request: &MovementRequest) -> Result<(), MovementError> {
        let product = self.store.get_product(request.product_id()).await?;
        if !product.is_some_and(|p| p.active) {
            return Err(MovementError::ProductInactiveOrMissing);
        }

        let actor = self.store.get_user(request.actor_id()).await?;
        if !actor.is_some_and(|u| u.can_act()) {
            return Err(MovementError::ActorMissing);
        }
        Ok(())
    }
}

async fn apply(
    tx: &mut dyn StockTransaction,
    request: &MovementRequest,
) -> Result<RecordedMovement, MovementError> {
    let locked = *tx.locked();
    // Deactivation may have committed between the precheck and the lock.
    if !locked.active {
        return Err(MovementError::ProductInactiveOrMissing);
    }

    let signed = request.signed_quantity();
    let candidate = next_balance(locked.balance, signed)?;

    let movement_id = tx.append(request.to_new_movement()).await?;
    let new_balance = tx
        .apply_delta(locked.product_id, signed, locked.balance)
        .await?;
    if new_balance != candidate {
        return Err(MovementError::Storage(format!(
            "balance moved to {new_balance}, expected {candidate}"
        )));
    }

    tx.commit().await?;

    Ok(RecordedMovement {
        movement_id,
        new_balance,
    })
}
