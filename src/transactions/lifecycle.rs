//! Transaction lifecycle
//!
//! The outermost scoped unit bound to the real database transaction. A
//! `Transaction` owns the savepoint ledger; every state-changing call is
//! validated against the ledger before any statement reaches the
//! connection, so a nesting-discipline violation never aborts the
//! underlying transaction.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::connection::{RawConnection, SessionShared, SimpleConnection};
use crate::error::{TxError, TxResult};
use crate::result::QueryResult;
use crate::transactions::isolation::IsolationLevel;
use crate::transactions::savepoints::{create_savepoint, run_scope, Savepoint, SavepointManager};

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Open,
    Committed,
    RolledBack,
}

/// Transaction configuration options applied right after BEGIN
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Transaction isolation level; `None` keeps the session default
    pub isolation_level: Option<IsolationLevel>,
    /// Whether the transaction is read-only
    pub read_only: bool,
    /// Whether the transaction is deferrable
    pub deferrable: bool,
}

/// Per-transaction bookkeeping: the state machine plus the savepoint
/// manager. Guarded by a std mutex that is never held across driver calls.
#[derive(Debug)]
pub(crate) struct TxLedger {
    pub(crate) state: TransactionState,
    pub(crate) savepoints: SavepointManager,
}

pub(crate) fn lock_ledger(ledger: &Mutex<TxLedger>) -> MutexGuard<'_, TxLedger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The outermost scoped transaction unit.
///
/// Obtained from [`SimpleConnection::transaction`]; `begin()` issues the
/// real BEGIN, `commit()`/`rollback()` resolve it exactly once, and
/// `savepoint()` opens nested scopes on the shared LIFO stack.
pub struct Transaction {
    session: Arc<SessionShared>,
    ledger: Arc<Mutex<TxLedger>>,
    config: TransactionConfig,
    scoped: bool,
}

impl Transaction {
    pub(crate) fn new(session: Arc<SessionShared>, config: TransactionConfig) -> Self {
        Self {
            session,
            ledger: Arc::new(Mutex::new(TxLedger {
                state: TransactionState::NotStarted,
                savepoints: SavepointManager::new(),
            })),
            config,
            scoped: false,
        }
    }

    /// Internal duplicate handed to scope closures; shares all state but
    /// never warns on drop.
    pub(crate) fn scoped_handle(&self) -> Transaction {
        Transaction {
            session: Arc::clone(&self.session),
            ledger: Arc::clone(&self.ledger),
            config: self.config,
            scoped: true,
        }
    }

    /// Issue the real BEGIN and transition to `Open`.
    ///
    /// Fails if this transaction already began or resolved, if the
    /// connection already carries an open transaction, or if the driver
    /// itself reports one. If a transaction-characteristics statement fails
    /// after BEGIN, the transaction is rolled back and the connection is
    /// released before the driver error surfaces.
    pub async fn begin(&self) -> TxResult<()> {
        {
            let guard = lock_ledger(&self.ledger);
            match guard.state {
                TransactionState::NotStarted => {}
                TransactionState::Open => {
                    return Err(TxError::TransactionState(
                        "transaction has already begun".to_string(),
                    ))
                }
                _ => {
                    return Err(TxError::TransactionState(
                        "transaction has already been resolved".to_string(),
                    ))
                }
            }
        }
        if !self.session.claim() {
            return Err(TxError::TransactionState(
                "connection already has an open transaction".to_string(),
            ));
        }

        let mut conn = self.session.conn.lock().await;
        if conn.in_transaction() {
            self.session.release();
            return Err(TxError::TransactionState(
                "connection is already inside a driver-level transaction".to_string(),
            ));
        }
        debug!(config = ?self.config, "beginning transaction");
        if let Err(err) = conn.begin().await {
            self.session.release();
            return Err(err);
        }
        lock_ledger(&self.ledger).state = TransactionState::Open;

        // Transaction characteristics must be set before the first statement.
        // A failure here must not leave the driver mid-transaction or the
        // connection claimed, so the BEGIN is unwound before the error
        // surfaces.
        if let Err(err) = apply_characteristics(&mut **conn, &self.config).await {
            if let Err(rb_err) = conn.rollback().await {
                debug!(error = %rb_err, "rollback after failed transaction characteristics failed");
            }
            lock_ledger(&self.ledger).state = TransactionState::RolledBack;
            self.session.release();
            return Err(err);
        }
        Ok(())
    }

    /// Issue the real COMMIT and transition to `Committed`.
    ///
    /// All nested savepoints must have resolved first; committing over an
    /// open savepoint is a nesting-discipline violation and leaves the
    /// connection in-transaction.
    pub async fn commit(&self) -> TxResult<()> {
        {
            let guard = lock_ledger(&self.ledger);
            match guard.state {
                TransactionState::Open => {}
                TransactionState::NotStarted => {
                    return Err(TxError::TransactionState(
                        "cannot commit a transaction that has not begun".to_string(),
                    ))
                }
                _ => {
                    return Err(TxError::TransactionState(
                        "transaction has already been resolved".to_string(),
                    ))
                }
            }
            let depth = guard.savepoints.depth();
            if depth > 0 {
                return Err(TxError::TransactionState(format!(
                    "cannot commit with {} unresolved savepoint(s)",
                    depth
                )));
            }
        }
        debug!("committing transaction");
        {
            let mut conn = self.session.conn.lock().await;
            conn.commit().await?;
        }
        lock_ledger(&self.ledger).state = TransactionState::Committed;
        self.session.release();
        Ok(())
    }

    /// Issue the real ROLLBACK and transition to `RolledBack`.
    ///
    /// Savepoints still on the stack are invalidated: the driver-level
    /// rollback discards them, so later resolution attempts fail with
    /// [`TxError::StaleSavepoint`].
    pub async fn rollback(&self) -> TxResult<()> {
        {
            let guard = lock_ledger(&self.ledger);
            match guard.state {
                TransactionState::Open => {}
                TransactionState::NotStarted => {
                    return Err(TxError::TransactionState(
                        "cannot roll back a transaction that has not begun".to_string(),
                    ))
                }
                _ => {
                    return Err(TxError::TransactionState(
                        "transaction has already been resolved".to_string(),
                    ))
                }
            }
        }
        debug!("rolling back transaction");
        {
            let mut conn = self.session.conn.lock().await;
            conn.rollback().await?;
        }
        {
            let mut guard = lock_ledger(&self.ledger);
            guard.savepoints.invalidate_open();
            guard.state = TransactionState::RolledBack;
        }
        self.session.release();
        Ok(())
    }

    /// Open a nested scope: issues `SAVEPOINT sp_<n>` and pushes it onto
    /// the stack. Only valid while the transaction is open.
    pub async fn savepoint(&self) -> TxResult<Savepoint> {
        create_savepoint(&self.session, &self.ledger, None).await
    }

    /// Run `f` inside a savepoint scope: released on `Ok`, rolled back on
    /// `Err`, with the original error propagated.
    pub async fn with_savepoint<F, Fut, R>(&self, f: F) -> TxResult<R>
    where
        F: FnOnce(Savepoint) -> Fut,
        Fut: Future<Output = TxResult<R>>,
    {
        let sp = self.savepoint().await?;
        run_scope(sp, f).await
    }

    /// Execute a statement inside the open transaction
    pub async fn execute(&self, statement: &str) -> TxResult<QueryResult> {
        {
            let guard = lock_ledger(&self.ledger);
            if guard.state != TransactionState::Open {
                return Err(TxError::TransactionState(
                    "transaction is not open".to_string(),
                ));
            }
        }
        let mut conn = self.session.conn.lock().await;
        let raw = conn.execute(statement).await?;
        Ok(QueryResult::from_raw(raw))
    }

    /// Current transaction state
    pub fn state(&self) -> TransactionState {
        lock_ledger(&self.ledger).state
    }

    /// Check if the transaction is currently open
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Open
    }

    /// Number of unresolved savepoints on the stack
    pub fn depth(&self) -> usize {
        lock_ledger(&self.ledger).savepoints.depth()
    }

    /// The configuration this transaction was created with
    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.scoped {
            return;
        }
        if lock_ledger(&self.ledger).state == TransactionState::Open {
            warn!("transaction dropped while still open; an explicit commit or rollback is required");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .field("depth", &self.depth())
            .field("config", &self.config)
            .finish()
    }
}

async fn apply_characteristics(
    conn: &mut dyn RawConnection,
    config: &TransactionConfig,
) -> TxResult<()> {
    if let Some(level) = config.isolation_level {
        conn.execute(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            level.as_sql()
        ))
        .await?;
    }
    if config.read_only {
        conn.execute("SET TRANSACTION READ ONLY").await?;
    }
    if config.deferrable {
        conn.execute("SET TRANSACTION DEFERRABLE").await?;
    }
    Ok(())
}

/// Run `f` inside a transaction scope with guaranteed resolution.
///
/// Begins a transaction, hands a handle to `f`, and resolves on every exit
/// path: `Ok` commits, `Err` rolls back and returns the original error
/// unchanged. A failed commit is followed by a best-effort rollback so the
/// connection never stays claimed. No retries: transaction failures are
/// application-visible.
pub async fn with_transaction<F, Fut, R>(
    conn: &SimpleConnection,
    config: TransactionConfig,
    f: F,
) -> TxResult<R>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = TxResult<R>>,
{
    let tx = conn.transaction_with(config)?;
    tx.begin().await?;
    match f(tx.scoped_handle()).await {
        Ok(value) => match tx.commit().await {
            Ok(()) => Ok(value),
            Err(err) => {
                if let Err(rb_err) = tx.rollback().await {
                    debug!(error = %rb_err, "transaction rollback during scope unwind failed");
                }
                Err(err)
            }
        },
        Err(err) => {
            if let Err(rb_err) = tx.rollback().await {
                debug!(error = %rb_err, "transaction rollback during scope unwind failed");
            }
            Err(err)
        }
    }
}

/// [`with_transaction`] with default configuration
pub async fn with_transaction_default<F, Fut, R>(conn: &SimpleConnection, f: F) -> TxResult<R>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = TxResult<R>>,
{
    with_transaction(conn, TransactionConfig::default(), f).await
}
