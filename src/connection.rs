//! Connection capability and the simple connection wrapper
//!
//! The core never talks to a database directly. It depends on the
//! [`RawConnection`] trait, an opaque capability the caller supplies:
//! driver-level begin/commit/rollback, statement execution, and session
//! parameter mutation. [`SimpleConnection`] composes a capability with the
//! transaction factory and session helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::error::{TxError, TxResult};
use crate::result::{QueryResult, RawQueryOutput};
use crate::transactions::{IsolationLevel, Transaction, TransactionConfig};

/// Session-level configuration applied outside of any transaction.
///
/// Unset fields leave the corresponding session parameter untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}

impl SessionOptions {
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }
}

/// Abstract connection capability consumed by the core.
///
/// Implementations own the wire protocol, timeouts, and cancellation; the
/// core treats every call as synchronous-and-possibly-blocking and adds no
/// policy of its own. The core never closes the connection.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Issue a driver-level BEGIN
    async fn begin(&mut self) -> TxResult<()>;

    /// Issue a driver-level COMMIT
    async fn commit(&mut self) -> TxResult<()>;

    /// Issue a driver-level ROLLBACK
    async fn rollback(&mut self) -> TxResult<()>;

    /// Execute a statement and report its outcome
    async fn execute(&mut self, statement: &str) -> TxResult<RawQueryOutput>;

    /// Apply session-level configuration
    async fn set_session(&mut self, options: &SessionOptions) -> TxResult<()>;

    /// Whether the driver currently has a transaction open
    fn in_transaction(&self) -> bool;
}

/// Connection state shared between a [`SimpleConnection`], its open
/// [`Transaction`], and that transaction's savepoints.
///
/// `tx_open` is the structural lock from the concurrency model: at most one
/// transaction may be open per connection, and only the innermost open
/// scope issues state-changing calls.
pub(crate) struct SessionShared {
    pub(crate) conn: AsyncMutex<Box<dyn RawConnection>>,
    pub(crate) tx_open: AtomicBool,
}

impl SessionShared {
    pub(crate) fn claim(&self) -> bool {
        self.tx_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.tx_open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_claimed(&self) -> bool {
        self.tx_open.load(Ordering::SeqCst)
    }
}

/// A database connection with transaction and session helpers.
///
/// Wraps a caller-supplied [`RawConnection`] and mediates all access to it:
/// `transaction()` hands out the single allowed [`Transaction`], and
/// `set_session` refuses to run while one is open.
pub struct SimpleConnection {
    session: Arc<SessionShared>,
}

impl SimpleConnection {
    /// Wrap a raw connection capability
    pub fn new<C>(conn: C) -> Self
    where
        C: RawConnection + 'static,
    {
        Self {
            session: Arc::new(SessionShared {
                conn: AsyncMutex::new(Box::new(conn)),
                tx_open: AtomicBool::new(false),
            }),
        }
    }

    /// Create a transaction bound to this connection with default settings.
    ///
    /// The transaction starts in `NotStarted` state; call
    /// [`Transaction::begin`] (or use [`crate::with_transaction`]) to issue
    /// the driver-level BEGIN. Fails if a transaction is already open on
    /// this connection.
    pub fn transaction(&self) -> TxResult<Transaction> {
        self.transaction_with(TransactionConfig::default())
    }

    /// Create a transaction with explicit configuration
    pub fn transaction_with(&self, config: TransactionConfig) -> TxResult<Transaction> {
        if self.session.is_claimed() {
            return Err(TxError::TransactionState(
                "connection already has an open transaction".to_string(),
            ));
        }
        Ok(Transaction::new(Arc::clone(&self.session), config))
    }

    /// Apply session-level configuration to the underlying connection.
    ///
    /// Session parameters that affect transaction behavior cannot change
    /// mid-transaction, so this fails while a transaction is open.
    pub async fn set_session(&self, options: SessionOptions) -> TxResult<()> {
        if self.session.is_claimed() {
            return Err(TxError::SessionState(
                "cannot change session parameters while a transaction is open".to_string(),
            ));
        }
        debug!(?options, "applying session options");
        let mut conn = self.session.conn.lock().await;
        conn.set_session(&options).await
    }

    /// Execute a statement outside of any managed scope
    pub async fn execute(&self, statement: &str) -> TxResult<QueryResult> {
        let mut conn = self.session.conn.lock().await;
        let raw = conn.execute(statement).await?;
        Ok(QueryResult::from_raw(raw))
    }

    /// Whether this connection currently has an open managed transaction
    pub fn in_transaction(&self) -> bool {
        self.session.is_claimed()
    }
}

impl std::fmt::Debug for SimpleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleConnection")
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;

    #[tokio::test]
    async fn test_set_session_reaches_capability_when_idle() {
        let rec = RecordingConnection::new();
        let conn = SimpleConnection::new(rec.clone());

        let options = SessionOptions::default()
            .isolation_level(IsolationLevel::Serializable)
            .read_only(true);
        conn.set_session(options).await.unwrap();

        assert_eq!(rec.session_log(), vec![options]);
    }

    #[tokio::test]
    async fn test_set_session_fails_while_transaction_open() {
        let rec = RecordingConnection::new();
        let conn = SimpleConnection::new(rec.clone());

        let tx = conn.transaction().unwrap();
        tx.begin().await.unwrap();

        let err = conn
            .set_session(SessionOptions::default().read_only(true))
            .await
            .unwrap_err();
        assert!(matches!(err, TxError::SessionState(_)));
        assert!(rec.session_log().is_empty());

        tx.rollback().await.unwrap();
        conn.set_session(SessionOptions::default().read_only(true))
            .await
            .unwrap();
        assert_eq!(rec.session_log().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_wraps_raw_output() {
        use crate::result::{Column, RawQueryOutput, SqlValue};

        let rec = RecordingConnection::new();
        rec.respond_with(
            "SELECT 1",
            RawQueryOutput {
                columns: vec![Column::new("?column?", "int4")],
                rows: vec![vec![SqlValue::Int32(1)]],
                rows_affected: 1,
            },
        );
        let conn = SimpleConnection::new(rec.clone());

        let result = conn.execute("SELECT 1").await.unwrap();
        assert_eq!(result.rows_affected(), 1);
        assert_eq!(result.rows()[0].get(0), Some(&SqlValue::Int32(1)));
        assert_eq!(rec.statements(), vec!["SELECT 1".to_string()]);
    }
}
