//! # txscope: nested transaction management
//!
//! A small library that lets application code open a transaction on a
//! database connection it already holds, nest further logical transactions
//! as savepoints, and have each nested scope commit or roll back
//! independently while the outermost scope governs the real driver-level
//! commit or rollback.
//!
//! The database itself stays out of scope: the core depends on the opaque
//! [`RawConnection`] capability (begin/commit/rollback, statement
//! execution, session configuration) and never implements pooling, SQL
//! translation, or a wire protocol.
//!
//! ## Usage
//!
//! ```
//! use txscope::testing::RecordingConnection;
//! use txscope::{with_transaction_default, SimpleConnection, TxResult};
//!
//! # async fn example() -> TxResult<()> {
//! let conn = SimpleConnection::new(RecordingConnection::new());
//!
//! with_transaction_default(&conn, |tx| async move {
//!     tx.execute("INSERT INTO audit DEFAULT VALUES").await?;
//!     tx.with_savepoint(|sp| async move {
//!         sp.execute("UPDATE accounts SET balance = balance - 1").await?;
//!         Ok(())
//!     })
//!     .await
//! })
//! .await?;
//! # Ok(())
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(example()).unwrap();
//! ```
//!
//! Scopes resolve exactly once on every exit path: `Ok` commits (releases),
//! `Err` rolls back, and the error keeps propagating unchanged.

pub mod connection;
pub mod error;
pub mod result;
pub mod testing;
pub mod transactions;


// Re-export core traits and types
pub use connection::{RawConnection, SessionOptions, SimpleConnection};
pub use error::{TxError, TxResult};
pub use result::{Column, QueryResult, RawQueryOutput, Row, SqlValue};
pub use transactions::{
    with_transaction, with_transaction_default, IsolationLevel, Savepoint, SavepointState,
    Transaction, TransactionBuilder, TransactionConfig, TransactionState,
};
