//! Transaction Management
//!
//! Nested transaction lifecycle: the outermost [`Transaction`] bound to
//! the real database transaction, [`Savepoint`] scopes stacked inside it,
//! and scoped helpers that guarantee exactly one resolution per scope.

pub mod isolation;
pub mod lifecycle;
pub mod savepoints;

pub use isolation::IsolationLevel;
pub use lifecycle::{
    with_transaction, with_transaction_default, Transaction, TransactionConfig, TransactionState,
};
pub use savepoints::{Savepoint, SavepointState};

use crate::connection::SimpleConnection;
use crate::error::TxResult;

/// Transaction builder for configuring transaction options
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    config: TransactionConfig,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.config.deferrable = deferrable;
        self
    }

    /// Create the transaction on `conn` and issue BEGIN immediately
    pub async fn begin(self, conn: &SimpleConnection) -> TxResult<Transaction> {
        let tx = conn.transaction_with(self.config)?;
        tx.begin().await?;
        Ok(tx)
    }
}
