//! Test doubles for the connection capability
//!
//! [`RecordingConnection`] is an in-memory [`RawConnection`] that journals
//! every statement it sees, tracks driver-level transaction status, and can
//! be scripted to answer or fail specific statements. Clones share the same
//! interior, so a probe kept by the test keeps observing the connection
//! after it moves into a [`crate::SimpleConnection`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::connection::{RawConnection, SessionOptions};
use crate::error::{TxError, TxResult};
use crate::result::RawQueryOutput;

/// Driver failure injected by [`RecordingConnection::fail_on`]
#[derive(Debug, thiserror::Error)]
#[error("injected failure for '{statement}'")]
pub struct InjectedFailure {
    pub statement: String,
}

#[derive(Debug, Default)]
struct RecorderState {
    statements: Vec<String>,
    session_log: Vec<SessionOptions>,
    responses: HashMap<String, RawQueryOutput>,
    failures: HashSet<String>,
    in_transaction: bool,
}

/// Scripted in-memory connection capability
#[derive(Debug, Clone, Default)]
pub struct RecordingConnection {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script a canned result for an exact statement
    pub fn respond_with(&self, statement: &str, output: RawQueryOutput) {
        self.lock().responses.insert(statement.to_string(), output);
    }

    /// Make an exact statement (or `BEGIN`/`COMMIT`/`ROLLBACK`) fail with
    /// an [`InjectedFailure`]
    pub fn fail_on(&self, statement: &str) {
        self.lock().failures.insert(statement.to_string());
    }

    /// Every statement issued so far, in order, including the driver-level
    /// `BEGIN`/`COMMIT`/`ROLLBACK` markers
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    /// Every `set_session` call observed so far
    pub fn session_log(&self) -> Vec<SessionOptions> {
        self.lock().session_log.clone()
    }

    fn record(&self, statement: &str) -> TxResult<()> {
        let mut state = self.lock();
        if state.failures.contains(statement) {
            return Err(TxError::driver(InjectedFailure {
                statement: statement.to_string(),
            }));
        }
        state.statements.push(statement.to_string());
        Ok(())
    }
}

#[async_trait]
impl RawConnection for RecordingConnection {
    async fn begin(&mut self) -> TxResult<()> {
        self.record("BEGIN")?;
        self.lock().in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> TxResult<()> {
        self.record("COMMIT")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> TxResult<()> {
        self.record("ROLLBACK")?;
        self.lock().in_transaction = false;
        Ok(())
    }

    async fn execute(&mut self, statement: &str) -> TxResult<RawQueryOutput> {
        self.record(statement)?;
        let state = self.lock();
        Ok(state.responses.get(statement).cloned().unwrap_or_default())
    }

    async fn set_session(&mut self, options: &SessionOptions) -> TxResult<()> {
        self.lock().session_log.push(*options);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }
}
