//! Savepoints: nested transaction scopes
//!
//! Every open transaction owns a [`SavepointManager`]: a strictly
//! increasing name counter, a LIFO stack of open savepoints, and an
//! append-only registry of every savepoint the transaction ever created.
//! The stack-top identity is the whole locking discipline — only the
//! innermost open savepoint may resolve, and the registry remembers
//! savepoints that an enclosing rollback invalidated so that late
//! resolution attempts fail with a dedicated error.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::connection::SessionShared;
use crate::error::{TxError, TxResult};
use crate::result::QueryResult;
use crate::transactions::lifecycle::{lock_ledger, TransactionState, TxLedger};

/// Lifecycle state of a single savepoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavepointState {
    /// Created and not yet resolved
    Open,
    /// Resolved by RELEASE SAVEPOINT
    Released,
    /// Resolved by ROLLBACK TO SAVEPOINT
    RolledBack,
    /// Invalidated by an enclosing rollback; can no longer be resolved
    Stale,
}

/// Savepoint bookkeeping embedded in every transaction.
///
/// Names are `sp_<counter>` with the counter strictly increasing for the
/// transaction's whole lifetime. A name is never reused, even after its
/// savepoint resolves, so the driver's savepoint namespace stays
/// unambiguous.
#[derive(Debug, Default)]
pub(crate) struct SavepointManager {
    counter: u64,
    stack: Vec<u64>,
    records: Vec<SavepointState>,
}

impl SavepointManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn name_of(id: u64) -> String {
        format!("sp_{}", id)
    }

    /// Allocate the next savepoint: unique id and name, pushed onto the
    /// stack. Returns the name of the previous stack top as the parent.
    pub(crate) fn allocate(&mut self) -> (u64, String, Option<String>) {
        let parent = self.stack.last().map(|&id| Self::name_of(id));
        self.counter += 1;
        let id = self.counter;
        self.records.push(SavepointState::Open);
        self.stack.push(id);
        (id, Self::name_of(id), parent)
    }

    pub(crate) fn state(&self, id: u64) -> SavepointState {
        self.records[(id - 1) as usize]
    }

    pub(crate) fn is_top(&self, id: u64) -> bool {
        self.stack.last() == Some(&id)
    }

    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Undo an allocation whose SAVEPOINT statement failed at the driver.
    pub(crate) fn discard_failed(&mut self, id: u64) {
        self.stack.retain(|&entry| entry != id);
        self.records[(id - 1) as usize] = SavepointState::Stale;
    }

    /// Validate that `id` may resolve right now: it must still be open and
    /// sit at the top of the stack.
    pub(crate) fn check_resolvable(&self, id: u64, name: &str) -> TxResult<()> {
        match self.state(id) {
            SavepointState::Open => {}
            SavepointState::Stale => {
                return Err(TxError::StaleSavepoint {
                    name: name.to_string(),
                })
            }
            SavepointState::Released | SavepointState::RolledBack => {
                return Err(TxError::TransactionState(format!(
                    "savepoint '{}' has already been resolved",
                    name
                )))
            }
        }
        if !self.is_top(id) {
            return Err(TxError::OutOfOrderResolution {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Record a RELEASE SAVEPOINT. Re-validates under the ledger lock so a
    /// concurrent resolution of a cloned handle cannot pop someone else's
    /// stack entry.
    pub(crate) fn mark_released(&mut self, id: u64, name: &str) -> TxResult<()> {
        self.check_resolvable(id, name)?;
        self.stack.pop();
        self.records[(id - 1) as usize] = SavepointState::Released;
        Ok(())
    }

    /// Record a ROLLBACK TO SAVEPOINT: the savepoint itself resolves, and
    /// every savepoint created after it no longer exists at the driver, so
    /// its registry entry turns stale.
    pub(crate) fn mark_rolled_back(&mut self, id: u64, name: &str) -> TxResult<()> {
        self.check_resolvable(id, name)?;
        self.stack.pop();
        self.records[(id - 1) as usize] = SavepointState::RolledBack;
        for record in self.records.iter_mut().skip(id as usize) {
            *record = SavepointState::Stale;
        }
        Ok(())
    }

    /// Record a transaction-level ROLLBACK: everything still on the stack
    /// is invalidated by the ancestor's rollback.
    pub(crate) fn invalidate_open(&mut self) {
        for &id in &self.stack {
            self.records[(id - 1) as usize] = SavepointState::Stale;
        }
        self.stack.clear();
    }
}

/// A nested transaction scope bound to a named database savepoint.
///
/// Handles are cheap clones over shared bookkeeping; the authoritative
/// state lives in the owning transaction's ledger.
#[derive(Clone)]
pub struct Savepoint {
    session: Arc<SessionShared>,
    ledger: Arc<Mutex<TxLedger>>,
    id: u64,
    name: String,
    parent: Option<String>,
}

impl Savepoint {
    /// The unique savepoint name, `sp_<n>`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the enclosing savepoint, or `None` at the first level
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Current lifecycle state
    pub fn state(&self) -> SavepointState {
        lock_ledger(&self.ledger).savepoints.state(self.id)
    }

    fn check_resolvable(&self) -> TxResult<()> {
        lock_ledger(&self.ledger)
            .savepoints
            .check_resolvable(self.id, &self.name)
    }

    /// Commit this nested scope: issues `RELEASE SAVEPOINT <name>`.
    ///
    /// Valid only while open and at the top of the stack.
    pub async fn release(&self) -> TxResult<()> {
        self.check_resolvable()?;
        debug!(savepoint = %self.name, "releasing savepoint");
        {
            let mut conn = self.session.conn.lock().await;
            conn.execute(&format!("RELEASE SAVEPOINT {}", self.name))
                .await?;
        }
        lock_ledger(&self.ledger)
            .savepoints
            .mark_released(self.id, &self.name)
    }

    /// Roll back this nested scope: issues `ROLLBACK TO SAVEPOINT <name>`.
    ///
    /// The connection's logical state returns to the point just after this
    /// savepoint was created; savepoints created after it become stale.
    pub async fn rollback(&self) -> TxResult<()> {
        self.check_resolvable()?;
        debug!(savepoint = %self.name, "rolling back to savepoint");
        {
            let mut conn = self.session.conn.lock().await;
            conn.execute(&format!("ROLLBACK TO SAVEPOINT {}", self.name))
                .await?;
        }
        lock_ledger(&self.ledger)
            .savepoints
            .mark_rolled_back(self.id, &self.name)
    }

    /// Create a further-nested savepoint on the same shared stack
    pub async fn savepoint(&self) -> TxResult<Savepoint> {
        create_savepoint(
            &self.session,
            &self.ledger,
            Some((self.id, self.name.as_str())),
        )
        .await
    }

    /// Run `f` inside a child savepoint scope: released on `Ok`, rolled
    /// back on `Err`, with the original error propagated.
    pub async fn with_savepoint<F, Fut, R>(&self, f: F) -> TxResult<R>
    where
        F: FnOnce(Savepoint) -> Fut,
        Fut: Future<Output = TxResult<R>>,
    {
        let sp = self.savepoint().await?;
        run_scope(sp, f).await
    }

    /// Execute a statement while this savepoint is open
    pub async fn execute(&self, statement: &str) -> TxResult<QueryResult> {
        match self.state() {
            SavepointState::Open => {}
            SavepointState::Stale => {
                return Err(TxError::StaleSavepoint {
                    name: self.name.clone(),
                })
            }
            _ => {
                return Err(TxError::TransactionState(format!(
                    "savepoint '{}' has already been resolved",
                    self.name
                )))
            }
        }
        let mut conn = self.session.conn.lock().await;
        let raw = conn.execute(statement).await?;
        Ok(QueryResult::from_raw(raw))
    }
}

impl std::fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Savepoint")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("state", &self.state())
            .finish()
    }
}

/// Allocate a savepoint in the ledger and issue `SAVEPOINT <name>`.
///
/// `created_by` carries the creating savepoint (if any) so a resolved or
/// stale handle cannot spawn children.
pub(crate) async fn create_savepoint(
    session: &Arc<SessionShared>,
    ledger: &Arc<Mutex<TxLedger>>,
    created_by: Option<(u64, &str)>,
) -> TxResult<Savepoint> {
    let (id, name, parent) = {
        let mut guard = lock_ledger(ledger);
        if guard.state != TransactionState::Open {
            return Err(TxError::TransactionState(
                "cannot create a savepoint outside an open transaction".to_string(),
            ));
        }
        if let Some((creator_id, creator_name)) = created_by {
            match guard.savepoints.state(creator_id) {
                SavepointState::Open => {}
                SavepointState::Stale => {
                    return Err(TxError::StaleSavepoint {
                        name: creator_name.to_string(),
                    })
                }
                _ => {
                    return Err(TxError::TransactionState(format!(
                        "savepoint '{}' has already been resolved",
                        creator_name
                    )))
                }
            }
        }
        guard.savepoints.allocate()
    };

    debug!(savepoint = %name, parent = ?parent, "creating savepoint");
    let outcome = {
        let mut conn = session.conn.lock().await;
        conn.execute(&format!("SAVEPOINT {}", name)).await
    };
    if let Err(err) = outcome {
        lock_ledger(ledger).savepoints.discard_failed(id);
        return Err(err);
    }

    Ok(Savepoint {
        session: Arc::clone(session),
        ledger: Arc::clone(ledger),
        id,
        name,
        parent,
    })
}

/// Scope runner shared by `Transaction::with_savepoint` and
/// `Savepoint::with_savepoint`: exactly one of release or rollback runs on
/// every exit path.
pub(crate) async fn run_scope<F, Fut, R>(sp: Savepoint, f: F) -> TxResult<R>
where
    F: FnOnce(Savepoint) -> Fut,
    Fut: Future<Output = TxResult<R>>,
{
    match f(sp.clone()).await {
        Ok(value) => match sp.release().await {
            Ok(()) => Ok(value),
            Err(err) => {
                if let Err(rb_err) = sp.rollback().await {
                    debug!(error = %rb_err, "savepoint rollback during scope unwind failed");
                }
                Err(err)
            }
        },
        Err(err) => {
            if let Err(rb_err) = sp.rollback().await {
                debug!(error = %rb_err, "savepoint rollback during scope unwind failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique_across_resolutions() {
        let mut mgr = SavepointManager::new();
        let mut names = Vec::new();

        let (id1, name1, _) = mgr.allocate();
        mgr.mark_released(id1, &name1).unwrap();
        names.push(name1);

        let (id2, name2, _) = mgr.allocate();
        mgr.mark_rolled_back(id2, &name2).unwrap();
        names.push(name2);

        let (_, name3, _) = mgr.allocate();
        names.push(name3);

        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        for name in &names {
            assert!(name.starts_with("sp_"));
            assert!(name["sp_".len()..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_parent_is_previous_stack_top() {
        let mut mgr = SavepointManager::new();
        let (_, name1, parent1) = mgr.allocate();
        assert_eq!(parent1, None);

        let (id2, name2, parent2) = mgr.allocate();
        assert_eq!(parent2, Some(name1.clone()));
        mgr.mark_released(id2, &name2).unwrap();

        let (_, _, parent3) = mgr.allocate();
        assert_eq!(parent3, Some(name1));
    }

    #[test]
    fn test_rollback_invalidates_later_entries() {
        let mut mgr = SavepointManager::new();
        let (id1, name1, _) = mgr.allocate();
        let (id2, name2, _) = mgr.allocate();
        mgr.mark_released(id2, &name2).unwrap();
        mgr.mark_rolled_back(id1, &name1).unwrap();

        assert_eq!(mgr.state(id1), SavepointState::RolledBack);
        assert_eq!(mgr.state(id2), SavepointState::Stale);
        assert_eq!(mgr.depth(), 0);
    }

    #[test]
    fn test_transaction_rollback_invalidates_stack() {
        let mut mgr = SavepointManager::new();
        let (id1, _, _) = mgr.allocate();
        let (id2, _, _) = mgr.allocate();
        mgr.invalidate_open();

        assert_eq!(mgr.state(id1), SavepointState::Stale);
        assert_eq!(mgr.state(id2), SavepointState::Stale);
        assert_eq!(mgr.depth(), 0);
    }

    #[test]
    fn test_top_of_stack_tracking() {
        let mut mgr = SavepointManager::new();
        let (id1, _, _) = mgr.allocate();
        let (id2, name2, _) = mgr.allocate();
        assert!(!mgr.is_top(id1));
        assert!(mgr.is_top(id2));
        mgr.mark_released(id2, &name2).unwrap();
        assert!(mgr.is_top(id1));
    }

    #[test]
    fn test_marking_revalidates_under_the_lock() {
        let mut mgr = SavepointManager::new();
        let (id1, name1, _) = mgr.allocate();
        let (id2, name2, _) = mgr.allocate();

        // not at the top of the stack
        assert!(matches!(
            mgr.mark_released(id1, &name1),
            Err(TxError::OutOfOrderResolution { .. })
        ));
        assert_eq!(mgr.state(id1), SavepointState::Open);
        assert_eq!(mgr.depth(), 2);

        mgr.mark_released(id2, &name2).unwrap();

        // a second resolution of the same entry loses the race cleanly
        assert!(matches!(
            mgr.mark_released(id2, &name2),
            Err(TxError::TransactionState(_))
        ));
        assert!(mgr.is_top(id1));
        mgr.mark_rolled_back(id1, &name1).unwrap();
    }
}
