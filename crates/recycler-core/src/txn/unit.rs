//! Unit of work: staged writes applied together, plus at most one
//! transaction lock held until commit or rollback.

use tracing::debug;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::project::Project;
use crate::models::transaction::{BuildTransaction, TxId};
use crate::store::repository::{Change, Repository};
use crate::txn::locks::{TxLockHandle, TxLockRegistry};

pub struct UnitOfWork<'a> {
    repo: &'a dyn Repository,
    locks: &'a TxLockRegistry,
    held: Option<TxLockHandle<'a>>,
    staged: Vec<Change>,
    finished: bool,
}

impl<'a> UnitOfWork<'a> {
    pub fn begin(repo: &'a dyn Repository, locks: &'a TxLockRegistry) -> Self {
        Self {
            repo,
            locks,
            held: None,
            staged: Vec::new(),
            finished: false,
        }
    }

    /// Sees this unit's own staged writes before the repository.
    pub fn find_project(&self, name: &str) -> RecyclerResult<Option<Project>> {
        for change in self.staged.iter().rev() {
            match change {
                Change::PersistProject(p) if p.name() == name => return Ok(Some(p.clone())),
                Change::RemoveProject(n) if n == name => return Ok(None),
                _ => {}
            }
        }
        self.repo.find_project(name)
    }

    pub fn find_transaction(&self, id: TxId) -> RecyclerResult<Option<BuildTransaction>> {
        for change in self.staged.iter().rev() {
            match change {
                Change::PersistTransaction(tx) if tx.id() == id => return Ok(Some(tx.clone())),
                Change::RemoveTransaction(r) if *r == id => return Ok(None),
                _ => {}
            }
        }
        self.repo.find_transaction(id)
    }

    /// Lock `id` for the rest of this unit and load it. Only one lock per
    /// unit is supported.
    pub fn lock_and_fetch(&mut self, id: TxId) -> RecyclerResult<BuildTransaction> {
        if let Some(held) = &self.held {
            return Err(RecyclerError::Concurrency(format!(
                "Multiple locking is not supported: holding {}, asked for {}",
                held.id(),
                id
            )));
        }
        let locks = self.locks;
        let handle = locks.acquire(id);
        match self.find_transaction(id)? {
            Some(tx) => {
                self.held = Some(handle);
                Ok(tx)
            }
            None => Err(RecyclerError::NotFound(format!("transaction {id}"))),
        }
    }

    pub fn locked(&self) -> Option<TxId> {
        self.held.as_ref().map(TxLockHandle::id)
    }

    pub fn persist_project(&mut self, project: Project) {
        self.staged.push(Change::PersistProject(project));
    }

    pub fn persist_transaction(&mut self, tx: BuildTransaction) {
        self.staged.push(Change::PersistTransaction(tx));
    }

    pub fn remove_project(&mut self, name: &str) {
        self.staged.push(Change::RemoveProject(name.to_string()));
    }

    pub fn remove_transaction(&mut self, id: TxId) {
        self.staged.push(Change::RemoveTransaction(id));
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Apply every staged change, then release the lock. The lock is
    /// released even when the apply fails.
    pub fn commit(mut self) -> RecyclerResult<()> {
        self.finished = true;
        let staged = std::mem::take(&mut self.staged);
        let result = if staged.is_empty() {
            Ok(())
        } else {
            self.repo.apply(&staged)
        };
        self.held = None;
        result
    }

    pub fn rollback(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        self.finished = true;
        if !self.staged.is_empty() {
            debug!("Rolled back {} staged changes", self.staged.len());
            self.staged.clear();
        }
        self.held = None;
    }
}

impl Drop for UnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
