//! In-process repository, used by tests and single-node deployments.
//!
//! Project membership follows each transaction's project, as in the SQLite
//! store, so a stale copy of a project never drops ids on persist.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::project::Project;
use crate::models::transaction::{BuildTransaction, TxId};
use crate::store::repository::{Change, Repository};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    projects: BTreeMap<String, Project>,
    transactions: BTreeMap<TxId, BuildTransaction>,
}

impl MemoryState {
    fn apply(&mut self, change: &Change) -> RecyclerResult<()> {
        match change {
            Change::PersistProject(project) => {
                let name = project.name();
                if !self.projects.contains_key(name) {
                    let mut registered = Project::new(name);
                    for tx in self.transactions.values() {
                        if tx.project() == Some(name) {
                            registered.add_transaction(tx.id());
                        }
                    }
                    self.projects.insert(name.to_string(), registered);
                }
            }
            Change::RemoveProject(name) => {
                self.projects.remove(name);
                self.transactions
                    .retain(|_, tx| tx.project() != Some(name.as_str()));
            }
            Change::PersistTransaction(tx) => {
                if let Some(project) = tx.project() {
                    if !self.projects.contains_key(project) {
                        return Err(RecyclerError::NotFound(format!("project {project}")));
                    }
                }
                let moved_from = self
                    .transactions
                    .insert(tx.id(), tx.clone())
                    .and_then(|prev| prev.project().map(str::to_string))
                    .filter(|prev| Some(prev.as_str()) != tx.project());
                if let Some(prev) = moved_from.and_then(|p| self.projects.get_mut(&p)) {
                    prev.delete_transaction(tx.id());
                }
                if let Some(project) = tx.project().and_then(|p| self.projects.get_mut(p)) {
                    project.add_transaction(tx.id());
                }
            }
            Change::RemoveTransaction(id) => {
                if let Some(tx) = self.transactions.remove(id) {
                    if let Some(project) = tx.project().and_then(|p| self.projects.get_mut(p)) {
                        project.delete_transaction(*id);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn find_project(&self, name: &str) -> RecyclerResult<Option<Project>> {
        Ok(self.state.lock().projects.get(name).cloned())
    }

    fn find_transaction(&self, id: TxId) -> RecyclerResult<Option<BuildTransaction>> {
        Ok(self.state.lock().transactions.get(&id).cloned())
    }

    fn query_transactions(
        &self,
        filter: &dyn Fn(&BuildTransaction) -> bool,
    ) -> RecyclerResult<Vec<BuildTransaction>> {
        let state = self.state.lock();
        Ok(state
            .transactions
            .values()
            .filter(|tx| filter(tx))
            .cloned()
            .collect())
    }

    fn list_projects(&self) -> RecyclerResult<Vec<String>> {
        Ok(self.state.lock().projects.keys().cloned().collect())
    }

    fn apply(&self, changes: &[Change]) -> RecyclerResult<()> {
        let mut state = self.state.lock();
        let mut staged = state.clone();
        for change in changes {
            staged.apply(change)?;
        }
        *state = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::moment::Moment;

    fn tx_in(project: &str, secs: u64) -> BuildTransaction {
        let mut tx = BuildTransaction::new(TxId::from_millis(secs * 1000), Moment::now());
        tx.set_project(project);
        tx
    }

    fn project_with(name: &str, ids: &[u64]) -> Project {
        let mut project = Project::new(name);
        for id in ids {
            project.add_transaction(TxId::from_millis(id * 1000));
        }
        project
    }

    #[test]
    fn test_persist_and_find() {
        let repo = MemoryRepository::new();
        repo.apply(&[
            Change::PersistProject(project_with("widgets", &[1])),
            Change::PersistTransaction(tx_in("widgets", 1)),
        ])
        .unwrap();
        assert!(repo.find_project("widgets").unwrap().is_some());
        assert!(repo.find_transaction(TxId::from_millis(1000)).unwrap().is_some());
        assert_eq!(repo.list_projects().unwrap(), vec!["widgets".to_string()]);
        assert_eq!(repo.transactions_of("widgets").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_batch_changes_nothing() {
        let repo = MemoryRepository::new();
        let result = repo.apply(&[
            Change::PersistProject(project_with("widgets", &[])),
            Change::PersistTransaction(tx_in("gadgets", 1)),
        ]);
        assert!(matches!(result, Err(RecyclerError::NotFound(_))));
        assert!(repo.find_project("widgets").unwrap().is_none());
    }

    #[test]
    fn test_remove_project_cascades() {
        let repo = MemoryRepository::new();
        repo.apply(&[
            Change::PersistProject(project_with("widgets", &[1, 2])),
            Change::PersistProject(project_with("gadgets", &[3])),
            Change::PersistTransaction(tx_in("widgets", 1)),
            Change::PersistTransaction(tx_in("widgets", 2)),
            Change::PersistTransaction(tx_in("gadgets", 3)),
        ])
        .unwrap();
        repo.apply(&[Change::RemoveProject("widgets".to_string())]).unwrap();
        let left = repo.query_transactions(&|_| true).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].project(), Some("gadgets"));
    }

    #[test]
    fn test_stale_project_does_not_drop_members() {
        let repo = MemoryRepository::new();
        repo.apply(&[Change::PersistProject(project_with("widgets", &[]))]).unwrap();
        let stale = repo.find_project("widgets").unwrap().unwrap();

        repo.apply(&[Change::PersistTransaction(tx_in("widgets", 1))]).unwrap();
        repo.apply(&[
            Change::PersistProject(stale),
            Change::PersistTransaction(tx_in("widgets", 2)),
        ])
        .unwrap();

        let project = repo.find_project("widgets").unwrap().unwrap();
        assert_eq!(
            project.transactions(),
            &[TxId::from_millis(1000), TxId::from_millis(2000)]
        );
    }

    #[test]
    fn test_remove_transaction_updates_project() {
        let repo = MemoryRepository::new();
        repo.apply(&[
            Change::PersistProject(project_with("widgets", &[1, 2])),
            Change::PersistTransaction(tx_in("widgets", 1)),
            Change::PersistTransaction(tx_in("widgets", 2)),
        ])
        .unwrap();
        repo.apply(&[Change::RemoveTransaction(TxId::from_millis(2000))]).unwrap();
        let project = repo.find_project("widgets").unwrap().unwrap();
        assert_eq!(project.transactions(), &[TxId::from_millis(1000)]);
        repo.apply(&[Change::RemoveTransaction(TxId::from_millis(9000))]).unwrap();
    }
}
