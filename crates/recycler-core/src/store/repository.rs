//! Persistence seam for projects and build transactions.

use crate::errors::RecyclerResult;
use crate::models::project::Project;
use crate::models::transaction::{BuildTransaction, TxId};

/// One staged write. A unit of work collects these and applies them
/// together.
#[derive(Debug, Clone)]
pub enum Change {
    /// Registers the project. Membership follows each transaction's
    /// project, never the list carried here.
    PersistProject(Project),
    /// Also removes every transaction of the project.
    RemoveProject(String),
    PersistTransaction(BuildTransaction),
    RemoveTransaction(TxId),
}

pub trait Repository: Send + Sync {
    fn find_project(&self, name: &str) -> RecyclerResult<Option<Project>>;

    fn find_transaction(&self, id: TxId) -> RecyclerResult<Option<BuildTransaction>>;

    /// Transactions matching `filter`, in id order.
    fn query_transactions(
        &self,
        filter: &dyn Fn(&BuildTransaction) -> bool,
    ) -> RecyclerResult<Vec<BuildTransaction>>;

    fn list_projects(&self) -> RecyclerResult<Vec<String>>;

    /// Apply every change or none of them.
    fn apply(&self, changes: &[Change]) -> RecyclerResult<()>;

    fn transactions_of(&self, project: &str) -> RecyclerResult<Vec<BuildTransaction>> {
        self.query_transactions(&|tx| tx.project() == Some(project))
    }
}
