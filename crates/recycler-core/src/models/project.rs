//! Projects group build transactions that share a container namespace.

use crate::models::transaction::TxId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    name: String,
    transactions: Vec<TxId>,
}

impl Project {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transactions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transaction ids in the order they joined the project.
    pub fn transactions(&self) -> &[TxId] {
        &self.transactions
    }

    /// Ids stay in ascending order whatever order they arrive in.
    pub fn add_transaction(&mut self, id: TxId) {
        if let Err(at) = self.transactions.binary_search(&id) {
            self.transactions.insert(at, id);
        }
    }

    pub fn delete_transaction(&mut self, id: TxId) -> bool {
        let before = self.transactions.len();
        self.transactions.retain(|t| *t != id);
        before != self.transactions.len()
    }

    pub fn most_recent(&self) -> Option<TxId> {
        self.transactions.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let mut project = Project::new("widgets");
        assert!(project.is_empty());
        assert_eq!(project.most_recent(), None);

        project.add_transaction(TxId::from_millis(1_000));
        project.add_transaction(TxId::from_millis(2_000));
        project.add_transaction(TxId::from_millis(1_000));
        assert_eq!(project.transactions().len(), 2);
        assert_eq!(project.most_recent(), Some(TxId::from_millis(2_000)));

        assert!(project.delete_transaction(TxId::from_millis(2_000)));
        assert!(!project.delete_transaction(TxId::from_millis(2_000)));
        assert_eq!(project.most_recent(), Some(TxId::from_millis(1_000)));
    }
}
