//! Predecessor traversal inside one transaction.
//!
//! Starting from a path touch, find for each prerequisite of its command the
//! most recent earlier touch of the same path that wrote it, then continue
//! from that writer's command. Each command is visited at most once.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::models::action::PathTouch;
use crate::models::transaction::BuildTransaction;

/// A touch addressed by record position and touch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TouchRef {
    pub record: usize,
    pub touch: usize,
}

impl TouchRef {
    pub fn new(record: usize, touch: usize) -> Self {
        Self { record, touch }
    }
}

/// Lookup collaborator for the traversal.
pub trait PathHistory {
    fn touch(&self, at: TouchRef) -> Option<&PathTouch>;

    fn touch_count(&self, record: usize) -> usize;

    /// Every touch of `path`, ordered by path state, oldest first.
    fn history(&self, path: &str) -> Vec<TouchRef>;
}

/// History of one transaction, indexed by path up front.
pub struct TransactionHistory<'a> {
    tx: &'a BuildTransaction,
    by_path: HashMap<&'a str, Vec<TouchRef>>,
}

impl<'a> TransactionHistory<'a> {
    pub fn new(tx: &'a BuildTransaction) -> Self {
        let mut by_path: HashMap<&'a str, Vec<TouchRef>> = HashMap::new();
        for (r, record) in tx.audit_records().iter().enumerate() {
            for (t, touch) in record.touches().iter().enumerate() {
                by_path
                    .entry(touch.state().path_str())
                    .or_default()
                    .push(TouchRef::new(r, t));
            }
        }

        let records = tx.audit_records();
        for refs in by_path.values_mut() {
            // Stable: equal states keep record order.
            refs.sort_by(|a, b| {
                let sa = records[a.record].touches()[a.touch].state();
                let sb = records[b.record].touches()[b.touch].state();
                sa.sort_key().cmp(&sb.sort_key())
            });
        }
        Self { tx, by_path }
    }
}

impl PathHistory for TransactionHistory<'_> {
    fn touch(&self, at: TouchRef) -> Option<&PathTouch> {
        self.tx.audit_records().get(at.record)?.touches().get(at.touch)
    }

    fn touch_count(&self, record: usize) -> usize {
        self.tx
            .audit_records()
            .get(record)
            .map(|r| r.touches().len())
            .unwrap_or(0)
    }

    fn history(&self, path: &str) -> Vec<TouchRef> {
        self.by_path.get(path).cloned().unwrap_or_default()
    }
}

/// Map from record to the touch that linked it in, starting with `start`.
/// Insertion order is depth-first discovery order.
pub fn find_predecessors(
    history: &dyn PathHistory,
    start: TouchRef,
    members_only: bool,
) -> IndexMap<usize, usize> {
    let mut actions: IndexMap<usize, usize> = IndexMap::new();
    actions.insert(start.record, start.touch);

    // (record, next touch to examine)
    let mut stack: Vec<(usize, usize)> = vec![(start.record, 0)];

    while let Some((record, cursor)) = stack.pop() {
        let count = history.touch_count(record);
        let mut next = cursor;
        while next < count {
            let here = TouchRef::new(record, next);
            next += 1;

            let Some(prereq) = history.touch(here) else {
                continue;
            };
            if prereq.is_target() || (members_only && !prereq.is_member()) {
                continue;
            }

            let found = predecessor(history, prereq.state().path_str(), here, &actions);
            if let Some(writer) = found {
                actions.insert(writer.record, writer.touch);
                stack.push((record, next));
                stack.push((writer.record, 0));
                break;
            }
        }
    }
    actions
}

/// The closest earlier writer of `path` whose record is not yet visited.
fn predecessor(
    history: &dyn PathHistory,
    path: &str,
    here: TouchRef,
    visited: &IndexMap<usize, usize>,
) -> Option<TouchRef> {
    let prevs = history.history(path);
    let i = prevs.iter().position(|r| *r == here)?;
    prevs[..i].iter().rev().copied().find(|candidate| {
        !visited.contains_key(&candidate.record)
            && history.touch(*candidate).is_some_and(|t| t.is_target())
    })
}
