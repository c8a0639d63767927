//! Which transactions go into a roadmap.

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::transaction::BuildTransaction;
use crate::models::wire::FS1;

/// Quotas as `total,label,user,host`. A negative quota is unset.
///
/// Selection stops once the label, user and host quotas are all set and
/// met and the total quota is met as well. With any of the three unset,
/// every eligible transaction is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strategy {
    pub total: i32,
    pub label: i32,
    pub user: i32,
    pub host: i32,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            total: -1,
            label: -1,
            user: -1,
            host: -1,
        }
    }
}

impl Strategy {
    /// Leading fields are positional; missing trailing fields stay unset.
    pub fn parse(text: &str) -> RecyclerResult<Self> {
        let fields: Vec<&str> = text.split(FS1).collect();
        if fields.len() > 4 {
            return Err(RecyclerError::malformed("too many strategy fields", text));
        }
        let mut values = [-1i32; 4];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field
                .trim()
                .parse()
                .map_err(|_| RecyclerError::malformed("bad strategy quota", text))?;
        }
        let [total, label, user, host] = values;
        Ok(Self {
            total,
            label,
            user,
            host,
        })
    }

    fn satisfied(&self, total: i32, label: i32, user: i32, host: i32) -> bool {
        let met = |max: i32, count: i32| max >= 0 && count >= max;
        met(self.label, label) && met(self.user, user) && met(self.host, host) && total >= self.total
    }

    /// Walk `newest_first`, skipping transactions that are still running or
    /// uploaded nothing.
    pub fn choose<'a>(
        &self,
        newest_first: &'a [BuildTransaction],
        log_name: Option<&str>,
        host_name: Option<&str>,
    ) -> Vec<&'a BuildTransaction> {
        let (mut total, mut label, mut user, mut host) = (0, 0, 0, 0);
        let mut chosen = Vec::new();

        for tx in newest_first {
            if tx.uploaded_count() == 0 || !tx.is_done() {
                continue;
            }
            chosen.push(tx);

            if tx.is_labeled() {
                label += 1;
            }
            if log_name.is_some() && tx.host.log_name.as_deref() == log_name {
                user += 1;
            }
            if host_name.is_some() && tx.host.host_name.as_deref() == host_name {
                host += 1;
            }
            total += 1;

            if self.satisfied(total, label, user, host) {
                break;
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::moment::Moment;
    use crate::models::transaction::TxId;

    fn finished(secs: u64, user: &str, host: &str, label: Option<&str>) -> BuildTransaction {
        let mut tx = BuildTransaction::new(TxId::from_millis(secs * 1000), Moment::now());
        tx.host.log_name = Some(user.to_string());
        tx.host.host_name = Some(host.to_string());
        if let Some(label) = label {
            tx.set_label(label);
        }
        tx.bump_uploaded_count();
        tx.set_result(true);
        tx
    }

    fn ids(chosen: &[&BuildTransaction]) -> Vec<u64> {
        chosen.iter().map(|tx| tx.id().millis() / 1000).collect()
    }

    #[test]
    fn test_parse_fills_leading_fields() {
        assert_eq!(
            Strategy::parse("10,1,2,3").unwrap(),
            Strategy { total: 10, label: 1, user: 2, host: 3 }
        );
        assert_eq!(
            Strategy::parse("5,1").unwrap(),
            Strategy { total: 5, label: 1, user: -1, host: -1 }
        );
        assert!(Strategy::parse("").is_err());
        assert!(Strategy::parse("a,b").is_err());
        assert!(Strategy::parse("1,2,3,4,5").is_err());
    }

    #[test]
    fn test_unset_quotas_take_everything_eligible() {
        let mut running = finished(3, "ann", "h1", None);
        running.result = crate::models::transaction::TxResult::Running;
        let mut empty = finished(2, "ann", "h1", None);
        empty.uploaded_count = 0;
        let txs = vec![running, empty, finished(1, "ann", "h1", None), finished(0, "bob", "h2", None)];
        let chosen = Strategy::default().choose(&txs, Some("ann"), Some("h1"));
        assert_eq!(ids(&chosen), vec![1, 0]);
    }

    #[test]
    fn test_stops_when_all_quotas_met() {
        let txs = vec![
            finished(5, "bob", "h2", None),
            finished(4, "ann", "h1", Some("rel")),
            finished(3, "ann", "h1", None),
            finished(2, "ann", "h1", None),
        ];
        let strategy = Strategy::parse("2,1,1,1").unwrap();
        let chosen = strategy.choose(&txs, Some("ann"), Some("h1"));
        assert_eq!(ids(&chosen), vec![5, 4]);

        let strategy = Strategy::parse("3,1,1,1").unwrap();
        let chosen = strategy.choose(&txs, Some("ann"), Some("h1"));
        assert_eq!(ids(&chosen), vec![5, 4, 3]);
    }

    #[test]
    fn test_unknown_user_never_satisfies() {
        let txs = vec![finished(2, "ann", "h1", Some("x")), finished(1, "ann", "h1", Some("y"))];
        let strategy = Strategy::parse("1,1,1,1").unwrap();
        let chosen = strategy.choose(&txs, None, Some("h1"));
        assert_eq!(chosen.len(), 2);
    }
}
