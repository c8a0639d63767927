//! Roadmap index: which transactions produced or consumed which path states,
//! per command, and its serialization into the cdb file clients shop from.
//!
//! The index is additive. Adding a transaction that is already cached only
//! refreshes its last-used time, and adding the same set of transactions in
//! any order yields the same content. Transactions unused for longer than
//! the staleness window are expired and commands left with no paths are
//! dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::RoadmapConfig;
use crate::errors::{RecyclerError, RecyclerResult};
use crate::indexer::cdb::CdbWriter;
use crate::models::command::CommandKey;
use crate::models::path::PathState;
use crate::models::transaction::{BuildTransaction, TxId};
use crate::models::wire::{format_radix, FS1, FS2, NEWLINE_TOKEN, NULL_FIELD};
use crate::query::selection::Strategy;
use crate::store::repository::Repository;

const TX_PREFIX: &str = "X";
const CMD_PREFIX: &str = "C";
const PREREQ_MARK: char = '<';
const TARGET_MARK: char = '>';
const COMMENT_KEY: &str = "#";

type PathSide = HashMap<PathState, BTreeSet<TxId>>;

// ---------------------------------------------------------------------------
// Index content
// ---------------------------------------------------------------------------

/// Everything one command is known to have read and written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandEntry {
    pub rwd: Option<String>,
    pub aggregated: bool,
    pub codes: BTreeSet<String>,
    pub prereqs: PathSide,
    pub targets: PathSide,
}

impl CommandEntry {
    fn is_empty(&self) -> bool {
        self.prereqs.is_empty() && self.targets.is_empty()
    }

    fn remove_transaction(&mut self, id: TxId) {
        for side in [&mut self.prereqs, &mut self.targets] {
            side.retain(|_, txs| {
                txs.remove(&id);
                !txs.is_empty()
            });
        }
    }
}

/// The timestamp-free part of an index, comparable across instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexContent {
    pub commands: BTreeMap<CommandKey, CommandEntry>,
    pub has_kids: BTreeSet<CommandKey>,
}

/// Union a state into one side. Of two equal states the one with the
/// smaller sort key is kept as the representative.
fn add_to_side(side: &mut PathSide, state: &PathState, id: TxId) {
    let (key, mut txs) = match side.remove_entry(state) {
        Some((existing, txs)) if existing.sort_key() <= state.sort_key() => (existing, txs),
        Some((_, txs)) => (state.clone(), txs),
        None => (state.clone(), BTreeSet::new()),
    };
    txs.insert(id);
    side.insert(key, txs);
}

fn smaller_rwd(current: Option<String>, candidate: Option<&str>) -> Option<String> {
    match (current, candidate) {
        (Some(a), Some(b)) if b < a.as_str() => Some(b.to_string()),
        (Some(a), _) => Some(a),
        (None, b) => b.map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// RoadmapIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RoadmapIndex {
    content: IndexContent,
    last_used: HashMap<TxId, DateTime<Utc>>,
}

impl RoadmapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(&self) -> &IndexContent {
        &self.content
    }

    pub fn contains(&self, id: TxId) -> bool {
        self.last_used.contains_key(&id)
    }

    pub fn last_used(&self, id: TxId) -> Option<DateTime<Utc>> {
        self.last_used.get(&id).copied()
    }

    pub fn known_transactions(&self) -> Vec<TxId> {
        let mut ids: Vec<TxId> = self.last_used.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn command_count(&self) -> usize {
        self.content.commands.len()
    }

    pub fn command(&self, key: &CommandKey) -> Option<&CommandEntry> {
        self.content.commands.get(key)
    }

    pub fn has_kids(&self, key: &CommandKey) -> bool {
        self.content.has_kids.contains(key)
    }

    pub fn add_transaction(&mut self, tx: &BuildTransaction) -> bool {
        self.add_transaction_at(tx, Utc::now())
    }

    /// Index `tx`, or just refresh it when already cached. Returns true when
    /// the transaction was newly indexed.
    pub fn add_transaction_at(&mut self, tx: &BuildTransaction, now: DateTime<Utc>) -> bool {
        let id = tx.id();
        if self.last_used.insert(id, now).is_some() {
            return false;
        }

        for record in tx.audit_records() {
            let command = record.command();
            let entry = self.content.commands.entry(command.index_key()).or_default();
            entry.aggregated |= command.is_aggregated();
            entry.rwd = smaller_rwd(entry.rwd.take(), command.relative_working_directory());
            if let Some(code) = command.code() {
                entry.codes.insert(code.to_string());
            }

            for touch in record.touches() {
                if touch.is_unlink() {
                    continue;
                }
                let side = if touch.is_target() {
                    &mut entry.targets
                } else {
                    &mut entry.prereqs
                };
                add_to_side(side, touch.state(), id);
            }
        }

        self.refresh_kids();
        debug!(
            "Added transaction to roadmap: id = {}, commands = {}",
            tx.id_string(),
            self.content.commands.len()
        );
        true
    }

    /// Drop one transaction from every mapping.
    pub fn remove_transaction(&mut self, id: TxId) -> bool {
        if self.last_used.remove(&id).is_none() {
            return false;
        }
        for entry in self.content.commands.values_mut() {
            entry.remove_transaction(id);
        }
        self.content.commands.retain(|_, entry| !entry.is_empty());
        self.refresh_kids();
        debug!("Expired transaction from roadmap: id = {}", id.to_id_string());
        true
    }

    pub fn expire_stale(&mut self, window: Duration) -> Vec<TxId> {
        self.expire_stale_at(Utc::now(), window)
    }

    /// Remove every transaction last used more than `window` before `now`.
    pub fn expire_stale_at(&mut self, now: DateTime<Utc>, window: Duration) -> Vec<TxId> {
        let mut stale: Vec<TxId> = self
            .last_used
            .iter()
            .filter(|(_, used)| now.signed_duration_since(**used) > window)
            .map(|(id, _)| *id)
            .collect();
        stale.sort();

        for id in &stale {
            self.remove_transaction(*id);
        }
        if !stale.is_empty() {
            info!(
                "Expired {} stale transactions, {} remain",
                stale.len(),
                self.last_used.len()
            );
        }
        stale
    }

    /// A command has kids when some indexed command names one of its codes
    /// as parent.
    fn refresh_kids(&mut self) {
        let parents: BTreeSet<&str> = self
            .content
            .commands
            .keys()
            .filter_map(|key| key.parent_code.as_deref())
            .collect();
        self.content.has_kids = self
            .content
            .commands
            .iter()
            .filter(|(_, entry)| entry.codes.iter().any(|c| parents.contains(c.as_str())))
            .map(|(key, _)| key.clone())
            .collect();
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Write the cdb for `chosen` into `out`. Only associations with a
    /// chosen transaction are emitted.
    pub fn write_cdb<W: Write + Seek>(&self, out: W, chosen: &[TxId]) -> RecyclerResult<W> {
        let mut cdb = CdbWriter::new(out)?;

        comment(&mut cdb, "KEY-VALUE DATABASE TO SUPPORT AO SHOPPING")?;
        comment(&mut cdb, "")?;
        comment(&mut cdb, "KNOWN PTXES:")?;
        comment(&mut cdb, " key=(PTX INDEX) value=(PTX ID)")?;
        comment(&mut cdb, "")?;
        let mut tx_index: HashMap<TxId, usize> = HashMap::new();
        for id in chosen {
            if tx_index.contains_key(id) {
                continue;
            }
            let n = tx_index.len();
            cdb.add_str(TX_PREFIX, &format!("{TX_PREFIX}{n}={}", id.to_id_string()))?;
            tx_index.insert(*id, n);
        }

        let commands: Vec<(&CommandKey, &CommandEntry, Vec<Visible>, Vec<Visible>)> = self
            .content
            .commands
            .iter()
            .map(|(key, entry)| {
                (
                    key,
                    entry,
                    visible(&entry.prereqs, &tx_index),
                    visible(&entry.targets, &tx_index),
                )
            })
            .filter(|(_, _, prereqs, targets)| !prereqs.is_empty() || !targets.is_empty())
            .collect();

        comment(&mut cdb, "")?;
        comment(&mut cdb, "KNOWN PATHSTATES:")?;
        comment(&mut cdb, "key=(PS INDEX) value=(PS CSV)")?;
        comment(&mut cdb, "")?;
        let mut state_index: IndexMap<&PathState, String> = IndexMap::new();
        for (_, _, prereqs, targets) in &commands {
            for (state, _) in prereqs.iter().chain(targets.iter()) {
                if !state_index.contains_key(*state) {
                    let ix = format_radix(state_index.len() as u64);
                    state_index.insert(*state, ix);
                }
            }
        }
        for (state, ix) in &state_index {
            let value = format!("{}{}{}", state.to_csv_string(), FS1, state.path_str());
            cdb.add_str(ix, &value)?;
        }

        comment(&mut cdb, "")?;
        comment(&mut cdb, "MAPPINGS BETWEEN PATHSTATES AND COMMANDS, IN BLOCKS OF:")?;
        comment(&mut cdb, "key=(COMMAND LINE) value=(CMDIX)")?;
        comment(&mut cdb, "key=(CMDIX)  value=(PCCODE,PATHCODE,HAS_TGT,AGG,KIDS,DURATION,RWD)")?;
        comment(&mut cdb, "key=<(CMDIX) value=(PREREQ-LIST),(PTX-LIST)")?;
        comment(&mut cdb, "key=>(CMDIX) value=(TARGET-LIST),(PTX-LIST)")?;
        comment(&mut cdb, "")?;
        for (n, (key, entry, prereqs, targets)) in commands.iter().enumerate() {
            let cix = format!("{CMD_PREFIX}{}", format_radix(n as u64));
            cdb.add_str(&key.line.replace(NEWLINE_TOKEN, "\n"), &cix)?;

            let meta = format!(
                "{pccode}{fs}{pathcode}{fs}{has_tgt}{fs}{agg}{fs}{kids}{fs}0{fs}{rwd}",
                fs = FS1,
                pccode = key.parent_code.as_deref().unwrap_or(NULL_FIELD),
                pathcode = key.path_code.as_deref().unwrap_or(NULL_FIELD),
                has_tgt = !targets.is_empty(),
                agg = entry.aggregated,
                kids = if self.has_kids(key) { '+' } else { '-' },
                rwd = entry.rwd.as_deref().unwrap_or(NULL_FIELD),
            );
            cdb.add_str(&cix, &meta)?;

            write_groups(&mut cdb, PREREQ_MARK, &cix, prereqs, &state_index)?;
            write_groups(&mut cdb, TARGET_MARK, &cix, targets, &state_index)?;
        }

        debug!(
            "Serialized roadmap: transactions = {}, states = {}, commands = {}, records = {}",
            tx_index.len(),
            state_index.len(),
            commands.len(),
            cdb.len()
        );
        cdb.finish()
    }

    pub fn to_cdb_bytes(&self, chosen: &[TxId]) -> RecyclerResult<Vec<u8>> {
        Ok(self.write_cdb(std::io::Cursor::new(Vec::new()), chosen)?.into_inner())
    }

    /// Generate next to `path` and move into place once complete.
    pub fn generate(&self, path: &Path, chosen: &[TxId]) -> RecyclerResult<u64> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        let size = {
            let file = self.write_cdb(temp.as_file_mut(), chosen)?;
            file.seek(SeekFrom::End(0))?
        };
        temp.persist(path).map_err(|e| RecyclerError::Io(e.error))?;
        Ok(size)
    }
}

/// A state with the chosen-transaction indices it maps to.
type Visible<'a> = (&'a PathState, Vec<usize>);

/// States of one side that touch a chosen transaction, in sort-key order.
fn visible<'a>(side: &'a PathSide, tx_index: &HashMap<TxId, usize>) -> Vec<Visible<'a>> {
    let mut states: Vec<Visible<'a>> = side
        .iter()
        .filter_map(|(state, txs)| {
            let mut indices: Vec<usize> = txs.iter().filter_map(|id| tx_index.get(id)).copied().collect();
            indices.sort_unstable();
            (!indices.is_empty()).then_some((state, indices))
        })
        .collect();
    states.sort_by(|a, b| a.0.sort_key().cmp(&b.0.sort_key()));
    states
}

fn comment<W: Write + Seek>(cdb: &mut CdbWriter<W>, text: &str) -> RecyclerResult<()> {
    cdb.add_str(COMMENT_KEY, text)
}

fn join_with<I: IntoIterator<Item = String>>(items: I, sep: char) -> String {
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(sep);
        }
        out.push_str(&item);
    }
    out
}

/// One record per distinct transaction list, naming every state that maps
/// to exactly that list.
fn write_groups<W: Write + Seek>(
    cdb: &mut CdbWriter<W>,
    mark: char,
    cix: &str,
    states: &[Visible<'_>],
    state_index: &IndexMap<&PathState, String>,
) -> RecyclerResult<()> {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for (state, txs) in states {
        let Some(ix) = state_index.get(*state) else {
            continue;
        };
        let tx_list = join_with(txs.iter().map(|n| format!("{TX_PREFIX}{n}")), FS2);
        groups.entry(tx_list).or_default().push(ix.clone());
    }
    let key = format!("{mark}{cix}");
    for (tx_list, members) in groups {
        cdb.add_str(&key, &format!("{}{}{}", join_with(members, FS2), FS1, tx_list))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-project cache
// ---------------------------------------------------------------------------

/// One index per project, each behind its own lock so that requests for
/// different projects do not contend.
pub struct RoadmapCache {
    staleness: Duration,
    default_strategy: Option<String>,
    indexes: Mutex<HashMap<String, Arc<Mutex<RoadmapIndex>>>>,
}

impl RoadmapCache {
    pub fn new(config: &RoadmapConfig) -> Self {
        Self {
            staleness: config.staleness(),
            default_strategy: config.default_strategy.clone(),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn index_for(&self, project: &str) -> Arc<Mutex<RoadmapIndex>> {
        let mut indexes = self.indexes.lock();
        match indexes.get(project) {
            Some(index) => {
                debug!("Using cached roadmap index: project = {project}");
                Arc::clone(index)
            }
            None => {
                debug!("Created roadmap index: project = {project}");
                let index = Arc::new(Mutex::new(RoadmapIndex::new()));
                indexes.insert(project.to_string(), Arc::clone(&index));
                index
            }
        }
    }

    pub fn cached_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn forget(&self, project: &str) -> bool {
        self.indexes.lock().remove(project).is_some()
    }

    pub fn clear(&self) {
        self.indexes.lock().clear();
        info!("Emptied roadmap cache");
    }

    pub fn serve(&self, project: &str, chosen: &[&BuildTransaction]) -> RecyclerResult<Vec<u8>> {
        self.serve_at(project, chosen, Utc::now())
    }

    /// Index the chosen transactions, expire stale ones, then return the
    /// gzipped cdb. The cdb is built in a temp file before anything is
    /// compressed.
    pub fn serve_at(
        &self,
        project: &str,
        chosen: &[&BuildTransaction],
        now: DateTime<Utc>,
    ) -> RecyclerResult<Vec<u8>> {
        let index = self.index_for(project);
        let mut index = index.lock();
        for tx in chosen {
            index.add_transaction_at(tx, now);
        }
        index.expire_stale_at(now, self.staleness);

        let ids: Vec<TxId> = chosen.iter().map(|tx| tx.id()).collect();
        let mut file = index.write_cdb(tempfile::tempfile()?, &ids)?;
        drop(index);

        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::copy(&mut file, &mut encoder)?;
        let bytes = encoder.finish()?;

        info!(
            "Delivered roadmap: project = {project}, transactions = {}, size = {size}, compressed = {}",
            ids.len(),
            bytes.len()
        );
        Ok(bytes)
    }

    /// The full request: pick transactions by strategy, then serve them.
    /// Returns `None` when the project is unknown or nothing qualifies.
    pub fn serve_request(
        &self,
        repo: &dyn Repository,
        project: &str,
        strategy: Option<&str>,
        log_name: Option<&str>,
        host_name: Option<&str>,
    ) -> RecyclerResult<Option<Vec<u8>>> {
        let Some(found) = repo.find_project(project)? else {
            info!("No roadmap generation for unknown project {project}");
            return Ok(None);
        };
        let strategy = match strategy.or(self.default_strategy.as_deref()) {
            Some(text) => Strategy::parse(text)?,
            None => Strategy::default(),
        };

        let mut transactions = Vec::new();
        for id in found.transactions().iter().rev() {
            if let Some(tx) = repo.find_transaction(*id)? {
                transactions.push(tx);
            }
        }
        let chosen = strategy.choose(&transactions, log_name, host_name);
        if chosen.is_empty() {
            info!("Skipping roadmap generation for {project}: no finished transactions");
            return Ok(None);
        }
        self.serve(project, &chosen).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::audit::parse_audit_str;
    use crate::indexer::cdb::CdbReader;
    use crate::models::moment::Moment;
    use crate::models::project::Project;
    use crate::store::memory::MemoryRepository;
    use crate::store::repository::Change;
    use flate2::read::GzDecoder;
    use std::io::Read;

    const BASE: u64 = 1_271_088_813_000;

    const COMPILE: &str = "\
100,0,1,l0ruel.16mv8g,250,host,,cc,src,p1,c1,k1-2,cc -c a.c -o a.o
R,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,40,plw,y1,,a.c
C,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,120,plw,x1,,a.o
U,unlink,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,0,plw,,,a.tmp
";

    const LINK: &str = "\
200,0,1,l0ruel.16mv9g,100,host,,ld,src,p1,c2,k2-2,ld -o app a.o
R,open,l0ruel.16mv9g,200,0,1,1,p1,c2,f,?,l0ruel.16mv8g,120,plw,x1,,a.o
C,open,l0ruel.16mv9g,200,0,1,1,p1,c2,f,?,l0ruel.16mv9g,900,plw,z1,,app
";

    const MAKE: &str = "\
50,0,1,l0ruel.16mv7g,900,host,,make,src,p0,p1,k0-1,make
R,open,l0ruel.16mv7g,50,0,1,1,p0,p1,f,?,l0ruel.16mv7g,10,plw,m1,,Makefile
";

    fn tx(offset_secs: u64, blocks: &[&str]) -> BuildTransaction {
        let mut tx = BuildTransaction::new(
            TxId::from_millis(BASE + offset_secs * 1000),
            Moment::from_millis(BASE as i64),
        );
        for block in blocks {
            tx.add_audit_record(parse_audit_str(block).unwrap().record);
        }
        tx
    }

    fn at(hours: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_300_000_000, 0).unwrap() + Duration::hours(hours)
    }

    fn lookup(image: &[u8], key: &str) -> Vec<String> {
        let reader = CdbReader::new(image).unwrap();
        reader
            .find_all(key.as_bytes())
            .unwrap()
            .into_iter()
            .map(|v| String::from_utf8(v.to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_add_is_idempotent() {
        let a = tx(0, &[COMPILE]);
        let mut once = RoadmapIndex::new();
        assert!(once.add_transaction_at(&a, at(0)));
        let mut twice = RoadmapIndex::new();
        twice.add_transaction_at(&a, at(0));
        assert!(!twice.add_transaction_at(&a, at(1)));
        assert_eq!(once.content(), twice.content());
        assert_eq!(twice.last_used(a.id()), Some(at(1)));
    }

    #[test]
    fn test_add_is_commutative() {
        let a = tx(0, &[COMPILE]);
        let b = tx(1, &[COMPILE, LINK]);
        let mut ab = RoadmapIndex::new();
        ab.add_transaction_at(&a, at(0));
        ab.add_transaction_at(&b, at(0));
        let mut ba = RoadmapIndex::new();
        ba.add_transaction_at(&b, at(0));
        ba.add_transaction_at(&a, at(0));
        assert_eq!(ab.content(), ba.content());
        assert_eq!(
            ab.to_cdb_bytes(&[a.id(), b.id()]).unwrap(),
            ba.to_cdb_bytes(&[a.id(), b.id()]).unwrap()
        );
    }

    #[test]
    fn test_add_is_commutative_with_mixed_codes() {
        let uncoded = COMPILE.replace(",40,plw,y1,,a.c", ",40,plw,,,a.c");
        let later = COMPILE.replace("?,l0ruel.16mv8g,40,", "?,l0ruel.16mv9g,40,");
        let txs = [
            tx(0, &[COMPILE]),
            tx(1, &[uncoded.as_str()]),
            tx(2, &[later.as_str()]),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        let build = |order: &[usize; 3]| {
            let mut index = RoadmapIndex::new();
            for &i in order {
                index.add_transaction_at(&txs[i], at(0));
            }
            index
        };
        let first = build(&orders[0]);
        let key = parse_audit_str(COMPILE).unwrap().record.command().index_key();
        assert_eq!(first.command(&key).unwrap().prereqs.len(), 2);
        for order in &orders[1..] {
            assert_eq!(build(order).content(), first.content());
        }
    }

    #[test]
    fn test_unlinks_are_not_indexed() {
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&tx(0, &[COMPILE]), at(0));
        let key = parse_audit_str(COMPILE).unwrap().record.command().index_key();
        let entry = index.command(&key).unwrap();
        assert_eq!(entry.prereqs.len(), 1);
        assert_eq!(entry.targets.len(), 1);
    }

    #[test]
    fn test_has_kids_follows_parent_code() {
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&tx(0, &[MAKE, COMPILE]), at(0));
        let make = parse_audit_str(MAKE).unwrap().record.command().index_key();
        let compile = parse_audit_str(COMPILE).unwrap().record.command().index_key();
        assert!(index.has_kids(&make));
        assert!(!index.has_kids(&compile));
    }

    #[test]
    fn test_expiration_drops_transactions_and_empty_commands() {
        let a = tx(0, &[COMPILE]);
        let b = tx(1, &[LINK]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        index.add_transaction_at(&b, at(20));
        assert_eq!(index.command_count(), 2);

        let expired = index.expire_stale_at(at(25), Duration::hours(24));
        assert_eq!(expired, vec![a.id()]);
        assert!(!index.contains(a.id()));
        assert!(index.contains(b.id()));
        assert_eq!(index.command_count(), 1);

        let mut fresh = RoadmapIndex::new();
        fresh.add_transaction_at(&b, at(20));
        assert_eq!(index.content(), fresh.content());
    }

    #[test]
    fn test_refresh_postpones_expiration() {
        let a = tx(0, &[COMPILE]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        index.add_transaction_at(&a, at(20));
        assert!(index.expire_stale_at(at(30), Duration::hours(24)).is_empty());
        assert_eq!(index.expire_stale_at(at(45), Duration::hours(24)), vec![a.id()]);
        assert_eq!(index.command_count(), 0);
    }

    #[test]
    fn test_serialized_compile_scenario() {
        let a = tx(0, &[COMPILE]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        let image = index.to_cdb_bytes(&[a.id()]).unwrap();

        assert_eq!(lookup(&image, "X"), vec!["X0=20100412161333"]);
        let states: Vec<String> = ["0", "1"].iter().flat_map(|k| lookup(&image, k)).collect();
        assert_eq!(states.len(), 2);
        assert!(states[0].ends_with(",a.c"));
        assert!(states[1].ends_with(",a.o"));
        assert!(states[1].contains(",120,"));

        assert_eq!(lookup(&image, "cc -c a.c -o a.o"), vec!["C0"]);
        assert_eq!(lookup(&image, "C0"), vec!["p1,k1-2,true,false,-,0,src"]);
        assert_eq!(lookup(&image, "<C0"), vec!["0,X0"]);
        assert_eq!(lookup(&image, ">C0"), vec!["1,X0"]);
        assert!(!lookup(&image, "#").is_empty());
    }

    #[test]
    fn test_identical_states_group_transactions() {
        let a = tx(0, &[COMPILE]);
        let b = tx(1, &[COMPILE]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        index.add_transaction_at(&b, at(0));
        let image = index.to_cdb_bytes(&[a.id(), b.id()]).unwrap();

        assert_eq!(lookup(&image, "X").len(), 2);
        assert_eq!(lookup(&image, ">C0"), vec!["1,X0+X1"]);
        assert_eq!(lookup(&image, "<C0"), vec!["0,X0+X1"]);
    }

    #[test]
    fn test_only_chosen_transactions_are_serialized() {
        let a = tx(0, &[COMPILE]);
        let b = tx(1, &[LINK]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        index.add_transaction_at(&b, at(0));
        let image = index.to_cdb_bytes(&[b.id()]).unwrap();
        assert!(lookup(&image, "cc -c a.c -o a.o").is_empty());
        assert_eq!(lookup(&image, "ld -o app a.o"), vec!["C0"]);
        assert_eq!(lookup(&image, "X"), vec!["X0=20100412161334"]);
    }

    #[test]
    fn test_generate_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roadmap.cdb");
        let a = tx(0, &[COMPILE]);
        let mut index = RoadmapIndex::new();
        index.add_transaction_at(&a, at(0));
        let size = index.generate(&path, &[a.id()]).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(lookup(&bytes, "C0").len(), 1);
    }

    #[test]
    fn test_cache_serves_gzipped_roadmap() {
        let cache = RoadmapCache::new(&RoadmapConfig::default());
        let a = tx(0, &[COMPILE]);
        let gz = cache.serve_at("widgets", &[&a], at(0)).unwrap();

        let mut image = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut image).unwrap();
        assert_eq!(lookup(&image, "C0").len(), 1);

        assert!(Arc::ptr_eq(&cache.index_for("widgets"), &cache.index_for("widgets")));
        assert_eq!(cache.cached_projects(), vec!["widgets".to_string()]);
        assert!(cache.forget("widgets"));
        assert!(cache.cached_projects().is_empty());
    }

    #[test]
    fn test_serve_request_picks_finished_uploads() {
        let mut done = tx(0, &[COMPILE]);
        done.set_project("widgets");
        done.bump_uploaded_count();
        done.set_result(true);
        let mut running = tx(1, &[LINK]);
        running.set_project("widgets");
        running.bump_uploaded_count();

        let mut project = Project::new("widgets");
        project.add_transaction(done.id());
        project.add_transaction(running.id());
        let repo = MemoryRepository::new();
        repo.apply(&[
            Change::PersistProject(project),
            Change::PersistTransaction(done),
            Change::PersistTransaction(running),
        ])
        .unwrap();

        let cache = RoadmapCache::new(&RoadmapConfig::default());
        assert!(cache.serve_request(&repo, "gadgets", None, None, None).unwrap().is_none());

        let gz = cache
            .serve_request(&repo, "widgets", None, None, None)
            .unwrap()
            .unwrap();
        let mut image = Vec::new();
        GzDecoder::new(gz.as_slice()).read_to_end(&mut image).unwrap();
        assert_eq!(lookup(&image, "X"), vec!["X0=20100412161333"]);
        assert!(lookup(&image, "ld -o app a.o").is_empty());

        assert!(cache
            .serve_request(&repo, "widgets", Some("1,x"), None, None)
            .is_err());
    }
}
