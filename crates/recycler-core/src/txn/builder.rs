//! Server-side lifecycle of a build transaction: start, audit, label, end,
//! uploads and downloads.
//!
//! Every write goes through a [`UnitOfWork`]. Writes that touch an existing
//! transaction lock it first, so concurrent uploads to one build never lose
//! a count.

use std::io::Read;

use tracing::{debug, info, warn};

use crate::config::RecyclerConfig;
use crate::errors::{RecyclerError, RecyclerResult};
use crate::indexer::audit::{parse_audit_bytes, ParsedAudit};
use crate::models::codes::HashAlgorithm;
use crate::models::moment::Moment;
use crate::models::path::PathState;
use crate::models::project::Project;
use crate::models::transaction::{BuildTransaction, HostInfo, TxId};
use crate::store::containers::{ArtifactStore, ContainerKey};
use crate::store::repository::Repository;
use crate::txn::allocator::{self, TxIdAllocator};
use crate::txn::locks::{self, TxLockRegistry};
use crate::txn::unit::UnitOfWork;

/// What a client reports when it opens a transaction.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub project: String,
    pub label: Option<String>,
    pub base_dir: Option<String>,
    pub rwd: Option<String>,
    pub host: HostInfo,
    pub read_only: bool,
    pub client_start_time: Option<Moment>,
}

/// What an upload carries.
#[derive(Debug, Clone, Copy)]
pub enum UploadTarget<'s> {
    Content(&'s PathState),
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Stored { bytes: u64 },
    /// An identical container was already present.
    Skipped,
}

pub struct TransactionBuilder<'a> {
    repo: &'a dyn Repository,
    store: &'a ArtifactStore,
    locks: &'a TxLockRegistry,
    ids: &'a TxIdAllocator,
    algorithm: HashAlgorithm,
}

impl<'a> TransactionBuilder<'a> {
    /// Uses the process-wide lock registry and id allocator.
    pub fn new(repo: &'a dyn Repository, store: &'a ArtifactStore, config: &RecyclerConfig) -> Self {
        Self::with_coordination(repo, store, locks::global(), allocator::global())
            .with_algorithm(config.identity.algorithm)
    }

    pub fn with_coordination(
        repo: &'a dyn Repository,
        store: &'a ArtifactStore,
        locks: &'a TxLockRegistry,
        ids: &'a TxIdAllocator,
    ) -> Self {
        Self {
            repo,
            store,
            locks,
            ids,
            algorithm: HashAlgorithm::default(),
        }
    }

    pub fn with_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn unit(&self) -> UnitOfWork<'a> {
        UnitOfWork::begin(self.repo, self.locks)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open a new transaction, creating its project on first use.
    pub fn start(&self, request: StartRequest) -> RecyclerResult<BuildTransaction> {
        if request.project.is_empty() {
            return Err(RecyclerError::Malformed("transaction without a project".to_string()));
        }
        let mut tx = BuildTransaction::new(self.ids.next(), Moment::now());
        tx.base_dir = request.base_dir;
        tx.rwd = request.rwd;
        tx.host = request.host;
        tx.read_only = request.read_only;
        tx.client_start_time = request.client_start_time;
        if let Some(label) = request.label {
            tx.set_label(label);
        }
        tx.set_project(&request.project);

        let mut unit = self.unit();
        let mut project = match unit.find_project(&request.project)? {
            Some(project) => project,
            None => {
                debug!("New project {}", request.project);
                Project::new(request.project.as_str())
            }
        };
        project.add_transaction(tx.id());
        unit.persist_project(project);
        unit.persist_transaction(tx.clone());
        unit.commit()?;

        info!("Started transaction {} in project {}", tx.id_string(), request.project);
        Ok(tx)
    }

    /// Attach one parsed audit block to a transaction.
    pub fn record_audit(&self, id: TxId, parsed: ParsedAudit) -> RecyclerResult<()> {
        let mut unit = self.unit();
        let mut tx = unit.lock_and_fetch(id)?;
        if let Some(width) = parsed.data_code_width {
            tx.widen_data_code(width);
        }
        self.check_path_code(&tx, &parsed);
        tx.add_audit_record(parsed.record);
        unit.persist_transaction(tx);
        unit.commit()
    }

    /// Parse an uploaded audit block, gzipped or not, and record it.
    pub fn ingest(&self, id: TxId, block: &[u8], gzipped: bool) -> RecyclerResult<()> {
        let parsed = parse_audit_bytes(block, gzipped)?;
        self.record_audit(id, parsed)
    }

    /// A path code that does not match the touched paths is logged and kept.
    fn check_path_code(&self, tx: &BuildTransaction, parsed: &ParsedAudit) {
        let (Some(sent), Some(base_dir)) = (parsed.record.command().path_code(), tx.base_dir.as_deref())
        else {
            return;
        };
        let derived = parsed.record.derive_path_code(self.algorithm, base_dir);
        if derived.as_deref() != Some(sent) {
            warn!(
                "Path code mismatch in {}: client sent {}, server derived {}",
                tx.id_string(),
                sent,
                derived.as_deref().unwrap_or("-")
            );
        }
    }

    pub fn label(&self, id: TxId, label: &str) -> RecyclerResult<BuildTransaction> {
        let mut unit = self.unit();
        let mut tx = unit.lock_and_fetch(id)?;
        tx.set_label(label);
        unit.persist_transaction(tx.clone());
        unit.commit()?;
        Ok(tx)
    }

    /// Close a transaction. A second end keeps the first result but still
    /// records the download count.
    pub fn end(&self, id: TxId, success: bool, downloaded: u32) -> RecyclerResult<BuildTransaction> {
        let mut unit = self.unit();
        let mut tx = unit.lock_and_fetch(id)?;
        if !tx.set_result(success) {
            debug!("Transaction {} already ended", tx.id_string());
        }
        tx.set_downloaded_count(downloaded);
        unit.persist_transaction(tx.clone());
        unit.commit()?;
        info!(
            "Ended transaction {} with result {}",
            tx.id_string(),
            tx.result_char()
        );
        Ok(tx)
    }

    /// Remove a transaction and its log container.
    pub fn delete(&self, id: TxId) -> RecyclerResult<()> {
        let mut unit = self.unit();
        let tx = unit.lock_and_fetch(id)?;
        unit.remove_transaction(id);
        unit.commit()?;
        if let Some(project) = tx.project() {
            self.store.delete(&ContainerKey::for_log(project, id))?;
        }
        info!("Deleted transaction {}", tx.id_string());
        Ok(())
    }

    /// Remove a project, every transaction in it, and all its containers.
    pub fn delete_project(&self, name: &str) -> RecyclerResult<()> {
        let mut unit = self.unit();
        if unit.find_project(name)?.is_none() {
            return Err(RecyclerError::NotFound(format!("project {name}")));
        }
        unit.remove_project(name);
        unit.commit()?;
        self.store.delete_all(name)?;
        info!("Deleted project {name}");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Uploads and downloads
    // -----------------------------------------------------------------------

    /// Count the upload against the transaction, then store the container
    /// unless an identical one is already there.
    pub fn upload<R: Read>(
        &self,
        id: TxId,
        target: UploadTarget<'_>,
        reader: R,
        already_compressed: bool,
    ) -> RecyclerResult<UploadOutcome> {
        let mut unit = self.unit();
        let mut tx = unit.lock_and_fetch(id)?;
        let project = tx
            .project()
            .ok_or_else(|| RecyclerError::NotFound(format!("project of transaction {id}")))?
            .to_string();
        let key = match target {
            UploadTarget::Content(state) => {
                tx.bump_uploaded_count();
                ContainerKey::for_state(&project, state)?
            }
            UploadTarget::Log => ContainerKey::for_log(&project, id),
        };
        unit.persist_transaction(tx);
        unit.commit()?;

        if self.store.exists(&key)? {
            debug!("Skipped upload for {project}: container already present");
            return Ok(UploadOutcome::Skipped);
        }
        let bytes = self.store.store(&key, reader, already_compressed)?;
        Ok(UploadOutcome::Stored { bytes })
    }

    /// Gzip-framed bytes for the content a path state describes.
    pub fn download(&self, project: &str, state: &PathState) -> RecyclerResult<Vec<u8>> {
        self.store.fetch(&ContainerKey::for_state(project, state)?)
    }

    pub fn download_log(&self, id: TxId) -> RecyclerResult<Vec<u8>> {
        let tx = self
            .repo
            .find_transaction(id)?
            .ok_or_else(|| RecyclerError::NotFound(format!("transaction {id}")))?;
        let project = tx
            .project()
            .ok_or_else(|| RecyclerError::NotFound(format!("project of transaction {id}")))?;
        self.store.fetch(&ContainerKey::for_log(project, id))
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Find a transaction of `project` by id string, or by label.
    pub fn find_by_name(&self, project: &str, name: &str) -> RecyclerResult<Option<BuildTransaction>> {
        let candidates = self.repo.transactions_of(project)?;
        let Some(id) = TxId::resolve(name, &candidates) else {
            return Ok(None);
        };
        Ok(candidates.into_iter().find(|tx| tx.id() == id))
    }
}
