//! Gzip containers on disk, one directory tree per project.
//!
//! Content lives at `<root>/<project>/<encoded basename>/<size>.<code>.gz`
//! and transaction logs at `<root>/<project>/_LOGFILES_/<id string>.log.gz`.
//! A container is addressed by what it holds, so storing the same
//! `(basename, size, code)` twice leaves one file.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::StoreConfig;
use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::path::PathState;
use crate::models::transaction::TxId;

pub const LOG_DIR: &str = "_LOGFILES_";

const GZ_SUFFIX: &str = ".gz";

// ---------------------------------------------------------------------------
// ContainerKey
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerKey {
    Content {
        project: String,
        basename: String,
        size: i64,
        code: String,
    },
    Log {
        project: String,
        tx: TxId,
    },
}

impl ContainerKey {
    /// Key for the content a path state describes. States without a content
    /// code cannot be stored.
    pub fn for_state(project: &str, state: &PathState) -> RecyclerResult<Self> {
        let code = state.content_code().ok_or_else(|| {
            RecyclerError::malformed("path state without content code", state.path_str())
        })?;
        Ok(ContainerKey::Content {
            project: project.to_string(),
            basename: state.path().basename().to_string(),
            size: state.size(),
            code: code.to_string(),
        })
    }

    pub fn for_log(project: &str, tx: TxId) -> Self {
        ContainerKey::Log {
            project: project.to_string(),
            tx,
        }
    }

    pub fn project(&self) -> &str {
        match self {
            ContainerKey::Content { project, .. } | ContainerKey::Log { project, .. } => project,
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, ContainerKey::Log { .. })
    }

    /// Path below the project directory.
    fn relative_path(&self) -> PathBuf {
        match self {
            ContainerKey::Content {
                basename,
                size,
                code,
                ..
            } => Path::new(&encode_basename(basename)).join(format!("{size}.{code}{GZ_SUFFIX}")),
            ContainerKey::Log { tx, .. } => {
                Path::new(LOG_DIR).join(format!("{}.log{GZ_SUFFIX}", tx.to_id_string()))
            }
        }
    }
}

/// URL-encode a basename. Only `A-Z a-z 0-9 - _ . ~` survive, so `*` and
/// spaces are escaped as well.
fn encode_basename(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

fn check_project(project: &str) -> RecyclerResult<()> {
    if project.is_empty()
        || project == "."
        || project == ".."
        || project.contains(['/', '\\'])
    {
        return Err(RecyclerError::malformed("unusable project name", project));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Container count and total bytes held for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub containers: u64,
    pub bytes: u64,
}

pub struct ArtifactStore {
    root: PathBuf,
    mkdir_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mkdir_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.container_root.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: &str) -> RecyclerResult<PathBuf> {
        check_project(project)?;
        Ok(self.root.join(project))
    }

    pub fn path_of(&self, key: &ContainerKey) -> RecyclerResult<PathBuf> {
        Ok(self.project_dir(key.project())?.join(key.relative_path()))
    }

    pub fn exists(&self, key: &ContainerKey) -> RecyclerResult<bool> {
        Ok(self.path_of(key)?.is_file())
    }

    /// Directory creation is serialized across callers sharing this store.
    fn ensure_dir(&self, dir: &Path) -> RecyclerResult<()> {
        let _guard = self.mkdir_lock.lock();
        if !dir.is_dir() {
            fs::create_dir_all(dir)?;
            debug!("Created container directory {}", dir.display());
        }
        Ok(())
    }

    /// Write `reader` into the container for `key`, gzipping it unless it is
    /// already compressed. The file only appears once fully written.
    /// Returns the number of bytes read from `reader`.
    pub fn store<R: Read>(
        &self,
        key: &ContainerKey,
        mut reader: R,
        already_compressed: bool,
    ) -> RecyclerResult<u64> {
        let path = self.path_of(key)?;
        let dir = path
            .parent()
            .ok_or_else(|| RecyclerError::malformed("container without a directory", key.project()))?;
        self.ensure_dir(dir)?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        let copied = {
            let mut out = BufWriter::new(temp.as_file_mut());
            let copied = if already_compressed {
                io::copy(&mut reader, &mut out)?
            } else {
                let mut encoder = GzEncoder::new(&mut out, Compression::default());
                let copied = io::copy(&mut reader, &mut encoder)?;
                encoder.finish()?;
                copied
            };
            out.flush()?;
            copied
        };
        temp.persist(&path).map_err(|e| RecyclerError::Io(e.error))?;

        info!("Stored container {} ({} bytes in)", path.display(), copied);
        Ok(copied)
    }

    /// Open the gzip-framed container for reading.
    pub fn open(&self, key: &ContainerKey) -> RecyclerResult<BufReader<File>> {
        let path = self.path_of(key)?;
        match File::open(&path) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RecyclerError::NotFound(
                format!("container {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// The gzip-framed bytes of a container. Callers decompress as needed.
    pub fn fetch(&self, key: &ContainerKey) -> RecyclerResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open(key)?.read_to_end(&mut bytes)?;
        debug!("Fetched container for {} ({} bytes)", key.project(), bytes.len());
        Ok(bytes)
    }

    /// Returns false when there was nothing to delete.
    pub fn delete(&self, key: &ContainerKey) -> RecyclerResult<bool> {
        let path = self.path_of(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted container {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every container of a project.
    pub fn delete_all(&self, project: &str) -> RecyclerResult<()> {
        let dir = self.project_dir(project)?;
        if dir.is_dir() {
            fs::remove_dir_all(&dir)?;
            info!("Deleted all containers of project {project}");
        }
        Ok(())
    }

    pub fn usage(&self, project: &str) -> RecyclerResult<StoreUsage> {
        let dir = self.project_dir(project)?;
        let mut usage = StoreUsage::default();
        if !dir.is_dir() {
            return Ok(usage);
        }
        for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if !entry.file_name().to_string_lossy().ends_with(GZ_SUFFIX) {
                continue;
            }
            usage.containers += 1;
            usage.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
        Ok(usage)
    }
}
