//! The build transaction aggregate and its identifier.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::action::AuditRecord;
use crate::models::moment::{Elapsed, Moment};

const ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Narrowest content code width a transaction reports.
pub const MIN_DATA_CODE_WIDTH: usize = 8;

// ---------------------------------------------------------------------------
// TxId
// ---------------------------------------------------------------------------

/// Milliseconds since the epoch, always a whole second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(u64);

impl TxId {
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// `yyyyMMddHHmmss` in UTC.
    pub fn to_id_string(&self) -> String {
        match DateTime::<Utc>::from_timestamp_millis(self.0 as i64) {
            Some(dt) => dt.format(ID_FORMAT).to_string(),
            None => self.0.to_string(),
        }
    }

    pub fn parse_id_string(text: &str) -> Option<Self> {
        if text.len() != 14 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let parsed = NaiveDateTime::parse_from_str(text, ID_FORMAT).ok()?;
        u64::try_from(parsed.and_utc().timestamp_millis())
            .ok()
            .map(TxId)
    }

    /// Resolve an id string, or else the earliest transaction with that label.
    pub fn resolve<'a, I>(name: &str, candidates: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a BuildTransaction>,
    {
        Self::parse_id_string(name).or_else(|| {
            candidates
                .into_iter()
                .filter(|tx| tx.label() == Some(name))
                .map(|tx| tx.id())
                .min()
        })
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_id_string())
    }
}

// ---------------------------------------------------------------------------
// TxResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxResult {
    #[default]
    Running,
    Succeeded,
    Failed,
}

impl TxResult {
    pub fn as_char(&self) -> char {
        match self {
            TxResult::Running => '*',
            TxResult::Succeeded => '+',
            TxResult::Failed => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '*' => Some(TxResult::Running),
            '+' => Some(TxResult::Succeeded),
            '-' => Some(TxResult::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BuildTransaction
// ---------------------------------------------------------------------------

/// Who ran the build, and where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub log_name: Option<String>,
    pub group_name: Option<String>,
    pub host_name: Option<String>,
    pub system_name: Option<String>,
    pub os_release: Option<String>,
    pub machine_type: Option<String>,
}

/// One audited build: its commands, what they touched, and how it ended.
#[derive(Debug, Clone)]
pub struct BuildTransaction {
    id: TxId,
    pub(crate) project: Option<String>,
    pub base_dir: Option<String>,
    pub rwd: Option<String>,
    pub host: HostInfo,
    pub read_only: bool,
    pub client_start_time: Option<Moment>,
    pub(crate) start_time: Moment,
    pub(crate) duration: Elapsed,
    pub(crate) uploaded_count: u32,
    pub(crate) downloaded_count: u32,
    pub(crate) data_code_width: usize,
    pub(crate) result: TxResult,
    pub(crate) label: Option<String>,
    records: Vec<AuditRecord>,
}

impl BuildTransaction {
    pub fn new(id: TxId, start_time: Moment) -> Self {
        Self {
            id,
            project: None,
            base_dir: None,
            rwd: None,
            host: HostInfo::default(),
            read_only: false,
            client_start_time: None,
            start_time,
            duration: Elapsed::default(),
            uploaded_count: 0,
            downloaded_count: 0,
            data_code_width: MIN_DATA_CODE_WIDTH,
            result: TxResult::Running,
            label: None,
            records: Vec::new(),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn id_string(&self) -> String {
        self.id.to_id_string()
    }

    /// The label when there is one, otherwise the id string.
    pub fn name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.id_string())
    }

    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub(crate) fn set_project(&mut self, project: &str) {
        self.project = Some(project.to_string());
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    pub fn is_labeled(&self) -> bool {
        self.label.is_some()
    }

    pub fn start_time(&self) -> Moment {
        self.start_time
    }

    pub fn duration(&self) -> Elapsed {
        self.duration
    }

    fn refresh_duration(&mut self) {
        self.duration = Elapsed::since(self.start_time);
    }

    pub fn unqualified_host_name(&self) -> Option<&str> {
        self.host
            .host_name
            .as_deref()
            .map(|h| match h.find('.') {
                Some(dot) if dot > 0 => &h[..dot],
                _ => h,
            })
    }

    pub fn uploaded_count(&self) -> u32 {
        self.uploaded_count
    }

    pub fn bump_uploaded_count(&mut self) {
        self.uploaded_count += 1;
    }

    pub fn downloaded_count(&self) -> u32 {
        self.downloaded_count
    }

    pub fn set_downloaded_count(&mut self, count: u32) {
        self.downloaded_count = count;
    }

    pub fn data_code_width(&self) -> usize {
        self.data_code_width
    }

    pub fn widen_data_code(&mut self, width: usize) {
        self.data_code_width = self.data_code_width.max(width);
    }

    pub fn result(&self) -> TxResult {
        self.result
    }

    pub fn is_done(&self) -> bool {
        self.result != TxResult::Running
    }

    pub fn result_char(&self) -> char {
        self.result.as_char()
    }

    /// Sets the outcome once. Returns false when it was already set.
    pub fn set_result(&mut self, success: bool) -> bool {
        if self.is_done() {
            return false;
        }
        self.result = if success {
            TxResult::Succeeded
        } else {
            TxResult::Failed
        };
        self.refresh_duration();
        true
    }

    /// Insert in start-time order; equal start times keep arrival order.
    pub fn add_audit_record(&mut self, record: AuditRecord) {
        self.insert_record(record);
        self.refresh_duration();
    }

    fn insert_record(&mut self, mut record: AuditRecord) {
        record.attach(self.id);
        let at = self
            .records
            .partition_point(|existing| existing.start() <= record.start());
        self.records.insert(at, record);
    }

    /// Audit records ordered by start time.
    pub fn audit_records(&self) -> &[AuditRecord] {
        &self.records
    }

    /// The first record started is its own parent. Others find the first
    /// record they are a child of.
    pub fn parent_of(&self, current: &AuditRecord) -> Option<&AuditRecord> {
        let top = self.records.first()?;
        if std::ptr::eq(top, current) {
            return Some(top);
        }
        self.records.iter().find(|candidate| current.is_child_of(candidate))
    }

    /// Reload stored records without touching the duration.
    pub(crate) fn restore_records(&mut self, records: Vec<AuditRecord>) {
        for record in records {
            self.insert_record(record);
        }
    }
}

impl PartialEq for BuildTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BuildTransaction {}

impl fmt::Display for BuildTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id_string())
    }
}
