//! Path identity: a canonical path name plus the state of its content.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::moment::Moment;
use crate::models::wire::{
    format_radix, nth_separator, optional_field, parse_decimal, parse_radix, split_fields, FS1,
};

/// Number of descriptor fields ahead of the path name.
const DESCRIPTOR_FIELDS: usize = 7;

static DRIVE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z]:[/\\]").unwrap());

// ---------------------------------------------------------------------------
// PathName
// ---------------------------------------------------------------------------

/// A "/"-separated path. Member paths are project-relative, others absolute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathName(String);

impl PathName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Paths are members unless rooted, with either separator or a drive prefix.
    pub fn is_member(&self) -> bool {
        match self.0.chars().next() {
            None => true,
            Some('/') | Some('\\') => false,
            Some(_) => !DRIVE_PREFIX.is_match(&self.0),
        }
    }

    pub fn basename(&self) -> &str {
        self.0
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.0.as_str())
    }

    pub fn dirname(&self) -> Option<&str> {
        self.0.rfind(['/', '\\']).map(|i| &self.0[..i])
    }
}

impl fmt::Display for PathName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PathState
// ---------------------------------------------------------------------------

/// One observed state of a path: type, size, mode, mtime and content code.
///
/// Built once from an audit line and never changed afterwards, except for an
/// optional display label.
#[derive(Debug, Clone)]
pub struct PathState {
    csv: String,
    path: PathName,
    data_type: Option<String>,
    fs_name: Option<String>,
    mtime: Moment,
    size: i64,
    mode: u32,
    content_code: Option<String>,
    link_target: Option<String>,
    display_label: Option<String>,
}

impl PathState {
    /// Parse `<descriptor>,<path>`. The path is everything after the
    /// descriptor fields and may itself contain separators.
    pub fn parse(csv: &str) -> RecyclerResult<Self> {
        let divider = nth_separator(csv, DESCRIPTOR_FIELDS)
            .ok_or_else(|| RecyclerError::malformed("path state without a path", csv))?;
        let (descriptor, path) = (&csv[..divider], &csv[divider + 1..]);
        if path.is_empty() {
            return Err(RecyclerError::malformed("path state with an empty path", csv));
        }
        Self::from_descriptor(descriptor, PathName::new(path))
    }

    fn from_descriptor(descriptor: &str, path: PathName) -> RecyclerResult<Self> {
        let fields = split_fields(descriptor, DESCRIPTOR_FIELDS, "path state")?;
        let required = |i: usize, what: &str| {
            optional_field(fields[i])
                .ok_or_else(|| RecyclerError::malformed(what, descriptor))
        };

        let mtime = Moment::parse(required(2, "path state without mtime")?)?;
        let size = parse_decimal(required(3, "path state without size")?)?;
        let mode_text = required(4, "path state without mode")?;
        let mode = u32::try_from(parse_radix(mode_text)?)
            .map_err(|_| RecyclerError::malformed("path state mode out of range", mode_text))?;
        let content_code = optional_field(fields[5])
            .filter(|code| !code.is_empty())
            .map(str::to_string);
        let link_target = match optional_field(fields[6]).filter(|t| !t.is_empty()) {
            Some(encoded) => Some(
                urlencoding::decode(encoded)
                    .map_err(|_| RecyclerError::malformed("bad link target encoding", encoded))?
                    .into_owned(),
            ),
            None => None,
        };

        Ok(Self {
            csv: descriptor.to_string(),
            path,
            data_type: optional_field(fields[0]).map(str::to_string),
            fs_name: optional_field(fields[1]).map(str::to_string),
            mtime,
            size,
            mode,
            content_code,
            link_target,
            display_label: None,
        })
    }

    /// Build a regular-file state from typed parts, rendering the same text a
    /// client would send.
    pub fn file(
        path: impl Into<String>,
        mtime: Moment,
        size: i64,
        mode: u32,
        content_code: Option<&str>,
    ) -> Self {
        let csv = format!(
            "f,?,{},{},{},{},",
            mtime.to_standard_string(),
            size,
            format_radix(mode as u64),
            content_code.unwrap_or("")
        );
        Self {
            csv,
            path: PathName::new(path),
            data_type: Some("f".to_string()),
            fs_name: Some("?".to_string()),
            mtime,
            size,
            mode,
            content_code: content_code.filter(|c| !c.is_empty()).map(str::to_string),
            link_target: None,
            display_label: None,
        }
    }

    pub fn path(&self) -> &PathName {
        &self.path
    }

    pub fn path_str(&self) -> &str {
        self.path.as_str()
    }

    pub fn data_type(&self) -> Option<&str> {
        self.data_type.as_deref()
    }

    pub fn fs_name(&self) -> Option<&str> {
        self.fs_name.as_deref()
    }

    pub fn mtime(&self) -> Moment {
        self.mtime
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn mode_string(&self) -> String {
        format_radix(self.mode as u64)
    }

    pub fn content_code(&self) -> Option<&str> {
        self.content_code.as_deref()
    }

    pub fn has_content_code(&self) -> bool {
        self.content_code.is_some()
    }

    pub fn link_target(&self) -> Option<&str> {
        self.link_target.as_deref()
    }

    pub fn is_file(&self) -> bool {
        self.data_type.as_deref() == Some("f")
    }

    pub fn is_member(&self) -> bool {
        self.path.is_member()
    }

    pub fn display_label(&self) -> Option<&str> {
        self.display_label.as_deref()
    }

    pub fn set_display_label(&mut self, label: impl Into<String>) {
        self.display_label = Some(label.into());
    }

    /// The descriptor exactly as received, without the path.
    pub fn to_csv_string(&self) -> &str {
        &self.csv
    }

    pub fn to_standard_string(&self) -> String {
        let mut out = format!("{}{}{}", self.csv, FS1, self.path);
        if let Some(label) = &self.display_label {
            out.push_str(&format!(" [{label}]"));
        }
        out
    }

    pub fn compare_mtime(&self, other: &PathState) -> Ordering {
        self.mtime.cmp(&other.mtime)
    }

    /// A strict total order over every field that takes part in identity.
    pub fn sort_key(&self) -> (&str, Moment, i64, Option<&str>) {
        (self.path.as_str(), self.mtime, self.size, self.content_code())
    }

    /// Same state of the same path. Coded states match on their code alone,
    /// uncoded ones on their mtime, and a coded state never matches an
    /// uncoded one.
    fn same_state(&self, other: &PathState) -> bool {
        if self.path != other.path || self.size != other.size {
            return false;
        }
        match (&self.content_code, &other.content_code) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.mtime == other.mtime,
            _ => false,
        }
    }
}

impl PartialEq for PathState {
    fn eq(&self, other: &Self) -> bool {
        self.same_state(other)
    }
}

impl Eq for PathState {}

impl Hash for PathState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.size.hash(state);
    }
}

impl PartialOrd for PathState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Within one path, uncoded states come first and sort oldest to newest;
/// coded states follow, by size and then code.
impl Ord for PathState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path.cmp(&other.path).then_with(|| {
            match (&self.content_code, &other.content_code) {
                (None, None) => self
                    .compare_mtime(other)
                    .then_with(|| self.size.cmp(&other.size)),
                (Some(a), Some(b)) => self.size.cmp(&other.size).then_with(|| a.cmp(b)),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
            }
        })
    }
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_standard_string())
    }
}
