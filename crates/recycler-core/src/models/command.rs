//! Command identity: what ran, and the rules for calling two runs the same work.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::wire::{optional_field, split_fields, NEWLINE_TOKEN};

const COMMAND_FIELDS: usize = 6;

/// One command as reported by the auditing client.
///
/// Two commands are the same work when their lines match and, if both carry
/// one, their path codes match. The parent command code never affects
/// equality; it only perturbs [`Command::compare_identity`].
#[derive(Debug, Clone)]
pub struct Command {
    csv: String,
    program: Option<String>,
    rwd: Option<String>,
    parent_code: Option<String>,
    code: Option<String>,
    path_code: Option<String>,
    line: String,
    aggregated: bool,
}

/// Exact-match key used to file commands in a roadmap index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandKey {
    pub line: String,
    pub path_code: Option<String>,
    pub parent_code: Option<String>,
}

impl Command {
    pub fn parse(csv: &str) -> RecyclerResult<Self> {
        let fields = split_fields(csv, COMMAND_FIELDS, "command")?;
        let line = optional_field(fields[5])
            .ok_or_else(|| RecyclerError::malformed("command without a line", csv))?;
        let owned = |i: usize| optional_field(fields[i]).map(str::to_string);
        Ok(Self {
            csv: csv.to_string(),
            program: owned(0),
            rwd: owned(1),
            parent_code: owned(2),
            code: owned(3),
            path_code: owned(4),
            line: line.to_string(),
            aggregated: false,
        })
    }

    pub fn program(&self) -> Option<&str> {
        self.program.as_deref()
    }

    pub fn relative_working_directory(&self) -> Option<&str> {
        self.rwd.as_deref()
    }

    pub fn parent_code(&self) -> Option<&str> {
        self.parent_code.as_deref()
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn path_code(&self) -> Option<&str> {
        self.path_code.as_deref()
    }

    /// The line as transmitted, newlines still encoded.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn original_line(&self) -> String {
        self.line.replace(NEWLINE_TOKEN, "\n")
    }

    pub fn is_aggregated(&self) -> bool {
        self.aggregated
    }

    pub(crate) fn mark_aggregated(&mut self) {
        self.aggregated = true;
    }

    pub fn to_csv_string(&self) -> &str {
        &self.csv
    }

    pub fn index_key(&self) -> CommandKey {
        CommandKey {
            line: self.line.clone(),
            path_code: self.path_code.clone(),
            parent_code: self.parent_code.clone(),
        }
    }

    /// Three-way comparison with a secondary tie-break.
    ///
    /// `-1`/`1` mean different work. `0` means the same work. `-2`/`2` also
    /// mean the same work, ordered apart by parent command code.
    pub fn compare_identity(&self, other: &Command) -> i32 {
        match self.line.cmp(&other.line) {
            Ordering::Less => return -1,
            Ordering::Greater => return 1,
            Ordering::Equal => {}
        }
        if let (Some(mine), Some(theirs)) = (&self.path_code, &other.path_code) {
            match mine.cmp(theirs) {
                Ordering::Less => return -1,
                Ordering::Greater => return 1,
                Ordering::Equal => {}
            }
        }
        // TODO: replace the parent-code tie-break with an explicit display comparator.
        match (&self.parent_code, &other.parent_code) {
            (Some(mine), Some(theirs)) => match mine.cmp(theirs) {
                Ordering::Less => -2,
                Ordering::Greater => 2,
                Ordering::Equal => 0,
            },
            _ => 0,
        }
    }

    pub fn is_same_work(&self, other: &Command) -> bool {
        !matches!(self.compare_identity(other), -1 | 1)
    }

    /// Display order derived from [`Command::compare_identity`].
    pub fn display_cmp(&self, other: &Command) -> Ordering {
        self.compare_identity(other).cmp(&0)
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_work(other)
    }
}

impl Eq for Command {}

/// Path codes may be absent on one side, so only the line is hashed.
impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.line.hash(state);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.csv)
    }
}
