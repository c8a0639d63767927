//! Audit records: one command invocation and the path touches it made.

use std::fmt;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::codes::{derive_path_code, HashAlgorithm};
use crate::models::command::Command;
use crate::models::moment::{Elapsed, Moment};
use crate::models::path::PathState;
use crate::models::transaction::TxId;
use crate::models::wire::{nth_separator, parse_decimal, split_fields, FS1};

const RECORD_FIELDS: usize = 7;
const TOUCH_FIELDS: usize = 9;

// ---------------------------------------------------------------------------
// Operation codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Exec,
    Create,
    Append,
    Link,
    Symlink,
    Unlink,
    Other(char),
}

impl Op {
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => Op::Read,
            'X' => Op::Exec,
            'C' => Op::Create,
            'A' => Op::Append,
            'L' => Op::Link,
            'S' => Op::Symlink,
            'U' => Op::Unlink,
            other => Op::Other(other),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Op::Read => 'R',
            Op::Exec => 'X',
            Op::Create => 'C',
            Op::Append => 'A',
            Op::Link => 'L',
            Op::Symlink => 'S',
            Op::Unlink => 'U',
            Op::Other(c) => *c,
        }
    }

    /// Everything except a pure read or exec modifies the path.
    pub fn is_target(&self) -> bool {
        !matches!(self, Op::Read | Op::Exec)
    }
}

// ---------------------------------------------------------------------------
// PathTouch
// ---------------------------------------------------------------------------

/// One operation on one path, as seen by the auditing client.
#[derive(Debug, Clone, PartialEq)]
pub struct PathTouch {
    op: Op,
    call: Option<String>,
    state: PathState,
}

impl PathTouch {
    pub fn new(op: Op, state: PathState) -> Self {
        Self {
            op,
            call: None,
            state,
        }
    }

    pub fn with_call(mut self, call: Option<String>) -> Self {
        self.call = call.filter(|c| !c.is_empty());
        self
    }

    /// Parse a letter-leading audit line: nine action fields, then a path state.
    pub fn parse(line: &str) -> RecyclerResult<Self> {
        let divider = nth_separator(line, TOUCH_FIELDS)
            .ok_or_else(|| RecyclerError::malformed("path action too short", line))?;
        let (action, state) = (&line[..divider], &line[divider + 1..]);
        let fields = split_fields(action, TOUCH_FIELDS, "path action")?;
        let op = fields[0]
            .chars()
            .next()
            .map(Op::from_char)
            .ok_or_else(|| RecyclerError::malformed("path action without op", line))?;
        Ok(Self {
            op,
            call: Some(fields[1].to_string()).filter(|c| !c.is_empty()),
            state: PathState::parse(state)?,
        })
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn call(&self) -> Option<&str> {
        self.call.as_deref()
    }

    pub fn state(&self) -> &PathState {
        &self.state
    }

    pub fn is_target(&self) -> bool {
        self.op.is_target()
    }

    pub fn is_unlink(&self) -> bool {
        self.op == Op::Unlink
    }

    pub fn is_symlink(&self) -> bool {
        self.op == Op::Symlink
    }

    pub fn is_member(&self) -> bool {
        self.state.is_member()
    }
}

impl fmt::Display for PathTouch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.op.as_char(), self.state)
    }
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// One concrete invocation of a command inside a build transaction.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    transaction: Option<TxId>,
    command: Command,
    pid: u64,
    depth: u64,
    ppid: u64,
    start: Moment,
    duration: Elapsed,
    host: Option<String>,
    recycled_from: Option<String>,
    touches: Vec<PathTouch>,
}

impl AuditRecord {
    /// Parse a digit-leading audit line: seven record fields, then the command.
    pub fn parse(line: &str) -> RecyclerResult<Self> {
        let divider = nth_separator(line, RECORD_FIELDS)
            .ok_or_else(|| RecyclerError::malformed("command action too short", line))?;
        let (record, command) = (&line[..divider], &line[divider + 1..]);
        let fields = split_fields(record, RECORD_FIELDS, "command action")?;
        let number = |i: usize| -> RecyclerResult<u64> {
            let value = parse_decimal(fields[i])?;
            u64::try_from(value).map_err(|_| RecyclerError::malformed("negative process id", line))
        };
        Ok(Self {
            transaction: None,
            command: Command::parse(command)?,
            pid: number(0)?,
            depth: number(1)?,
            ppid: number(2)?,
            start: Moment::parse(fields[3])?,
            duration: Elapsed::parse(fields[4])?,
            host: Some(fields[5].to_string()).filter(|h| !h.is_empty() && h != "-"),
            recycled_from: Some(fields[6].to_string()).filter(|r| !r.is_empty() && r != "-"),
            touches: Vec::new(),
        })
    }

    pub fn transaction(&self) -> Option<TxId> {
        self.transaction
    }

    pub(crate) fn attach(&mut self, tx: TxId) {
        self.transaction = Some(tx);
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub(crate) fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn ppid(&self) -> u64 {
        self.ppid
    }

    pub fn start(&self) -> Moment {
        self.start
    }

    pub fn duration(&self) -> Elapsed {
        self.duration
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Id string of the transaction this command's results were recycled from.
    pub fn recycled_from(&self) -> Option<&str> {
        self.recycled_from.as_deref()
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled_from.is_some()
    }

    /// Appends without de-duplication.
    pub fn add_path_touch(&mut self, touch: PathTouch) {
        self.touches.push(touch);
    }

    pub fn touches(&self) -> &[PathTouch] {
        &self.touches
    }

    pub fn prereqs(&self) -> impl Iterator<Item = &PathTouch> {
        self.touches.iter().filter(|t| !t.is_target())
    }

    pub fn targets(&self) -> impl Iterator<Item = &PathTouch> {
        self.touches.iter().filter(|t| t.is_target())
    }

    pub fn has_target(&self) -> bool {
        self.targets().next().is_some()
    }

    /// The last touch of each path, in order of each path's first appearance.
    pub fn final_states(&self) -> Vec<&PathTouch> {
        let mut latest: indexmap::IndexMap<&str, &PathTouch> = indexmap::IndexMap::new();
        for touch in &self.touches {
            latest.insert(touch.state().path_str(), touch);
        }
        latest.into_values().collect()
    }

    /// Parent/child inside one transaction, rebuilt from process ids.
    pub fn is_child_of(&self, other: &AuditRecord) -> bool {
        if std::ptr::eq(self, other) {
            false
        } else if other.pid == self.ppid {
            true
        } else {
            other.pid == self.pid && other.depth.checked_sub(self.depth) == Some(1)
        }
    }

    /// Recompute the path code the client should have sent.
    pub fn derive_path_code(&self, algorithm: HashAlgorithm, base_dir: &str) -> Option<String> {
        let paths = self
            .touches
            .iter()
            .filter(|t| t.is_member() && !t.is_unlink())
            .map(|t| t.state().path());
        derive_path_code(algorithm, base_dir, paths)
    }

    pub fn to_csv_string(&self) -> String {
        format!(
            "{pid}{fs}{depth}{fs}{ppid}{fs}{start}{fs}{dur}{fs}{host}{fs}{rec}{fs}{cmd}",
            fs = FS1,
            pid = self.pid,
            depth = self.depth,
            ppid = self.ppid,
            start = self.start.to_standard_string(),
            dur = self.duration.to_simple_string(),
            host = self.host.as_deref().unwrap_or("-"),
            rec = self.recycled_from.as_deref().unwrap_or(""),
            cmd = self.command.to_csv_string(),
        )
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_csv_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA_LINE: &str = "1234,0,1,l0ruel.16mv8g,250,buildhost,,/usr/bin/cc,src,p1,c1,k1-2,cc -c a.c";
    const PA_LINE: &str = "R,open,l0ruel.16mv8g,1234,0,1,1,p1,c1,f,?,l0ruel.16mv8g,8,plw,1sgxm0v,,src/a.c";

    #[test]
    fn test_parse_record() {
        let record = AuditRecord::parse(CA_LINE).unwrap();
        assert_eq!(record.pid(), 1234);
        assert_eq!(record.depth(), 0);
        assert_eq!(record.ppid(), 1);
        assert_eq!(record.start().to_standard_string(), "l0ruel.16mv8g");
        assert_eq!(record.duration().millis(), 250);
        assert_eq!(record.host(), Some("buildhost"));
        assert_eq!(record.recycled_from(), None);
        assert_eq!(record.command().line(), "cc -c a.c");
        assert_eq!(record.transaction(), None);
    }

    #[test]
    fn test_parse_recycled_record() {
        let line = CA_LINE.replace("buildhost,,", "buildhost,20100412160000,");
        let record = AuditRecord::parse(&line).unwrap();
        assert!(record.is_recycled());
        assert_eq!(record.recycled_from(), Some("20100412160000"));
    }

    #[test]
    fn test_short_record_rejected() {
        assert!(AuditRecord::parse("1234,0,1,l0ruel.16mv8g,250,buildhost").is_err());
        assert!(AuditRecord::parse("x,0,1,l0ruel.16mv8g,250,h,,cc,src,p,c,k,line").is_err());
        assert!(AuditRecord::parse("1,0,1,l0ruel.16mv8g,250,h,,cc,src,p,c").is_err());
    }

    #[test]
    fn test_parse_touch() {
        let touch = PathTouch::parse(PA_LINE).unwrap();
        assert_eq!(touch.op(), Op::Read);
        assert_eq!(touch.call(), Some("open"));
        assert!(!touch.is_target());
        assert!(touch.is_member());
        assert_eq!(touch.state().path_str(), "src/a.c");
    }

    #[test]
    fn test_touch_with_blank_action_fields() {
        let touch = PathTouch::parse("U,,,,,,,,,f,?,l0ruel.16mv8g,8,plw,,,/tmp/x").unwrap();
        assert!(touch.is_unlink());
        assert!(touch.is_target());
        assert!(!touch.is_member());
        assert!(PathTouch::parse(",,,,,,,,,f,?,l0ruel.16mv8g,8,plw,,,/tmp/x").is_err());
        assert!(PathTouch::parse("R,,,,,,,,").is_err());
    }

    #[test]
    fn test_target_classification() {
        for (c, target) in [('R', false), ('X', false), ('C', true), ('A', true), ('U', true), ('S', true)] {
            assert_eq!(Op::from_char(c).is_target(), target, "op {c}");
            assert_eq!(Op::from_char(c).as_char(), c);
        }
    }

    fn record(pid: u64, depth: u64, ppid: u64) -> AuditRecord {
        AuditRecord::parse(&format!("{pid},{depth},{ppid},1.0,0,h,,-,-,-,-,-,true")).unwrap()
    }

    #[test]
    fn test_child_by_parent_pid() {
        let parent = record(100, 0, 1);
        let child = record(200, 0, 100);
        assert!(child.is_child_of(&parent));
        assert!(!parent.is_child_of(&child));
    }

    #[test]
    fn test_child_by_depth_in_same_process() {
        let outer = record(100, 1, 1);
        let inner = record(100, 0, 1);
        assert!(inner.is_child_of(&outer));
        assert!(!outer.is_child_of(&inner));
    }

    #[test]
    fn test_not_child_of_self() {
        let only = record(100, 0, 100);
        assert!(!only.is_child_of(&only));
    }

    #[test]
    fn test_final_states_keep_last_touch() {
        let mut rec = record(1, 0, 0);
        rec.add_path_touch(PathTouch::parse("C,,,,,,,,,f,?,1.0,1,plw,a1,,out.o").unwrap());
        rec.add_path_touch(PathTouch::parse("R,,,,,,,,,f,?,1.0,1,plw,b1,,in.c").unwrap());
        rec.add_path_touch(PathTouch::parse("A,,,,,,,,,f,?,2.0,2,plw,a2,,out.o").unwrap());
        assert_eq!(rec.touches().len(), 3);
        let last = rec.final_states();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].state().content_code(), Some("a2"));
        assert_eq!(rec.prereqs().count(), 1);
        assert_eq!(rec.targets().count(), 2);
        assert!(rec.has_target());
    }

    #[test]
    fn test_derive_path_code_skips_unlinks_and_non_members() {
        let mut rec = record(1, 0, 0);
        rec.add_path_touch(PathTouch::parse("R,,,,,,,,,f,?,1.0,1,plw,,,a.c").unwrap());
        rec.add_path_touch(PathTouch::parse("R,,,,,,,,,f,?,1.0,1,plw,,,/usr/include/x.h").unwrap());
        rec.add_path_touch(PathTouch::parse("U,,,,,,,,,f,?,1.0,1,plw,,,tmp.o").unwrap());
        let code = rec.derive_path_code(HashAlgorithm::Crc32, "/proj").unwrap();
        assert!(code.ends_with("-1"));
    }
}
