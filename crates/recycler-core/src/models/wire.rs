//! Constants and small helpers shared by every audit and roadmap text format.

use crate::errors::{RecyclerError, RecyclerResult};

/// Radix used for every numeric-as-text field.
pub const CSV_RADIX: u32 = 36;

/// Primary field separator.
pub const FS1: char = ',';

/// Secondary separator, used for lists inside a single field.
pub const FS2: char = '+';

/// Marker for a field with no value.
pub const NULL_FIELD: &str = "-";

/// Stand-in for an embedded newline inside a command line.
pub const NEWLINE_TOKEN: &str = "^J";

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Render `value` in radix 36, lower case.
pub fn format_radix(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        buf.push(DIGITS[(value % CSV_RADIX as u64) as usize]);
        value /= CSV_RADIX as u64;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

pub fn parse_radix(text: &str) -> RecyclerResult<u64> {
    u64::from_str_radix(text, CSV_RADIX)
        .map_err(|_| RecyclerError::malformed("bad radix-36 number", text))
}

pub fn parse_decimal(text: &str) -> RecyclerResult<i64> {
    text.trim()
        .parse::<i64>()
        .map_err(|_| RecyclerError::malformed("bad decimal number", text))
}

/// Split `text` into exactly `count` fields; the last field keeps any
/// remaining separators.
pub fn split_fields<'a>(text: &'a str, count: usize, what: &str) -> RecyclerResult<Vec<&'a str>> {
    let fields: Vec<&str> = text.splitn(count, FS1).collect();
    if fields.len() != count {
        return Err(RecyclerError::Malformed(format!(
            "{what} needs {count} fields, found {}: '{text}'",
            fields.len()
        )));
    }
    Ok(fields)
}

/// `None` for the null marker, otherwise the field itself.
pub fn optional_field(field: &str) -> Option<&str> {
    if field == NULL_FIELD {
        None
    } else {
        Some(field)
    }
}

/// Byte offset of the `nth` field separator (1-based).
pub fn nth_separator(text: &str, nth: usize) -> Option<usize> {
    text.match_indices(FS1).nth(nth.checked_sub(1)?).map(|(i, _)| i)
}
