//! Audit ingestion: turn one uploaded audit block into an [`AuditRecord`].
//!
//! A block holds one digit-leading command line followed by letter-leading
//! path lines. Further digit-leading lines are subcommands that the client
//! rolled into the first one; they only mark the command as aggregated.

use std::io::{BufRead, BufReader, Read};

use flate2::read::GzDecoder;
use rayon::prelude::*;
use tracing::debug;

use crate::errors::{RecyclerError, RecyclerResult};
use crate::models::action::{AuditRecord, PathTouch};

/// A parsed block plus the widest content code it carried.
#[derive(Debug, Clone)]
pub struct ParsedAudit {
    pub record: AuditRecord,
    pub data_code_width: Option<usize>,
}

pub fn parse_audit<R: BufRead>(reader: R) -> RecyclerResult<ParsedAudit> {
    let mut record: Option<AuditRecord> = None;
    let mut width: Option<usize> = None;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        let Some(first) = line.chars().next() else {
            continue;
        };

        if first.is_ascii_digit() {
            match record.as_mut() {
                None => record = Some(AuditRecord::parse(line)?),
                Some(existing) => existing.command_mut().mark_aggregated(),
            }
        } else if first.is_alphabetic() {
            let touch = PathTouch::parse(line)?;
            let owner = record
                .as_mut()
                .ok_or_else(|| RecyclerError::malformed("path action before command", line))?;
            if let Some(code) = touch.state().content_code() {
                width = Some(width.unwrap_or(0).max(code.len()));
            }
            owner.add_path_touch(touch);
        } else {
            return Err(RecyclerError::malformed("unexpected audit line", line));
        }
    }

    let record = record.ok_or_else(|| RecyclerError::Malformed("empty audit block".to_string()))?;
    debug!(
        "Parsed audit: line = {}, touches = {}, aggregated = {}",
        record.command().line(),
        record.touches().len(),
        record.command().is_aggregated()
    );
    Ok(ParsedAudit {
        record,
        data_code_width: width,
    })
}

pub fn parse_audit_str(text: &str) -> RecyclerResult<ParsedAudit> {
    parse_audit(text.as_bytes())
}

/// Parse a block, gunzipping first when the client says it is compressed.
pub fn parse_audit_bytes(bytes: &[u8], gzipped: bool) -> RecyclerResult<ParsedAudit> {
    if gzipped {
        parse_audit(BufReader::new(GzDecoder::new(bytes)))
    } else {
        parse_audit(bytes)
    }
}

pub fn parse_audit_reader<R: Read>(reader: R) -> RecyclerResult<ParsedAudit> {
    parse_audit(BufReader::new(reader))
}

/// Parse independent blocks on a Rayon pool. A bad block fails alone.
pub fn parse_audit_batch(blocks: &[String], workers: usize) -> Vec<RecyclerResult<ParsedAudit>> {
    if blocks.is_empty() {
        return vec![];
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();

    match pool {
        Ok(pool) => pool.install(|| {
            blocks
                .par_iter()
                .map(|block| parse_audit_str(block))
                .collect()
        }),
        Err(_) => {
            // Fallback to sequential
            blocks.iter().map(|block| parse_audit_str(block)).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const BLOCK: &str = "\
100,0,1,l0ruel.16mv8g,250,host,,cc,src,p1,c1,k1-2,cc -c a.c -o a.o
R,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,40,plw,y1,,a.c
C,open,l0ruel.16mv8g,100,0,1,1,p1,c1,f,?,l0ruel.16mv8g,120,plw,x1234567890,,a.o
";

    #[test]
    fn test_parse_block() {
        let parsed = parse_audit_str(BLOCK).unwrap();
        assert_eq!(parsed.record.command().line(), "cc -c a.c -o a.o");
        assert_eq!(parsed.record.touches().len(), 2);
        assert_eq!(parsed.record.targets().count(), 1);
        assert!(!parsed.record.command().is_aggregated());
        assert_eq!(parsed.data_code_width, Some(11));
    }

    #[test]
    fn test_second_command_line_marks_aggregated() {
        let text = format!("{BLOCK}101,1,100,l0ruel.16mv8g,5,host,,as,src,c1,c2,k2-1,as a.s\n");
        let parsed = parse_audit_str(&text).unwrap();
        assert!(parsed.record.command().is_aggregated());
        assert_eq!(parsed.record.command().line(), "cc -c a.c -o a.o");
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let text = BLOCK.replace('\n', "\r\n") + "\r\n";
        let parsed = parse_audit_str(&text).unwrap();
        assert_eq!(parsed.record.touches().len(), 2);
    }

    #[test]
    fn test_rejects_bad_blocks() {
        assert!(parse_audit_str("").is_err());
        assert!(parse_audit_str("R,,,,,,,,,f,?,1.0,1,plw,,,a.c\n").is_err());
        assert!(parse_audit_str("#comment\n").is_err());
        let truncated = BLOCK.replace(",,a.o", "");
        assert!(parse_audit_str(&truncated).is_err());
    }

    #[test]
    fn test_gzipped_block() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(BLOCK.as_bytes()).unwrap();
        let bytes = encoder.finish().unwrap();
        let parsed = parse_audit_bytes(&bytes, true).unwrap();
        assert_eq!(parsed.record.touches().len(), 2);
        assert!(parse_audit_bytes(BLOCK.as_bytes(), false).is_ok());
    }

    #[test]
    fn test_batch_isolates_failures() {
        let blocks = vec![BLOCK.to_string(), "garbage".to_string(), BLOCK.to_string()];
        let results = parse_audit_batch(&blocks, 2);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert!(parse_audit_batch(&[], 2).is_empty());
    }
}
