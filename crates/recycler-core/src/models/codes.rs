//! Identity hashes for command lines, path sets and file content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::path::PathName;
use crate::models::wire::format_radix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// CRC32 rendered in radix 36. What clients send by default.
    #[default]
    Crc32,
    /// SHA-256 rendered as lower-case hex.
    Sha256,
}

pub fn identity_code(algorithm: HashAlgorithm, data: &[u8]) -> String {
    match algorithm {
        HashAlgorithm::Crc32 => format_radix(crc32fast::hash(data) as u64),
        HashAlgorithm::Sha256 => format!("{:x}", Sha256::digest(data)),
    }
}

/// Hash of the absolute form of every path, joined end to end, suffixed
/// with `-<count>`. `None` when there are no paths.
pub fn derive_path_code<'a, I>(algorithm: HashAlgorithm, base_dir: &str, paths: I) -> Option<String>
where
    I: IntoIterator<Item = &'a PathName>,
{
    let mut joined = String::new();
    let mut count = 0usize;
    for path in paths {
        if path.is_member() {
            joined.push_str(base_dir.trim_end_matches(['/', '\\']));
            joined.push('/');
        }
        joined.push_str(path.as_str());
        count += 1;
    }
    if count == 0 {
        return None;
    }
    Some(format!(
        "{}-{count}",
        identity_code(algorithm, joined.as_bytes())
    ))
}
