//! RAID 6 shard file names
//!
//! Shard `block` of chunk `chunk` is stored as `<object>.<chunk>.<block>` and
//! its version copies as `<object>.<chunk>.<block>.v<N>`.

/// Head shard file name
pub fn shard_file_name(object: &str, chunk: u32, block: usize) -> String {
    format!("{}.{}.{}", object, chunk, block)
}

/// Components of a parsed shard file name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardName {
    pub chunk: u32,
    pub block: usize,
    pub version: Option<u32>,
}

/// Parse `file` as a shard of `object`
///
/// The remainder after `<object>.` must be exactly two numeric groups,
/// optionally followed by `.v<N>`; anything else belongs to another object.
pub fn parse_shard_name(object: &str, file: &str) -> Option<ShardName> {
    let rest = file.strip_prefix(object)?.strip_prefix('.')?;
    let mut parts = rest.split('.');
    let chunk = parse_number(parts.next()?)?;
    let block = parse_number(parts.next()?)? as usize;
    let version = match parts.next() {
        None => None,
        Some(v) => Some(parse_number(v.strip_prefix('v')?)?),
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ShardName {
        chunk,
        block,
        version,
    })
}

fn parse_number(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
