use serde::Serialize;

/// Outcome of comparing a local copy against its remote original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
}

/// Byte-length equality is the only integrity signal; there is no tolerance window.
pub fn compare(local_size_bytes: u64, remote_size_bytes: u64) -> Verdict {
    if local_size_bytes == remote_size_bytes {
        Verdict::Match
    } else {
        Verdict::Mismatch
    }
}
