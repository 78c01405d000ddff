use submerge_lang::Tsd;

/// A content hash of `tsd`, used as the CAS precondition a transaction sends
/// with its attempted write (spec.md §4.6): the server rejects the write as
/// stale if the value at `path` no longer hashes to this.
pub fn content_hash(tsd: &Tsd) -> String {
    let bytes = rmp_serde::to_vec(tsd).expect("Tsd always serializes");
    format!("{:016x}", rapidhash::rapidhash(&bytes))
}
