use serde_derive::Deserialize;
use serde_derive::Serialize;

pub mod txnlog;

pub use txnlog::FileTxnLog;

use failure::Error;
use std::path::Path;

use crate::proto::Proposal;
use crate::Zxid;

#[derive(Deserialize, Serialize)]
pub struct FileHeader {
    pub magic: i32,   // Should be TXNLOG_MAGIC
    pub version: i32, // Should be TXNLOG_VERSION
    pub dbid: i64,
}

pub const TXNLOG_MAGIC: i32 = 0x5a4b4c47; // "ZKLG"
pub const TXNLOG_VERSION: i32 = 2;

/// Parses the zxid suffix of a `log.<hex zxid>` file name.
pub fn zxid_from_path(path: impl AsRef<Path>) -> Option<Zxid> {
    let name = path.as_ref().file_name()?.to_str()?;
    let hex = name.splitn(2, '.').nth(1)?;
    u64::from_str_radix(hex, 16).ok().map(|v| Zxid(v as i64))
}

/// A scoped forward cursor over persisted proposals. It owns the open file
/// handles it needs; dropping it releases them on every exit path.
pub type TxnLogCursor<'a> = Box<dyn Iterator<Item = Result<Proposal, Error>> + 'a>;

/// Narrow read interface over the on-disk transaction log, as consumed by the
/// replicated log view.
pub trait TxnLogSource: Send + Sync {
    /// Opens a cursor positioned at the newest log segment whose first record
    /// is at or before `zxid`. Callers scan forward from there; records below
    /// their target are skipped by the caller, which uses them to locate a
    /// truncation point.
    ///
    /// Returns an empty cursor when `zxid` predates the oldest retained
    /// record, or when `size_limit` is non-zero and the selected segments
    /// exceed it.
    fn open_from<'a>(&'a self, zxid: Zxid, size_limit: u64) -> Result<TxnLogCursor<'a>, Error>;
}
