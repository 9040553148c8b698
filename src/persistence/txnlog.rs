use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::Error;
use itertools::Itertools;

use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::iter;
use std::path::{Path, PathBuf};

use super::{FileHeader, TxnLogCursor, TxnLogSource, TXNLOG_MAGIC, TXNLOG_VERSION};
use crate::proto::txn::Txn;
use crate::proto::Proposal;
use crate::Zxid;

/// Trailer byte closing every record (see `o.a.z.s.persistence.Util`).
const RECORD_TRAILER: u8 = 0x42;

const ADLER_MOD: u32 = 65521;

/// Adler-32 checksum of the record bytes, as stored in the log.
fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= ADLER_MOD;
        b %= ADLER_MOD;
    }
    (b << 16) | a
}

/// A single transaction log segment, named `log.<hex zxid>` after its first
/// record. After the initial header, it is a sequence of records framed as
/// `(crc: u64, length: u32, record bytes, 0x42)`.
///
/// A zero length or a clean end of file at a record boundary terminates the
/// segment; anything else mid-record means the last write was partial.
pub struct TxnLogFile {
    reader: BufReader<File>,
    done: bool,
}

impl TxnLogFile {
    pub fn new(path: impl AsRef<Path>) -> Result<TxnLogFile, Error> {
        let mut reader = BufReader::new(File::open(path)?);

        let header = FileHeader {
            magic: reader.read_i32::<BigEndian>()?,
            version: reader.read_i32::<BigEndian>()?,
            dbid: reader.read_i64::<BigEndian>()?,
        };

        if header.magic != TXNLOG_MAGIC {
            return Err(failure::err_msg("Wrong magic number"));
        }

        if header.version != TXNLOG_VERSION {
            return Err(failure::err_msg("Wrong version number"));
        }

        Ok(TxnLogFile {
            reader,
            done: false,
        })
    }
}

impl Iterator for TxnLogFile {
    type Item = Result<Proposal, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        fn read_next(this: &mut TxnLogFile) -> Result<Option<Proposal>, Error> {
            let crc = match this.reader.read_u64::<BigEndian>() {
                Ok(crc) => crc,
                // End of file at a record boundary terminates the segment
                Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let length = this.reader.read_u32::<BigEndian>()?;
            if length == 0 {
                // Pre-allocated segments are zero-filled, and zero length
                // indicates end of log
                return Ok(None);
            }

            let mut data = vec![0u8; length as usize];
            this.reader.read_exact(&mut data)?;

            if crc != adler32(&data) as u64 {
                return Err(failure::err_msg("Transaction checksum mismatch"));
            }

            // Next byte must be 'B' (0x42) (see o.a.z.s.persistence.Util)
            let b = this.reader.read_u8()?;
            if b != RECORD_TRAILER {
                return Err(failure::err_msg("Last transaction was partial."));
            }

            let txn: Txn = bincode::deserialize(&data)?;

            Ok(Some(Proposal {
                zxid: txn.header.zxid,
                data,
            }))
        }

        if self.done {
            None
        } else {
            let result = read_next(self).transpose();
            self.done = match result {
                None | Some(Err(_)) => true,
                Some(Ok(_)) => false,
            };
            result
        }
    }
}

/// Directory-backed transaction log: a series of `log.<hex zxid>` segments,
/// each starting at the zxid of its first record.
pub struct FileTxnLog {
    dir: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileTxnLog {
    pub fn new(dir: impl AsRef<Path>) -> FileTxnLog {
        FileTxnLog {
            dir: dir.as_ref().to_path_buf(),
            writer: None,
        }
    }

    /// Appends a transaction. The first append after construction or after
    /// `roll()` starts a new segment named after the transaction's zxid.
    pub fn append(&mut self, txn: &Txn) -> Result<(), Error> {
        let data = bincode::serialize(txn)?;

        if self.writer.is_none() {
            let name = format!("log.{:x}", txn.header.zxid.0 as u64);
            let file = File::create(self.dir.join(name))?;
            let mut writer = BufWriter::new(file);
            writer.write_i32::<BigEndian>(TXNLOG_MAGIC)?;
            writer.write_i32::<BigEndian>(TXNLOG_VERSION)?;
            writer.write_i64::<BigEndian>(0)?; // dbid
            self.writer = Some(writer);
        }

        let writer = self.writer.as_mut().unwrap();
        writer.write_u64::<BigEndian>(adler32(&data) as u64)?;
        writer.write_u32::<BigEndian>(data.len() as u32)?;
        writer.write_all(&data)?;
        writer.write_u8(RECORD_TRAILER)?;

        Ok(())
    }

    /// Flushes buffered records down to the file system.
    pub fn commit(&mut self) -> Result<(), Error> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Closes the current segment; the next append starts a new one.
    pub fn roll(&mut self) -> Result<(), Error> {
        self.commit()?;
        self.writer = None;
        Ok(())
    }

    /// Finds the log segments containing transactions at or after `zxid`:
    /// every segment from the newest one whose starting zxid is `<= zxid`
    /// onwards, in zxid order. Empty when `zxid` predates the oldest segment.
    pub fn find_txnlog_paths(&self, zxid: Zxid) -> Result<Vec<PathBuf>, Error> {
        // Collect log files as (zxid, path) pairs
        let mut zxid_paths = std::fs::read_dir(&self.dir)?
            .filter_map(|r| r.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .starts_with("log.")
            })
            .filter_map(|path| super::zxid_from_path(&path).map(|z| (z, path)))
            .collect::<Vec<_>>();

        zxid_paths.sort_by(|(zxid1, _), (zxid2, _)| zxid1.cmp(zxid2));

        // Find the highest starting zxid that is <= the target
        let start_zxid = zxid_paths
            .iter()
            .map(|(z, _)| *z)
            .filter(|z| z <= &zxid)
            .max();

        let start_zxid = match start_zxid {
            Some(z) => z,
            None => return Ok(Vec::new()),
        };

        let result = zxid_paths
            .into_iter()
            .filter_map(|(z, path)| if z < start_zxid { None } else { Some(path) })
            .collect();

        Ok(result)
    }
}

impl TxnLogSource for FileTxnLog {
    fn open_from<'a>(&'a self, zxid: Zxid, size_limit: u64) -> Result<TxnLogCursor<'a>, Error> {
        let paths = self.find_txnlog_paths(zxid)?;
        if paths.is_empty() {
            return Ok(Box::new(iter::empty()));
        }

        if size_limit > 0 {
            let mut total = 0u64;
            for path in &paths {
                total += std::fs::metadata(path)?.len();
            }
            if total > size_limit {
                info!(
                    "txnlog segments from {} hold {} bytes, above the {} byte sync limit",
                    zxid, total, size_limit
                );
                return Ok(Box::new(iter::empty()));
            }
        }

        // Open all segments, failing if one can't be opened
        let files = paths
            .into_iter()
            .map(TxnLogFile::new)
            .fold_results(Vec::new(), |mut vec, txnlog| {
                vec.push(txnlog);
                vec
            })?;

        Ok(Box::new(files.into_iter().flat_map(|f| f)))
    }
}
