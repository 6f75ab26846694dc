//! A single append-only log file.
//!
//! Layout: a fixed header (magic, format version, checksum algorithm)
//! followed by self-delimited entries. Opening an existing file walks the
//! entries once; a torn tail (crash mid-append) is detected by the length
//! framing plus checksum and truncated back to the last good boundary.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::entry::LogEntry;

pub const MAGIC: [u8; 6] = *b"(logd)";
pub const FORMAT_VERSION: u8 = 1;
pub const CHECKSUM_ALGORITHM_CRC32C: u8 = 0;

/// magic + format version + checksum algorithm + 2 reserved bytes
pub const HEADER_LEN: u64 = MAGIC.len() as u64 + 4;

#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
}

impl LogFile {
    /// Create a fresh file at `path` and write its header.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the file exists.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&MAGIC)?;
        file.write_all(&[FORMAT_VERSION, CHECKSUM_ALGORITHM_CRC32C, 0, 0])?;
        file.sync_all()?;

        Ok(LogFile {
            path,
            writer: BufWriter::new(file),
            size: HEADER_LEN,
        })
    }

    /// Open an existing file, validating the header and repairing a torn
    /// tail.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).append(true).open(&path)?;

        let mut reader = BufReader::new(File::open(&path)?);
        check_header(&mut reader, &path)?;

        // Walk to the last good entry boundary.
        let mut good_end = HEADER_LEN;
        loop {
            match LogEntry::decode_from(&mut reader, good_end) {
                Ok(Some(entry)) => {
                    good_end += entry_len_on_disk(&entry);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        "torn tail in {}: {} -- truncating to offset {}",
                        path.display(),
                        e,
                        good_end
                    );
                    file.set_len(good_end)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        let size = file.metadata()?.len();
        debug_assert_eq!(size, good_end);

        Ok(LogFile {
            path,
            writer: BufWriter::new(file),
            size,
        })
    }

    /// Open `path` if it exists, create it otherwise.
    pub fn open_or_create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes, including the header.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append one entry durably. Returns the byte offset it was written
    /// at.
    pub fn append(&mut self, entry: &LogEntry) -> io::Result<u64> {
        let pos = self.size;
        let written = entry.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.size += written;
        Ok(pos)
    }

    /// Read the entry at `pos` through an independent handle, so readers
    /// never disturb the append position.
    pub fn read_entry_at(&self, pos: u64) -> io::Result<Option<LogEntry>> {
        if pos < HEADER_LEN || pos >= self.size {
            return Ok(None);
        }
        let mut reader = BufReader::new(File::open(&self.path)?);
        reader.seek(SeekFrom::Start(pos))?;
        LogEntry::decode_from(&mut reader, pos)
    }

    /// A sequential iterator over `(offset, entry)`, reading through an
    /// independent handle. The iterator sees the entries present when it
    /// was created; concurrent appends past that point are not yielded.
    pub fn entries(&self) -> io::Result<Entries> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        check_header(&mut reader, &self.path)?;
        Ok(Entries {
            reader,
            pos: HEADER_LEN,
            size: self.size,
        })
    }

    /// Sequentially visit `(offset, entry)` for every entry in the file.
    pub fn for_each_entry(
        &self,
        mut visit: impl FnMut(u64, LogEntry) -> io::Result<()>,
    ) -> io::Result<()> {
        for item in self.entries()? {
            let (pos, entry) = item?;
            visit(pos, entry)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    /// Delete the file. Consumes self; the handle is useless afterwards.
    pub fn remove(self) -> io::Result<()> {
        let path = self.path;
        drop(self.writer);
        fs::remove_file(&path)
    }
}

/// Iterator over the entries of one [`LogFile`], created by
/// [`LogFile::entries`].
#[must_use = "iterators are lazy and do nothing unless consumed"]
#[derive(Debug)]
pub struct Entries {
    reader: BufReader<File>,
    pos: u64,
    size: u64,
}

impl Iterator for Entries {
    type Item = io::Result<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.size {
            return None;
        }
        match LogEntry::decode_from(&mut self.reader, self.pos) {
            Ok(Some(entry)) => {
                let at = self.pos;
                self.pos += entry_len_on_disk(&entry);
                Some(Ok((at, entry)))
            }
            Ok(None) => None,
            Err(e) => {
                // Don't loop on a bad entry.
                self.pos = self.size;
                Some(Err(e))
            }
        }
    }
}

fn check_header<R: io::Read>(reader: &mut R, path: &Path) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN as usize];
    reader.read_exact(&mut header).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!("log file {} too short for header", path.display()),
        )
    })?;
    if !header.starts_with(&MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("log file {} does not start with magic", path.display()),
        ));
    }
    let version = header[MAGIC.len()];
    let checksum = header[MAGIC.len() + 1];
    if version > FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported log format version {version}"),
        ));
    }
    if checksum != CHECKSUM_ALGORITHM_CRC32C {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checksum algorithm {checksum}"),
        ));
    }
    Ok(())
}

fn entry_len_on_disk(entry: &LogEntry) -> u64 {
    // Cheaper than tracking it through decode: re-measure the body.
    let mut sink = CountingSink(0);
    entry.write_to(&mut sink).expect("counting sink cannot fail");
    sink.0
}

struct CountingSink(u64);

impl Write for CountingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryBody, LogEntry};
    use chrono::{TimeZone, Utc};
    use logd_value::Node;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn entry(commit: u64) -> LogEntry {
        LogEntry {
            commit,
            tx_seq: commit,
            last_commit: commit.saturating_sub(1),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap(),
            scope: None,
            schema: None,
            body: EntryBody::Patch(Node::object([("n", Node::int(commit as i64))])),
        }
    }

    #[test]
    fn append_read_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.a.0");

        let mut file = LogFile::create(&path).unwrap();
        let p1 = file.append(&entry(1)).unwrap();
        let p2 = file.append(&entry(2)).unwrap();
        assert_eq!(p1, HEADER_LEN);
        assert!(p2 > p1);

        assert_eq!(file.read_entry_at(p2).unwrap().unwrap(), entry(2));
        drop(file);

        let file = LogFile::open(&path).unwrap();
        assert_eq!(file.read_entry_at(p1).unwrap().unwrap(), entry(1));

        let mut seen = Vec::new();
        file.for_each_entry(|pos, entry| {
            seen.push((pos, entry.commit));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(p1, 1), (p2, 2)]);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.a.0");

        let mut file = LogFile::create(&path).unwrap();
        let p1 = file.append(&entry(1)).unwrap();
        file.append(&entry(2)).unwrap();
        let good = file.read_entry_at(p1).unwrap().unwrap();
        let full = file.size();
        drop(file);

        // Chop into the middle of the second entry.
        let handle = OpenOptions::new().write(true).open(&path).unwrap();
        handle.set_len(full - 5).unwrap();
        drop(handle);

        let file = LogFile::open(&path).unwrap();
        assert_eq!(file.read_entry_at(p1).unwrap().unwrap(), good);
        let mut count = 0;
        file.for_each_entry(|_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rejects_foreign_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.a.0");
        fs::write(&path, b"not a log file at all").unwrap();
        assert!(LogFile::open(&path).is_err());
    }
}
