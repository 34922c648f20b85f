use crate::ops::StateOp;
use crate::types::{PeerId, SpaceId};
use anyhow::{anyhow, bail, Context as _, Result};
use fs_err::{self as fs, File, OpenOptions};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, trace, warn};

/// WAL file header identifying format, version and owning replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub space_id: SpaceId,
    pub peer_id: PeerId,
    pub created_at: i64,
}

impl WalHeader {
    const MAGIC: [u8; 4] = *b"SSWL";
    const VERSION: u32 = 1;

    pub fn new(space_id: SpaceId, peer_id: PeerId) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            space_id,
            peer_id,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}

/// Entry in the WAL file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub state_op: StateOp,
    pub checksum: u32,
}

impl WalEntry {
    pub fn new(sequence: u64, state_op: StateOp) -> Result<Self> {
        let checksum = Self::checksum_of(&state_op)?;
        Ok(Self {
            sequence,
            state_op,
            checksum,
        })
    }

    fn checksum_of(state_op: &StateOp) -> Result<u32> {
        let serialized = bincode::serde::encode_to_vec(state_op, bincode::config::standard())?;
        Ok(crc32fast::hash(&serialized))
    }

    pub fn verify_checksum(&self) -> bool {
        Self::checksum_of(&self.state_op).is_ok_and(|computed| computed == self.checksum)
    }
}

/// Append-only log of state ops for one space replica.
///
/// Layout: `[u32 header_len][header][u32 entry_len][entry]...`, all bincode.
pub struct WriteAheadLog {
    file_path: PathBuf,
    writer: Option<BufWriter<File>>,
    sequence: u64,
    space_id: SpaceId,
    peer_id: PeerId,
}

impl WriteAheadLog {
    /// Create or open a WAL file
    pub fn new<P: AsRef<Path>>(file_path: P, space_id: &str, peer_id: &str) -> Result<Self> {
        let mut wal = Self {
            file_path: file_path.as_ref().to_path_buf(),
            writer: None,
            sequence: 0,
            space_id: space_id.to_string(),
            peer_id: peer_id.to_string(),
        };
        wal.open_for_writing()?;
        Ok(wal)
    }

    fn open_for_writing(&mut self) -> Result<()> {
        let file_exists = self.file_path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.file_path)?;

        if !file_exists {
            let mut writer = BufWriter::new(file);
            let header = WalHeader::new(self.space_id.clone(), self.peer_id.clone());
            write_frame(&mut writer, &header)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;

            info!("Created new WAL file: {:?}", self.file_path);
            self.writer = Some(writer);
            return Ok(());
        }

        let file_len = file.metadata()?.len();
        let mut reader = FrameReader::new(BufReader::new(File::open(&self.file_path)?), file_len);
        let header = self.read_header(&mut reader)?;
        if header.peer_id != self.peer_id {
            warn!(
                "WAL writer mismatch: expected {}, found {}",
                self.peer_id, header.peer_id
            );
        }
        let entries = scan_entries(&mut reader);
        self.sequence = entries.last().map_or(0, |entry| entry.sequence);

        // Appends must land right after the last intact frame
        let valid_len = reader.offset();
        if valid_len < file_len {
            warn!(
                "Truncating torn WAL tail of {:?}: {} -> {} bytes",
                self.file_path, file_len, valid_len
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        self.writer = Some(BufWriter::new(file));

        info!(
            "Opened existing WAL file: {:?}, last sequence: {}",
            self.file_path, self.sequence
        );
        Ok(())
    }

    fn read_header<R: Read>(&self, reader: &mut FrameReader<R>) -> Result<WalHeader> {
        let header: WalHeader = reader
            .next()?
            .ok_or_else(|| anyhow!("WAL file {:?} has no header", self.file_path))?;
        if !header.is_valid() {
            bail!("Invalid WAL file header in {:?}", self.file_path);
        }
        if header.space_id != self.space_id {
            bail!(
                "WAL space mismatch: expected {}, found {}",
                self.space_id,
                header.space_id
            );
        }
        Ok(header)
    }

    /// Write multiple state operations to the WAL in a single fsync
    pub fn write_ops(&mut self, state_ops: &[StateOp]) -> Result<()> {
        if state_ops.is_empty() {
            return Ok(());
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("WAL writer not initialized"))?;

        for state_op in state_ops {
            self.sequence += 1;
            let wal_entry = WalEntry::new(self.sequence, state_op.clone())?;
            write_frame(writer, &wal_entry)?;
            trace!("Wrote WAL op: sequence={}, op={state_op:?}", self.sequence);
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read all state operations from the WAL for recovery
    pub fn read_all_ops(&self) -> Result<Vec<StateOp>> {
        let file = File::open(&self.file_path)?;
        let file_len = file.metadata()?.len();
        let mut reader = FrameReader::new(BufReader::new(file), file_len);
        self.read_header(&mut reader)?;

        let entries = scan_entries(&mut reader);
        if entries.iter().any(|entry| !entry.verify_checksum()) {
            bail!("WAL entry corrupted in {:?}", self.file_path);
        }

        info!(
            "Read {} log ops from WAL: {:?}",
            entries.len(),
            self.file_path
        );
        Ok(entries.into_iter().map(|entry| entry.state_op).collect())
    }

    /// Close the WAL and ensure all data is flushed
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            info!("Closed WAL: {:?}", self.file_path);
        }
        Ok(())
    }

    /// Truncate WAL by deleting the file and reopening a fresh one
    pub fn reset(&mut self) -> Result<()> {
        self.close()?;
        if let Err(err) = fs::remove_file(&self.file_path) {
            if err.kind() != ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        self.sequence = 0;
        self.open_for_writing()
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing WAL in drop: {e}");
        }
    }
}

fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
    let len = u32::try_from(bytes.len()).context("WAL frame too large")?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Sequential frame reader over a file of known length. `offset` is the
/// end of the last frame decoded in full.
struct FrameReader<R> {
    inner: R,
    offset: u64,
    len: u64,
}

impl<R: Read> FrameReader<R> {
    fn new(inner: R, len: u64) -> Self {
        Self {
            inner,
            offset: 0,
            len,
        }
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    /// Read one length-prefixed frame; `None` on a clean end of file.
    fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let remaining = self.len - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < 4 {
            bail!("{remaining} trailing bytes where a frame length was expected");
        }
        let mut len_bytes = [0u8; 4];
        self.inner
            .read_exact(&mut len_bytes)
            .context("Failed to read WAL frame length")?;
        let frame_len = u64::from(u32::from_le_bytes(len_bytes));
        if frame_len > remaining - 4 {
            bail!(
                "frame of {frame_len} bytes overruns the file ({} bytes left)",
                remaining - 4
            );
        }
        let mut bytes = vec![0u8; frame_len as usize];
        self.inner
            .read_exact(&mut bytes)
            .context("Failed to read WAL frame")?;
        let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .context("Failed to deserialize WAL frame")?;
        self.offset += 4 + frame_len;
        Ok(Some(value))
    }
}

/// Read entries until EOF. A truncated or undecodable tail (torn write) ends
/// the scan instead of failing it.
fn scan_entries<R: Read>(reader: &mut FrameReader<R>) -> Vec<WalEntry> {
    let mut entries = Vec::new();
    loop {
        match reader.next::<WalEntry>() {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => break,
            Err(err) => {
                warn!("Stopping WAL scan at damaged tail: {err:#}");
                break;
            }
        }
    }
    entries
}
