//! Append-only block and undo files addressed by [`BlockPosition`].
//!
//! Records are framed with a little-endian length prefix; the position
//! stored in the index points at the frame, matching `blk?????.dat` and
//! `rev?????.dat` conventions.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::blockindex::BlockPosition;

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    NullPosition,
    OversizeRecord,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::NullPosition => write!(f, "null block position"),
            BlockFileError::OversizeRecord => write!(f, "record exceeds block file size"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

pub struct BlockFileStore {
    dir: PathBuf,
    prefix: String,
    max_file_size: u32,
    state: Mutex<BlockFileState>,
}

#[derive(Debug)]
struct BlockFileState {
    current_file: i32,
    current_len: u32,
}

impl BlockFileStore {
    pub const DEFAULT_MAX_FILE_SIZE: u32 = 128 * 1024 * 1024;

    /// Store for raw block data (`blk?????.dat`).
    pub fn blocks(dir: impl Into<PathBuf>) -> Result<Self, BlockFileError> {
        Self::with_prefix(dir, "blk", Self::DEFAULT_MAX_FILE_SIZE)
    }

    /// Store for undo data (`rev?????.dat`).
    pub fn undo(dir: impl Into<PathBuf>) -> Result<Self, BlockFileError> {
        Self::with_prefix(dir, "rev", Self::DEFAULT_MAX_FILE_SIZE)
    }

    pub fn with_prefix(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        max_file_size: u32,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        let prefix = prefix.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, &prefix, max_file_size)?;
        Ok(Self {
            dir,
            prefix,
            max_file_size,
            state: Mutex::new(BlockFileState {
                current_file,
                current_len,
            }),
        })
    }

    pub fn append(&self, bytes: &[u8]) -> Result<BlockPosition, BlockFileError> {
        let needed = 4u64 + bytes.len() as u64;
        if needed > u64::from(self.max_file_size) {
            return Err(BlockFileError::OversizeRecord);
        }
        let mut state = self.state.lock().expect("block file lock");
        if u64::from(state.current_len) + needed > u64::from(self.max_file_size) {
            state.current_file += 1;
            state.current_len = 0;
        }
        let offset = state.current_len;
        let path = self.file_path(state.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        file.write_all(bytes)?;
        file.flush()?;
        state.current_len += needed as u32;
        Ok(BlockPosition::new(state.current_file, offset))
    }

    pub fn read(&self, position: BlockPosition) -> Result<Vec<u8>, BlockFileError> {
        if position.is_null() {
            return Err(BlockFileError::NullPosition);
        }
        let path = self.file_path(position.file);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(u64::from(position.offset)))?;
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn file_path(&self, file: i32) -> PathBuf {
        self.dir.join(format!("{}{file:05}.dat", self.prefix))
    }

    fn locate_active_file(
        dir: &Path,
        prefix: &str,
        max_file_size: u32,
    ) -> Result<(i32, u32), BlockFileError> {
        let mut file = 0i32;
        let mut last_existing: Option<(i32, u32)> = None;
        loop {
            let path = dir.join(format!("{prefix}{file:05}.dat"));
            if !path.exists() {
                break;
            }
            let len = std::fs::metadata(&path)?.len();
            last_existing = Some((file, len.min(u64::from(max_file_size)) as u32));
            file += 1;
        }
        match last_existing {
            Some((last, len)) if len >= max_file_size => Ok((last + 1, 0)),
            Some((last, len)) => Ok((last, len)),
            None => Ok((0, 0)),
        }
    }
}
