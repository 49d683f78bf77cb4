//! Chunked reading of delimited sources.
//!
//! Two chunking modes:
//!
//! - [`LineBatchReader`]: whole lines only. The header line is dropped exactly once, blank lines
//!   are discarded and the remaining data lines are regrouped into fixed-size [`RawBatch`]es.
//!   A data row is never split across two batches.
//! - [`ByteChunkReader`]: fixed-size byte chunks for backends that buffer partial records
//!   themselves. A chunk boundary may fall inside a record.
//!
//! Both readers are lazy and finite. They cannot be rewound; re-open the [`CsvSource`] to start
//! over from the beginning.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// A file-backed delimited source that can be opened any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    /// Create a source for `path`. Nothing is opened until a reader is requested.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a fresh line-oriented reader.
    pub fn line_batches(&self, batch_size: usize) -> EngineResult<LineBatchReader<BufReader<File>>> {
        let (file, total) = open_file(&self.path)?;
        LineBatchReader::new(BufReader::new(file), batch_size, Some(total))
    }

    /// Open a fresh byte-oriented reader.
    pub fn byte_chunks(&self, chunk_bytes: usize) -> EngineResult<ByteChunkReader<File>> {
        let (file, total) = open_file(&self.path)?;
        Ok(ByteChunkReader::new(file, chunk_bytes, Some(total)))
    }
}

fn open_file(path: &Path) -> EngineResult<(File, u64)> {
    let file = File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => EngineError::SourceNotFound {
            path: path.to_path_buf(),
        },
        _ => EngineError::Io(e),
    })?;
    let total = file.metadata()?.len();
    Ok((file, total))
}

/// One data line and its 1-based position in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// 1-based line number (the header is line 1 of a file without leading blanks).
    pub number: u64,
    /// Line text without its terminator.
    pub text: String,
}

/// A group of whole data lines, tagged with the index it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    /// Zero-based, monotonic read index.
    pub index: u64,
    /// Data lines, in source order.
    pub lines: Vec<SourceLine>,
    /// Bytes of source text covered by this batch (blank lines and terminators included).
    pub byte_len: u64,
    /// Cumulative source bytes consumed once this batch was read (header included).
    pub bytes_consumed: u64,
    /// Cumulative data rows read once this batch was read.
    pub rows_consumed: u64,
}

impl RawBatch {
    /// Number of data lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the batch holds no lines.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Line texts in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.text.as_str())
    }
}

/// Line-oriented batch reader. See the module docs.
pub struct LineBatchReader<R> {
    inner: R,
    header: Option<String>,
    batch_size: usize,
    next_index: u64,
    line_no: u64,
    bytes_consumed: u64,
    rows_consumed: u64,
    total_bytes: Option<u64>,
    done: bool,
    buf: String,
}

impl<R: BufRead> LineBatchReader<R> {
    /// Wrap `inner`, reading the header immediately.
    ///
    /// The first non-blank line is the header. An input without one yields no batches.
    pub fn new(inner: R, batch_size: usize, total_bytes: Option<u64>) -> EngineResult<Self> {
        if batch_size == 0 {
            return Err(EngineError::InvalidConfig {
                message: "batch_size must be > 0".to_string(),
            });
        }
        let mut reader = Self {
            inner,
            header: None,
            batch_size,
            next_index: 0,
            line_no: 0,
            bytes_consumed: 0,
            rows_consumed: 0,
            total_bytes,
            done: false,
            buf: String::new(),
        };
        while let Some((_, text, _)) = reader.read_line()? {
            if !text.trim().is_empty() {
                reader.header = Some(text);
                break;
            }
        }
        if reader.header.is_none() {
            reader.done = true;
        }
        Ok(reader)
    }

    /// The header line, if the source had one.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Total source size in bytes, when known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    /// Bytes consumed so far, header included.
    pub fn bytes_consumed(&self) -> u64 {
        self.bytes_consumed
    }

    /// Read the next batch of up to `batch_size` data lines.
    pub fn next_batch(&mut self) -> EngineResult<Option<RawBatch>> {
        if self.done {
            return Ok(None);
        }
        let start_bytes = self.bytes_consumed;
        let mut lines = Vec::with_capacity(self.batch_size);
        while lines.len() < self.batch_size {
            match self.read_line()? {
                Some((number, text, _)) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    lines.push(SourceLine { number, text });
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if lines.is_empty() {
            return Ok(None);
        }

        self.rows_consumed += lines.len() as u64;
        let batch = RawBatch {
            index: self.next_index,
            lines,
            byte_len: self.bytes_consumed - start_bytes,
            bytes_consumed: self.bytes_consumed,
            rows_consumed: self.rows_consumed,
        };
        self.next_index += 1;
        Ok(Some(batch))
    }

    fn read_line(&mut self) -> EngineResult<Option<(u64, String, usize)>> {
        self.buf.clear();
        let n = self.inner.read_line(&mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        self.bytes_consumed += n as u64;
        let text = self.buf.trim_end_matches(['\n', '\r']).to_string();
        Ok(Some((self.line_no, text, n)))
    }
}

impl<R: BufRead> Iterator for LineBatchReader<R> {
    type Item = EngineResult<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(b)) => Some(Ok(b)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// A raw slice of source bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteChunk {
    /// Zero-based, monotonic read index.
    pub index: u64,
    /// Chunk contents. May begin or end mid-record.
    pub bytes: Vec<u8>,
    /// Cumulative bytes consumed once this chunk was read.
    pub consumed: u64,
    /// Total source size in bytes, when known.
    pub total: Option<u64>,
}

/// Byte-oriented chunk reader. See the module docs.
pub struct ByteChunkReader<R> {
    inner: R,
    chunk_bytes: usize,
    next_index: u64,
    consumed: u64,
    total: Option<u64>,
    done: bool,
}

impl<R: Read> ByteChunkReader<R> {
    /// Wrap `inner`, producing chunks of at most `chunk_bytes` bytes.
    pub fn new(inner: R, chunk_bytes: usize, total: Option<u64>) -> Self {
        Self {
            inner,
            chunk_bytes: chunk_bytes.max(1),
            next_index: 0,
            consumed: 0,
            total,
            done: false,
        }
    }

    /// Total source size in bytes, when known.
    pub fn total_bytes(&self) -> Option<u64> {
        self.total
    }

    /// Read the next chunk. Only the final chunk may be shorter than `chunk_bytes`.
    pub fn next_chunk(&mut self) -> EngineResult<Option<ByteChunk>> {
        if self.done {
            return Ok(None);
        }
        let mut bytes = Vec::with_capacity(self.chunk_bytes);
        (&mut self.inner)
            .take(self.chunk_bytes as u64)
            .read_to_end(&mut bytes)?;
        if bytes.len() < self.chunk_bytes {
            self.done = true;
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        self.consumed += bytes.len() as u64;
        let chunk = ByteChunk {
            index: self.next_index,
            bytes,
            consumed: self.consumed,
            total: self.total,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

impl<R: Read> Iterator for ByteChunkReader<R> {
    type Item = EngineResult<ByteChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(c)) => Some(Ok(c)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
