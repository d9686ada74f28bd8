//! Streaming I/O pipeline.
//!
//! A filter transforms a byte stream chunk by chunk. Filters compose into an
//! ordered group attached to a read or write endpoint; the endpoint drives
//! raw bytes through the group and serves the transformed view. Filters are
//! single-producer single-consumer and strictly synchronous - parallelism
//! lives outside the filter boundary (worker processes).
//!
//! A filter that cannot consume its whole input without emitting reports the
//! number of bytes it did consume and is re-entered with the remainder. On
//! end of stream the group flushes filters left to right until each reports
//! done. After close each filter surfaces an optional typed result (digest,
//! byte count, failed page list) keyed by filter name.

use std::collections::VecDeque;
use std::io::Read;

use anyhow::Error;

use crate::error::{vault_err, ErrorClass};

pub mod capture;
pub mod cipher;
pub mod compress;
pub mod hash;
pub mod page_checksum;
pub mod size;

/// Chunk size used when driving raw sources through a group.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

// Spin limit for a filter that neither consumes nor produces; exceeding it
// means the filter has violated the processing contract.
const DRIVE_LIMIT: usize = 1000;

/// Typed value surfaced by a filter after the stream is closed.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterResult {
    None,
    /// Total bytes seen (size filter).
    Size(u64),
    /// Hex digest (hash filters).
    Digest(String),
    /// Collected output bytes (capture filter).
    Buffer(Vec<u8>),
    /// Page numbers that failed checksum validation.
    PageErrors(Vec<u64>),
}

/// A single streaming transform.
pub trait Filter {
    fn name(&self) -> &'static str;

    /// Consume input bytes, appending any produced bytes to `output`.
    /// Returns how much input was consumed; the driver re-enters with the
    /// rest. `eof` marks the final chunk - once set the filter must reach
    /// `done` after finitely many calls.
    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error>;

    /// Terminal state after the final flush.
    fn done(&self) -> bool;

    fn result(&mut self) -> FilterResult {
        FilterResult::None
    }
}

/// Results gathered from a closed filter group, keyed by filter name.
#[derive(Debug, Default)]
pub struct FilterResults {
    results: Vec<(String, FilterResult)>,
}

impl FilterResults {
    pub fn get(&self, name: &str) -> Option<&FilterResult> {
        self.results
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    pub fn digest(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FilterResult::Digest(digest)) => Some(digest),
            _ => None,
        }
    }

    pub fn size(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(FilterResult::Size(size)) => Some(*size),
            _ => None,
        }
    }

    pub fn page_errors(&self, name: &str) -> Option<&[u64]> {
        match self.get(name) {
            Some(FilterResult::PageErrors(pages)) => Some(pages),
            _ => None,
        }
    }

    pub fn buffer(&self, name: &str) -> Option<&[u8]> {
        match self.get(name) {
            Some(FilterResult::Buffer(data)) => Some(data),
            _ => None,
        }
    }
}

/// Ordered filter composition.
#[derive(Default)]
pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    finished: bool,
}

impl FilterGroup {
    pub fn new() -> Self {
        FilterGroup {
            filters: Vec::new(),
            finished: false,
        }
    }

    pub fn add(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Drive one chunk through every filter in order. With `eof` set each
    /// filter is flushed to `done` before the next one sees end of stream.
    pub fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<(), Error> {
        if self.finished {
            return Err(vault_err(ErrorClass::Assert, "filter group already finished"));
        }

        let mut stage = input.to_vec();

        for filter in self.filters.iter_mut() {
            let mut next = Vec::new();
            let mut pos = 0;
            let mut spins = 0;

            while pos < stage.len() || (eof && !filter.done()) {
                let produced = next.len();
                let consumed = filter.process(&stage[pos..], eof, &mut next)?;
                pos += consumed;

                if consumed == 0 && next.len() == produced {
                    spins += 1;
                    if spins > DRIVE_LIMIT {
                        return Err(vault_err(
                            ErrorClass::Assert,
                            format!("filter '{}' is not making progress", filter.name()),
                        ));
                    }
                } else {
                    spins = 0;
                }
            }

            stage = next;
        }

        if eof {
            self.finished = true;
        }

        output.extend_from_slice(&stage);
        Ok(())
    }

    pub fn done(&self) -> bool {
        self.finished
    }

    /// Gather per-filter results after the final flush.
    pub fn results(&mut self) -> FilterResults {
        let mut results = FilterResults::default();
        for filter in self.filters.iter_mut() {
            results
                .results
                .push((filter.name().to_string(), filter.result()));
        }
        results
    }
}

/// Read endpoint: pulls from a raw source through a filter group.
pub struct FilteredRead {
    source: Box<dyn Read>,
    group: FilterGroup,
    pending: VecDeque<u8>,
    chunk: Vec<u8>,
    source_eof: bool,
}

impl FilteredRead {
    pub fn new(source: Box<dyn Read>, group: FilterGroup) -> Self {
        FilteredRead {
            source,
            group,
            pending: VecDeque::new(),
            chunk: vec![0u8; IO_BUFFER_SIZE],
            source_eof: false,
        }
    }

    pub fn eof(&self) -> bool {
        self.source_eof && self.pending.is_empty()
    }

    /// Read everything into one buffer and close.
    pub fn read_all(&mut self) -> Result<Vec<u8>, Error> {
        let mut data = Vec::new();
        std::io::Read::read_to_end(self, &mut data)?;
        Ok(data)
    }

    /// Filter results; valid once the stream has been fully consumed.
    pub fn results(&mut self) -> Result<FilterResults, Error> {
        if !self.eof() {
            return Err(vault_err(
                ErrorClass::Assert,
                "filter results requested before end of stream",
            ));
        }
        Ok(self.group.results())
    }

    fn fill(&mut self) -> Result<(), Error> {
        while self.pending.is_empty() && !self.source_eof {
            let count = self.source.read(&mut self.chunk)?;
            let mut produced = Vec::new();

            if count == 0 {
                self.source_eof = true;
                if !self.group.done() {
                    self.group.process(&[], true, &mut produced)?;
                }
            } else {
                self.group.process(&self.chunk[..count], false, &mut produced)?;
            }

            self.pending.extend(produced);
        }
        Ok(())
    }
}

impl Read for FilteredRead {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        self.fill()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", err)))?;

        let count = buf.len().min(self.pending.len());
        for (i, byte) in self.pending.drain(..count).enumerate() {
            buf[i] = byte;
        }
        Ok(count)
    }
}

/// Raw byte sink under a write endpoint. `close` commits the write (rename
/// for atomic posix writes, upload completion for object stores).
pub trait RawWrite {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error>;
    fn close(&mut self) -> Result<(), Error>;
}

/// Write endpoint: pushes caller bytes through a filter group into a sink.
pub struct FilteredWrite {
    sink: Box<dyn RawWrite>,
    group: FilterGroup,
    closed: bool,
}

impl FilteredWrite {
    pub fn new(sink: Box<dyn RawWrite>, group: FilterGroup) -> Self {
        FilteredWrite {
            sink,
            group,
            closed: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(vault_err(ErrorClass::Assert, "write endpoint already closed"));
        }

        let mut produced = Vec::new();
        self.group.process(data, false, &mut produced)?;
        if !produced.is_empty() {
            self.sink.write_chunk(&produced)?;
        }
        Ok(())
    }

    /// Flush the filters, commit the sink, and surface filter results.
    pub fn close(&mut self) -> Result<FilterResults, Error> {
        if self.closed {
            return Err(vault_err(ErrorClass::Assert, "write endpoint already closed"));
        }
        self.closed = true;

        let mut produced = Vec::new();
        self.group.process(&[], true, &mut produced)?;
        if !produced.is_empty() {
            self.sink.write_chunk(&produced)?;
        }
        self.sink.close()?;

        Ok(self.group.results())
    }
}

#[cfg(test)]
mod tests {
    use super::compress::{GzCompressFilter, GzDecompressFilter};
    use super::hash::{HashFilter, HashType};
    use super::size::SizeFilter;
    use super::*;

    #[test]
    fn empty_group_passthrough() {
        let mut group = FilterGroup::new();
        let mut out = Vec::new();
        group.process(b"hello", false, &mut out).unwrap();
        group.process(b" world", true, &mut out).unwrap();
        assert_eq!(out, b"hello world");
        assert!(group.done());
    }

    #[test]
    fn sink_filters_observe_stream() {
        let mut group = FilterGroup::new()
            .add(Box::new(HashFilter::new(HashType::Sha1)))
            .add(Box::new(SizeFilter::new()));

        let mut out = Vec::new();
        group.process(b"abc", false, &mut out).unwrap();
        group.process(&[], true, &mut out).unwrap();
        assert_eq!(out, b"abc");

        let results = group.results();
        assert_eq!(
            results.digest("hash"),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert_eq!(results.size("size"), Some(3));
    }

    #[test]
    fn compress_chain_terminates_and_round_trips() {
        let data: Vec<u8> = (0..100_000u32).map(|v| (v % 251) as u8).collect();

        let mut group = FilterGroup::new().add(Box::new(GzCompressFilter::new(6)));
        let mut compressed = Vec::new();
        for chunk in data.chunks(4096) {
            group.process(chunk, false, &mut compressed).unwrap();
        }
        group.process(&[], true, &mut compressed).unwrap();
        assert!(group.done());
        assert!(compressed.len() < data.len());

        let mut group = FilterGroup::new().add(Box::new(GzDecompressFilter::new()));
        let mut plain = Vec::new();
        for chunk in compressed.chunks(1000) {
            group.process(chunk, false, &mut plain).unwrap();
        }
        group.process(&[], true, &mut plain).unwrap();
        assert_eq!(plain, data);
    }

    #[test]
    fn filtered_read_drives_group() {
        let data = b"stream of repository bytes".to_vec();
        let group = FilterGroup::new()
            .add(Box::new(SizeFilter::new()))
            .add(Box::new(HashFilter::new(HashType::Sha256)));

        let mut read = FilteredRead::new(Box::new(std::io::Cursor::new(data.clone())), group);
        let out = read.read_all().unwrap();
        assert_eq!(out, data);

        let results = read.results().unwrap();
        assert_eq!(results.size("size"), Some(data.len() as u64));
        assert!(results.digest("hash").unwrap().len() == 64);
    }

    struct VecSink(std::rc::Rc<std::cell::RefCell<(Vec<u8>, bool)>>);

    impl RawWrite for VecSink {
        fn write_chunk(&mut self, data: &[u8]) -> Result<(), Error> {
            self.0.borrow_mut().0.extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            self.0.borrow_mut().1 = true;
            Ok(())
        }
    }

    #[test]
    fn filtered_write_commits_on_close() {
        let state = std::rc::Rc::new(std::cell::RefCell::new((Vec::new(), false)));
        let group = FilterGroup::new().add(Box::new(SizeFilter::new()));

        let mut write = FilteredWrite::new(Box::new(VecSink(state.clone())), group);
        write.write(b"part one ").unwrap();
        write.write(b"part two").unwrap();
        let results = write.close().unwrap();

        assert_eq!(results.size("size"), Some(17));
        let state = state.borrow();
        assert_eq!(state.0, b"part one part two");
        assert!(state.1);
    }
}
