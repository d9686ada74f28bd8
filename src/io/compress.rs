//! Compression filters: gzip (streaming) and lz4 (frame format).

use std::io::{Read, Write};

use anyhow::{format_err, Error};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use super::{Filter, FilterResult};

/// Compression algorithms supported for repository files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    None,
    Gz,
    Lz4,
}

impl CompressType {
    pub fn parse(value: &str) -> Result<CompressType, Error> {
        match value {
            "none" => Ok(CompressType::None),
            "gz" | "gzip" => Ok(CompressType::Gz),
            "lz4" => Ok(CompressType::Lz4),
            _ => Err(crate::error::vault_err(
                crate::error::ErrorClass::Option,
                format!("invalid compress type '{}'", value),
            )),
        }
    }

    /// File name extension, including the dot. Empty for none.
    pub fn extension(self) -> &'static str {
        match self {
            CompressType::None => "",
            CompressType::Gz => ".gz",
            CompressType::Lz4 => ".lz4",
        }
    }

    /// Derive the compression from a repository file name.
    pub fn from_name(name: &str) -> CompressType {
        if name.ends_with(".gz") {
            CompressType::Gz
        } else if name.ends_with(".lz4") {
            CompressType::Lz4
        } else {
            CompressType::None
        }
    }
}

pub struct GzCompressFilter {
    encoder: Option<GzEncoder<Vec<u8>>>,
    done: bool,
}

impl GzCompressFilter {
    pub fn new(level: u32) -> Self {
        GzCompressFilter {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::new(level))),
            done: false,
        }
    }
}

impl Filter for GzCompressFilter {
    fn name(&self) -> &'static str {
        "gz-compress"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| format_err!("gzip encoder already finished"))?;

        encoder.write_all(input)?;
        output.append(encoder.get_mut());

        if eof {
            let mut tail = self.encoder.take().unwrap().finish()?;
            output.append(&mut tail);
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn result(&mut self) -> FilterResult {
        FilterResult::None
    }
}

pub struct GzDecompressFilter {
    decoder: Option<GzDecoder<Vec<u8>>>,
    done: bool,
}

impl GzDecompressFilter {
    pub fn new() -> Self {
        GzDecompressFilter {
            decoder: Some(GzDecoder::new(Vec::new())),
            done: false,
        }
    }
}

impl Default for GzDecompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for GzDecompressFilter {
    fn name(&self) -> &'static str {
        "gz-decompress"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| format_err!("gzip decoder already finished"))?;

        decoder
            .write_all(input)
            .map_err(|err| format_err!("gzip decompress failed - {}", err))?;
        output.append(decoder.get_mut());

        if eof {
            let mut tail = self
                .decoder
                .take()
                .unwrap()
                .finish()
                .map_err(|err| format_err!("gzip stream truncated or corrupt - {}", err))?;
            output.append(&mut tail);
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }
}

/// Lz4 frame compression. The frame encoder emits its output when the
/// stream is finished, so input is staged until end of stream.
pub struct Lz4CompressFilter {
    staged: Vec<u8>,
    done: bool,
}

impl Lz4CompressFilter {
    pub fn new() -> Self {
        Lz4CompressFilter { staged: Vec::new(), done: false }
    }
}

impl Default for Lz4CompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Lz4CompressFilter {
    fn name(&self) -> &'static str {
        "lz4-compress"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        self.staged.extend_from_slice(input);

        if eof && !self.done {
            let mut encoder = FrameEncoder::new(Vec::new());
            encoder.write_all(&self.staged)?;
            let mut frame = encoder
                .finish()
                .map_err(|err| format_err!("lz4 compress failed - {}", err))?;
            output.append(&mut frame);
            self.staged = Vec::new();
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }
}

pub struct Lz4DecompressFilter {
    staged: Vec<u8>,
    done: bool,
}

impl Lz4DecompressFilter {
    pub fn new() -> Self {
        Lz4DecompressFilter { staged: Vec::new(), done: false }
    }
}

impl Default for Lz4DecompressFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Lz4DecompressFilter {
    fn name(&self) -> &'static str {
        "lz4-decompress"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        self.staged.extend_from_slice(input);

        if eof && !self.done {
            let mut decoder = FrameDecoder::new(&self.staged[..]);
            let mut plain = Vec::new();
            decoder
                .read_to_end(&mut plain)
                .map_err(|err| format_err!("lz4 stream truncated or corrupt - {}", err))?;
            output.append(&mut plain);
            self.staged = Vec::new();
            self.done = true;
        }

        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }
}

/// Compression filter for the configured type, None when uncompressed.
pub fn compress_filter(compress_type: CompressType, level: u32) -> Option<Box<dyn Filter>> {
    match compress_type {
        CompressType::None => None,
        CompressType::Gz => Some(Box::new(GzCompressFilter::new(level))),
        CompressType::Lz4 => Some(Box::new(Lz4CompressFilter::new())),
    }
}

/// Decompression filter matching the configured type.
pub fn decompress_filter(compress_type: CompressType) -> Option<Box<dyn Filter>> {
    match compress_type {
        CompressType::None => None,
        CompressType::Gz => Some(Box::new(GzDecompressFilter::new())),
        CompressType::Lz4 => Some(Box::new(Lz4DecompressFilter::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FilterGroup;

    fn round_trip(compress_type: CompressType, data: &[u8]) {
        let mut group = FilterGroup::new().add(compress_filter(compress_type, 6).unwrap());
        let mut packed = Vec::new();
        for chunk in data.chunks(3000) {
            group.process(chunk, false, &mut packed).unwrap();
        }
        group.process(&[], true, &mut packed).unwrap();

        let mut group = FilterGroup::new().add(decompress_filter(compress_type).unwrap());
        let mut plain = Vec::new();
        for chunk in packed.chunks(777) {
            group.process(chunk, false, &mut plain).unwrap();
        }
        group.process(&[], true, &mut plain).unwrap();

        assert_eq!(plain, data);
    }

    #[test]
    fn gz_round_trip() {
        let data: Vec<u8> = (0..60_000u32).map(|v| (v % 200) as u8).collect();
        round_trip(CompressType::Gz, &data);
    }

    #[test]
    fn lz4_round_trip() {
        let data: Vec<u8> = (0..60_000u32).map(|v| (v / 100) as u8).collect();
        round_trip(CompressType::Lz4, &data);
    }

    #[test]
    fn empty_stream() {
        round_trip(CompressType::Gz, b"");
        round_trip(CompressType::Lz4, b"");
    }

    #[test]
    fn corrupt_gz_fails() {
        let mut group = FilterGroup::new().add(compress_filter(CompressType::Gz, 6).unwrap());
        let mut packed = Vec::new();
        group.process(b"payload", true, &mut packed).unwrap();

        packed.truncate(packed.len() - 4);
        let mut group = FilterGroup::new().add(decompress_filter(CompressType::Gz).unwrap());
        let mut plain = Vec::new();
        assert!(group.process(&packed, true, &mut plain).is_err());
    }

    #[test]
    fn extension_mapping() {
        assert_eq!(CompressType::Gz.extension(), ".gz");
        assert_eq!(CompressType::from_name("000000010000000000000001-abc.gz"), CompressType::Gz);
        assert_eq!(CompressType::from_name("seg.lz4"), CompressType::Lz4);
        assert_eq!(CompressType::from_name("seg"), CompressType::None);
    }
}
