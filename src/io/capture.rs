//! Buffer capture filter: collects the stream at its position in the chain.

use anyhow::Error;

use super::{Filter, FilterResult};

pub struct CaptureFilter {
    data: Vec<u8>,
    done: bool,
}

impl CaptureFilter {
    pub fn new() -> Self {
        CaptureFilter { data: Vec::new(), done: false }
    }
}

impl Default for CaptureFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for CaptureFilter {
    fn name(&self) -> &'static str {
        "capture"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        self.data.extend_from_slice(input);
        output.extend_from_slice(input);
        if eof {
            self.done = true;
        }
        Ok(input.len())
    }

    fn done(&self) -> bool {
        self.done
    }

    fn result(&mut self) -> FilterResult {
        FilterResult::Buffer(std::mem::take(&mut self.data))
    }
}
