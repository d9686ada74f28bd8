//! Running byte count filter.

use anyhow::Error;

use super::{Filter, FilterResult};

pub struct SizeFilter {
    total: u64,
    done: bool,
}

impl SizeFilter {
    pub fn new() -> Self {
        SizeFilter { total: 0, done: false }
    }
}

impl Default for SizeFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for SizeFilter {
    fn name(&self) -> &'static str {
        "size"
    }

    fn process(&mut self, input: &[u8], eof: bool, output: &mut Vec<u8>) -> Result<usize, Error> {
        self.total += input.len() as u64;
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
        FilterResult::Size(self.total)
    }
}
