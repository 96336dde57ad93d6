// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal ordered structured-message block list standing in for HTX
//! (spec §6 "Structured-message (HTX)").
//!
//! Real HTX is an intrusive ring of typed blocks inside a shared buffer;
//! this crate only needs enough of that shape to drive the mux's send path
//! in tests, so it is modeled directly as a `Vec<HtxBlock>` with head/next/
//! remove/cut_data operations matching the consumed interface.

use bytes::Bytes;
use http::{Method, Version};

/// One block of a structured HTTP message.
#[derive(Debug, Clone)]
pub enum HtxBlock {
    /// The request/response start line.
    StartLine {
        /// HTTP method (request side only; responses leave this as GET).
        method: Method,
        /// Request target / response reason, depending on direction.
        target: String,
        /// HTTP version, used to set `H1_MF_VER_11`-equivalent behavior.
        version: Version,
    },
    /// One header field.
    Header {
        /// Header name, already lowercased.
        name: String,
        /// Header value.
        value: String,
    },
    /// A chunk of body bytes.
    Data(Bytes),
    /// Marks the end of the header block.
    EndOfHeaders,
    /// Marks the end of the trailer block.
    EndOfTrailers,
    /// Marks the end of the message.
    EndOfMessage,
}

impl HtxBlock {
    /// Whether this block ends the structured message (the EOM flag the
    /// consumed interface exposes as a separate accessor elsewhere;
    /// collapsed here into the block itself).
    pub fn is_eom(&self) -> bool {
        matches!(self, HtxBlock::EndOfMessage)
    }
}

/// An ordered list of [`HtxBlock`]s representing one HTTP message.
#[derive(Debug, Clone, Default)]
pub struct Htx {
    blocks: Vec<HtxBlock>,
}

impl Htx {
    /// Builds an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block to the end of the message.
    pub fn push(&mut self, block: HtxBlock) {
        self.blocks.push(block);
    }

    /// The first remaining block, if any.
    pub fn head(&self) -> Option<&HtxBlock> {
        self.blocks.first()
    }

    /// An iterator over the remaining blocks in order.
    pub fn iter(&self) -> impl Iterator<Item = &HtxBlock> {
        self.blocks.iter()
    }

    /// Removes and returns the first remaining block.
    pub fn remove_head(&mut self) -> Option<HtxBlock> {
        if self.blocks.is_empty() {
            None
        } else {
            Some(self.blocks.remove(0))
        }
    }

    /// Removes up to `max` bytes from the front of the head block if it is
    /// [`HtxBlock::Data`], returning the cut bytes. Removes the block
    /// entirely if it is drained. Returns `None` if the head is not a data
    /// block.
    pub fn cut_data(&mut self, max: usize) -> Option<Bytes> {
        match self.blocks.first_mut()? {
            HtxBlock::Data(buf) => {
                let n = max.min(buf.len());
                let cut = buf.split_to(n);
                if buf.is_empty() {
                    self.blocks.remove(0);
                }
                Some(cut)
            }
            _ => None,
        }
    }

    /// Whether every block has been consumed.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_data_splits_and_drains_a_block() {
        let mut htx = Htx::new();
        htx.push(HtxBlock::Data(Bytes::from_static(b"hello world")));
        let first = htx.cut_data(5).unwrap();
        assert_eq!(&first[..], b"hello");
        assert!(!htx.is_empty());
        let rest = htx.cut_data(100).unwrap();
        assert_eq!(&rest[..], b" world");
        assert!(htx.is_empty());
    }

    #[test]
    fn remove_head_pops_blocks_in_order() {
        let mut htx = Htx::new();
        htx.push(HtxBlock::EndOfHeaders);
        htx.push(HtxBlock::EndOfMessage);
        assert!(matches!(htx.remove_head(), Some(HtxBlock::EndOfHeaders)));
        assert!(matches!(htx.remove_head(), Some(HtxBlock::EndOfMessage)));
        assert!(htx.remove_head().is_none());
    }
}
