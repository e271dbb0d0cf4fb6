//! Block Model
//!
//! Ordered, append-only content units. A block is either accumulated plain text
//! or a single tool invocation with its input and output.
//!
//! Invariants:
//! - At most one text block is `Streaming` at a time (the "current" one)
//! - Opening a tool block closes the current text block first
//! - Blocks are never reordered or removed once appended

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a text block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    /// Still receiving tokens
    Streaming,
    /// Closed, content is final
    Done,
}

/// Status of a tool block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Tool was invoked, no result yet
    Pending,
    /// Tool completed successfully
    Done,
    /// Tool failed
    Error,
}

/// Accumulated plain text between tool invocations
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Block identifier
    pub id: String,
    /// Text accumulated so far
    pub content: String,
    /// Whether the block is still open
    pub status: BlockStatus,
}

/// A single tool invocation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolBlock {
    /// Tool invocation ID
    pub id: String,
    /// Tool name
    pub tool_name: String,
    /// Input parameters
    pub input: Value,
    /// Output, absent until the tool is closed
    pub output: Option<Value>,
    /// Invocation status
    pub status: ToolStatus,
}

/// One unit of rendered output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    /// Plain text
    Text(TextBlock),
    /// Tool invocation
    Tool(ToolBlock),
}

impl Block {
    /// Block identifier
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Text(b) => &b.id,
            Self::Tool(b) => &b.id,
        }
    }
}

/// Append-only block sequence with O(1) tool lookup by invocation ID
#[derive(Clone, Debug, Default)]
pub struct BlockList {
    blocks: Vec<Block>,
    /// Tool invocation ID -> index into `blocks`
    tool_index: HashMap<String, usize>,
    /// Index of the text block currently streaming, if any
    current_text: Option<usize>,
    /// Counter for generated text block IDs
    text_seq: u32,
}

impl BlockList {
    /// Create an empty block list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All blocks in order
    #[must_use]
    pub fn as_slice(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no block has been appended yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Whether a text block is currently streaming
    #[must_use]
    pub fn has_open_text(&self) -> bool {
        self.current_text.is_some()
    }

    /// Append text to the current text block, opening one if needed
    pub fn append_text(&mut self, text: &str) {
        let idx = match self.current_text {
            Some(idx) => idx,
            None => {
                self.text_seq += 1;
                self.blocks.push(Block::Text(TextBlock {
                    id: format!("text-{}", self.text_seq),
                    content: String::new(),
                    status: BlockStatus::Streaming,
                }));
                let idx = self.blocks.len() - 1;
                self.current_text = Some(idx);
                idx
            }
        };

        if let Some(Block::Text(block)) = self.blocks.get_mut(idx) {
            block.content.push_str(text);
        }
    }

    /// Close the current text block, if one is open
    pub fn close_text(&mut self) {
        if let Some(idx) = self.current_text.take() {
            if let Some(Block::Text(block)) = self.blocks.get_mut(idx) {
                block.status = BlockStatus::Done;
            }
        }
    }

    /// Append a pending tool block, closing any open text block first
    ///
    /// Returns false if a tool with the same invocation ID already exists;
    /// the existing block is left untouched.
    pub fn open_tool(&mut self, id: &str, tool_name: &str, input: Value) -> bool {
        if self.tool_index.contains_key(id) {
            return false;
        }

        self.close_text();
        self.blocks.push(Block::Tool(ToolBlock {
            id: id.to_string(),
            tool_name: tool_name.to_string(),
            input,
            output: None,
            status: ToolStatus::Pending,
        }));
        self.tool_index.insert(id.to_string(), self.blocks.len() - 1);
        true
    }

    /// Transition a tool block to `Done` or `Error`, attaching output
    ///
    /// Returns false if no tool block with this ID exists.
    pub fn close_tool(&mut self, id: &str, output: Value, status: ToolStatus) -> bool {
        let Some(&idx) = self.tool_index.get(id) else {
            return false;
        };

        match self.blocks.get_mut(idx) {
            Some(Block::Tool(block)) => {
                block.output = Some(output);
                block.status = status;
                true
            }
            _ => false,
        }
    }

    /// Look up a tool block by invocation ID
    #[must_use]
    pub fn tool(&self, id: &str) -> Option<&ToolBlock> {
        let idx = *self.tool_index.get(id)?;
        match self.blocks.get(idx) {
            Some(Block::Tool(block)) => Some(block),
            _ => None,
        }
    }
}
