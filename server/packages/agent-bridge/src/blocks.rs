use std::collections::HashMap;

use serde_json::Value;

use crate::event::{BlockDelta, ContentBlock};
use crate::wire::OutwardChunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    ToolUse,
    Other,
}

#[derive(Debug, Clone)]
pub struct ActiveBlock {
    pub id: String,
    pub kind: BlockKind,
    pub tool_name: Option<String>,
    pub partial_input: String,
    /// Input announced with the block start, used when no deltas follow.
    start_input: Value,
}

/// Content blocks of the assistant message currently being streamed.
///
/// Blocks are keyed by the per-message index the agent assigns, so the map is
/// cleared whenever a message starts or stops.
#[derive(Debug, Default)]
pub struct BlockAccumulator {
    blocks: HashMap<u32, ActiveBlock>,
    streamed: bool,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, index: u32) -> Option<&ActiveBlock> {
        self.blocks.get(&index)
    }

    pub fn active_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn on_block_start(&mut self, index: u32, block: ContentBlock) -> Vec<OutwardChunk> {
        self.streamed = true;
        let (kind, id, tool_name, start_input) = match block {
            ContentBlock::Text { .. } => (BlockKind::Text, String::new(), None, Value::Null),
            ContentBlock::ToolUse { id, name, input } => (BlockKind::ToolUse, id, Some(name), input),
            ContentBlock::Other => (BlockKind::Other, String::new(), None, Value::Null),
        };

        let mut chunks = Vec::new();
        if let Some(name) = &tool_name {
            chunks.push(OutwardChunk::ToolStarted {
                index,
                id: id.clone(),
                name: name.clone(),
            });
        }

        let replaced = self.blocks.insert(
            index,
            ActiveBlock {
                id,
                kind,
                tool_name,
                partial_input: String::new(),
                start_input,
            },
        );
        if replaced.is_some() {
            tracing::warn!(index, "content block restarted before it was stopped");
        }
        chunks
    }

    pub fn on_block_delta(&mut self, index: u32, delta: BlockDelta) -> Vec<OutwardChunk> {
        self.streamed = true;
        let Some(block) = self.blocks.get_mut(&index) else {
            tracing::warn!(index, "delta for a content block that was never started");
            return Vec::new();
        };

        match delta {
            BlockDelta::TextDelta { text } if !text.is_empty() => {
                vec![OutwardChunk::Text { text }]
            }
            BlockDelta::InputJsonDelta { partial_json } if block.kind == BlockKind::ToolUse => {
                block.partial_input.push_str(&partial_json);
                vec![OutwardChunk::ToolInput {
                    index,
                    id: block.id.clone(),
                    partial_json,
                }]
            }
            _ => Vec::new(),
        }
    }

    pub fn on_block_stop(&mut self, index: u32) -> Vec<OutwardChunk> {
        self.streamed = true;
        let Some(block) = self.blocks.remove(&index) else {
            tracing::warn!(index, "stop for a content block that was never started");
            return Vec::new();
        };

        match (block.kind, block.tool_name) {
            (BlockKind::ToolUse, Some(name)) => {
                let input = if block.partial_input.is_empty() {
                    render_input(&block.start_input)
                } else {
                    block.partial_input
                };
                vec![OutwardChunk::ToolEnded {
                    index,
                    id: block.id,
                    name,
                    input,
                }]
            }
            _ => Vec::new(),
        }
    }

    /// Handles a complete assistant message. When the same content was
    /// already streamed block by block the snapshot is skipped.
    pub fn on_message(&mut self, content: Vec<ContentBlock>) -> Vec<OutwardChunk> {
        if self.streamed {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        for (position, block) in content.into_iter().enumerate() {
            let index = u32::try_from(position).unwrap_or(u32::MAX);
            match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    chunks.push(OutwardChunk::Text { text });
                }
                ContentBlock::ToolUse { id, name, input } => {
                    chunks.push(OutwardChunk::ToolStarted {
                        index,
                        id: id.clone(),
                        name: name.clone(),
                    });
                    chunks.push(OutwardChunk::ToolEnded {
                        index,
                        id,
                        name,
                        input: render_input(&input),
                    });
                }
                _ => {}
            }
        }
        chunks
    }

    /// Drops blocks left over from the previous message and returns how many
    /// were discarded.
    pub fn reset_turn(&mut self) -> usize {
        let discarded = self.blocks.len();
        if discarded > 0 {
            let indices: Vec<u32> = self.blocks.keys().copied().collect();
            tracing::debug!(?indices, "discarding unfinished content blocks");
        }
        self.blocks.clear();
        discarded
    }
}

fn render_input(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}
