use super::types::{Block, BlockEvent, BlockId, BlockKind, BlockStatus};

/// Ordered record of every block a session produced.
///
/// Ids start at 1 and follow insertion order, so a block's index is `id - 1`.
/// Lifecycle events are queued here and drained by the coordinator once the
/// current batch has been classified.
#[derive(Debug)]
pub(crate) struct BlockLedger {
    blocks: Vec<Block>,
    classified: Option<usize>,
    thinking: Option<usize>,
    first_prose: Option<BlockId>,
    keep_first_prose: bool,
    events: Vec<BlockEvent>,
}

impl BlockLedger {
    pub(crate) fn new(keep_first_prose: bool) -> Self {
        Self {
            blocks: Vec::new(),
            classified: None,
            thinking: None,
            first_prose: None,
            keep_first_prose,
            events: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub(crate) fn visible(&self) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(|block| block.status != BlockStatus::Removed)
    }

    pub(crate) fn get(&self, id: BlockId) -> Option<&Block> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.blocks.get(idx)
    }

    /// The open prose or code block, if any.
    pub(crate) fn current(&self) -> Option<&Block> {
        self.classified.and_then(|idx| self.blocks.get(idx))
    }

    #[cfg(test)]
    pub(crate) fn open_thinking(&self) -> Option<&Block> {
        self.thinking.and_then(|idx| self.blocks.get(idx))
    }

    pub(crate) fn open(&mut self, kind: BlockKind, language: Option<String>) -> BlockId {
        debug_assert!(
            kind != BlockKind::Code || language.is_some(),
            "code blocks always carry a language"
        );
        let lane = if kind.is_classified() {
            self.classified
        } else {
            self.thinking
        };
        debug_assert!(lane.is_none(), "a {} block is already open", kind.as_str());

        let idx = self.blocks.len();
        let id = idx as BlockId + 1;
        self.blocks.push(Block {
            id,
            kind,
            language: language.clone(),
            content: String::new(),
            status: BlockStatus::Open,
        });
        if kind.is_classified() {
            self.classified = Some(idx);
        } else {
            self.thinking = Some(idx);
        }
        if kind == BlockKind::Prose && self.first_prose.is_none() {
            self.first_prose = Some(id);
        }
        self.events.push(BlockEvent::Opened { id, kind, language });
        id
    }

    pub(crate) fn append(&mut self, id: BlockId, text: &str) {
        if text.is_empty() {
            return;
        }
        let Some(block) = self.block_mut(id) else {
            tracing::warn!(id, "append to unknown block");
            return;
        };
        if !block.is_open() {
            debug_assert!(false, "append to {:?} block {id}", block.status);
            tracing::warn!(id, status = ?block.status, "append to a block that is not open");
            return;
        }
        block.content.push_str(text);
        self.events.push(BlockEvent::Appended {
            id,
            delta: text.to_string(),
        });
    }

    /// Appends to the open prose/code block. Returns false when none is open.
    pub(crate) fn append_current(&mut self, text: &str) -> bool {
        let Some(id) = self.current().map(|block| block.id) else {
            return false;
        };
        self.append(id, text);
        true
    }

    /// Closes a block, applying the empty-prose policy. A blank prose block
    /// that is not exempt becomes `Removed` and gets no `Closed` event.
    pub(crate) fn close(&mut self, id: BlockId) -> BlockStatus {
        let removable = self.is_removable(id);
        let Some(block) = self.block_mut(id) else {
            tracing::warn!(id, "close of unknown block");
            return BlockStatus::Removed;
        };
        if !block.is_open() {
            return block.status;
        }
        let status = if removable {
            BlockStatus::Removed
        } else {
            BlockStatus::Closed
        };
        block.status = status;
        let text = block.content.clone();
        let kind = block.kind;

        let idx = (id - 1) as usize;
        if kind.is_classified() {
            if self.classified == Some(idx) {
                self.classified = None;
            }
        } else if self.thinking == Some(idx) {
            self.thinking = None;
        }
        if status == BlockStatus::Closed {
            self.events.push(BlockEvent::Closed { id, text });
        }
        status
    }

    /// Closes every open block in ledger order, then sweeps: any blank prose
    /// block that is not exempt ends up `Removed`, and one `Removed` event is
    /// queued per removed block.
    pub(crate) fn finalize(&mut self) {
        let open_ids: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|block| block.is_open())
            .map(|block| block.id)
            .collect();
        for id in open_ids {
            self.close(id);
        }

        for idx in 0..self.blocks.len() {
            let id = self.blocks[idx].id;
            if self.is_removable(id) {
                self.blocks[idx].status = BlockStatus::Removed;
            }
        }
        let removed: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|block| block.status == BlockStatus::Removed)
            .map(|block| block.id)
            .collect();
        for id in removed {
            self.events.push(BlockEvent::Removed { id });
        }
    }

    pub(crate) fn drain_events(&mut self) -> Vec<BlockEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    fn is_removable(&self, id: BlockId) -> bool {
        let Some(block) = self.get(id) else {
            return false;
        };
        if block.kind != BlockKind::Prose || !block.is_blank() {
            return false;
        }
        !(self.keep_first_prose && self.first_prose == Some(id))
    }

    fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.blocks.get_mut(idx)
    }
}
