use std::time::{Duration, Instant};

use super::fence::FenceMachine;
use super::ledger::BlockLedger;
use super::types::{BlockEvent, BlockId, BlockKind, BlockSink, Fragment, FragmentKind};

/// Collects fragments between ticks so each tick feeds the fence machine once.
#[derive(Debug, Default)]
pub(crate) struct ChunkBatcher {
    text: String,
    scheduled: bool,
    thinking: ThinkingAccumulator,
}

impl ChunkBatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, fragment: Fragment) {
        match fragment.kind {
            FragmentKind::Text => {
                if fragment.text.is_empty() {
                    return;
                }
                if self.text.is_empty() {
                    self.text = fragment.text;
                } else {
                    self.text.push_str(&fragment.text);
                }
                self.scheduled = true;
            }
            FragmentKind::Thinking => self.thinking.push(&fragment.text),
        }
    }

    pub(crate) fn has_text(&self) -> bool {
        self.scheduled
    }

    pub(crate) fn flush_now(&mut self, machine: &mut FenceMachine, ledger: &mut BlockLedger) {
        if !self.scheduled {
            return;
        }
        self.scheduled = false;
        let text = std::mem::take(&mut self.text);
        machine.feed(&text, ledger);
    }

    pub(crate) fn flush_thinking(&mut self, ledger: &mut BlockLedger) {
        self.thinking.flush(ledger);
    }

    pub(crate) fn close_thinking(&mut self, ledger: &mut BlockLedger) {
        self.thinking.close(ledger);
    }
}

/// Thinking text goes straight into its own block; it is never scanned for fences.
#[derive(Debug, Default)]
pub(crate) struct ThinkingAccumulator {
    buffer: String,
    block: Option<BlockId>,
}

impl ThinkingAccumulator {
    fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    fn flush(&mut self, ledger: &mut BlockLedger) {
        if self.buffer.is_empty() {
            return;
        }
        let id = match self.block {
            Some(id) => id,
            None => {
                let id = ledger.open(BlockKind::Thinking, None);
                self.block = Some(id);
                id
            }
        };
        let text = std::mem::take(&mut self.buffer);
        ledger.append(id, &text);
    }

    fn close(&mut self, ledger: &mut BlockLedger) {
        self.flush(ledger);
        if let Some(id) = self.block.take() {
            ledger.close(id);
        }
    }
}

#[derive(Debug)]
struct PendingAppend {
    id: BlockId,
    delta: String,
}

/// Rate-limits append notifications for the open prose block.
///
/// Deltas merge while the interval has not elapsed. Anything else that reaches
/// the sink first releases the merged delta, so deltas always concatenate to
/// the block's text and arrive before its close.
#[derive(Debug)]
pub(crate) struct AppendThrottle {
    interval: Duration,
    prose: Option<BlockId>,
    pending: Option<PendingAppend>,
    last_emit: Option<Instant>,
}

impl AppendThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            prose: None,
            pending: None,
            last_emit: None,
        }
    }

    pub(crate) fn process<S: BlockSink + ?Sized>(
        &mut self,
        event: BlockEvent,
        now: Instant,
        sink: &mut S,
    ) {
        match event {
            BlockEvent::Appended { id, delta } if self.prose == Some(id) => {
                match self.pending.as_mut() {
                    Some(pending) if pending.id == id => pending.delta.push_str(&delta),
                    _ => {
                        self.flush(sink);
                        self.pending = Some(PendingAppend { id, delta });
                    }
                }
                self.poll(now, sink);
            }
            event => {
                self.flush(sink);
                match &event {
                    BlockEvent::Opened { id, kind, .. } if *kind == BlockKind::Prose => {
                        self.prose = Some(*id);
                        self.last_emit = None;
                    }
                    BlockEvent::Closed { id, .. } | BlockEvent::Removed { id }
                        if self.prose == Some(*id) =>
                    {
                        self.prose = None;
                    }
                    _ => {}
                }
                sink.deliver(&event);
            }
        }
    }

    /// Releases the merged delta once the interval has passed.
    pub(crate) fn poll<S: BlockSink + ?Sized>(&mut self, now: Instant, sink: &mut S) {
        if self.pending.is_none() {
            return;
        }
        let due = self
            .last_emit
            .map_or(true, |last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.flush(sink);
            self.last_emit = Some(now);
        }
    }

    pub(crate) fn flush<S: BlockSink + ?Sized>(&mut self, sink: &mut S) {
        if let Some(pending) = self.pending.take() {
            sink.block_appended(pending.id, &pending.delta);
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}
