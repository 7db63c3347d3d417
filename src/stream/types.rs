use std::fmt;

pub(crate) type BlockId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum BlockKind {
    Prose,
    Code,
    Thinking,
}

impl BlockKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Prose => "prose",
            BlockKind::Code => "code",
            BlockKind::Thinking => "thinking",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "prose" => Some(BlockKind::Prose),
            "code" => Some(BlockKind::Code),
            "thinking" => Some(BlockKind::Thinking),
            _ => None,
        }
    }

    /// Prose and code share one lane of the ledger; thinking has its own.
    pub(crate) fn is_classified(&self) -> bool {
        !matches!(self, BlockKind::Thinking)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    Open,
    Closed,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Block {
    pub(crate) id: BlockId,
    pub(crate) kind: BlockKind,
    pub(crate) language: Option<String>,
    pub(crate) content: String,
    pub(crate) status: BlockStatus,
}

impl Block {
    pub(crate) fn is_open(&self) -> bool {
        self.status == BlockStatus::Open
    }

    pub(crate) fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FragmentKind {
    Text,
    Thinking,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Fragment {
    pub(crate) kind: FragmentKind,
    pub(crate) text: String,
}

impl Fragment {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Text,
            text: text.into(),
        }
    }

    pub(crate) fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Thinking,
            text: text.into(),
        }
    }
}

/// Everything that travels from the producer thread to the consumer.
#[derive(Debug)]
pub(crate) enum StreamMessage {
    Fragment(Fragment),
    Complete,
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockEvent {
    Opened {
        id: BlockId,
        kind: BlockKind,
        language: Option<String>,
    },
    Appended {
        id: BlockId,
        delta: String,
    },
    Closed {
        id: BlockId,
        text: String,
    },
    Removed {
        id: BlockId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl StreamOutcome {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Cancelled => "cancelled",
            StreamOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Streaming,
    Finalizing,
    Done,
    Cancelled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Streaming => "streaming",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Receiver of block lifecycle callbacks (renderer, transcript saver).
pub(crate) trait BlockSink {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>);
    fn block_appended(&mut self, id: BlockId, delta: &str);
    fn block_closed(&mut self, id: BlockId, final_text: &str);
    fn block_removed(&mut self, id: BlockId);

    fn stream_started(&mut self) {}

    fn stream_finished(&mut self, _outcome: &StreamOutcome) {}

    fn deliver(&mut self, event: &BlockEvent) {
        match event {
            BlockEvent::Opened { id, kind, language } => {
                self.block_opened(*id, *kind, language.as_deref())
            }
            BlockEvent::Appended { id, delta } => self.block_appended(*id, delta),
            BlockEvent::Closed { id, text } => self.block_closed(*id, text),
            BlockEvent::Removed { id } => self.block_removed(*id),
        }
    }
}

impl<A: BlockSink, B: BlockSink> BlockSink for (A, B) {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) {
        self.0.block_opened(id, kind, language);
        self.1.block_opened(id, kind, language);
    }

    fn block_appended(&mut self, id: BlockId, delta: &str) {
        self.0.block_appended(id, delta);
        self.1.block_appended(id, delta);
    }

    fn block_closed(&mut self, id: BlockId, final_text: &str) {
        self.0.block_closed(id, final_text);
        self.1.block_closed(id, final_text);
    }

    fn block_removed(&mut self, id: BlockId) {
        self.0.block_removed(id);
        self.1.block_removed(id);
    }

    fn stream_started(&mut self) {
        self.0.stream_started();
        self.1.stream_started();
    }

    fn stream_finished(&mut self, outcome: &StreamOutcome) {
        self.0.stream_finished(outcome);
        self.1.stream_finished(outcome);
    }
}

impl<S: BlockSink> BlockSink for Option<S> {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) {
        if let Some(sink) = self {
            sink.block_opened(id, kind, language);
        }
    }

    fn block_appended(&mut self, id: BlockId, delta: &str) {
        if let Some(sink) = self {
            sink.block_appended(id, delta);
        }
    }

    fn block_closed(&mut self, id: BlockId, final_text: &str) {
        if let Some(sink) = self {
            sink.block_closed(id, final_text);
        }
    }

    fn block_removed(&mut self, id: BlockId) {
        if let Some(sink) = self {
            sink.block_removed(id);
        }
    }

    fn stream_started(&mut self) {
        if let Some(sink) = self {
            sink.stream_started();
        }
    }

    fn stream_finished(&mut self, outcome: &StreamOutcome) {
        if let Some(sink) = self {
            sink.stream_finished(outcome);
        }
    }
}
