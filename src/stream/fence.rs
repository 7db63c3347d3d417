use tracing::{trace, warn};

use super::ledger::BlockLedger;
use super::string_tracker::StringTracker;
use super::types::BlockKind;
use crate::config::LanguageTable;

const FENCE_LEN: usize = 3;
const FENCE: &str = "```";

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum FenceState {
    Prose,
    LangLine { tag: String },
    Code { language: String },
}

impl FenceState {
    fn name(&self) -> &'static str {
        match self {
            FenceState::Prose => "prose",
            FenceState::LangLine { .. } => "lang_line",
            FenceState::Code { .. } => "code",
        }
    }
}

/// Character-level classifier that turns streamed text into prose and code
/// blocks in a [`BlockLedger`].
///
/// Text for the open block collects in `pending` and is flushed at fence
/// boundaries and at the end of every `feed`. A partial backtick run is kept
/// across calls, so any split of the input produces the same ledger.
#[derive(Debug)]
pub(crate) struct FenceMachine {
    state: FenceState,
    strings: StringTracker,
    backticks: usize,
    pending: String,
    languages: LanguageTable,
    armed: bool,
    finished: bool,
}

impl FenceMachine {
    pub(crate) fn new(languages: LanguageTable) -> Self {
        Self {
            state: FenceState::Prose,
            strings: StringTracker::new(),
            backticks: 0,
            pending: String::new(),
            languages,
            armed: false,
            finished: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &FenceState {
        &self.state
    }

    /// Opens the session's first prose block. Idempotent.
    pub(crate) fn arm(&mut self, ledger: &mut BlockLedger) {
        if self.armed {
            return;
        }
        self.armed = true;
        let id = ledger.open(BlockKind::Prose, None);
        trace!(id, "fence machine armed");
    }

    pub(crate) fn feed(&mut self, text: &str, ledger: &mut BlockLedger) {
        if self.finished {
            debug_assert!(false, "feed after finish");
            warn!(len = text.len(), "dropping text fed after finish");
            return;
        }
        if text.is_empty() {
            return;
        }
        self.arm(ledger);

        for ch in text.chars() {
            let state = std::mem::replace(&mut self.state, FenceState::Prose);
            let next = self.advance(state, ch, ledger);
            self.state = next;
        }
        self.flush_pending(ledger);
    }

    /// Ends the stream: settles any half-read fence and closes every block.
    pub(crate) fn finish(&mut self, ledger: &mut BlockLedger) {
        if self.finished {
            return;
        }
        self.settle(ledger);
        ledger.finalize();
        self.finished = true;
    }

    /// Ends the stream early. Everything classified so far is kept and a
    /// closed prose block holding `marker` is added after it.
    pub(crate) fn interrupt(&mut self, ledger: &mut BlockLedger, marker: &str) {
        if self.finished {
            return;
        }
        self.settle(ledger);
        if let Some(id) = ledger.current().map(|block| block.id) {
            ledger.close(id);
        }
        self.armed = true;
        let id = ledger.open(BlockKind::Prose, None);
        ledger.append(id, marker);
        ledger.close(id);
        ledger.finalize();
        self.finished = true;
    }

    fn settle(&mut self, ledger: &mut BlockLedger) {
        if let FenceState::LangLine { tag } = std::mem::replace(&mut self.state, FenceState::Prose)
        {
            // The prose block is still open, so the unfinished fence lands in it verbatim.
            trace!(tag = %tag, "unterminated fence kept as prose");
            self.pending.push_str(FENCE);
            self.pending.push_str(&tag);
        }
        self.release_backticks();
        self.flush_pending(ledger);
    }

    fn advance(&mut self, state: FenceState, ch: char, ledger: &mut BlockLedger) -> FenceState {
        match state {
            FenceState::Prose => self.advance_prose(ch, ledger),
            FenceState::LangLine { mut tag } => {
                if ch == '\n' {
                    self.open_code(&tag, ledger)
                } else {
                    tag.push(ch);
                    FenceState::LangLine { tag }
                }
            }
            FenceState::Code { language } => self.advance_code(language, ch, ledger),
        }
    }

    fn advance_prose(&mut self, ch: char, ledger: &mut BlockLedger) -> FenceState {
        if ch != '`' {
            self.release_backticks();
            self.pending.push(ch);
            return FenceState::Prose;
        }
        self.backticks += 1;
        if self.backticks < FENCE_LEN {
            return FenceState::Prose;
        }
        self.backticks = 0;
        self.flush_pending(ledger);
        trace!(from = "prose", to = "lang_line", "fence transition");
        FenceState::LangLine { tag: String::new() }
    }

    fn open_code(&mut self, tag: &str, ledger: &mut BlockLedger) -> FenceState {
        let language = self.languages.resolve(tag);
        if let Some(id) = ledger.current().map(|block| block.id) {
            let status = ledger.close(id);
            trace!(id, ?status, "prose closed at fence");
        }
        let id = ledger.open(BlockKind::Code, Some(language.clone()));
        self.strings.reset();
        trace!(id, tag = tag.trim(), language = %language, "fence transition to code");
        FenceState::Code { language }
    }

    fn advance_code(&mut self, language: String, ch: char, ledger: &mut BlockLedger) -> FenceState {
        self.strings.track(ch);
        if ch != '`' || self.strings.in_string() {
            self.release_backticks();
            self.pending.push(ch);
            return FenceState::Code { language };
        }
        self.backticks += 1;
        if self.backticks < FENCE_LEN {
            return FenceState::Code { language };
        }
        self.backticks = 0;
        self.flush_pending(ledger);
        if let Some(id) = ledger.current().map(|block| block.id) {
            ledger.close(id);
        }
        self.strings.reset();
        let id = ledger.open(BlockKind::Prose, None);
        trace!(id, language = %language, "fence transition to prose");
        FenceState::Prose
    }

    fn release_backticks(&mut self) {
        for _ in 0..std::mem::take(&mut self.backticks) {
            self.pending.push('`');
        }
    }

    fn flush_pending(&mut self, ledger: &mut BlockLedger) {
        if self.pending.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending);
        if !ledger.append_current(&text) {
            warn!(state = self.state.name(), len = text.len(), "no open block for text");
        }
    }
}
