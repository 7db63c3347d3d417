use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use super::batcher::{AppendThrottle, ChunkBatcher};
use super::error::StreamError;
use super::fence::FenceMachine;
use super::ledger::BlockLedger;
use super::types::{Block, BlockSink, Fragment, Phase, StreamMessage, StreamOutcome};
use crate::config::StreamConfig;

pub(crate) const CANCELLED_MARKER: &str = "(cancelled)";
pub(crate) const FAILED_MARKER: &str = "(failed)";
const DISCONNECTED: &str = "producer disconnected";

/// Shared flag checked by the consumer loop at every tick boundary.
#[derive(Clone, Debug, Default)]
pub(crate) struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct StreamSession {
    machine: FenceMachine,
    ledger: BlockLedger,
    batcher: ChunkBatcher,
    throttle: AppendThrottle,
}

impl StreamSession {
    fn new(config: &StreamConfig) -> Self {
        Self {
            machine: FenceMachine::new(config.languages.clone()),
            ledger: BlockLedger::new(config.keep_first_prose),
            batcher: ChunkBatcher::new(),
            throttle: AppendThrottle::new(config.throttle()),
        }
    }

    /// Thinking first, then text. Text closes the thinking block and arms the
    /// machine, which opens the first prose block after it. Thinking that
    /// arrived after text within the same tick is still flushed ahead of it.
    fn flush(&mut self) {
        self.batcher.flush_thinking(&mut self.ledger);
        if self.batcher.has_text() {
            self.batcher.close_thinking(&mut self.ledger);
            self.machine.arm(&mut self.ledger);
            self.batcher.flush_now(&mut self.machine, &mut self.ledger);
        }
    }

    fn dispatch<S: BlockSink>(&mut self, now: Instant, sink: &mut S) {
        if self.ledger.has_events() {
            for event in self.ledger.drain_events() {
                self.throttle.process(event, now, sink);
            }
        }
        self.throttle.poll(now, sink);
    }

    fn finalize<S: BlockSink>(&mut self, marker: Option<&str>, sink: &mut S) {
        self.flush();
        match marker {
            Some(marker) => self.machine.interrupt(&mut self.ledger, marker),
            None => self.machine.finish(&mut self.ledger),
        }
        self.dispatch(Instant::now(), sink);
        self.throttle.flush(sink);
        debug_assert!(!self.throttle.has_pending());
    }
}

/// Drives one response: owns the pipeline state and reports block lifecycle
/// events to the sink.
pub(crate) struct StreamCoordinator<S: BlockSink> {
    config: StreamConfig,
    phase: Phase,
    session: Option<StreamSession>,
    sink: S,
}

impl<S: BlockSink> StreamCoordinator<S> {
    pub(crate) fn new(config: StreamConfig, sink: S) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            session: None,
            sink,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &S {
        &self.sink
    }

    #[cfg(test)]
    pub(crate) fn into_sink(self) -> S {
        self.sink
    }

    #[cfg(test)]
    pub(crate) fn blocks(&self) -> &[Block] {
        self.session
            .as_ref()
            .map(|session| session.ledger.blocks())
            .unwrap_or(&[])
    }

    pub(crate) fn visible_blocks(&self) -> Vec<&Block> {
        self.session
            .as_ref()
            .map(|session| session.ledger.visible().collect())
            .unwrap_or_default()
    }

    pub(crate) fn start(&mut self) -> Result<(), StreamError> {
        self.expect_phase("start", &[Phase::Idle])?;
        self.session = Some(StreamSession::new(&self.config));
        self.set_phase(Phase::Streaming);
        self.sink.stream_started();
        Ok(())
    }

    pub(crate) fn on_fragment(&mut self, fragment: Fragment) -> Result<(), StreamError> {
        self.expect_phase("accept a fragment", &[Phase::Streaming])?;
        if let Some(session) = self.session.as_mut() {
            session.batcher.push(fragment);
        }
        Ok(())
    }

    pub(crate) fn tick(&mut self, now: Instant) -> Result<(), StreamError> {
        self.expect_phase("tick", &[Phase::Streaming])?;
        if let Some(session) = self.session.as_mut() {
            session.flush();
            session.dispatch(now, &mut self.sink);
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> Result<StreamOutcome, StreamError> {
        self.expect_phase("finish", &[Phase::Streaming])?;
        self.set_phase(Phase::Finalizing);
        if let Some(session) = self.session.as_mut() {
            session.finalize(None, &mut self.sink);
        }
        self.set_phase(Phase::Done);
        Ok(self.report(StreamOutcome::Completed))
    }

    /// Stops early. Text already received is still classified, then a
    /// marker block is appended.
    pub(crate) fn cancel(&mut self) -> Result<StreamOutcome, StreamError> {
        self.expect_phase("cancel", &[Phase::Streaming, Phase::Finalizing])?;
        self.interrupt(CANCELLED_MARKER);
        Ok(self.report(StreamOutcome::Cancelled))
    }

    /// Producer failure: finalizes like a cancel and reports the message once.
    pub(crate) fn fail(&mut self, message: impl Into<String>) -> Result<StreamOutcome, StreamError> {
        self.expect_phase("fail", &[Phase::Streaming, Phase::Finalizing])?;
        let message = message.into();
        warn!(error = %message, "stream failed");
        self.interrupt(FAILED_MARKER);
        Ok(self.report(StreamOutcome::Failed(message)))
    }

    /// Consumer loop. Messages are taken until the next tick deadline, then one
    /// tick runs and the cancel token is checked.
    pub(crate) fn run(
        &mut self,
        rx: &Receiver<StreamMessage>,
        cancel: &CancelToken,
    ) -> Result<StreamOutcome, StreamError> {
        if self.phase == Phase::Idle {
            self.start()?;
        }
        let tick = self.config.tick();
        let mut deadline = Instant::now() + tick;
        loop {
            match rx.recv_deadline(deadline) {
                Ok(StreamMessage::Fragment(fragment)) => {
                    self.on_fragment(fragment)?;
                    if Instant::now() < deadline {
                        continue;
                    }
                }
                Ok(StreamMessage::Complete) => return self.finish(),
                // A provider killed by the interrupt reports an error; the user asked to stop.
                Ok(StreamMessage::Error(_)) | Err(RecvTimeoutError::Disconnected)
                    if cancel.is_cancelled() =>
                {
                    return self.cancel();
                }
                Ok(StreamMessage::Error(message)) => return self.fail(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.fail(DISCONNECTED),
            }

            let now = Instant::now();
            self.tick(now)?;
            if cancel.is_cancelled() {
                self.drain_received(rx)?;
                return self.cancel();
            }
            deadline = now + tick;
        }
    }

    /// Accepts fragments already sitting in the channel so a cancel keeps them.
    fn drain_received(&mut self, rx: &Receiver<StreamMessage>) -> Result<(), StreamError> {
        let mut drained = 0usize;
        while let Ok(message) = rx.try_recv() {
            if let StreamMessage::Fragment(fragment) = message {
                self.on_fragment(fragment)?;
                drained += 1;
            }
        }
        debug!(drained, "drained channel before cancel");
        Ok(())
    }

    fn interrupt(&mut self, marker: &str) {
        if let Some(session) = self.session.as_mut() {
            session.finalize(Some(marker), &mut self.sink);
        }
        self.set_phase(Phase::Cancelled);
    }

    fn report(&mut self, outcome: StreamOutcome) -> StreamOutcome {
        let blocks = self.visible_blocks().len();
        info!(outcome = outcome.as_str(), blocks, "stream finished");
        self.sink.stream_finished(&outcome);
        outcome
    }

    fn expect_phase(&self, action: &'static str, allowed: &[Phase]) -> Result<(), StreamError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(StreamError::InvalidPhase {
                action,
                phase: self.phase,
            })
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, "stream phase");
        self.phase = phase;
    }
}
