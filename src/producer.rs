use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{info, warn};

use crate::providers::{self, Provider};
use crate::stream::{Fragment, StreamMessage};

const CONSUMER_GONE: &str = "consumer stopped listening";

/// Producer side of the hand-off channel. `send` blocks while the channel is
/// full, so nothing is dropped under backpressure.
#[derive(Clone, Debug)]
pub(crate) struct FragmentSender {
    tx: Sender<StreamMessage>,
}

impl FragmentSender {
    pub(crate) fn new(tx: Sender<StreamMessage>) -> Self {
        Self { tx }
    }

    pub(crate) fn text(&self, text: impl Into<String>) -> Result<(), String> {
        self.send(StreamMessage::Fragment(Fragment::text(text)))
    }

    pub(crate) fn thinking(&self, text: impl Into<String>) -> Result<(), String> {
        self.send(StreamMessage::Fragment(Fragment::thinking(text)))
    }

    pub(crate) fn complete(self) {
        let _ = self.tx.send(StreamMessage::Complete);
    }

    pub(crate) fn error(self, message: impl Into<String>) {
        let _ = self.tx.send(StreamMessage::Error(message.into()));
    }

    fn send(&self, message: StreamMessage) -> Result<(), String> {
        self.tx.send(message).map_err(|_| CONSUMER_GONE.to_string())
    }
}

/// Runs one provider request on its own thread. The thread always ends the
/// stream with exactly one `complete` or `error`.
pub(crate) fn spawn_producer(
    provider: Provider,
    prompt: String,
    sender: FragmentSender,
    child_pids: Arc<Mutex<Vec<u32>>>,
    simulated_delay: Duration,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        info!(provider = provider.as_str(), "producer started");
        match providers::run_provider_stream(
            provider,
            &prompt,
            &sender,
            &child_pids,
            simulated_delay,
        ) {
            Ok(()) => {
                info!(provider = provider.as_str(), "producer finished");
                sender.complete();
            }
            Err(err) => {
                warn!(provider = provider.as_str(), error = %err, "producer failed");
                sender.error(format!("{} error: {}", provider.as_str(), err));
            }
        }
    })
}
