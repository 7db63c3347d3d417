use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::producer::FragmentSender;

pub(crate) mod claude;
pub(crate) mod simulated;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum Provider {
    Claude,
    Simulated,
}

impl Provider {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Simulated => "simulated",
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "claude" => Some(Provider::Claude),
            "simulated" | "sim" | "fake" => Some(Provider::Simulated),
            _ => None,
        }
    }

    /// External binary the provider drives, if any.
    pub(crate) fn binary(&self) -> Option<&'static str> {
        match self {
            Provider::Claude => Some("claude"),
            Provider::Simulated => None,
        }
    }
}

pub(crate) fn run_provider_stream(
    provider: Provider,
    prompt: &str,
    sender: &FragmentSender,
    child_pids: &Arc<Mutex<Vec<u32>>>,
    simulated_delay: Duration,
) -> std::result::Result<(), String> {
    match provider {
        Provider::Claude => claude::run_stream(prompt, sender, child_pids),
        Provider::Simulated => simulated::run_stream(prompt, sender, simulated_delay),
    }
}
