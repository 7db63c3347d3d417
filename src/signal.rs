use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::stream::CancelToken;

/// First Ctrl+C cancels the stream; a second one exits immediately. Provider
/// processes are stopped by the caller once the consumer has finalized.
pub(crate) fn install_interrupt_handler(cancel: CancelToken) -> Result<()> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        cancel.cancel();
        info!("interrupt received");
    })
    .context("install interrupt handler")
}

/// Sends SIGTERM to every registered child and clears the list.
pub(crate) fn terminate_children(child_pids: &Arc<Mutex<Vec<u32>>>) -> usize {
    let pids = match child_pids.lock() {
        Ok(mut pids) => std::mem::take(&mut *pids),
        Err(_) => return 0,
    };
    pids.into_iter().filter(|pid| kill_pid(*pid)).count()
}

fn kill_pid(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let sent = unsafe { libc::kill(raw, libc::SIGTERM) == 0 };
    if !sent {
        warn!(pid, "failed to signal child process");
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn terminate_children_stops_registered_processes() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pids = Arc::new(Mutex::new(vec![child.id()]));

        assert_eq!(terminate_children(&pids), 1);
        let status = child.wait().expect("wait for sleep");
        assert!(!status.success());
        assert!(pids.lock().expect("pid list").is_empty());
    }

    #[test]
    fn empty_list_stops_nothing() {
        let pids = Arc::new(Mutex::new(Vec::new()));
        assert_eq!(terminate_children(&pids), 0);
    }
}
