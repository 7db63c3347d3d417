use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::producer::FragmentSender;
use crate::stream::{Fragment, FragmentKind};

fn claude_model() -> Option<String> {
    std::env::var("FENCESTREAM_CLAUDE_MODEL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub(crate) fn run_stream(
    prompt: &str,
    sender: &FragmentSender,
    child_pids: &Arc<Mutex<Vec<u32>>>,
) -> std::result::Result<(), String> {
    let mut cmd = Command::new("claude");
    cmd.arg("--print")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--include-partial-messages");
    if let Some(model) = claude_model() {
        cmd.arg("--model").arg(model);
    }
    cmd.arg(prompt);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| format!("claude spawn failed: {e}"))?;
    if let Ok(mut pids) = child_pids.lock() {
        pids.push(child.id());
    }
    debug!(pid = child.id(), "claude started");

    let stderr_reader = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text);
            text
        })
    });
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "claude stdout missing".to_string())?;
    let reader = BufReader::new(stdout);

    let mut fallback_text: Option<String> = None;
    let mut emitted = false;
    let mut quota_message: Option<String> = None;
    for line in reader.lines() {
        let line = line.map_err(|e| format!("claude stream read failed: {e}"))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(fragment) = extract_delta(&line) {
            if fragment.kind == FragmentKind::Text && is_quota_error_text(&fragment.text) {
                quota_message.get_or_insert(fragment.text);
                continue;
            }
            let sent = match fragment.kind {
                FragmentKind::Text => sender.text(fragment.text),
                FragmentKind::Thinking => sender.thinking(fragment.text),
            };
            if let Err(err) = sent {
                stop_child(&mut child, child_pids);
                return Err(err);
            }
            emitted = true;
        } else if let Some(text) = extract_fallback_text(&line) {
            fallback_text = Some(text);
        }
    }

    let status = child
        .wait()
        .map_err(|e| format!("claude wait failed: {e}"))?;
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    forget_child(child_pids, child.id());

    if !status.success() {
        let detail = stderr.trim();
        if detail.is_empty() {
            return Err(format!("claude exited with {status}"));
        }
        return Err(format!("claude failed: {detail}"));
    }
    if let Some(message) = quota_message {
        if !emitted {
            return Err(format!("claude quota/rate limit: {message}"));
        }
        warn!(message = %message, "claude reported a limit mid-stream");
    }
    if !emitted {
        // Without partial messages the CLI only reports the final text.
        if let Some(text) = fallback_text.filter(|text| !text.trim().is_empty()) {
            if is_quota_error_text(&text) {
                return Err(format!("claude quota/rate limit: {text}"));
            }
            sender.text(text)?;
        }
    }
    Ok(())
}

pub(crate) fn is_quota_error_text(text: &str) -> bool {
    let t = text.to_lowercase();
    t.contains("hit your limit")
        || t.contains("rate_limit")
        || t.contains("rate limit")
        || t.contains("quota")
        || t.contains("credit balance is too low")
        || t.contains("insufficient credits")
        || t.contains("usage limit")
}

fn parse_json_line(line: &str) -> Option<Value> {
    serde_json::from_str(line).ok()
}

/// Text and thinking deltas from a `content_block_delta` stream event.
fn extract_delta(line: &str) -> Option<Fragment> {
    let value = parse_json_line(line)?;
    if value.get("type")?.as_str()? != "stream_event" {
        return None;
    }
    let event = value.get("event")?;
    if event.get("type")?.as_str()? != "content_block_delta" {
        return None;
    }
    let delta = event.get("delta")?;
    match delta.get("type").and_then(Value::as_str) {
        Some("thinking_delta") => delta
            .get("thinking")?
            .as_str()
            .map(Fragment::thinking),
        Some("text_delta") | None => delta.get("text")?.as_str().map(Fragment::text),
        Some(_) => None,
    }
}

/// Kills and reaps a child whose output nobody reads any more.
fn stop_child(child: &mut Child, child_pids: &Arc<Mutex<Vec<u32>>>) {
    let pid = child.id();
    if let Err(err) = child.kill() {
        debug!(pid, error = %err, "claude already exited");
    }
    if let Err(err) = child.wait() {
        warn!(pid, error = %err, "claude wait failed after kill");
    }
    forget_child(child_pids, pid);
}

fn forget_child(child_pids: &Arc<Mutex<Vec<u32>>>, pid: u32) {
    if let Ok(mut pids) = child_pids.lock() {
        pids.retain(|registered| *registered != pid);
    }
}

fn extract_fallback_text(line: &str) -> Option<String> {
    let value = parse_json_line(line)?;
    match value.get("type")?.as_str()? {
        "assistant" => value
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_array)
            .and_then(|arr| {
                arr.iter().find_map(|item| {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        item.get("text")
                            .and_then(Value::as_str)
                            .map(|s| s.to_string())
                    } else {
                        None
                    }
                })
            }),
        "result" => value
            .get("result")
            .and_then(Value::as_str)
            .map(|s| s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_becomes_text_fragment() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"```py\n"}}}"#;
        assert_eq!(extract_delta(line), Some(Fragment::text("```py\n")));
    }

    #[test]
    fn thinking_delta_becomes_thinking_fragment() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"Let me see"}}}"#;
        assert_eq!(extract_delta(line), Some(Fragment::thinking("Let me see")));
    }

    #[test]
    fn other_deltas_and_events_are_skipped() {
        let json_delta = r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{}"}}}"#;
        let start = r#"{"type":"stream_event","event":{"type":"content_block_start","content_block":{"type":"text","text":""}}}"#;
        assert_eq!(extract_delta(json_delta), None);
        assert_eq!(extract_delta(start), None);
        assert_eq!(extract_delta("not json"), None);
    }

    #[test]
    fn fallback_reads_result_and_assistant_lines() {
        let result = r#"{"type":"result","subtype":"success","result":"final answer"}"#;
        let assistant = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi there"}]}}"#;
        assert_eq!(extract_fallback_text(result).as_deref(), Some("final answer"));
        assert_eq!(extract_fallback_text(assistant).as_deref(), Some("hi there"));
    }

    #[test]
    fn stopped_child_is_reaped_and_unregistered() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let other = child.id() + 1;
        let pids = Arc::new(Mutex::new(vec![child.id(), other]));

        stop_child(&mut child, &pids);

        let status = child.try_wait().expect("try_wait");
        assert!(status.is_some_and(|status| !status.success()));
        assert_eq!(*pids.lock().expect("pid list"), vec![other]);
    }

    #[test]
    fn quota_messages_are_detected() {
        assert!(is_quota_error_text("You've hit your limit for today"));
        assert!(is_quota_error_text("Credit balance is too low"));
        assert!(!is_quota_error_text("print('hello')"));
    }
}
