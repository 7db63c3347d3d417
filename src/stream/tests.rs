use super::coordinator::{CancelToken, StreamCoordinator, CANCELLED_MARKER, FAILED_MARKER};
use super::error::StreamError;
use super::types::*;
use crate::config::StreamConfig;
use crossbeam_channel::{bounded, unbounded};
use std::time::{Duration, Instant};

/// Sink that records every callback in order.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Vec<BlockEvent>,
    pub(crate) started: usize,
    pub(crate) outcomes: Vec<StreamOutcome>,
}

impl RecordingSink {
    pub(crate) fn appends(&self, id: BlockId) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                BlockEvent::Appended { id: got, delta } if *got == id => Some(delta.clone()),
                _ => None,
            })
            .collect()
    }

    fn closed_text(&self, id: BlockId) -> Option<&str> {
        self.events.iter().find_map(|event| match event {
            BlockEvent::Closed { id: got, text } if *got == id => Some(text.as_str()),
            _ => None,
        })
    }

    fn removed(&self) -> Vec<BlockId> {
        self.events
            .iter()
            .filter_map(|event| match event {
                BlockEvent::Removed { id } => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl BlockSink for RecordingSink {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) {
        self.events.push(BlockEvent::Opened {
            id,
            kind,
            language: language.map(str::to_string),
        });
    }

    fn block_appended(&mut self, id: BlockId, delta: &str) {
        self.events.push(BlockEvent::Appended {
            id,
            delta: delta.to_string(),
        });
    }

    fn block_closed(&mut self, id: BlockId, final_text: &str) {
        self.events.push(BlockEvent::Closed {
            id,
            text: final_text.to_string(),
        });
    }

    fn block_removed(&mut self, id: BlockId) {
        self.events.push(BlockEvent::Removed { id });
    }

    fn stream_started(&mut self) {
        self.started += 1;
    }

    fn stream_finished(&mut self, outcome: &StreamOutcome) {
        self.outcomes.push(outcome.clone());
    }
}

type Row = (BlockKind, Option<String>, String);

fn unthrottled() -> StreamConfig {
    StreamConfig {
        throttle_ms: 0,
        tick_ms: 1,
        ..StreamConfig::default()
    }
}

fn coordinator(config: StreamConfig) -> StreamCoordinator<RecordingSink> {
    let mut coordinator = StreamCoordinator::new(config, RecordingSink::default());
    coordinator.start().expect("start");
    coordinator
}

/// One fragment per tick, then finish.
fn drive(config: StreamConfig, fragments: &[Fragment]) -> StreamCoordinator<RecordingSink> {
    let mut coordinator = coordinator(config);
    let now = Instant::now();
    for fragment in fragments {
        coordinator
            .on_fragment(fragment.clone())
            .expect("fragment accepted");
        coordinator.tick(now).expect("tick");
    }
    coordinator.finish().expect("finish");
    coordinator
}

fn text_fragments(chunks: &[&str]) -> Vec<Fragment> {
    chunks.iter().map(|chunk| Fragment::text(*chunk)).collect()
}

fn rows(coordinator: &StreamCoordinator<RecordingSink>) -> Vec<Row> {
    coordinator
        .visible_blocks()
        .into_iter()
        .map(|block| (block.kind, block.language.clone(), block.content.clone()))
        .collect()
}

fn prose(text: &str) -> Row {
    (BlockKind::Prose, None, text.to_string())
}

fn code(language: &str, text: &str) -> Row {
    (BlockKind::Code, Some(language.to_string()), text.to_string())
}

fn thinking(text: &str) -> Row {
    (BlockKind::Thinking, None, text.to_string())
}

fn assert_deltas_match_closed_text(sink: &RecordingSink) {
    for event in &sink.events {
        if let BlockEvent::Closed { id, text } = event {
            assert_eq!(&sink.appends(*id).concat(), text, "block {id}");
        }
    }
}

const SAMPLE: &str = "Sure:\n```py\nfence = \"```\"\nprint(fence)\n```\n\n```sh\necho 'a ``` b'\n```\nDone with `two` blocks.";

#[test]
fn chunking_does_not_change_blocks() {
    let whole = rows(&drive(unthrottled(), &text_fragments(&[SAMPLE])));
    assert_eq!(
        whole,
        vec![
            prose("Sure:\n"),
            code("python", "fence = \"```\"\nprint(fence)\n"),
            code("bash", "echo 'a ``` b'\n"),
            prose("\nDone with `two` blocks."),
        ]
    );

    let per_char: Vec<Fragment> = SAMPLE.chars().map(|ch| Fragment::text(ch.to_string())).collect();
    assert_eq!(rows(&drive(unthrottled(), &per_char)), whole);

    for split in SAMPLE.char_indices().map(|(idx, _)| idx) {
        let (head, tail) = SAMPLE.split_at(split);
        assert_eq!(
            rows(&drive(unthrottled(), &text_fragments(&[head, tail]))),
            whole,
            "split at byte {split}"
        );
    }
}

#[test]
fn fence_in_string_does_not_close_code() {
    let coordinator = drive(
        unthrottled(),
        &text_fragments(&["```python\nx = \"``", "`\"\ny = 2\n```"]),
    );
    assert_eq!(
        rows(&coordinator),
        vec![prose(""), code("python", "x = \"```\"\ny = 2\n")]
    );
}

#[test]
fn py_and_python_tags_are_the_same_language() {
    let short = drive(unthrottled(), &text_fragments(&["```py\nx = 1\n```"]));
    let long = drive(unthrottled(), &text_fragments(&["```python\nx = 1\n```"]));
    assert_eq!(rows(&short), rows(&long));
    assert_eq!(rows(&short)[1], code("python", "x = 1\n"));
}

#[test]
fn blank_prose_between_code_blocks_is_swept() {
    let coordinator = drive(
        unthrottled(),
        &text_fragments(&["```sh\nls\n```\n  \n", "```py\npass\n```\n"]),
    );
    let sink = coordinator.sink();

    assert_eq!(sink.removed(), vec![3, 5]);
    assert!(sink.closed_text(3).is_none());
    assert!(sink.closed_text(5).is_none());
    assert_eq!(
        rows(&coordinator),
        vec![prose(""), code("bash", "ls\n"), code("python", "pass\n")]
    );
    assert_eq!(coordinator.blocks()[2].status, BlockStatus::Removed);
}

#[test]
fn first_blank_prose_is_swept_when_policy_is_off() {
    let config = StreamConfig {
        keep_first_prose: false,
        ..unthrottled()
    };
    let coordinator = drive(config, &text_fragments(&["```py\nx\n```"]));
    assert_eq!(rows(&coordinator), vec![code("python", "x\n")]);
    assert_eq!(coordinator.sink().removed(), vec![1, 3]);
}

#[test]
fn unterminated_fence_becomes_prose() {
    let coordinator = drive(unthrottled(), &text_fragments(&["prose ", "``", "`"]));
    assert_eq!(rows(&coordinator), vec![prose("prose ```")]);
    assert_eq!(coordinator.sink().closed_text(1), Some("prose ```"));

    let coordinator = drive(unthrottled(), &text_fragments(&["see\n```pyth"]));
    assert_eq!(rows(&coordinator), vec![prose("see\n```pyth")]);
}

#[test]
fn thinking_comes_before_prose() {
    let mut coordinator = coordinator(unthrottled());
    coordinator
        .on_fragment(Fragment::thinking("plan"))
        .expect("thinking");
    coordinator
        .on_fragment(Fragment::text("Answer"))
        .expect("text");
    coordinator.tick(Instant::now()).expect("tick");
    coordinator.finish().expect("finish");

    assert_eq!(
        coordinator.sink().events,
        vec![
            BlockEvent::Opened {
                id: 1,
                kind: BlockKind::Thinking,
                language: None
            },
            BlockEvent::Appended {
                id: 1,
                delta: "plan".to_string()
            },
            BlockEvent::Closed {
                id: 1,
                text: "plan".to_string()
            },
            BlockEvent::Opened {
                id: 2,
                kind: BlockKind::Prose,
                language: None
            },
            BlockEvent::Appended {
                id: 2,
                delta: "Answer".to_string()
            },
            BlockEvent::Closed {
                id: 2,
                text: "Answer".to_string()
            },
        ]
    );
}

#[test]
fn late_thinking_opens_a_new_thinking_block() {
    let coordinator = drive(
        unthrottled(),
        &[
            Fragment::thinking("first"),
            Fragment::text("Hello"),
            Fragment::thinking("second"),
            Fragment::text(" again"),
        ],
    );
    assert_eq!(
        rows(&coordinator),
        vec![
            thinking("first"),
            prose("Hello again"),
            thinking("second"),
        ]
    );
}

#[test]
fn cancel_keeps_delivered_code_and_adds_marker() {
    let mut coordinator = coordinator(unthrottled());
    coordinator
        .on_fragment(Fragment::text("```python\nprint(1)"))
        .expect("fragment");
    coordinator.tick(Instant::now()).expect("tick");

    assert_eq!(coordinator.cancel(), Ok(StreamOutcome::Cancelled));
    assert_eq!(coordinator.phase(), Phase::Cancelled);
    assert_eq!(
        rows(&coordinator),
        vec![
            prose(""),
            code("python", "print(1)"),
            prose(CANCELLED_MARKER)
        ]
    );
    assert!(coordinator.blocks().iter().all(|block| !block.is_open()));
    assert_eq!(coordinator.sink().outcomes, vec![StreamOutcome::Cancelled]);
}

#[test]
fn cancel_classifies_text_not_yet_ticked() {
    let mut coordinator = coordinator(unthrottled());
    coordinator
        .on_fragment(Fragment::text("partial answer"))
        .expect("fragment");
    coordinator.cancel().expect("cancel");

    assert_eq!(
        rows(&coordinator),
        vec![prose("partial answer"), prose(CANCELLED_MARKER)]
    );
}

#[test]
fn producer_error_finalizes_once_with_failed_outcome() {
    let mut coordinator = coordinator(unthrottled());
    coordinator
        .on_fragment(Fragment::text("Half a thought"))
        .expect("fragment");
    let outcome = coordinator.fail("connection reset").expect("fail");

    assert_eq!(outcome, StreamOutcome::Failed("connection reset".to_string()));
    assert_eq!(
        rows(&coordinator),
        vec![prose("Half a thought"), prose(FAILED_MARKER)]
    );
    assert_eq!(coordinator.sink().outcomes, vec![outcome]);
    assert!(coordinator.fail("again").is_err());
    assert!(coordinator.cancel().is_err());
    assert_eq!(coordinator.sink().outcomes.len(), 1);
}

#[test]
fn lifecycle_rejects_invalid_transitions() {
    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    assert_eq!(
        coordinator.tick(Instant::now()),
        Err(StreamError::InvalidPhase {
            action: "tick",
            phase: Phase::Idle
        })
    );
    assert!(coordinator.finish().is_err());
    assert!(coordinator.cancel().is_err());
    assert!(coordinator.on_fragment(Fragment::text("early")).is_err());

    coordinator.start().expect("start");
    assert_eq!(coordinator.phase(), Phase::Streaming);
    assert!(coordinator.start().is_err());

    coordinator.finish().expect("finish");
    assert_eq!(coordinator.phase(), Phase::Done);
    assert_eq!(
        coordinator.on_fragment(Fragment::text("late")),
        Err(StreamError::InvalidPhase {
            action: "accept a fragment",
            phase: Phase::Done
        })
    );
    assert!(coordinator.cancel().is_err());
    assert!(coordinator.finish().is_err());

    let sink = coordinator.into_sink();
    assert_eq!(sink.started, 1);
    assert_eq!(sink.outcomes, vec![StreamOutcome::Completed]);
}

#[test]
fn empty_stream_completes_without_blocks() {
    let coordinator = drive(unthrottled(), &[]);
    assert!(coordinator.blocks().is_empty());
    assert_eq!(coordinator.sink().outcomes, vec![StreamOutcome::Completed]);
}

#[test]
fn throttled_prose_still_closes_with_full_text() {
    let config = StreamConfig {
        throttle_ms: 60_000,
        ..StreamConfig::default()
    };
    let words = ["The ", "quick ", "brown ", "fox ", "jumps"];
    let coordinator = drive(config, &text_fragments(&words));
    let sink = coordinator.sink();

    let appends = sink.appends(1);
    assert_eq!(appends.first().map(String::as_str), Some("The "));
    assert!(appends.len() < words.len());
    assert_eq!(sink.closed_text(1), Some("The quick brown fox jumps"));
    assert_deltas_match_closed_text(sink);
}

#[test]
fn deltas_always_concatenate_to_closed_text() {
    let config = StreamConfig {
        throttle_ms: 50,
        ..StreamConfig::default()
    };
    let mut coordinator = coordinator(config);
    let start = Instant::now();
    for (step, ch) in SAMPLE.chars().enumerate() {
        coordinator
            .on_fragment(Fragment::text(ch.to_string()))
            .expect("fragment");
        coordinator
            .tick(start + Duration::from_millis(step as u64 * 7))
            .expect("tick");
    }
    coordinator.finish().expect("finish");
    assert_deltas_match_closed_text(coordinator.sink());
}

#[test]
fn run_consumes_a_producer_thread_until_complete() {
    let (tx, rx) = bounded(2);
    let producer = std::thread::spawn(move || {
        let chars: Vec<char> = SAMPLE.chars().collect();
        tx.send(StreamMessage::Fragment(Fragment::thinking("considering")))
            .expect("send thinking");
        for piece in chars.chunks(3) {
            let text: String = piece.iter().collect();
            tx.send(StreamMessage::Fragment(Fragment::text(text)))
                .expect("send text");
        }
        tx.send(StreamMessage::Complete).expect("send complete");
    });

    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator
        .run(&rx, &CancelToken::new())
        .expect("run");
    producer.join().expect("producer thread");

    assert_eq!(outcome, StreamOutcome::Completed);
    let expected: Vec<Row> = std::iter::once(thinking("considering"))
        .chain(rows(&drive(unthrottled(), &text_fragments(&[SAMPLE]))))
        .collect();
    assert_eq!(rows(&coordinator), expected);
    assert_deltas_match_closed_text(coordinator.sink());
}

#[test]
fn run_reports_producer_error() {
    let (tx, rx) = unbounded();
    tx.send(StreamMessage::Fragment(Fragment::text("Working")))
        .expect("send");
    tx.send(StreamMessage::Error("stream read failed".to_string()))
        .expect("send");

    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator.run(&rx, &CancelToken::new()).expect("run");

    assert_eq!(outcome, StreamOutcome::Failed("stream read failed".to_string()));
    assert_eq!(rows(&coordinator), vec![prose("Working"), prose(FAILED_MARKER)]);
}

#[test]
fn run_treats_disconnect_as_failure() {
    let (tx, rx) = unbounded();
    tx.send(StreamMessage::Fragment(Fragment::text("cut off")))
        .expect("send");
    drop(tx);

    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator.run(&rx, &CancelToken::new()).expect("run");

    assert_eq!(outcome, StreamOutcome::Failed("producer disconnected".to_string()));
    assert_eq!(rows(&coordinator)[0], prose("cut off"));
}

#[test]
fn run_honours_cancel_and_keeps_queued_text() {
    let (tx, rx) = unbounded();
    tx.send(StreamMessage::Fragment(Fragment::text("```python\n")))
        .expect("send");
    tx.send(StreamMessage::Fragment(Fragment::text("print(1)")))
        .expect("send");

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator.run(&rx, &cancel).expect("run");
    drop(tx);

    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(
        rows(&coordinator),
        vec![
            prose(""),
            code("python", "print(1)"),
            prose(CANCELLED_MARKER)
        ]
    );
}

#[test]
fn provider_error_after_interrupt_is_a_cancel() {
    let (tx, rx) = unbounded();
    tx.send(StreamMessage::Fragment(Fragment::text("```python\nprint(1)")))
        .expect("send");
    tx.send(StreamMessage::Error("claude exited with signal: 15".to_string()))
        .expect("send");

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator.run(&rx, &cancel).expect("run");

    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(coordinator.phase(), Phase::Cancelled);
    assert_eq!(
        rows(&coordinator),
        vec![
            prose(""),
            code("python", "print(1)"),
            prose(CANCELLED_MARKER)
        ]
    );
    assert_eq!(coordinator.sink().outcomes, vec![StreamOutcome::Cancelled]);
}

#[test]
fn disconnect_after_interrupt_is_a_cancel() {
    let (tx, rx) = unbounded();
    tx.send(StreamMessage::Fragment(Fragment::text("stopped here")))
        .expect("send");
    drop(tx);

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut coordinator = StreamCoordinator::new(unthrottled(), RecordingSink::default());
    let outcome = coordinator.run(&rx, &cancel).expect("run");

    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(
        rows(&coordinator),
        vec![prose("stopped here"), prose(CANCELLED_MARKER)]
    );
}

#[test]
fn removed_events_follow_every_close() {
    let coordinator = drive(
        unthrottled(),
        &text_fragments(&["```sh\nls\n```\n\n", "```py\npass\n```\n"]),
    );
    let events = &coordinator.sink().events;
    let last_close = events
        .iter()
        .rposition(|event| matches!(event, BlockEvent::Closed { .. }))
        .expect("closed events");
    let first_remove = events
        .iter()
        .position(|event| matches!(event, BlockEvent::Removed { .. }))
        .expect("removed events");

    assert!(last_close < first_remove);
    assert!(events[first_remove..]
        .iter()
        .all(|event| matches!(event, BlockEvent::Removed { .. })));
}
