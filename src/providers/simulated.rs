use std::time::Duration;

use tracing::debug;

use crate::producer::FragmentSender;

struct Scenario {
    keywords: &'static [&'static str],
    thinking: Option<&'static str>,
    response: &'static str,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        keywords: &["hello", "hi", "hey"],
        thinking: Some(
            "The user is greeting me. I should respond in a friendly manner and offer to help.",
        ),
        response: "Hello! I'm a **simulated** assistant. How can I help you today?",
    },
    Scenario {
        keywords: &["calculate", "math", "sum", "add"],
        thinking: Some(
            "The user wants a calculation. I should write Python code that computes the result and prints it clearly.",
        ),
        response: "I can help with that calculation!\n\n```python\nresult = 10 + 5\nprint(f\"The result is: {result}\")\n```\n\nAnd the same from a shell:\n\n```sh\necho $((10 + 5))\n```\n\nThere it is.",
    },
    Scenario {
        keywords: &["string", "fence", "markdown"],
        thinking: Some("Fences inside string literals are a good edge case to show."),
        response: "Here is code that builds a markdown fence:\n\n```py\nfence = \"```\"\nblock = f'{fence}bash\\nls\\n{fence}'\nprint(block)\n```\n\nThe fence inside the string stays part of the code.",
    },
    Scenario {
        keywords: &["goodbye", "bye", "exit"],
        thinking: Some(
            "The user is saying goodbye. I should acknowledge and thank them for the conversation.",
        ),
        response: "Goodbye! Thanks for chatting with me.",
    },
];

const DEFAULT_THINKING: &str =
    "I'm not sure how to respond to this. Let me think about what the user might be asking for.";
const DEFAULT_RESPONSE: &str =
    "I'm not sure how to respond to that. Try asking about math or saying hello!\n\n```bash\necho \"try: fencestream hello\"\n```";

/// Picks the first scenario with a keyword that appears as a whole word in the prompt.
fn pick(prompt: &str) -> (Option<&'static str>, &'static str) {
    let words: Vec<String> = prompt
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(|word| word.to_lowercase())
        .collect();
    SCENARIOS
        .iter()
        .find(|scenario| {
            scenario
                .keywords
                .iter()
                .any(|keyword| words.iter().any(|word| word.starts_with(keyword)))
        })
        .map(|scenario| (scenario.thinking, scenario.response))
        .unwrap_or((Some(DEFAULT_THINKING), DEFAULT_RESPONSE))
}

/// Deterministic 1..=7 character pieces, seeded from the text.
fn split_pieces(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut state = (chars.len() as u64).wrapping_mul(2_654_435_761) | 1;
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let len = ((state >> 33) % 7 + 1) as usize;
        let end = (start + len).min(chars.len());
        pieces.push(chars[start..end].iter().collect());
        start = end;
    }
    pieces
}

pub(crate) fn run_stream(
    prompt: &str,
    sender: &FragmentSender,
    delay: Duration,
) -> std::result::Result<(), String> {
    let (thinking, response) = pick(prompt);
    debug!(
        thinking = thinking.map_or(0, str::len),
        response = response.len(),
        "simulated response picked"
    );

    if let Some(thinking) = thinking {
        for piece in split_pieces(thinking) {
            sender.thinking(piece)?;
            pause(delay);
        }
    }
    for piece in split_pieces(response) {
        sender.text(piece)?;
        pause(delay);
    }
    Ok(())
}

fn pause(delay: Duration) {
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
}
