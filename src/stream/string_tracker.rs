//! String-literal tracking for the inside of code blocks.
//!
//! A closing fence that appears inside a string literal (`"```"`) is code,
//! not a fence. The tracker sees every character of an open code block and
//! answers whether the character just fed sits inside a string.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Delimiter {
    quote: char,
    len: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct QuoteRun {
    quote: char,
    len: usize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct StringTracker {
    quote_run: Option<QuoteRun>,
    in_string: Option<Delimiter>,
    escape_next: bool,
}

fn is_quote(ch: char) -> bool {
    matches!(ch, '\'' | '"')
}

impl StringTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn in_string(&self) -> bool {
        self.in_string.is_some()
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn track(&mut self, ch: char) {
        if self.escape_next {
            self.escape_next = false;
            return;
        }

        if is_quote(ch) {
            self.track_quote(ch);
            return;
        }

        self.resolve_run();
        if ch == '\\' {
            self.escape_next = true;
        } else if ch == '\n' && matches!(self.in_string, Some(delim) if delim.len == 1) {
            // Single-quoted strings never span lines.
            self.in_string = None;
        }
    }

    fn track_quote(&mut self, quote: char) {
        match self.in_string {
            Some(delim) => {
                if quote != delim.quote {
                    self.quote_run = None;
                    return;
                }
                if self.bump_run(quote) == delim.len {
                    self.in_string = None;
                    self.quote_run = None;
                }
            }
            None => {
                if self.quote_run.is_some_and(|run| run.quote != quote) {
                    self.resolve_run();
                    if self.in_string.is_some() {
                        self.track_quote(quote);
                        return;
                    }
                }
                if self.bump_run(quote) == 3 {
                    self.in_string = Some(Delimiter { quote, len: 3 });
                    self.quote_run = None;
                }
            }
        }
    }

    fn bump_run(&mut self, quote: char) -> usize {
        let run = match self.quote_run {
            Some(run) if run.quote == quote => QuoteRun {
                quote,
                len: run.len + 1,
            },
            _ => QuoteRun { quote, len: 1 },
        };
        self.quote_run = Some(run);
        run.len
    }

    /// Settles a pending run once something other than its quote follows.
    /// One quote opens a string; two quotes are an empty string and change nothing.
    fn resolve_run(&mut self) {
        let Some(run) = self.quote_run.take() else {
            return;
        };
        if self.in_string.is_none() && run.len == 1 {
            self.in_string = Some(Delimiter {
                quote: run.quote,
                len: 1,
            });
        }
    }
}
