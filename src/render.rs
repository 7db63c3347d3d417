use std::collections::HashMap;
use std::io::{self, Write};

use crossterm::cursor::MoveToColumn;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use tracing::warn;
use unicode_width::UnicodeWidthStr;

use crate::stream::{BlockId, BlockKind, BlockSink, StreamOutcome};

const LOADING_PLACEHOLDER: &str = "(thinking...)";
const DEFAULT_WIDTH: usize = 72;
const MAX_WIDTH: usize = 100;

#[derive(Clone, Copy)]
pub(crate) struct Palette {
    pub(crate) code_fg: Color,
    pub(crate) frame: Color,
    pub(crate) muted_text: Color,
    pub(crate) error_text: Color,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            code_fg: Color::Rgb { r: 180, g: 200, b: 220 },
            frame: Color::Rgb { r: 100, g: 150, b: 200 },
            muted_text: Color::Rgb { r: 80, g: 100, b: 120 },
            error_text: Color::Rgb { r: 230, g: 120, b: 120 },
        }
    }
}

pub(crate) fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(DEFAULT_WIDTH)
        .clamp(20, MAX_WIDTH)
}

/// `── python ─────` padded with rules to `width` columns.
pub(crate) fn code_header(language: &str, width: usize) -> String {
    let label = format!("── {language} ");
    let used = UnicodeWidthStr::width(label.as_str());
    format!("{label}{}", "─".repeat(width.saturating_sub(used)))
}

pub(crate) fn code_footer(width: usize) -> String {
    "─".repeat(width)
}

/// Streams blocks to a terminal as they are classified.
pub(crate) struct TerminalRenderer<W: Write> {
    out: W,
    palette: Palette,
    width: usize,
    kinds: HashMap<BlockId, BlockKind>,
    loading: bool,
    at_line_start: bool,
    io_failed: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub(crate) fn new(out: W, width: usize) -> Self {
        Self {
            out,
            palette: Palette::default(),
            width,
            kinds: HashMap::new(),
            loading: false,
            at_line_start: true,
            io_failed: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.out
    }

    fn clear_loading(&mut self) -> io::Result<()> {
        if self.loading {
            self.loading = false;
            queue!(self.out, MoveToColumn(0), Clear(ClearType::CurrentLine))?;
        }
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        queue!(self.out, Print(text))?;
        self.at_line_start = text.ends_with('\n');
        Ok(())
    }

    fn end_line(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            self.write_text("\n")?;
        }
        Ok(())
    }

    fn opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) -> io::Result<()> {
        self.clear_loading()?;
        self.kinds.insert(id, kind);
        match kind {
            BlockKind::Prose => {}
            BlockKind::Code => {
                self.end_line()?;
                let header = code_header(language.unwrap_or("text"), self.width);
                queue!(self.out, SetForegroundColor(self.palette.frame))?;
                self.write_text(&header)?;
                self.write_text("\n")?;
                queue!(self.out, ResetColor)?;
            }
            BlockKind::Thinking => {
                self.end_line()?;
            }
        }
        Ok(())
    }

    fn appended(&mut self, id: BlockId, delta: &str) -> io::Result<()> {
        self.clear_loading()?;
        match self.kinds.get(&id).copied() {
            Some(BlockKind::Code) => {
                queue!(self.out, SetForegroundColor(self.palette.code_fg))?;
                self.write_text(delta)?;
                queue!(self.out, ResetColor)?;
            }
            Some(BlockKind::Thinking) => {
                queue!(
                    self.out,
                    SetAttribute(Attribute::Dim),
                    SetForegroundColor(self.palette.muted_text)
                )?;
                self.write_text(delta)?;
                queue!(self.out, ResetColor, SetAttribute(Attribute::Reset))?;
            }
            Some(BlockKind::Prose) | None => self.write_text(delta)?,
        }
        self.out.flush()
    }

    fn closed(&mut self, id: BlockId) -> io::Result<()> {
        match self.kinds.remove(&id) {
            Some(BlockKind::Code) => {
                self.end_line()?;
                let footer = code_footer(self.width);
                queue!(self.out, SetForegroundColor(self.palette.frame))?;
                self.write_text(&footer)?;
                self.write_text("\n")?;
                queue!(self.out, ResetColor)?;
            }
            Some(BlockKind::Thinking) => {
                self.end_line()?;
                self.write_text("\n")?;
            }
            Some(BlockKind::Prose) | None => {}
        }
        self.out.flush()
    }

    fn finished(&mut self, outcome: &StreamOutcome) -> io::Result<()> {
        self.clear_loading()?;
        self.end_line()?;
        if let StreamOutcome::Failed(message) = outcome {
            queue!(self.out, SetForegroundColor(self.palette.error_text))?;
            self.write_text(&format!("error: {message}\n"))?;
            queue!(self.out, ResetColor)?;
        }
        self.out.flush()
    }

    fn check(&mut self, result: io::Result<()>) {
        if let Err(err) = result {
            if !self.io_failed {
                warn!(error = %err, "terminal write failed");
                self.io_failed = true;
            }
        }
    }
}

impl<W: Write> BlockSink for TerminalRenderer<W> {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) {
        let result = self.opened(id, kind, language);
        self.check(result);
    }

    fn block_appended(&mut self, id: BlockId, delta: &str) {
        let result = self.appended(id, delta);
        self.check(result);
    }

    fn block_closed(&mut self, id: BlockId, _final_text: &str) {
        let result = self.closed(id);
        self.check(result);
    }

    fn block_removed(&mut self, id: BlockId) {
        self.kinds.remove(&id);
    }

    fn stream_started(&mut self) {
        self.loading = true;
        let result = queue!(
            self.out,
            SetForegroundColor(self.palette.muted_text),
            Print(LOADING_PLACEHOLDER),
            ResetColor
        )
        .and_then(|_| self.out.flush());
        self.check(result);
    }

    fn stream_finished(&mut self, outcome: &StreamOutcome) {
        let result = self.finished(outcome);
        self.check(result);
    }
}
