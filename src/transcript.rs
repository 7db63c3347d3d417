use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::warn;

use crate::config::data_dir;
use crate::stream::{BlockId, BlockKind, BlockSink, StreamOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredBlock {
    pub(crate) block_id: BlockId,
    pub(crate) kind: BlockKind,
    pub(crate) language: Option<String>,
    pub(crate) content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredTurn {
    pub(crate) turn: i64,
    pub(crate) prompt: String,
    pub(crate) outcome: Option<String>,
    pub(crate) blocks: Vec<StoredBlock>,
}

/// SQLite record of past prompts and the blocks their responses produced.
pub(crate) struct TranscriptStore {
    conn: Connection,
}

impl TranscriptStore {
    pub(crate) fn open_default() -> Result<Self> {
        let path = transcript_file_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("open transcript db {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory transcript db")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS turns (
              session_id TEXT NOT NULL,
              turn INTEGER NOT NULL,
              prompt TEXT NOT NULL,
              outcome TEXT,
              created_at INTEGER NOT NULL DEFAULT (unixepoch()),
              PRIMARY KEY (session_id, turn)
            );
            CREATE TABLE IF NOT EXISTS blocks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              session_id TEXT NOT NULL,
              turn INTEGER NOT NULL,
              block_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              language TEXT,
              content TEXT NOT NULL,
              created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX IF NOT EXISTS idx_blocks_session_turn
              ON blocks(session_id, turn, block_id);
            ",
        )
        .context("init transcript schema")?;
        Ok(Self { conn })
    }

    /// Records a prompt and returns its turn number within the session.
    pub(crate) fn begin_turn(&self, session_id: &str, prompt: &str) -> Result<i64> {
        let turn: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(turn), 0) + 1 FROM turns WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .context("next turn number")?;
        self.conn
            .execute(
                "INSERT INTO turns(session_id, turn, prompt) VALUES (?1, ?2, ?3)",
                params![session_id, turn, prompt.trim()],
            )
            .context("insert turn")?;
        Ok(turn)
    }

    pub(crate) fn finish_turn(&self, session_id: &str, turn: i64, outcome: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE turns SET outcome = ?3 WHERE session_id = ?1 AND turn = ?2",
                params![session_id, turn, outcome],
            )
            .context("update turn outcome")?;
        Ok(())
    }

    pub(crate) fn save_block(
        &self,
        session_id: &str,
        turn: i64,
        block: &StoredBlock,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO blocks(session_id, turn, block_id, kind, language, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    session_id,
                    turn,
                    block.block_id as i64,
                    block.kind.as_str(),
                    block.language,
                    block.content
                ],
            )
            .context("insert block")?;
        Ok(())
    }

    pub(crate) fn delete_block(&self, session_id: &str, turn: i64, block_id: BlockId) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM blocks WHERE session_id = ?1 AND turn = ?2 AND block_id = ?3",
                params![session_id, turn, block_id as i64],
            )
            .context("delete block")?;
        Ok(())
    }

    /// The last `limit` turns of a session, oldest first, with their blocks.
    pub(crate) fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<StoredTurn>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT turn, prompt, outcome
                 FROM turns
                 WHERE session_id = ?1
                 ORDER BY turn DESC
                 LIMIT ?2",
            )
            .context("prepare recent turns")?;
        let mut rows = stmt
            .query(params![session_id, limit as i64])
            .context("query recent turns")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("scan turn row")? {
            out.push(StoredTurn {
                turn: row.get(0).context("turn.turn")?,
                prompt: row.get(1).context("turn.prompt")?,
                outcome: row.get(2).context("turn.outcome")?,
                blocks: Vec::new(),
            });
        }
        out.reverse();

        for turn in &mut out {
            turn.blocks = self.turn_blocks(session_id, turn.turn)?;
        }
        Ok(out)
    }

    fn turn_blocks(&self, session_id: &str, turn: i64) -> Result<Vec<StoredBlock>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT block_id, kind, language, content
                 FROM blocks
                 WHERE session_id = ?1 AND turn = ?2
                 ORDER BY block_id",
            )
            .context("prepare turn blocks")?;
        let mut rows = stmt
            .query(params![session_id, turn])
            .context("query turn blocks")?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().context("scan block row")? {
            let raw_kind: String = row.get(1).context("block.kind")?;
            let Some(kind) = BlockKind::parse(&raw_kind) else {
                warn!(kind = %raw_kind, "skipping block with unknown kind");
                continue;
            };
            let block_id: i64 = row.get(0).context("block.block_id")?;
            out.push(StoredBlock {
                block_id: block_id as BlockId,
                kind,
                language: row.get(2).context("block.language")?,
                content: row.get(3).context("block.content")?,
            });
        }
        Ok(out)
    }

    pub(crate) fn clear_session(&self, session_id: &str) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("begin clear tx")?;
        tx.execute(
            "DELETE FROM blocks WHERE session_id = ?1",
            params![session_id],
        )
        .context("clear block rows")?;
        tx.execute(
            "DELETE FROM turns WHERE session_id = ?1",
            params![session_id],
        )
        .context("clear turn rows")?;
        tx.commit().context("commit clear tx")?;
        Ok(())
    }
}

fn transcript_file_path() -> PathBuf {
    data_dir().join("transcript.db")
}

/// Sink that writes every closed block of one turn to the store. Store
/// failures are logged, never surfaced to the stream.
pub(crate) struct TranscriptSaver {
    store: TranscriptStore,
    session_id: String,
    turn: i64,
    open: HashMap<BlockId, (BlockKind, Option<String>)>,
}

impl TranscriptSaver {
    pub(crate) fn begin(store: TranscriptStore, session_id: &str, prompt: &str) -> Result<Self> {
        let turn = store.begin_turn(session_id, prompt)?;
        Ok(Self {
            store,
            session_id: session_id.to_string(),
            turn,
            open: HashMap::new(),
        })
    }

    pub(crate) fn turn(&self) -> i64 {
        self.turn
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &TranscriptStore {
        &self.store
    }
}

impl BlockSink for TranscriptSaver {
    fn block_opened(&mut self, id: BlockId, kind: BlockKind, language: Option<&str>) {
        self.open.insert(id, (kind, language.map(str::to_string)));
    }

    fn block_appended(&mut self, _id: BlockId, _delta: &str) {}

    fn block_closed(&mut self, id: BlockId, final_text: &str) {
        let Some((kind, language)) = self.open.remove(&id) else {
            warn!(id, "closed block was never opened");
            return;
        };
        let block = StoredBlock {
            block_id: id,
            kind,
            language,
            content: final_text.to_string(),
        };
        if let Err(err) = self.store.save_block(&self.session_id, self.turn, &block) {
            warn!(id, error = %err, "failed to save block");
        }
    }

    fn block_removed(&mut self, id: BlockId) {
        self.open.remove(&id);
        if let Err(err) = self.store.delete_block(&self.session_id, self.turn, id) {
            warn!(id, error = %err, "failed to drop removed block");
        }
    }

    fn stream_finished(&mut self, outcome: &StreamOutcome) {
        if let Err(err) = self
            .store
            .finish_turn(&self.session_id, self.turn, outcome.as_str())
        {
            warn!(error = %err, "failed to record turn outcome");
        }
    }
}
