//! Session-wide usage accounting behind the `stats` history entry.

use crate::history::HistoryRecord;

#[derive(Debug, Clone, Default)]
pub struct SessionMetrics {
    user_turns: u64,
    continuations: u64,
    compressions: u64,
    tokens_saved: u64,
    last_known_total_tokens: Option<u64>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user_turn(&mut self) {
        self.user_turns = self.user_turns.saturating_add(1);
    }

    pub fn record_continuation(&mut self) {
        self.continuations = self.continuations.saturating_add(1);
    }

    pub fn record_compression(&mut self, original: Option<u64>, compressed: Option<u64>) {
        self.compressions = self.compressions.saturating_add(1);
        if let (Some(original), Some(compressed)) = (original, compressed) {
            self.tokens_saved = self
                .tokens_saved
                .saturating_add(original.saturating_sub(compressed));
            self.last_known_total_tokens = Some(compressed);
        }
    }

    /// Highest token total the client has reported for this session.
    pub fn record_token_watermark(&mut self, total: u64) {
        self.last_known_total_tokens = Some(total);
    }

    pub fn user_turns(&self) -> u64 {
        self.user_turns
    }

    pub fn as_record(&self) -> HistoryRecord {
        HistoryRecord::Stats {
            user_turns: self.user_turns,
            continuations: self.continuations,
            compressions: self.compressions,
            tokens_saved: self.tokens_saved,
            last_known_total_tokens: self.last_known_total_tokens,
        }
    }
}
