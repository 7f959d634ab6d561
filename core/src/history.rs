//! Append-only conversation history plus the single pending entry.
//!
//! Finalized entries are never mutated or removed within a session. The
//! pending slot holds the message currently being streamed (or the tool group
//! currently being scheduled); it is rendered separately and only enters the
//! entries list once finalized.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use skiff_protocol::ToolCallStatus;

/// One tool invocation as rendered inside a `tool_group` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolGroupCall {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
}

/// Type-specific payload of a history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    User {
        text: String,
    },
    UserShell {
        command: String,
    },
    Assistant {
        text: String,
    },
    /// Continuation fragment of a long assistant message that was split at a
    /// markdown boundary.
    AssistantContent {
        text: String,
    },
    ToolGroup {
        calls: Vec<ToolGroupCall>,
    },
    Info {
        text: String,
    },
    Error {
        text: String,
    },
    About {
        text: String,
    },
    Help {
        text: String,
    },
    Stats {
        user_turns: u64,
        continuations: u64,
        compressions: u64,
        tokens_saved: u64,
        last_known_total_tokens: Option<u64>,
    },
    Compression {
        original_token_count: Option<u64>,
        new_token_count: Option<u64>,
    },
    Summary {
        text: String,
    },
    Quit {
        text: String,
    },
}

/// A finalized history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: HistoryRecord,
}

/// The at-most-one partially assembled entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Pending {
    #[default]
    None,
    Assistant {
        text: String,
        /// True once earlier fragments of this message were already
        /// finalized; the eventual entry is then an `assistant_content`.
        continuation: bool,
    },
    ToolGroup {
        calls: Vec<ToolGroupCall>,
    },
}

impl Pending {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn assistant_text(&self) -> Option<&str> {
        match self {
            Self::Assistant { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn tool_calls(&self) -> Option<&[ToolGroupCall]> {
        match self {
            Self::ToolGroup { calls } => Some(calls),
            _ => None,
        }
    }
}

/// Ordered entries plus the pending slot and the monotonic id counter.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
    pending: Pending,
    next_id: u64,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn pending(&self) -> &Pending {
        &self.pending
    }

    /// Appends a finalized record, assigning the next id.
    pub fn append(&mut self, record: HistoryRecord, now: DateTime<Utc>) -> HistoryEntry {
        self.next_id += 1;
        let entry = HistoryEntry {
            id: self.next_id,
            timestamp: now,
            record,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Appends a streamed chunk to the pending assistant message, creating it
    /// if necessary.
    pub fn push_assistant_chunk(&mut self, chunk: &str) {
        match &mut self.pending {
            Pending::Assistant { text, .. } => text.push_str(chunk),
            _ => {
                self.pending = Pending::Assistant {
                    text: chunk.to_string(),
                    continuation: false,
                };
            }
        }
    }

    pub fn set_pending_tool_group(&mut self, calls: Vec<ToolGroupCall>) {
        self.pending = Pending::ToolGroup { calls };
    }

    /// Finalizes the head of the pending assistant message at `at` (a byte
    /// index), keeping the tail pending as a continuation fragment.
    pub fn split_pending_assistant(
        &mut self,
        at: usize,
        now: DateTime<Utc>,
    ) -> Option<HistoryEntry> {
        let Pending::Assistant { text, continuation } = &mut self.pending else {
            return None;
        };
        if at == 0 || at > text.len() || !text.is_char_boundary(at) {
            return None;
        }
        let tail = text.split_off(at);
        let head = std::mem::take(text);
        let was_continuation = *continuation;
        self.pending = Pending::Assistant {
            text: tail,
            continuation: true,
        };
        let record = if was_continuation {
            HistoryRecord::AssistantContent { text: head }
        } else {
            HistoryRecord::Assistant { text: head }
        };
        Some(self.append(record, now))
    }

    /// Converts the pending slot into a finalized entry; empty assistant
    /// buffers are dropped instead of producing an empty message.
    pub fn finalize_pending(&mut self, now: DateTime<Utc>) -> Option<HistoryEntry> {
        match std::mem::take(&mut self.pending) {
            Pending::None => None,
            Pending::Assistant { text, continuation } => {
                if text.is_empty() {
                    return None;
                }
                let record = if continuation {
                    HistoryRecord::AssistantContent { text }
                } else {
                    HistoryRecord::Assistant { text }
                };
                Some(self.append(record, now))
            }
            Pending::ToolGroup { calls } => Some(self.append(HistoryRecord::ToolGroup { calls }, now)),
        }
    }

    pub fn discard_pending(&mut self) {
        self.pending = Pending::None;
    }

    /// Marks every non-terminal call in a pending tool group as cancelled.
    pub fn cancel_pending_tools(&mut self) {
        if let Pending::ToolGroup { calls } = &mut self.pending {
            for call in calls.iter_mut() {
                if !call.status.is_terminal() {
                    call.status = ToolCallStatus::Cancelled;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn ids_increase_by_append_order() {
        let mut store = HistoryStore::new();
        let a = store.append(HistoryRecord::User { text: "hi".into() }, t0());
        let b = store.append(
            HistoryRecord::Info {
                text: "note".into(),
            },
            t0(),
        );
        assert!(b.id > a.id);
        assert_eq!(store.entries().len(), 2);
    }

    #[test]
    fn pending_is_not_part_of_entries() {
        let mut store = HistoryStore::new();
        store.push_assistant_chunk("partial");
        assert!(store.entries().is_empty());
        assert_eq!(store.pending().assistant_text(), Some("partial"));
    }

    #[test]
    fn finalize_assigns_id_and_clears_pending() {
        let mut store = HistoryStore::new();
        store.push_assistant_chunk("hello");
        let entry = store.finalize_pending(t0()).unwrap();
        assert_eq!(
            entry.record,
            HistoryRecord::Assistant {
                text: "hello".into()
            }
        );
        assert!(store.pending().is_none());
    }

    #[test]
    fn finalize_drops_empty_assistant_buffer() {
        let mut store = HistoryStore::new();
        store.push_assistant_chunk("");
        assert!(store.finalize_pending(t0()).is_none());
        assert!(store.entries().is_empty());
    }

    #[test]
    fn split_emits_leading_then_continuation_fragments() {
        let mut store = HistoryStore::new();
        store.push_assistant_chunk("first\n\nsecond");
        let head = store.split_pending_assistant(7, t0()).unwrap();
        assert_eq!(
            head.record,
            HistoryRecord::Assistant {
                text: "first\n\n".into()
            }
        );

        store.push_assistant_chunk("\n\nthird");
        let mid = store.split_pending_assistant(8, t0()).unwrap();
        assert_eq!(
            mid.record,
            HistoryRecord::AssistantContent {
                text: "second\n\n".into()
            }
        );

        let tail = store.finalize_pending(t0()).unwrap();
        assert_eq!(
            tail.record,
            HistoryRecord::AssistantContent {
                text: "third".into()
            }
        );
    }

    #[test]
    fn split_rejects_out_of_range_or_unaligned_indices() {
        let mut store = HistoryStore::new();
        store.push_assistant_chunk("héllo");
        assert!(store.split_pending_assistant(0, t0()).is_none());
        assert!(store.split_pending_assistant(2, t0()).is_none());
        assert!(store.split_pending_assistant(99, t0()).is_none());
    }

    #[test]
    fn cancel_pending_tools_only_touches_non_terminal_calls() {
        let mut store = HistoryStore::new();
        store.set_pending_tool_group(vec![
            ToolGroupCall {
                call_id: "a".into(),
                name: "read_file".into(),
                status: ToolCallStatus::Executing,
            },
            ToolGroupCall {
                call_id: "b".into(),
                name: "edit".into(),
                status: ToolCallStatus::Success,
            },
        ]);
        store.cancel_pending_tools();
        let calls = store.pending().tool_calls().unwrap();
        assert_eq!(calls[0].status, ToolCallStatus::Cancelled);
        assert_eq!(calls[1].status, ToolCallStatus::Success);
    }
}
