//! Compact textual snapshot of recent conversation context.
//!
//! Recovery prompts embed this snapshot so the model can re-orient itself,
//! and the same text is surfaced to the user alongside recovery notices.

use crate::history::HistoryEntry;
use crate::history::HistoryRecord;
use crate::history::Pending;
use crate::history::ToolGroupCall;

const SUMMARY_LIMIT: usize = 280;
const MAX_TOOL_CALL_LINES: usize = 4;

/// Builds up to three newline-joined segments: the latest user text, the
/// latest assistant text, and the calls of the last two tool groups. Empty
/// segments are omitted.
pub fn build_recovery_snapshot(entries: &[HistoryEntry], pending: &Pending) -> String {
    let mut segments: Vec<String> = Vec::new();

    if let Some(user) = last_user_text(entries) {
        let text = summarize(user);
        if !text.is_empty() {
            segments.push(format!("Last user message: {text}"));
        }
    }

    if let Some(assistant) = last_assistant_text(entries, pending) {
        let text = summarize(assistant);
        if !text.is_empty() {
            segments.push(format!("Last assistant reply: {text}"));
        }
    }

    let calls = recent_tool_calls(entries, pending);
    if !calls.is_empty() {
        let mut joined = calls
            .iter()
            .take(MAX_TOOL_CALL_LINES)
            .map(|call| format!("{}: {}", call.name, call.status))
            .collect::<Vec<_>>()
            .join(", ");
        if calls.len() > MAX_TOOL_CALL_LINES {
            joined.push_str(", …");
        }
        segments.push(format!("Recent tool calls: {joined}"));
    }

    segments.join("\n")
}

/// Collapses whitespace and truncates to the summary limit with an ellipsis.
fn summarize(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_LIMIT {
        return collapsed;
    }
    let mut truncated: String = collapsed.chars().take(SUMMARY_LIMIT).collect();
    truncated.push('…');
    truncated
}

fn last_user_text(entries: &[HistoryEntry]) -> Option<&str> {
    entries.iter().rev().find_map(|entry| match &entry.record {
        HistoryRecord::User { text } => Some(text.as_str()),
        HistoryRecord::UserShell { command } => Some(command.as_str()),
        _ => None,
    })
}

fn last_assistant_text<'a>(entries: &'a [HistoryEntry], pending: &'a Pending) -> Option<&'a str> {
    if let Some(text) = pending.assistant_text()
        && !text.is_empty()
    {
        return Some(text);
    }
    entries.iter().rev().find_map(|entry| match &entry.record {
        HistoryRecord::Assistant { text } | HistoryRecord::AssistantContent { text } => {
            Some(text.as_str())
        }
        _ => None,
    })
}

/// Calls of the last two tool groups, oldest first. A pending tool group
/// counts as the most recent.
fn recent_tool_calls(entries: &[HistoryEntry], pending: &Pending) -> Vec<ToolGroupCall> {
    let mut groups: Vec<&[ToolGroupCall]> = Vec::new();
    if let Some(calls) = pending.tool_calls() {
        groups.push(calls);
    }
    for entry in entries.iter().rev() {
        if groups.len() >= 2 {
            break;
        }
        if let HistoryRecord::ToolGroup { calls } = &entry.record {
            groups.push(calls);
        }
    }
    groups.reverse();
    groups.into_iter().flatten().cloned().collect()
}
