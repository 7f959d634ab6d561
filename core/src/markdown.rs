//! Markdown-aware split point for long streamed messages.

/// Byte offset just past the last paragraph break that sits outside a fenced
/// code block, or `None` when the text has no safe boundary yet.
///
/// Splitting only at such boundaries keeps each finalized fragment renderable
/// on its own: a fragment never ends mid-fence or mid-paragraph.
pub fn last_safe_split_point(text: &str) -> Option<usize> {
    let mut in_fence = false;
    let mut best: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\n', '\r']).trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        } else if !in_fence && trimmed.is_empty() && line.ends_with('\n') {
            let candidate = offset + line.len();
            // Keep the tail non-empty so the pending buffer never vanishes.
            if candidate < text.len() {
                best = Some(candidate);
            }
        }
        offset += line.len();
    }

    best
}
