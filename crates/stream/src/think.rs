//! Removal of reasoning ("think") segments from streamed answer text.
//!
//! Two delimiter styles are recognised: an XML-style `<think>…</think>` pair
//! and a fenced block opened by ```` ```think ````, ```` ```thought ```` or
//! ```` ```reasoning ```` and closed by a bare ```` ``` ````. Fragments are
//! processed in arrival order. A marker is only detected once it is complete
//! inside one fragment, but text inside an opened region is buffered, so a
//! region may span any number of fragments.

use std::sync::LazyLock;

use regex::Regex;

pub const XML_OPEN: &str = "<think>";
pub const XML_CLOSE: &str = "</think>";
pub const FENCE_CLOSE: &str = "```";
/// Longest reasoning summary emitted per segment, in characters.
pub const REASONING_SUMMARY_LIMIT: usize = 240;
const ELLIPSIS: char = '…';

static FENCE_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)```(?:think|thought|reasoning)\b").expect("fence opener pattern is valid")
});

/// Output of one [`ThinkStripper::strip`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stripped {
    /// Text that belongs to the visible answer; may be empty.
    pub visible: String,
    /// Summaries of reasoning segments that closed during this fragment.
    pub reasoning: Vec<String>,
}

/// Per-session reasoning filter state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThinkStripper {
    in_xml: bool,
    in_fence: bool,
    // A fence opened before the current XML region and not yet closed.
    fence_pending: bool,
    buffer: String,
}

impl ThinkStripper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_xml(&self) -> bool {
        self.in_xml
    }

    pub fn in_fence(&self) -> bool {
        self.in_fence
    }

    /// True while a reasoning region is open.
    pub fn in_reasoning(&self) -> bool {
        self.in_xml || self.in_fence
    }

    /// Reasoning text of the currently open region, not yet flushed.
    pub fn pending_reasoning(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Filters one token fragment.
    pub fn strip(&mut self, fragment: &str) -> Stripped {
        let mut reasoning = Vec::new();
        let visible = self
            .strip_regions(fragment.to_string(), &mut reasoning)
            .unwrap_or_default();

        Stripped { visible, reasoning }
    }

    fn strip_regions(&mut self, mut text: String, reasoning: &mut Vec<String>) -> Option<String> {
        // An open fence owns everything up to its closer, XML markers included.
        if self.in_fence {
            text = self.close_fence(text, reasoning)?;
        }

        let text = self.strip_xml(text, reasoning)?;
        if self.in_fence {
            // The XML region that just closed sat inside a fence that is
            // still open; the rest of the fragment starts inside it.
            return self.strip_regions(text, reasoning);
        }
        Some(self.strip_fences(text, reasoning))
    }

    /// Returns `None` when the whole fragment was absorbed by the open fence.
    fn close_fence(&mut self, mut text: String, reasoning: &mut Vec<String>) -> Option<String> {
        let Some(end) = text.find(FENCE_CLOSE) else {
            self.buffer.push_str(&text);
            return None;
        };
        self.buffer.push_str(&text[..end]);
        text.replace_range(..end + FENCE_CLOSE.len(), "");
        self.in_fence = false;
        self.flush(reasoning);
        Some(text)
    }

    /// XML pass. Returns `None` when the whole fragment was absorbed into an
    /// already-open region.
    fn strip_xml(&mut self, mut text: String, reasoning: &mut Vec<String>) -> Option<String> {
        if self.in_xml {
            let Some(end) = find_ignore_ascii_case(&text, XML_CLOSE, 0) else {
                self.buffer.push_str(&text);
                return None;
            };
            self.buffer.push_str(&text[..end]);
            text.replace_range(..end + XML_CLOSE.len(), "");
            self.in_xml = false;
            if std::mem::take(&mut self.fence_pending) {
                self.in_fence = true;
                return Some(text);
            }
            self.flush(reasoning);
        }

        while let Some(start) = find_ignore_ascii_case(&text, XML_OPEN, 0) {
            let inner_start = start + XML_OPEN.len();
            match find_ignore_ascii_case(&text, XML_CLOSE, inner_start) {
                Some(end) => {
                    push_summary(reasoning, &text[inner_start..end]);
                    text.replace_range(start..end + XML_CLOSE.len(), "");
                }
                None => {
                    self.in_xml = true;
                    self.buffer.push_str(&text[inner_start..]);
                    text.truncate(start);
                    break;
                }
            }
        }

        Some(text)
    }

    /// Fence pass over the output of the XML pass.
    fn strip_fences(&mut self, mut text: String, reasoning: &mut Vec<String>) -> String {
        while let Some(opener) = FENCE_OPEN.find(&text) {
            let (start, inner_start) = (opener.start(), opener.end());
            match text[inner_start..].find(FENCE_CLOSE) {
                Some(offset) => {
                    let end = inner_start + offset;
                    push_summary(reasoning, &text[inner_start..end]);
                    text.replace_range(start..end + FENCE_CLOSE.len(), "");
                }
                None if self.in_xml => {
                    // The XML region opened later in this fragment sits inside
                    // this fence; keep one region open and one buffer ordered,
                    // and reopen the fence once the XML region closes.
                    self.buffer.insert_str(0, &text[inner_start..]);
                    self.fence_pending = true;
                    text.truncate(start);
                    break;
                }
                None => {
                    self.in_fence = true;
                    self.buffer.push_str(&text[inner_start..]);
                    text.truncate(start);
                    break;
                }
            }
        }

        text
    }

    fn flush(&mut self, reasoning: &mut Vec<String>) {
        let buffered = std::mem::take(&mut self.buffer);
        push_summary(reasoning, &buffered);
    }
}

/// Collapses whitespace runs, trims, and caps the result at
/// [`REASONING_SUMMARY_LIMIT`] characters plus an ellipsis.
pub fn summarize_reasoning(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(REASONING_SUMMARY_LIMIT) {
        Some((cut, _)) => {
            let mut summary = collapsed[..cut].to_string();
            summary.push(ELLIPSIS);
            summary
        }
        None => collapsed,
    }
}

fn push_summary(reasoning: &mut Vec<String>, raw: &str) {
    let summary = summarize_reasoning(raw);
    if !summary.is_empty() {
        reasoning.push(summary);
    }
}

// ASCII-only case folding keeps byte offsets valid for the original text.
fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let needle = needle.as_bytes();
    if from > bytes.len() || needle.len() > bytes.len() - from {
        return None;
    }

    bytes[from..]
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|offset| from + offset)
}
