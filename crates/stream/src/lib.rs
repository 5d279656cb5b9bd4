#![deny(unsafe_code)]

//! Decoding and filtering of the assistant's server-sent event stream.

/// End-of-stream recovery of chart specs embedded in answer text.
pub mod chart;
/// Wire event model.
pub mod event;
pub mod sse;
pub mod think;

pub use chart::recover_plotly_spec;
pub use event::{ChartItem, StreamEvent, ToolInvocation};
pub use sse::{SseDecoder, decode_stream, parse_frame};
pub use think::{REASONING_SUMMARY_LIMIT, Stripped, ThinkStripper, summarize_reasoning};
