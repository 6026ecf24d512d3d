//! Run event stream.
//!
//! A run optionally narrates itself as newline-delimited JSON on stdout so a
//! supervising process can follow turns, tool calls and review steps live:
//!
//! ```text
//! thread_started
//!   turn_started → assistant_message → item_started → item_completed → turn_completed
//!   ...
//! thread_completed
//! ```
//!
//! Sequence numbers and item ids are scoped to one [`EventStream`], which is
//! passed explicitly to every emitter.

pub mod stream;
pub mod types;

pub use stream::{sanitize_tool_args, EventStream, PROMPT_PREVIEW_CHARS};
pub use types::{ItemKind, ItemStatus, RunEvent};
