//! Foundational low-level utilities shared across oabot crates.
//!
//! Provides atomic file-write helpers, millisecond clock/expiry utilities for
//! token records, and the canonical text normalization used by every
//! string-matching code path in the bot.

pub mod atomic_io;
pub mod text;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use text::normalize_text;
pub use time_utils::{current_unix_timestamp_ms, is_expired_with_skew_ms};
