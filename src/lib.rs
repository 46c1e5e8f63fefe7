//! Session analytics cards computed from agent transcripts.
//!
//! A transcript is a JSONL file of conversation records, optionally with one
//! extra file per delegated sub-agent. Cheap cards (tokens, tools, timing, ...)
//! come from one streaming pass over those files and are cached per session
//! until the transcript grows. The recap card is written by a model and
//! regenerated under a staleness window and a storage-level lock.

pub mod analyze;
pub mod cards;
pub mod collectors;
pub mod config;
pub mod files;
pub mod pipeline;
pub mod pricing;
pub mod recap;
pub mod search;
pub mod store;
pub mod transcript;
