//! reverie: command-line host for the Reverie engine
//!
//! - settings: `<state-dir>/reverie.toml` (engine + continuity sections)
//! - feed: JSONL observation records replayed into an engine

pub mod feed;
pub mod settings;
