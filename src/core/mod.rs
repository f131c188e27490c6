//! Storage building blocks shared by every item domain.
//!
//! Nothing here knows about prompts or tools; the façade in `store` composes
//! these pieces and the `plugins` supply the domain payloads.

pub mod assets;
pub mod builtin;
pub mod config;
pub mod db;
pub mod dirstore;
pub mod error;
pub mod fts;
pub mod fts_sync;
pub mod mapfile;
pub mod model;
pub mod names;
pub mod overlay;
pub mod rebuilder;
pub mod slug_lock;
pub mod task;
pub mod time;
pub mod token;
