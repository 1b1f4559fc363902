//! Relational layout of events and tags.
//!
//! - `schema`: DDL and migrations
//! - `tags`: lossless tag ↔ slot/overflow mapping
//! - `query`: filter → row-id SQL translation

pub mod query;
pub mod schema;
mod tags;

pub use tags::{tag_rows, TagRow, TAG_SLOTS};
