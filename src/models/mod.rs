//! Data models for the ephemeral relay.
//!
//! `ObjectMeta` is the in-memory description of a stored upload; the other
//! types are the JSON views served to clients via `serde`.

pub mod object;
