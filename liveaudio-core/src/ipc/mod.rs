//! Event types broadcast by a live source and its pull loop.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them as JSON.

pub mod events;
