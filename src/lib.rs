//! guild-player library crate
//!
//! Per-guild audio playback: sources buffer songs to disk and deliver raw
//! PCM in real time, the processor applies effects and encodes, and the
//! player feeds the result to a voice transport as the queue dictates.
//! The demo binary is in main.rs.

#[macro_use]
extern crate log;

pub mod buffer;
pub mod chunk_store;
pub mod config;
pub mod constants;
pub mod event;
pub mod guild;
pub mod notify;
pub mod pipeline;
pub mod player;
pub mod processor;
pub mod queue;
pub mod song;
pub mod sources;
pub mod transport;
