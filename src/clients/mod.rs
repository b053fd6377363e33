//! Client records — prospects, their channel binding, status and transcript.

pub mod model;

pub use model::{
    ChannelIdentity, Client, ClientFilter, ClientId, ClientStatus, Direction, NewClient,
    Transition, TranscriptEntry,
};
