//! Reply pipeline.
//!
//! Every inbound item flows through:
//! 1. `claim_next_inbound()` — atomic claim on the channel queue
//! 2. `classify_bounded()` — gateway call with timeout, failures become `UNKNOWN`
//! 3. `ActionDispatcher::dispatch()` — exhaustive match over the intent taxonomy
//! 4. `commit_reply()` — one transaction for all effects
//!
//! [`drain::InboxDrain`] drives the steps; the other modules are pure.

pub mod classifier;
pub mod compose;
pub mod dispatcher;
pub mod drain;
pub mod intent;
pub mod types;

pub use classifier::{ClassificationGateway, LlmClassifier, classify_bounded};
pub use compose::{Composer, Draft};
pub use dispatcher::{ActionDispatcher, Dispatch, Reply, parse_deadline};
pub use drain::{DrainReport, InboxDrain};
pub use intent::Intent;
pub use types::ClassificationResult;
