//! The consuming half of the pipeline.
//!
//! A [`ConsumerRuntime`] keeps one member in its consumer group through the [`Coordinator`],
//! indexes every claimed message with an [`IndexingHandler`] and reacts to control signals:
//! a terminate signal drains and stops the process, a pause toggle stops and resumes fetching
//! without leaving the group.

use feedsink_log::GroupError;
use tokio::task::JoinError;

mod coordinator;
mod handler;
mod pause;
mod ready;
mod runtime;

pub use coordinator::Coordinator;
pub use handler::{HandlerStats, IndexingHandler};
pub use pause::PauseControl;
pub use ready::{Readiness, ReadyGate};
pub use runtime::ConsumerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("consuming failed: {0}")]
    Consume(#[source] GroupError),

    #[error("closing the consumer group failed: {0}")]
    Close(#[source] GroupError),

    #[error("the consumer group error stream was already taken")]
    ErrorsTaken,

    #[error("consumer task failed: {0}")]
    Task(#[from] JoinError),
}
