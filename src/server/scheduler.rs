use crate::common::data::Delay;
use std::{future::Future, time::Duration};
use tokio::time::error::Elapsed;

/// Thin facade over the tokio timer and task primitives used by the dispatcher.
/// Keeps every wait in the dispatch path non-blocking.
#[derive(Clone, Copy, Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Sleeps for the configured delay, if any.
    pub async fn delay(&self, delay: Option<&Delay>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay.to_duration()).await;
        }
    }

    /// Runs a future with an upper time bound.
    pub async fn timeout<F>(&self, duration: Duration, future: F) -> Result<F::Output, Elapsed>
    where
        F: Future,
    {
        tokio::time::timeout(duration, future).await
    }
}
