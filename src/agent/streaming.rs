//! Streaming runs.

use std::sync::Arc;

use futures::Stream;
use futures::stream;
use tokio::sync::mpsc;

use super::events::EventSink;
use super::{AgentEvent, AgentRuntime, RunOptions};
use crate::AppError;
use crate::manifest::ManifestKey;

impl AgentRuntime {
    /// Runs a new root agent on a spawned task and streams its progress.
    ///
    /// The stream always ends with [`AgentEvent::Finished`], or with
    /// [`AgentEvent::Failed`] when the run could not start. Dropping the stream
    /// does not stop the run.
    pub fn stream_agent(
        &self,
        key: &ManifestKey,
        input: impl Into<String>,
        options: RunOptions,
    ) -> impl Stream<Item = AgentEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(&self.engine);
        let key = key.clone();
        let input = input.into();
        let sink = if engine.config.emit_stream_events {
            EventSink::new(tx.clone())
        } else {
            EventSink::disabled()
        };

        tokio::spawn(async move {
            let last = match engine.start_root(&key, input, options, &sink).await {
                Ok(result) => AgentEvent::Finished {
                    result: Box::new(result),
                },
                Err(e) => {
                    tracing::warn!(manifest = %key, error = %e, "Streamed run failed to start");
                    AgentEvent::Failed {
                        error: AppError::from(&e),
                    }
                }
            };
            let _ = tx.send(last);
        });

        stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
    }
}
