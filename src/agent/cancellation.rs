//! Cooperative cancellation through TTL-bound markers.
//!
//! `cancel_agent` writes `agent:cancel:{state_id}`; a running loop polls the
//! markers of itself and its ancestors between steps. Steps already sent to
//! the model are never interrupted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::KeyValueStore;
use crate::types::StateId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSignal {
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

/// Reads and writes cancellation markers.
#[derive(Clone)]
pub struct CancellationSignals {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl CancellationSignals {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn key(state_id: StateId) -> String {
        format!("agent:cancel:{}", state_id)
    }

    pub async fn signal(&self, state_id: StateId, reason: impl Into<String>) -> crate::Result<()> {
        let signal = CancelSignal {
            reason: reason.into(),
            requested_at: Utc::now(),
        };
        let data = serde_json::to_string(&signal)?;
        self.store
            .set(&Self::key(state_id), &data, Some(self.ttl))
            .await?;
        Ok(())
    }

    pub async fn check(&self, state_id: StateId) -> crate::Result<Option<CancelSignal>> {
        match self.store.get(&Self::key(state_id)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn clear(&self, state_id: StateId) -> crate::Result<bool> {
        Ok(self.store.delete(&Self::key(state_id)).await?)
    }
}

/// Throttled view of the cancellation markers for one run.
///
/// The first poll always reads the store; later polls read it at most once per
/// `interval`. Once a signal is observed it is sticky.
pub struct CancellationMonitor {
    signals: CancellationSignals,
    scope: Vec<StateId>,
    interval: Duration,
    last_poll: Option<Instant>,
    observed: Option<CancelSignal>,
}

impl CancellationMonitor {
    pub fn new(signals: CancellationSignals, scope: Vec<StateId>, interval: Duration) -> Self {
        Self {
            signals,
            scope,
            interval,
            last_poll: None,
            observed: None,
        }
    }

    pub async fn poll(&mut self) -> crate::Result<Option<CancelSignal>> {
        if let Some(signal) = &self.observed {
            return Ok(Some(signal.clone()));
        }
        if let Some(last) = self.last_poll
            && last.elapsed() < self.interval
        {
            return Ok(None);
        }
        self.last_poll = Some(Instant::now());

        for state_id in &self.scope {
            if let Some(signal) = self.signals.check(*state_id).await? {
                tracing::debug!(%state_id, reason = %signal.reason, "Cancellation signal observed");
                self.observed = Some(signal.clone());
                return Ok(Some(signal));
            }
        }
        Ok(None)
    }
}
