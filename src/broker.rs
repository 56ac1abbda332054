//! Peer coordination requests
//!
//! The broker only records requests and responses. It never closes or
//! expires a request; deadlines are advisory and callers decide when enough
//! responses have arrived.

use chrono::{TimeDelta, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{CoordinationRequest, CoordinationView, RequestId, ResponseRecord, ResponseType};

struct Entry {
    request: Mutex<CoordinationRequest>,
    changed: Notify,
}

#[derive(Default)]
pub struct CoordinationBroker {
    requests: RwLock<HashMap<RequestId, Arc<Entry>>>,
}

impl CoordinationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, request_id: &str) -> Option<Arc<Entry>> {
        self.requests.read().await.get(request_id).cloned()
    }

    /// Open a request. `deadline` is relative to now and only reported back
    /// through `status`.
    pub async fn request(
        &self,
        requesting_agent: &str,
        target_agents: &[String],
        reason: &str,
        deadline: Option<Duration>,
    ) -> Result<RequestId> {
        let targets: BTreeSet<String> = target_agents.iter().cloned().collect();
        if targets.is_empty() {
            return Err(EngineError::InvalidTargetSet {
                requester: requesting_agent.to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let request = CoordinationRequest {
            id: id.clone(),
            requesting_agent: requesting_agent.to_string(),
            channel: format!("coordination_{id}"),
            targets,
            reason: reason.to_string(),
            responses: BTreeMap::new(),
            history: Vec::new(),
            created_at: now,
            deadline: deadline.and_then(|d| TimeDelta::from_std(d).ok()).map(|d| now + d),
        };

        info!(
            request_id = %id,
            requesting_agent = %requesting_agent,
            targets = ?request.targets,
            channel = %request.channel,
            reason = %reason,
            "Coordination requested"
        );

        self.requests.write().await.insert(
            id.clone(),
            Arc::new(Entry {
                request: Mutex::new(request),
                changed: Notify::new(),
            }),
        );
        Ok(id)
    }

    /// Record a response; a repeat response replaces the latest one and is
    /// kept in the history.
    pub async fn respond(&self, responding_agent: &str, request_id: &str, response: ResponseType) -> Result<()> {
        let entry = self.entry(request_id).await.ok_or_else(|| EngineError::UnknownRequest {
            request: request_id.to_string(),
        })?;

        {
            let mut request = entry.request.lock().await;
            if !request.is_target(responding_agent) {
                return Err(EngineError::NotATarget {
                    agent: responding_agent.to_string(),
                    request: request_id.to_string(),
                });
            }

            let previous = request.responses.insert(responding_agent.to_string(), response);
            request.history.push(ResponseRecord {
                agent_id: responding_agent.to_string(),
                response,
                responded_at: Utc::now(),
            });

            if let Some(previous) = previous {
                debug!(
                    request_id = %request_id,
                    agent_id = %responding_agent,
                    previous = %previous,
                    response = %response,
                    "Coordination response replaced"
                );
            }
        }

        entry.changed.notify_waiters();
        info!(request_id = %request_id, agent_id = %responding_agent, response = %response, "Coordination response recorded");
        Ok(())
    }

    pub async fn status(&self, request_id: &str) -> Option<CoordinationView> {
        let entry = self.entry(request_id).await?;
        let request = entry.request.lock().await;
        Some(CoordinationView::from_request(&request, Utc::now()))
    }

    /// Wait until every target has responded or `timeout` elapses, then
    /// return the current view either way.
    pub async fn wait_for_responses(&self, request_id: &str, timeout: Duration) -> Result<CoordinationView> {
        let entry = self.entry(request_id).await.ok_or_else(|| EngineError::UnknownRequest {
            request: request_id.to_string(),
        })?;
        let until = tokio::time::Instant::now() + timeout;

        loop {
            let notified = entry.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let view = {
                let request = entry.request.lock().await;
                CoordinationView::from_request(&request, Utc::now())
            };
            if view.all_responded() {
                return Ok(view);
            }

            if tokio::time::timeout_at(until, notified).await.is_err() {
                debug!(request_id = %request_id, pending = ?view.pending, "Stopped waiting for coordination responses");
                let request = entry.request.lock().await;
                return Ok(CoordinationView::from_request(&request, Utc::now()));
            }
        }
    }
}
