//! Collaborators the event handler consults before streaming.

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use dashmap::DashMap;
use pipeliner_events::{BuildId, BuildStatus, EventBus, EventStoreError};
use tracing::warn;

/// What the handler needs to know about a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub id: BuildId,
    pub status: BuildStatus,
}

impl BuildInfo {
    /// Running builds are streamed live; finished ones are replayed.
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// Build lookup
#[async_trait]
pub trait BuildLookup: Send + Sync {
    async fn find_build(&self, id: BuildId) -> Option<BuildInfo>;
}

/// In-memory registry of build statuses
#[derive(Debug, Default)]
pub struct InMemoryBuilds {
    builds: DashMap<BuildId, BuildStatus>,
}

impl InMemoryBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, id: BuildId, status: BuildStatus) {
        self.builds.insert(id, status);
    }

    pub fn remove(&self, id: BuildId) -> Option<BuildStatus> {
        self.builds.remove(&id).map(|(_, status)| status)
    }
}

#[async_trait]
impl BuildLookup for InMemoryBuilds {
    async fn find_build(&self, id: BuildId) -> Option<BuildInfo> {
        self.builds.get(&id).map(|status| BuildInfo {
            id,
            status: *status,
        })
    }
}

/// Builds known to the bus's event store. A finalized event stream counts as
/// a finished build; the store does not record how it ended.
#[async_trait]
impl BuildLookup for EventBus {
    async fn find_build(&self, id: BuildId) -> Option<BuildInfo> {
        let status = match self.store().is_finalized(id).await {
            Ok(true) => BuildStatus::Succeeded,
            Ok(false) => BuildStatus::Started,
            Err(EventStoreError::NotFound(_)) => return None,
            Err(e) => {
                warn!(build_id = %id, error = %e, "Cannot look up build in event store");
                return None;
            }
        };
        Some(BuildInfo { id, status })
    }
}

/// Decides per request whether a viewer sees redacted events.
pub trait AccessPolicy: Send + Sync {
    fn requires_censoring(&self, build: &BuildInfo, headers: &HeaderMap) -> bool;
}

/// Every viewer sees everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn requires_censoring(&self, _build: &BuildInfo, _headers: &HeaderMap) -> bool {
        false
    }
}

/// Viewers presenting `Authorization: Bearer <token>` see unredacted events;
/// everyone else gets them censored.
#[derive(Debug, Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| presented.trim() == self.token)
    }
}

impl AccessPolicy for BearerToken {
    fn requires_censoring(&self, _build: &BuildInfo, headers: &HeaderMap) -> bool {
        !self.is_authorized(headers)
    }
}
