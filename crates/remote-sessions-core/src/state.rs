//! Shared per-resource session state.
//!
//! Each resource holds one slot per [`SessionKind`]. The console and stream
//! lifecycles run independently and may interleave arbitrarily, so the only
//! way to mutate state is [`Reconciler::merge_slot`] (or its conditional form
//! [`Reconciler::merge_slot_if`]), a partial merge into a single keyed slot.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{RemoteInfo, ResourceId, SessionDescriptor, SessionKind, SessionStatus};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Last-known state of one session kind on one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotState {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub remote_info: Option<RemoteInfo>,
    /// User-visible error or warning attached to the slot.
    pub notice: Option<String>,
    /// Unix epoch milliseconds of the last merge.
    pub updated_at: i64,
}

impl SlotState {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

/// Partial update for one slot. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotUpdate {
    pub status: Option<SessionStatus>,
    pub session_id: Option<Option<String>>,
    pub remote_info: Option<Option<RemoteInfo>>,
    pub notice: Option<Option<String>>,
}

impl SlotUpdate {
    /// Fresh start issued; forgets any previous session of this slot.
    #[must_use]
    pub fn starting() -> Self {
        Self {
            status: Some(SessionStatus::Starting),
            session_id: Some(None),
            remote_info: Some(None),
            notice: Some(None),
        }
    }

    /// Start accepted by the remote host, readiness still pending.
    #[must_use]
    pub fn started(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(Some(session_id.into())),
            ..Self::default()
        }
    }

    /// Session confirmed ready.
    #[must_use]
    pub fn active(session_id: Option<String>, remote_info: RemoteInfo) -> Self {
        Self {
            status: Some(SessionStatus::Active),
            session_id: session_id.map(Some),
            remote_info: Some(Some(remote_info)),
            notice: Some(None),
        }
    }

    /// Stop issued, teardown unconfirmed.
    #[must_use]
    pub fn stopping() -> Self {
        Self {
            status: Some(SessionStatus::Stopping),
            notice: Some(None),
            ..Self::default()
        }
    }

    /// Session gone; slot back to its empty state.
    #[must_use]
    pub fn cleared() -> Self {
        Self {
            status: Some(SessionStatus::Absent),
            session_id: Some(None),
            remote_info: Some(None),
            notice: Some(None),
        }
    }

    /// Start or connection failed; nothing half-started is kept.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(SessionStatus::Error),
            session_id: Some(None),
            remote_info: Some(None),
            notice: Some(Some(message.into())),
        }
    }

    /// Attach a notice without touching the lifecycle fields.
    #[must_use]
    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            notice: Some(Some(message.into())),
            ..Self::default()
        }
    }

    /// Override the notice carried by this update.
    #[must_use]
    pub fn with_notice(mut self, message: impl Into<String>) -> Self {
        self.notice = Some(Some(message.into()));
        self
    }

    fn apply(self, slot: &mut SlotState) {
        if let Some(status) = self.status {
            slot.status = status;
        }
        if let Some(session_id) = self.session_id {
            slot.session_id = session_id;
        }
        if let Some(remote_info) = self.remote_info {
            slot.remote_info = remote_info;
        }
        if let Some(notice) = self.notice {
            slot.notice = notice;
        }
        slot.updated_at = now_millis();
    }
}

/// Per-resource record holding one slot per session kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    slots: BTreeMap<SessionKind, SlotState>,
}

impl ResourceState {
    /// State of `kind`; an untouched slot reads as absent.
    #[must_use]
    pub fn slot(&self, kind: SessionKind) -> SlotState {
        self.slots.get(&kind).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn console(&self) -> SlotState {
        self.slot(SessionKind::Console)
    }

    #[must_use]
    pub fn stream(&self) -> SlotState {
        self.slot(SessionKind::Stream)
    }
}

/// Notification of one slot merge.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub resource_id: ResourceId,
    pub kind: SessionKind,
    pub slot: SlotState,
}

/// Owner of all resource states; cheap to clone and share.
#[derive(Clone)]
pub struct Reconciler {
    resources: Arc<RwLock<HashMap<ResourceId, ResourceState>>>,
    changes: broadcast::Sender<StateChange>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            resources: Arc::new(RwLock::new(HashMap::new())),
            changes,
        }
    }

    /// Merge `update` into the `kind` slot of `resource_id`.
    ///
    /// The sibling slot is never written. Returns the merged slot.
    pub fn merge_slot(&self, resource_id: &str, kind: SessionKind, update: SlotUpdate) -> SlotState {
        match self.merge_slot_if(resource_id, kind, |_| true, update) {
            Ok(slot) | Err(slot) => slot,
        }
    }

    /// Merge `update` only if `condition` accepts the current slot.
    ///
    /// The check and the write happen under one lock, so two callers racing
    /// for the same slot cannot both pass.
    ///
    /// # Errors
    /// Returns the unchanged slot when `condition` rejects it.
    pub fn merge_slot_if(
        &self,
        resource_id: &str,
        kind: SessionKind,
        condition: impl FnOnce(&SlotState) -> bool,
        update: SlotUpdate,
    ) -> Result<SlotState, SlotState> {
        let merged = {
            let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
            let current = resources
                .get(resource_id)
                .map(|state| state.slot(kind))
                .unwrap_or_default();
            if !condition(&current) {
                return Err(current);
            }

            let state = resources.entry(resource_id.to_string()).or_default();
            let sibling = state.slots.get(&kind.other()).cloned();

            let slot = state.slots.entry(kind).or_default();
            update.apply(slot);
            let merged = slot.clone();

            debug_assert_eq!(state.slots.get(&kind.other()), sibling.as_ref());
            merged
        };

        tracing::debug!(resource_id, %kind, status = ?merged.status, "slot merged");
        let _ = self.changes.send(StateChange {
            resource_id: resource_id.to_string(),
            kind,
            slot: merged.clone(),
        });
        Ok(merged)
    }

    /// Copy of the full record for `resource_id`.
    #[must_use]
    pub fn snapshot(&self, resource_id: &str) -> ResourceState {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy of one slot.
    #[must_use]
    pub fn slot(&self, resource_id: &str, kind: SessionKind) -> SlotState {
        self.snapshot(resource_id).slot(kind)
    }

    /// Descriptor view of one slot.
    #[must_use]
    pub fn descriptor(&self, resource_id: &str, kind: SessionKind) -> SessionDescriptor {
        let slot = self.slot(resource_id, kind);
        SessionDescriptor {
            resource_id: resource_id.to_string(),
            session_kind: kind,
            status: slot.status,
            session_id: slot.session_id,
            remote_info: slot.remote_info,
        }
    }

    /// Resources that have ever been written.
    #[must_use]
    pub fn resources(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Receiver for every subsequent merge, across all resources.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn info() -> RemoteInfo {
        serde_json::from_value(json!({"endpoint": "10.0.0.9", "port": 5900})).unwrap()
    }

    #[test]
    fn merge_never_touches_sibling_slot() {
        let rec = Reconciler::new();
        rec.merge_slot("z1", SessionKind::Stream, SlotUpdate::active(Some("s-9".into()), info()));
        let stream_before = rec.slot("z1", SessionKind::Stream);

        for update in [
            SlotUpdate::starting(),
            SlotUpdate::started("c-1"),
            SlotUpdate::active(Some("c-1".into()), info()),
            SlotUpdate::stopping(),
            SlotUpdate::failed("boom"),
            SlotUpdate::cleared(),
        ] {
            rec.merge_slot("z1", SessionKind::Console, update);
            assert_eq!(rec.slot("z1", SessionKind::Stream), stream_before);
        }
    }

    #[test]
    fn both_kinds_active_simultaneously() {
        let rec = Reconciler::new();
        rec.merge_slot("z1", SessionKind::Stream, SlotUpdate::active(Some("s".into()), info()));
        rec.merge_slot("z1", SessionKind::Console, SlotUpdate::active(Some("c".into()), info()));

        let state = rec.snapshot("z1");
        assert!(state.stream().is_active());
        assert!(state.console().is_active());
    }

    #[test]
    fn partial_merge_keeps_untouched_fields() {
        let rec = Reconciler::new();
        rec.merge_slot("z1", SessionKind::Console, SlotUpdate::active(Some("c".into()), info()));
        rec.merge_slot("z1", SessionKind::Console, SlotUpdate::notice("still stopping"));

        let slot = rec.slot("z1", SessionKind::Console);
        assert!(slot.is_active());
        assert_eq!(slot.session_id.as_deref(), Some("c"));
        assert_eq!(slot.notice.as_deref(), Some("still stopping"));
    }

    #[test]
    fn failed_start_leaves_nothing_half_started() {
        let rec = Reconciler::new();
        rec.merge_slot("z2", SessionKind::Console, SlotUpdate::starting());
        rec.merge_slot("z2", SessionKind::Console, SlotUpdate::started("c-7"));
        rec.merge_slot("z2", SessionKind::Console, SlotUpdate::failed("not ready"));

        let d = rec.descriptor("z2", SessionKind::Console);
        assert_eq!(d.status, SessionStatus::Error);
        assert!(d.session_id.is_none());
        assert!(d.remote_info.is_none());
    }

    #[test]
    fn resources_are_independent() {
        let rec = Reconciler::new();
        rec.merge_slot("a", SessionKind::Console, SlotUpdate::starting());
        assert_eq!(rec.slot("b", SessionKind::Console), SlotState::default());
        assert_eq!(rec.resources(), ["a"]);
    }

    #[test]
    fn conditional_merge_rejects_without_writing() {
        let rec = Reconciler::new();
        rec.merge_slot("z1", SessionKind::Console, SlotUpdate::starting());
        let mut rx = rec.subscribe();

        let rejected = rec.merge_slot_if(
            "z1",
            SessionKind::Console,
            |slot| slot.status != SessionStatus::Starting,
            SlotUpdate::started("c-2"),
        );
        assert_eq!(rejected.unwrap_err().status, SessionStatus::Starting);
        assert!(rec.slot("z1", SessionKind::Console).session_id.is_none());
        assert!(rx.try_recv().is_err());

        let accepted = rec.merge_slot_if(
            "z1",
            SessionKind::Stream,
            |slot| slot.status == SessionStatus::Absent,
            SlotUpdate::starting(),
        );
        assert_eq!(accepted.unwrap().status, SessionStatus::Starting);
    }

    #[tokio::test]
    async fn subscribers_see_each_merge() {
        let rec = Reconciler::new();
        let mut rx = rec.subscribe();
        rec.merge_slot("z1", SessionKind::Stream, SlotUpdate::starting());

        let change = tokio_test::assert_ok!(rx.recv().await);
        assert_eq!(change.resource_id, "z1");
        assert_eq!(change.kind, SessionKind::Stream);
        assert_eq!(change.slot.status, SessionStatus::Starting);
    }
}
