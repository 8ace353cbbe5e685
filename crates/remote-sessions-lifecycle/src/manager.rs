//! Session manager for orchestrating remote session lifecycles.

use std::sync::Arc;

use remote_sessions_core::{
    ControlChannel, ControlError, Reconciler, SessionConfig, SessionDescriptor, SessionKind,
    SessionStatus, SlotState, SlotUpdate, StartOptions,
};
use tokio::task::JoinHandle;

use crate::{KillVerdict, KillVerifier, Readiness, ReadinessPoller, SessionScope};

/// Result of a start request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Session confirmed ready after `attempts` info calls.
    Ready {
        descriptor: SessionDescriptor,
        attempts: u32,
    },
    /// A session of this kind was already active; nothing was started.
    AlreadyActive(SessionDescriptor),
    /// Readiness bound exhausted, or a start is already in flight.
    NotReady { attempts: u32, reason: String },
    /// The owning scope went away, or a stop took the slot over; the result
    /// was discarded and the accepted session handed to a detached teardown.
    Cancelled,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Teardown confirmed and the slot cleared.
    Confirmed { attempts: u32 },
    /// No session was known for the slot.
    AlreadyAbsent,
    /// Teardown unconfirmed; the slot stays `stopping` with a warning.
    Unconfirmed { attempts: u32, reason: String },
    /// The owning scope went away; the result was discarded.
    Cancelled,
}

/// Session manager for console and stream sessions of many resources.
///
/// All state writes go through [`Reconciler`] merges, so console and
/// stream lifecycles of one resource may interleave freely.
pub struct SessionManager<C>
where
    C: ControlChannel,
{
    client: Arc<C>,
    reconciler: Reconciler,
    poller: ReadinessPoller,
    verifier: KillVerifier,
}

impl<C> Clone for SessionManager<C>
where
    C: ControlChannel,
{
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            reconciler: self.reconciler.clone(),
            poller: self.poller,
            verifier: self.verifier,
        }
    }
}

impl<C> SessionManager<C>
where
    C: ControlChannel + 'static,
{
    /// Create a new session manager.
    #[must_use]
    pub fn new(client: Arc<C>, reconciler: Reconciler, config: &SessionConfig) -> Self {
        Self::with_parts(
            client,
            reconciler,
            ReadinessPoller::from_config(config),
            KillVerifier::from_config(config),
        )
    }

    /// Create a manager with explicit poller and verifier.
    #[must_use]
    pub const fn with_parts(
        client: Arc<C>,
        reconciler: Reconciler,
        poller: ReadinessPoller,
        verifier: KillVerifier,
    ) -> Self {
        Self {
            client,
            reconciler,
            poller,
            verifier,
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    #[must_use]
    pub const fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Write a start result while the scope is alive and the slot still
    /// belongs to this start.
    fn merge_start(
        &self,
        scope: &SessionScope,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
        update: SlotUpdate,
    ) -> bool {
        !scope.is_cancelled()
            && self
                .reconciler
                .merge_slot_if(resource_id, kind, |slot| holds_start(slot, session_id), update)
                .is_ok()
    }

    /// Write a stop result while the scope is alive and the slot still holds
    /// `session_id`. A slot taken over by a newer start is left alone.
    fn merge_owned(
        &self,
        scope: &SessionScope,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
        update: SlotUpdate,
    ) -> bool {
        if scope.is_cancelled() {
            tracing::debug!(resource_id, %kind, "scope cancelled, discarding state update");
            return false;
        }
        self.reconciler
            .merge_slot_if(
                resource_id,
                kind,
                |slot| slot.session_id.as_deref() == Some(session_id),
                update,
            )
            .is_ok()
    }

    /// Start a session and wait for it to become ready.
    ///
    /// At most one start per slot is in flight: the `starting` claim is
    /// checked and written under one lock.
    ///
    /// # Errors
    /// Returns the control error if the start call itself fails; the slot is
    /// then marked `error` with an inline notice.
    pub async fn start_session(
        &self,
        resource_id: &str,
        kind: SessionKind,
        options: &StartOptions,
        scope: &SessionScope,
    ) -> Result<StartOutcome, ControlError> {
        if scope.is_cancelled() {
            return Ok(StartOutcome::Cancelled);
        }

        let claim = self.reconciler.merge_slot_if(
            resource_id,
            kind,
            |slot| !slot.is_active() && slot.status != SessionStatus::Starting,
            SlotUpdate::starting(),
        );
        if let Err(current) = claim {
            if current.is_active() {
                tracing::debug!(resource_id, %kind, "session already active");
                return Ok(StartOutcome::AlreadyActive(
                    self.reconciler.descriptor(resource_id, kind),
                ));
            }
            return Ok(StartOutcome::NotReady {
                attempts: 0,
                reason: format!("{kind} session start already in progress"),
            });
        }

        tracing::info!(resource_id, %kind, "starting session");
        let started = match self.client.start(resource_id, kind, options).await {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(resource_id, %kind, "failed to start session: {e}");
                // Release the claim even when nobody is left to show the error.
                let update = if scope.is_cancelled() {
                    SlotUpdate::cleared()
                } else {
                    SlotUpdate::failed(format!("Failed to start {kind} session: {e}"))
                };
                let _ = self.reconciler.merge_slot_if(
                    resource_id,
                    kind,
                    |slot| slot.status == SessionStatus::Starting && slot.session_id.is_none(),
                    update,
                );
                return Err(e);
            }
        };
        let session_id = started.session_id;
        if !self.merge_start(scope, resource_id, kind, &session_id, SlotUpdate::started(&session_id)) {
            return Ok(self.abandon_start(resource_id, kind, &session_id));
        }

        match self.poller.poll(self.client.as_ref(), resource_id, kind, scope).await {
            Readiness::Ready { info, attempts } => {
                let mut remote_info = started.remote_info;
                remote_info.fields.extend(info.remote_info.fields);
                let update = SlotUpdate::active(Some(session_id.clone()), remote_info);
                if !self.merge_start(scope, resource_id, kind, &session_id, update) {
                    return Ok(self.abandon_start(resource_id, kind, &session_id));
                }
                Ok(StartOutcome::Ready {
                    descriptor: self.reconciler.descriptor(resource_id, kind),
                    attempts,
                })
            }
            Readiness::NotReady { attempts, reason } => {
                tracing::warn!(resource_id, %kind, attempts, "{reason}");
                let update = SlotUpdate::failed(reason.clone());
                if !self.merge_start(scope, resource_id, kind, &session_id, update) {
                    return Ok(self.abandon_start(resource_id, kind, &session_id));
                }
                Ok(StartOutcome::NotReady { attempts, reason })
            }
            Readiness::Cancelled { .. } => Ok(self.abandon_start(resource_id, kind, &session_id)),
        }
    }

    /// The start lost its owner after the remote host accepted it: hand the
    /// slot to a detached teardown so it neither lingers in `starting` nor
    /// leaves the session running.
    fn abandon_start(&self, resource_id: &str, kind: SessionKind, session_id: &str) -> StartOutcome {
        let handover = SlotUpdate {
            status: Some(SessionStatus::Stopping),
            session_id: Some(Some(session_id.to_string())),
            remote_info: Some(None),
            notice: Some(None),
        };
        match self
            .reconciler
            .merge_slot_if(resource_id, kind, |slot| holds_start(slot, session_id), handover)
        {
            Ok(_) => tracing::info!(resource_id, %kind, session_id, "start abandoned, tearing session down"),
            // A stop already owns this session.
            Err(slot) if slot.session_id.as_deref() == Some(session_id) => return StartOutcome::Cancelled,
            Err(_) => tracing::info!(resource_id, %kind, session_id, "slot taken over, tearing orphaned session down"),
        }
        self.spawn_teardown(resource_id, kind, session_id);
        StartOutcome::Cancelled
    }

    /// Stop `session_id` in the background, detached from any owner scope.
    ///
    /// Slot writes still only land while the slot holds that session.
    pub fn spawn_teardown(&self, resource_id: &str, kind: SessionKind, session_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let (resource_id, session_id) = (resource_id.to_string(), session_id.to_string());
        tokio::spawn(async move {
            match this
                .stop_known(&resource_id, kind, &session_id, &SessionScope::new())
                .await
            {
                Ok(outcome) => {
                    tracing::debug!(%resource_id, %kind, %session_id, ?outcome, "detached teardown finished");
                }
                Err(e) => tracing::warn!(%resource_id, %kind, %session_id, "detached teardown failed: {e}"),
            }
        })
    }

    /// Stop a session and verify its teardown.
    ///
    /// # Errors
    /// Returns the control error if the stop call fails; the slot stays
    /// `stopping` with a warning notice, and the stop may be retried.
    pub async fn stop_session(
        &self,
        resource_id: &str,
        kind: SessionKind,
        scope: &SessionScope,
    ) -> Result<StopOutcome, ControlError> {
        if scope.is_cancelled() {
            return Ok(StopOutcome::Cancelled);
        }

        let current = self.reconciler.slot(resource_id, kind);
        match current.session_id.as_deref() {
            Some(session_id) => self.stop_known(resource_id, kind, session_id, scope).await,
            None => Ok(self.stop_without_id(resource_id, kind, &current)),
        }
    }

    fn stop_without_id(&self, resource_id: &str, kind: SessionKind, current: &SlotState) -> StopOutcome {
        match current.status {
            SessionStatus::Absent => StopOutcome::AlreadyAbsent,
            SessionStatus::Active => {
                // Adopted through `info` without an id; the stop call has nothing to address.
                let reason = format!("{kind} session has no known id and cannot be stopped from here");
                tracing::warn!(resource_id, %kind, "{reason}");
                self.reconciler
                    .merge_slot(resource_id, kind, SlotUpdate::notice(reason.clone()));
                StopOutcome::Unconfirmed { attempts: 0, reason }
            }
            SessionStatus::Starting | SessionStatus::Stopping | SessionStatus::Error => {
                self.reconciler.merge_slot(resource_id, kind, SlotUpdate::cleared());
                StopOutcome::AlreadyAbsent
            }
        }
    }

    async fn stop_known(
        &self,
        resource_id: &str,
        kind: SessionKind,
        session_id: &str,
        scope: &SessionScope,
    ) -> Result<StopOutcome, ControlError> {
        tracing::info!(resource_id, %kind, session_id, "stopping session");
        self.merge_owned(scope, resource_id, kind, session_id, SlotUpdate::stopping());

        match self.client.stop(resource_id, kind, session_id).await {
            Ok(res) if res.success => {}
            Ok(_) => {
                let reason = format!("Remote host refused to stop {kind} session");
                tracing::warn!(resource_id, %kind, session_id, "{reason}");
                self.merge_owned(scope, resource_id, kind, session_id, SlotUpdate::notice(reason.clone()));
                return Ok(StopOutcome::Unconfirmed { attempts: 0, reason });
            }
            Err(ControlError::NotFound) => {
                self.merge_owned(scope, resource_id, kind, session_id, SlotUpdate::cleared());
                return Ok(StopOutcome::Confirmed { attempts: 0 });
            }
            Err(e) => {
                tracing::error!(resource_id, %kind, session_id, "failed to stop session: {e}");
                let notice = SlotUpdate::notice(format!("Failed to stop {kind} session: {e}"));
                self.merge_owned(scope, resource_id, kind, session_id, notice);
                return Err(e);
            }
        }

        match self.verifier.verify(self.client.as_ref(), resource_id, kind, scope).await {
            KillVerdict::Confirmed { attempts } => {
                if scope.is_cancelled() {
                    return Ok(StopOutcome::Cancelled);
                }
                self.merge_owned(scope, resource_id, kind, session_id, SlotUpdate::cleared());
                Ok(StopOutcome::Confirmed { attempts })
            }
            KillVerdict::Unconfirmed { attempts, reason } => {
                let notice = format!("{kind} session may still be running: {reason}");
                self.merge_owned(scope, resource_id, kind, session_id, SlotUpdate::notice(notice));
                Ok(StopOutcome::Unconfirmed { attempts, reason })
            }
            KillVerdict::Cancelled { .. } => Ok(StopOutcome::Cancelled),
        }
    }

    /// Re-sync one slot from a single `info` call.
    ///
    /// Used when a view mounts and the remote host may hold a session started
    /// elsewhere. Slots with a lifecycle in flight are left alone.
    ///
    /// # Errors
    /// Returns transport and status errors; `NotFound` clears the slot.
    pub async fn refresh(
        &self,
        resource_id: &str,
        kind: SessionKind,
        scope: &SessionScope,
    ) -> Result<SlotState, ControlError> {
        let update = match self.client.info(resource_id, kind).await {
            Ok(info) if info.is_ready() => {
                let session_id = info.session_id().map(str::to_string);
                let known = session_id.is_some()
                    || self.reconciler.slot(resource_id, kind).session_id.is_some();
                let update = SlotUpdate {
                    status: Some(SessionStatus::Active),
                    session_id: session_id.map(Some),
                    remote_info: Some(Some(info.remote_info)),
                    ..SlotUpdate::default()
                };
                if known {
                    update
                } else {
                    tracing::warn!(resource_id, %kind, "adopted session reports no id");
                    update.with_notice(format!(
                        "{kind} session was started elsewhere without an id; it cannot be stopped from here"
                    ))
                }
            }
            Ok(info) if info.is_active() => return Ok(self.reconciler.slot(resource_id, kind)),
            Ok(_) | Err(ControlError::NotFound) => SlotUpdate::cleared(),
            Err(e) => return Err(e),
        };

        if scope.is_cancelled() {
            return Ok(self.reconciler.slot(resource_id, kind));
        }
        match self
            .reconciler
            .merge_slot_if(resource_id, kind, |slot| !slot.status.is_transitional(), update)
        {
            Ok(slot) | Err(slot) => Ok(slot),
        }
    }
}

/// The slot is still the `starting` claim of the start that got `session_id`.
fn holds_start(slot: &SlotState, session_id: &str) -> bool {
    slot.status == SessionStatus::Starting
        && slot.session_id.as_deref().is_none_or(|id| id == session_id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remote_sessions_core::SessionStartResult;

    use super::*;
    use crate::testing::{Call, ScriptedControl, active_info, connectable_info, inactive_info};

    fn manager(control: ScriptedControl) -> SessionManager<ScriptedControl> {
        SessionManager::new(Arc::new(control), Reconciler::new(), &SessionConfig::default())
    }

    fn start_result(id: &str) -> Result<SessionStartResult, ControlError> {
        Ok(SessionStartResult {
            session_id: id.to_string(),
            remote_info: Default::default(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn console_ready_after_two_polls() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(inactive_info()))
            .push_info(Ok(active_info(connectable_info("10.0.0.5", 6080))));
        let mgr = manager(control);

        let outcome = mgr
            .start_session("z1", SessionKind::Console, &StartOptions::new(), &SessionScope::new())
            .await
            .unwrap();

        let StartOutcome::Ready { descriptor, attempts } = outcome else {
            panic!("expected Ready, got {outcome:?}");
        };
        assert_eq!(attempts, 2);
        assert_eq!(descriptor.session_id.as_deref(), Some("c-1"));
        assert_eq!(descriptor.remote_info.unwrap().port(), Some(6080));
        assert!(mgr.reconciler().slot("z1", SessionKind::Console).is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_marks_error_without_session() {
        let control = ScriptedControl::new();
        control.push_start(Err(ControlError::Status {
            code: 502,
            body: "bad gateway".into(),
        }));
        let mgr = manager(control);

        let err = tokio_test::assert_err!(
            mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &SessionScope::new())
                .await
        );
        assert!(matches!(err, ControlError::Status { code: 502, .. }));

        let slot = mgr.reconciler().slot("z1", SessionKind::Console);
        assert_eq!(slot.status, SessionStatus::Error);
        assert!(slot.session_id.is_none());
        assert!(slot.notice.unwrap().contains("502"));
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_clears_half_started_session() {
        let control = ScriptedControl::new();
        control.push_start(start_result("c-2"));
        for _ in 0..10 {
            control.push_info(Ok(inactive_info()));
        }
        let mgr = manager(control);

        let outcome = mgr
            .start_session("z1", SessionKind::Console, &StartOptions::new(), &SessionScope::new())
            .await
            .unwrap();
        assert!(matches!(outcome, StartOutcome::NotReady { attempts: 10, .. }));

        let slot = mgr.reconciler().slot("z1", SessionKind::Console);
        assert_eq!(slot.status, SessionStatus::Error);
        assert!(slot.session_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_active_is_a_no_op() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(active_info(connectable_info("h", 1))));
        let mgr = manager(control);
        let scope = SessionScope::new();

        mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();
        let again = mgr
            .start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();

        assert!(matches!(again, StartOutcome::AlreadyActive(ref d) if d.session_id.as_deref() == Some("c-1")));
        let starts = mgr
            .client()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Start { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_with_immediate_not_found_clears_slot() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(active_info(connectable_info("h", 1))))
            .push_info(Err(ControlError::NotFound));
        let mgr = manager(control);
        let scope = SessionScope::new();
        mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();

        let outcome = mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();

        assert_eq!(outcome, StopOutcome::Confirmed { attempts: 1 });
        assert_eq!(mgr.client().info_calls(), 2);
        assert_eq!(mgr.reconciler().slot("z1", SessionKind::Console).status, SessionStatus::Absent);
        assert!(mgr.client().calls().contains(&Call::Stop {
            resource_id: "z1".into(),
            kind: SessionKind::Console,
            session_id: "c-1".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_stop_stays_stopping_with_warning() {
        let control = ScriptedControl::new();
        control.push_start(start_result("c-1"));
        for _ in 0..4 {
            control.push_info(Ok(active_info(connectable_info("h", 1))));
        }
        let mgr = manager(control);
        let scope = SessionScope::new();
        mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();

        let outcome = mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Unconfirmed { attempts: 3, .. }));

        let slot = mgr.reconciler().slot("z1", SessionKind::Console);
        assert_eq!(slot.status, SessionStatus::Stopping);
        assert_eq!(slot.session_id.as_deref(), Some("c-1"));
        assert!(slot.notice.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_stop_call_keeps_stopping_and_allows_retry() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(active_info(connectable_info("h", 1))))
            .push_stop(Err(ControlError::Transport("connection refused".into())));
        let mgr = manager(control);
        let scope = SessionScope::new();
        mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();

        tokio_test::assert_err!(mgr.stop_session("z1", SessionKind::Console, &scope).await);
        let slot = mgr.reconciler().slot("z1", SessionKind::Console);
        assert_eq!(slot.status, SessionStatus::Stopping);
        assert!(slot.notice.unwrap().contains("connection refused"));

        // Retry: stop succeeds, info falls back to NotFound.
        let outcome = mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();
        assert_eq!(outcome, StopOutcome::Confirmed { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_session_is_already_absent() {
        let mgr = manager(ScriptedControl::new());
        let outcome = mgr
            .stop_session("z9", SessionKind::Stream, &SessionScope::new())
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::AlreadyAbsent);
        assert!(mgr.client().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn console_lifecycle_never_disturbs_stream_slot() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(active_info(connectable_info("h", 1))))
            .push_info(Err(ControlError::NotFound));
        let mgr = manager(control);
        let scope = SessionScope::new();
        mgr.reconciler().merge_slot(
            "z1",
            SessionKind::Stream,
            SlotUpdate::active(Some("s-1".into()), connectable_info("h", 2)),
        );
        let stream_before = mgr.reconciler().slot("z1", SessionKind::Stream);

        mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
            .await
            .unwrap();
        let both = mgr.reconciler().snapshot("z1");
        assert!(both.console().is_active() && both.stream().is_active());

        mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();
        assert_eq!(mgr.reconciler().slot("z1", SessionKind::Stream), stream_before);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_start_tears_session_down_and_frees_slot() {
        let control = ScriptedControl::new();
        control
            .push_start(start_result("c-1"))
            .push_info(Ok(inactive_info()))
            .push_info(Ok(inactive_info()));
        let mgr = manager(control);
        let scope = SessionScope::new();

        let task = tokio::spawn({
            let (mgr, scope) = (mgr.clone(), scope.clone());
            async move {
                mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &scope)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        scope.cancel();
        assert_eq!(task.await.unwrap().unwrap(), StartOutcome::Cancelled);

        // Handed to the detached teardown: settle delay, then one check.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(mgr.client().calls().contains(&Call::Stop {
            resource_id: "z1".into(),
            kind: SessionKind::Console,
            session_id: "c-1".into(),
        }));
        assert_eq!(mgr.reconciler().slot("z1", SessionKind::Console).status, SessionStatus::Absent);

        mgr.client()
            .push_start(start_result("c-2"))
            .push_info(Ok(active_info(connectable_info("h", 1))));
        let again = mgr
            .start_session("z1", SessionKind::Console, &StartOptions::new(), &SessionScope::new())
            .await
            .unwrap();
        assert!(matches!(again, StartOutcome::Ready { ref descriptor, .. } if descriptor.session_id.as_deref() == Some("c-2")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_issue_one_remote_start() {
        let control = ScriptedControl::new();
        control.push_info(Ok(active_info(connectable_info("h", 1))));
        let mgr = SessionManager::with_parts(
            Arc::new(control),
            Reconciler::new(),
            ReadinessPoller::new(Duration::from_millis(5), 10),
            KillVerifier::from_config(&SessionConfig::default()),
        );
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (mgr, barrier) = (mgr.clone(), Arc::clone(&barrier));
                tokio::spawn(async move {
                    barrier.wait().await;
                    mgr.start_session("z1", SessionKind::Console, &StartOptions::new(), &SessionScope::new())
                        .await
                })
            })
            .collect();

        let mut ready = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                StartOutcome::Ready { .. } => ready += 1,
                StartOutcome::AlreadyActive(_) | StartOutcome::NotReady { attempts: 0, .. } => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(ready, 1);
        let starts = mgr
            .client()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Start { .. }))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_session_with_id_can_be_stopped() {
        let control = ScriptedControl::new();
        let mut info = active_info(connectable_info("h", 7));
        info.session_id = Some("c-9".into());
        control.push_info(Ok(info));
        let mgr = manager(control);
        let scope = SessionScope::new();

        let slot = mgr.refresh("z1", SessionKind::Console, &scope).await.unwrap();
        assert_eq!(slot.session_id.as_deref(), Some("c-9"));
        assert!(slot.notice.is_none());

        let outcome = mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();
        assert_eq!(outcome, StopOutcome::Confirmed { attempts: 1 });
        assert!(mgr.client().calls().contains(&Call::Stop {
            resource_id: "z1".into(),
            kind: SessionKind::Console,
            session_id: "c-9".into(),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_session_without_id_is_not_reported_stopped() {
        let control = ScriptedControl::new();
        control.push_info(Ok(active_info(connectable_info("h", 7))));
        let mgr = manager(control);
        let scope = SessionScope::new();

        let slot = mgr.refresh("z1", SessionKind::Console, &scope).await.unwrap();
        assert!(slot.is_active());
        assert!(slot.notice.is_some());

        let outcome = mgr.stop_session("z1", SessionKind::Console, &scope).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Unconfirmed { attempts: 0, .. }));
        assert!(mgr.reconciler().slot("z1", SessionKind::Console).is_active());
        assert!(!mgr.client().calls().iter().any(|c| matches!(c, Call::Stop { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_adopts_running_session_and_clears_missing_one() {
        let control = ScriptedControl::new();
        control
            .push_info(Ok(active_info(connectable_info("h", 7))))
            .push_info(Err(ControlError::NotFound));
        let mgr = manager(control);
        let scope = SessionScope::new();

        let slot = mgr.refresh("z1", SessionKind::Console, &scope).await.unwrap();
        assert!(slot.is_active());

        let slot = mgr.refresh("z1", SessionKind::Console, &scope).await.unwrap();
        assert_eq!(slot.status, SessionStatus::Absent);
    }
}
