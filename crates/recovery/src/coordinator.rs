//! Relay-based reconnection with exponential backoff.
//!
//! The direct path between the peers is gone, so the reconnection offer
//! travels through a relay peer that both sides can still reach. The
//! SDP blobs are opaque here; [`ConnectionFactory`] owns the actual
//! transport establishment.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use skiff_protocol::messages::{
    ReconnectAnswer, ReconnectOffer, RecoveryRequest, ResourceProfile,
};
use skiff_transfer::channel::ChannelTransport;
use skiff_transfer::orchestrator::TransferOrchestrator;
use skiff_transfer::types::{SessionEvent, SessionOutcome};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::RecoveryError;
use crate::backoff::RetrySchedule;
use crate::session::{ConnectionParams, RecoverySession, RecoveryState, SessionStore};

/// Routes a reconnection offer to the target peer through a relay and
/// returns its answer.
pub trait RelaySignaling: Send + Sync {
    fn relay_offer(
        &self,
        offer: ReconnectOffer,
    ) -> Pin<Box<dyn Future<Output = Result<ReconnectAnswer, RecoveryError>> + Send + '_>>;
}

/// Builds transports from connection parameters and relayed answers.
pub trait ConnectionFactory: Send + Sync {
    /// Produces the local offer blob for a new connection attempt.
    fn create_offer(
        &self,
        params: ConnectionParams,
    ) -> Pin<Box<dyn Future<Output = Result<String, RecoveryError>> + Send + '_>>;

    /// Completes establishment from the peer's answer and returns the
    /// new channel transport.
    fn establish(
        &self,
        params: ConnectionParams,
        answer: ReconnectAnswer,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ChannelTransport>, RecoveryError>> + Send + '_>>;
}

/// Drives recovery of one dropped session: backoff, relayed offer and
/// answer, transport registration, delta announcement, resume.
pub struct ReconnectionCoordinator {
    store: Arc<SessionStore>,
    schedule: RetrySchedule,
    signaling: Arc<dyn RelaySignaling>,
    factory: Arc<dyn ConnectionFactory>,
    cancel: CancellationToken,
}

impl ReconnectionCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        schedule: RetrySchedule,
        signaling: Arc<dyn RelaySignaling>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            store,
            schedule,
            signaling,
            factory,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs recovery to a terminal result: the resumed session completes,
    /// fails terminally, the retry budget runs out, or the coordinator
    /// is cancelled. A resumed session that drops again re-enters the
    /// backoff loop on the same budget.
    pub async fn run(
        &self,
        orchestrator: &TransferOrchestrator,
        session_id: &str,
        local_peer_id: &str,
        profile: &ResourceProfile,
    ) -> Result<SessionOutcome, RecoveryError> {
        loop {
            let session = self
                .store
                .get(session_id)
                .ok_or_else(|| RecoveryError::UnknownSession(session_id.to_string()))?;
            let attempt = session.retry_count + 1;

            if !self.schedule.allows(attempt) {
                self.store
                    .set_state(session_id, RecoveryState::RetriesExhausted);
                warn!(
                    session = session_id,
                    peer = %session.peer_id,
                    attempts = session.retry_count,
                    "automatic recovery exhausted, manual rendezvous required"
                );
                let _ = orchestrator
                    .events_sender()
                    .try_send(SessionEvent::ManualRecoveryNeeded {
                        peer_id: session.peer_id.clone(),
                        recovery_code: session_id.to_string(),
                    });
                return Err(RecoveryError::RetriesExhausted(self.schedule.max_attempts));
            }

            let delay = self.schedule.delay_for_attempt(attempt);
            info!(
                session = session_id,
                attempt,
                delay_secs = delay.as_secs(),
                "waiting before reconnection attempt"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(RecoveryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            self.store.record_attempt(session_id);

            match self
                .attempt(orchestrator, &session, local_peer_id, profile, delay)
                .await
            {
                Ok(SessionOutcome::Completed) => {
                    info!(session = session_id, "recovered session completed");
                    self.store.set_state(session_id, RecoveryState::Closed);
                    self.store.remove(session_id);
                    return Ok(SessionOutcome::Completed);
                }
                Ok(SessionOutcome::Dropped) => {
                    warn!(session = session_id, attempt, "resumed session dropped again");
                    if let Some(snapshot) = orchestrator.dropped_snapshot(&session.peer_id) {
                        self.store.update_snapshot(session_id, snapshot);
                    }
                    self.store.set_state(session_id, RecoveryState::Dropped);
                }
                Ok(SessionOutcome::Failed(reason)) => {
                    // A terminal failure (manifest mismatch, protocol
                    // violation) is not retryable.
                    self.store.remove(session_id);
                    return Err(RecoveryError::SessionFailed(reason));
                }
                Err(RecoveryError::Cancelled) => return Err(RecoveryError::Cancelled),
                Err(e) => {
                    warn!(
                        session = session_id,
                        attempt,
                        error = %e,
                        "reconnection attempt failed"
                    );
                }
            }
        }
    }

    /// One reconnection attempt followed by a resume of the remainder.
    ///
    /// Establishment is bounded by the attempt's backoff delay; the
    /// resume itself is never timed out, transfers may run long.
    async fn attempt(
        &self,
        orchestrator: &TransferOrchestrator,
        session: &RecoverySession,
        local_peer_id: &str,
        profile: &ResourceProfile,
        connect_timeout: Duration,
    ) -> Result<SessionOutcome, RecoveryError> {
        let transport = tokio::select! {
            _ = self.cancel.cancelled() => return Err(RecoveryError::Cancelled),
            result = tokio::time::timeout(
                connect_timeout,
                self.establish_transport(session, local_peer_id),
            ) => result.map_err(|_| RecoveryError::Timeout)??,
        };

        orchestrator.register_channels(&session.peer_id, transport)?;
        self.store
            .set_state(&session.session_id, RecoveryState::Reconnected);
        info!(
            session = %session.session_id,
            peer = %session.peer_id,
            "transport re-established"
        );

        // Announce the locally delivered set so the peer can subtract
        // everything we already confirmed before it resumes.
        let mut completed_files: Vec<String> =
            session.snapshot.delivered_files.iter().cloned().collect();
        completed_files.sort();
        let request = RecoveryRequest {
            session_id: session.session_id.clone(),
            peer_id: local_peer_id.to_string(),
            completed_files,
            completed_hashes: session.snapshot.delivered_hashes.clone(),
        };
        orchestrator.send_recovery_request(&session.peer_id, &request)?;

        self.store
            .set_state(&session.session_id, RecoveryState::ResumedTransferring);
        debug!(
            session = %session.session_id,
            pending = session.snapshot.pending_files.len(),
            "resuming transfer"
        );

        tokio::select! {
            _ = self.cancel.cancelled() => Err(RecoveryError::Cancelled),
            outcome = orchestrator.resume(&session.peer_id, &session.snapshot, profile) => {
                Ok(outcome?)
            }
        }
    }

    async fn establish_transport(
        &self,
        session: &RecoverySession,
        local_peer_id: &str,
    ) -> Result<Arc<dyn ChannelTransport>, RecoveryError> {
        let sdp_blob = self.factory.create_offer(session.params.clone()).await?;
        let offer = ReconnectOffer {
            session_id: session.session_id.clone(),
            source_peer_id: local_peer_id.to_string(),
            target_peer_id: session.peer_id.clone(),
            sdp_blob,
        };
        let answer = self.signaling.relay_offer(offer).await?;
        if answer.session_id != session.session_id {
            return Err(RecoveryError::Signaling(format!(
                "answer for session {} while recovering {}",
                answer.session_id, session.session_id
            )));
        }
        self.factory.establish(session.params.clone(), answer).await
    }
}
