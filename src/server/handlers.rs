use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::SharedState;
use crate::error::{AppError, AppResult, ConnectionResult, SessionError};
use crate::hub::agent::{AgentContext, Flow, Membership, MessageHandler};
use crate::hub::events::{
    AttendeeStatusPayload, InboundMessage, JoinSessionPayload, ScoreSubmittedRequest,
    ServerEvent, VoteSubmittedPayload, WelcomePayload, CODE_NOT_JOINED,
};
use crate::hub::{Audience, HubHandle};

/// Error code for failures with no more specific code.
const CODE_INTERNAL: u16 = 5000;

/// Map an error to the `error` envelope sent back to the requester.
pub fn error_event(err: &AppError) -> ServerEvent {
    let code = match err {
        AppError::Session(e) => e.code(),
        AppError::Connection(e) => e.code(),
        AppError::Storage(_) | AppError::Config { .. } | AppError::Internal { .. } => CODE_INTERNAL,
    };
    ServerEvent::error(code, err.to_string())
}

fn not_joined(kind: &str) -> ServerEvent {
    ServerEvent::error(CODE_NOT_JOINED, format!("{} requires join-session first", kind))
}

/// Routes session messages from connection agents to the engines.
pub struct SessionDispatcher {
    state: SharedState,
}

impl SessionDispatcher {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl MessageHandler for SessionDispatcher {
    async fn handle(&self, ctx: &AgentContext, message: InboundMessage) -> Flow {
        let kind = message.kind().to_string();
        let result = match message {
            InboundMessage::JoinSession(payload) => handle_join(&self.state, ctx, payload).await,
            InboundMessage::LeaveSession => {
                info!(agent_id = %ctx.id(), "Participant left");
                return Flow::Leave;
            }
            InboundMessage::VoteSubmitted(payload) => handle_vote(&self.state, ctx, payload).await,
            InboundMessage::ScoreSubmitted(payload) => {
                handle_score(&self.state, ctx, payload).await
            }
            InboundMessage::Pong | InboundMessage::Unknown { .. } => Ok(()),
        };

        if let Err(e) = result {
            debug!(agent_id = %ctx.id(), kind = %kind, error = %e, "Request rejected");
            ctx.reply(error_event(&e)).await;
        }
        Flow::Continue
    }

    async fn on_disconnect(&self, ctx: &AgentContext) {
        let Some(membership) = ctx.membership() else {
            return;
        };
        if let Err(e) = announce_departure(ctx.hub(), &membership).await {
            warn!(error = %e, "Could not announce departure");
        }
    }
}

/// Tell a session that a participant left, unless another of their
/// connections is still registered there. Call after the hub membership
/// change has been sent.
async fn announce_departure(hub: &HubHandle, membership: &Membership) -> ConnectionResult<()> {
    hub.flush().await?;
    if hub
        .online_participants(&membership.session_id)
        .contains(&membership.participant_id)
    {
        return Ok(());
    }
    hub.broadcast(
        Audience::Session(membership.session_id.clone()),
        ServerEvent::AttendeeStatus(AttendeeStatusPayload {
            session_id: membership.session_id.clone(),
            participant_id: membership.participant_id,
            online: false,
        }),
        None,
    )
    .await
}

/// Join a session: register with the hub, welcome the joiner and announce them.
pub async fn handle_join(
    state: &SharedState,
    ctx: &AgentContext,
    payload: JoinSessionPayload,
) -> AppResult<()> {
    let session = state.ledger.session(&payload.session_id).await?;
    if !state
        .directory
        .resolve_participant(session.project_id, payload.participant_id)
        .await?
    {
        return Err(SessionError::UnknownParticipant {
            project_id: session.project_id,
            participant_id: payload.participant_id,
        }
        .into());
    }

    let previous = ctx.membership().filter(|m| m.session_id != session.id);
    ctx.join(Membership {
        session_id: session.id.clone(),
        project_id: session.project_id,
        participant_id: payload.participant_id,
    })
    .await?;
    if let Some(previous) = previous {
        announce_departure(&state.hub, &previous).await?;
    }

    let progress = state.ledger.progress(&session.id).await?;
    let mut online = state.hub.online_participants(&session.id);
    if !online.contains(&payload.participant_id) {
        online.push(payload.participant_id);
        online.sort_unstable();
    }

    ctx.reply(ServerEvent::Welcome(WelcomePayload {
        agent_id: ctx.id(),
        session_id: session.id.clone(),
        participant_id: payload.participant_id,
        criterion: session.criterion,
        progress,
        online,
    }))
    .await;

    state
        .hub
        .broadcast(
            Audience::Session(session.id.clone()),
            ServerEvent::AttendeeStatus(AttendeeStatusPayload {
                session_id: session.id.clone(),
                participant_id: payload.participant_id,
                online: true,
            }),
            Some(ctx.id()),
        )
        .await?;

    info!(
        agent_id = %ctx.id(),
        session_id = %session.id,
        participant_id = payload.participant_id,
        "Participant joined"
    );
    Ok(())
}

/// Apply a vote from the joined participant.
pub async fn handle_vote(
    state: &SharedState,
    ctx: &AgentContext,
    payload: VoteSubmittedPayload,
) -> AppResult<()> {
    let Some(membership) = ctx.membership() else {
        ctx.reply(not_joined("vote-submitted")).await;
        return Ok(());
    };

    let outcome = state
        .ledger
        .submit_vote(
            membership.project_id,
            &payload.comparison_id,
            membership.participant_id,
            payload.choice,
            Some(ctx.id()),
        )
        .await?;

    debug!(
        agent_id = %ctx.id(),
        comparison_id = %payload.comparison_id,
        outcome = ?outcome,
        "Vote applied"
    );
    Ok(())
}

/// Apply a magnitude score from the joined participant.
pub async fn handle_score(
    state: &SharedState,
    ctx: &AgentContext,
    payload: ScoreSubmittedRequest,
) -> AppResult<()> {
    let Some(membership) = ctx.membership() else {
        ctx.reply(not_joined("score-submitted")).await;
        return Ok(());
    };

    let outcome = state
        .magnitude
        .submit_score(
            membership.project_id,
            payload.item_id,
            payload.criterion,
            membership.participant_id,
            payload.value,
            Some(ctx.id()),
        )
        .await?;

    debug!(
        agent_id = %ctx.id(),
        item_id = payload.item_id,
        criterion = %payload.criterion,
        outcome = ?outcome,
        "Score applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;

    #[test]
    fn test_error_event_codes() {
        let err: AppError = SessionError::ComparisonClosed {
            comparison_id: "c".to_string(),
        }
        .into();
        match error_event(&err) {
            ServerEvent::Error(payload) => {
                assert_eq!(payload.code, 4105);
                assert!(payload.message.contains("already closed"));
            }
            other => panic!("expected error, got {:?}", other),
        }

        let err: AppError = ConnectionError::Closed.into();
        assert!(matches!(error_event(&err), ServerEvent::Error(p) if p.code == 5001));

        let err = AppError::Internal {
            message: "boom".to_string(),
        };
        assert!(matches!(error_event(&err), ServerEvent::Error(p) if p.code == CODE_INTERNAL));
    }

    #[test]
    fn test_not_joined_code() {
        assert!(matches!(not_joined("vote-submitted"), ServerEvent::Error(p) if p.code == CODE_NOT_JOINED));
    }
}
