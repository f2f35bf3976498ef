//! Session hub: fan-out of session events to connected participants.
//!
//! Membership changes and broadcasts are serialized through one control loop
//! ([`Hub::run`]) fed by a bounded command queue. Nothing outside that loop
//! touches membership. Read-only queries ([`HubHandle::stats`],
//! [`HubHandle::members_of`]) go to a denormalized view the loop refreshes
//! after every membership change.

pub mod agent;
pub mod events;
pub mod transport;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::error::{ConnectionError, ConnectionResult};
use events::{AgentId, Envelope, ServerEvent};

/// Who a broadcast is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Audience {
    /// Every agent joined to one comparison session.
    Session(String),
    /// Every agent joined to any session of one project.
    Project(i64),
}

/// Sink for events derived from session mutations.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Deliver `event` to `audience`, skipping `exclude`.
    async fn publish(&self, audience: Audience, event: ServerEvent, exclude: Option<AgentId>);
}

/// Publisher that drops every event. Used when no hub is running.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

#[async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, _audience: Audience, _event: ServerEvent, _exclude: Option<AgentId>) {}
}

/// Everything the hub needs to deliver to, and tear down, one agent.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub session_id: String,
    pub project_id: i64,
    pub participant_id: i64,
    /// Sending half of the agent's bounded outbound queue.
    pub outbound: mpsc::Sender<Envelope>,
    /// Cleared by whoever tears the agent down first.
    pub live: Arc<AtomicBool>,
    /// Cancels both of the agent's pumps.
    pub cancel: CancellationToken,
}

/// Point-in-time hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered agents.
    pub connections: usize,
    /// Sessions with at least one agent.
    pub sessions: usize,
    /// Agents per session.
    pub per_session: BTreeMap<String, usize>,
    /// Broadcast commands processed.
    pub broadcasts: u64,
    /// Agents dropped for a full or closed outbound queue.
    pub dropped_agents: u64,
}

/// One registered agent, as seen from outside the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub agent_id: AgentId,
    pub participant_id: i64,
    pub joined_at: DateTime<Utc>,
}

enum HubCommand {
    Register(AgentRegistration),
    Unregister(AgentId),
    Broadcast {
        audience: Audience,
        envelope: Envelope,
        exclude: Option<AgentId>,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct HubView {
    stats: HubStats,
    members: HashMap<String, Vec<MemberInfo>>,
}

struct Member {
    registration: AgentRegistration,
    joined_at: DateTime<Utc>,
}

struct Room {
    project_id: i64,
    members: HashMap<AgentId, Member>,
}

/// The control loop. Owns all membership state.
pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    rooms: HashMap<String, Room>,
    agent_rooms: HashMap<AgentId, String>,
    view: Arc<RwLock<HubView>>,
    broadcasts: u64,
    dropped_agents: u64,
}

impl Hub {
    /// Create a hub and the handle that feeds it. The hub does nothing until
    /// [`Hub::run`] is polled.
    pub fn new(config: &HubConfig) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let view = Arc::new(RwLock::new(HubView::default()));
        let hub = Self {
            commands: rx,
            rooms: HashMap::new(),
            agent_rooms: HashMap::new(),
            view: Arc::clone(&view),
            broadcasts: 0,
            dropped_agents: 0,
        };
        (hub, HubHandle { commands: tx, view })
    }

    /// Create a hub and run its loop on a new task.
    pub fn spawn(config: &HubConfig) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(config);
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process commands until every [`HubHandle`] is dropped.
    pub async fn run(mut self) {
        info!("Session hub started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(registration) => self.register(registration),
                HubCommand::Unregister(agent_id) => self.unregister(agent_id),
                HubCommand::Broadcast {
                    audience,
                    envelope,
                    exclude,
                } => self.broadcast(&audience, &envelope, exclude),
                HubCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }

        for room in self.rooms.values() {
            for member in room.members.values() {
                member.registration.cancel.cancel();
            }
        }
        info!("Session hub stopped");
    }

    fn register(&mut self, registration: AgentRegistration) {
        let agent_id = registration.agent_id;

        let mut moved = false;
        if let Some(current) = self.agent_rooms.get(&agent_id) {
            if *current == registration.session_id {
                debug!(agent_id = %agent_id, "Agent already registered");
                return;
            }
            moved = self.remove(agent_id).is_some();
        }

        if !registration.live.load(Ordering::SeqCst) {
            debug!(agent_id = %agent_id, "Ignoring registration of torn-down agent");
            if moved {
                self.refresh_view();
            }
            return;
        }

        let session_id = registration.session_id.clone();
        info!(
            agent_id = %agent_id,
            session_id = %session_id,
            participant_id = registration.participant_id,
            "Agent registered"
        );

        let room = self.rooms.entry(session_id.clone()).or_insert_with(|| Room {
            project_id: registration.project_id,
            members: HashMap::new(),
        });
        room.members.insert(
            agent_id,
            Member {
                registration,
                joined_at: Utc::now(),
            },
        );
        self.agent_rooms.insert(agent_id, session_id);
        self.refresh_view();
    }

    fn unregister(&mut self, agent_id: AgentId) {
        if self.remove(agent_id).is_some() {
            info!(agent_id = %agent_id, "Agent unregistered");
            self.refresh_view();
        }
    }

    fn remove(&mut self, agent_id: AgentId) -> Option<Member> {
        let session_id = self.agent_rooms.remove(&agent_id)?;
        let room = self.rooms.get_mut(&session_id)?;
        let member = room.members.remove(&agent_id);
        if room.members.is_empty() {
            self.rooms.remove(&session_id);
        }
        member
    }

    fn broadcast(&mut self, audience: &Audience, envelope: &Envelope, exclude: Option<AgentId>) {
        self.broadcasts += 1;

        let mut dead: Vec<(AgentId, ConnectionError)> = Vec::new();
        let mut delivered = 0usize;

        let rooms = self.rooms.iter().filter(|(session_id, room)| match audience {
            Audience::Session(id) => *session_id == id,
            Audience::Project(id) => room.project_id == *id,
        });

        for (_, room) in rooms {
            for (agent_id, member) in &room.members {
                if Some(*agent_id) == exclude {
                    continue;
                }
                let registration = &member.registration;
                if !registration.live.load(Ordering::SeqCst) {
                    dead.push((*agent_id, ConnectionError::Closed));
                    continue;
                }
                match registration.outbound.try_send(envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => dead.push((
                        *agent_id,
                        ConnectionError::CapacityExceeded {
                            agent_id: agent_id.to_string(),
                        },
                    )),
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push((*agent_id, ConnectionError::Closed))
                    }
                }
            }
        }

        debug!(
            kind = envelope.event.kind(),
            audience = ?audience,
            delivered,
            "Broadcast dispatched"
        );

        if dead.is_empty() {
            self.view
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .stats
                .broadcasts = self.broadcasts;
            return;
        }

        for (agent_id, reason) in dead {
            if let Some(member) = self.remove(agent_id) {
                member.registration.live.store(false, Ordering::SeqCst);
                member.registration.cancel.cancel();
                self.dropped_agents += 1;
                warn!(agent_id = %agent_id, error = %reason, "Dropping agent");
            }
        }
        self.refresh_view();
    }

    fn refresh_view(&self) {
        let mut per_session = BTreeMap::new();
        let mut members = HashMap::with_capacity(self.rooms.len());
        for (session_id, room) in &self.rooms {
            per_session.insert(session_id.clone(), room.members.len());
            let mut infos: Vec<MemberInfo> = room
                .members
                .iter()
                .map(|(agent_id, member)| MemberInfo {
                    agent_id: *agent_id,
                    participant_id: member.registration.participant_id,
                    joined_at: member.joined_at,
                })
                .collect();
            infos.sort_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then_with(|| a.agent_id.cmp(&b.agent_id))
            });
            members.insert(session_id.clone(), infos);
        }

        let stats = HubStats {
            connections: self.agent_rooms.len(),
            sessions: self.rooms.len(),
            per_session,
            broadcasts: self.broadcasts,
            dropped_agents: self.dropped_agents,
        };

        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        view.stats = stats;
        view.members = members;
    }
}

/// Cloneable front end of the hub. Constructed once and passed to whoever
/// needs to register agents or publish events.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    view: Arc<RwLock<HubView>>,
}

impl HubHandle {
    async fn send(&self, command: HubCommand) -> ConnectionResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    /// Add an agent to a session. Re-registering under the same session is a
    /// no-op; under another session it moves the agent.
    pub async fn register(&self, registration: AgentRegistration) -> ConnectionResult<()> {
        self.send(HubCommand::Register(registration)).await
    }

    /// Remove an agent. Unknown agents are ignored.
    pub async fn unregister(&self, agent_id: AgentId) -> ConnectionResult<()> {
        self.send(HubCommand::Unregister(agent_id)).await
    }

    /// Queue `event` for every live agent in `audience` except `exclude`.
    pub async fn broadcast(
        &self,
        audience: Audience,
        event: ServerEvent,
        exclude: Option<AgentId>,
    ) -> ConnectionResult<()> {
        self.send(HubCommand::Broadcast {
            audience,
            envelope: Envelope::new(event),
            exclude,
        })
        .await
    }

    /// Wait until every command sent before this call has been processed.
    pub async fn flush(&self) -> ConnectionResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Flush(tx)).await?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    /// Snapshot of the hub counters.
    pub fn stats(&self) -> HubStats {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .stats
            .clone()
    }

    /// Agents registered to a session, oldest first.
    pub fn members_of(&self, session_id: &str) -> Vec<MemberInfo> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .members
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Distinct participants connected to a session, ascending.
    pub fn online_participants(&self, session_id: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .members_of(session_id)
            .into_iter()
            .map(|m| m.participant_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

#[async_trait]
impl EventPublisher for HubHandle {
    async fn publish(&self, audience: Audience, event: ServerEvent, exclude: Option<AgentId>) {
        let kind = event.kind();
        if let Err(e) = self.broadcast(audience, event, exclude).await {
            warn!(kind, error = %e, "Hub unavailable, event dropped");
        }
    }
}
