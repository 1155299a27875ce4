use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use call_proto::{ParticipantId, ServerMessage};
use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use slab::Slab;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_LINK_BUFFER: usize = 64;

pub type LinkId = Uuid;

/// Frames queued for a link's websocket writer.
#[derive(Debug, Clone)]
pub enum LinkFrame {
    Message(ServerMessage),
    Close { reason: String },
}

/// Outbound half of one connected transport link.
#[derive(Debug, Clone)]
pub struct TransportLink {
    id: LinkId,
    sender: mpsc::Sender<LinkFrame>,
}

impl TransportLink {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queues a frame for this link only, bypassing the registry.
    pub fn try_send(&self, frame: LinkFrame) -> bool {
        self.sender.try_send(frame).is_ok()
    }
}

pub struct LinkChannel {
    pub link: TransportLink,
    pub receiver: mpsc::Receiver<LinkFrame>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub per_link_buffer: usize,
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            per_link_buffer: DEFAULT_LINK_BUFFER,
            idle_timeout: Duration::from_secs(600),
            recycle_interval: Duration::from_secs(60),
        }
    }
}

/// Maps participant ids to their connected links.
///
/// Each participant's link set sits behind its own mutex so joins and leaves
/// for one id serialize against deliveries to that id without blocking other
/// participants.
#[derive(Clone)]
pub struct ParticipantRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    participants: DashMap<ParticipantId, Arc<ParticipantState>>,
    owners: DashMap<LinkId, ParticipantId>,
    config: RegistryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub links: usize,
    /// The participant entry was created by this join.
    pub created: bool,
    /// The link was already registered under this participant.
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub participant_id: ParticipantId,
    pub remaining: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryMetrics {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

pub struct ParticipantSnapshot {
    pub participant_id: ParticipantId,
    pub links: usize,
}

impl ParticipantRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                participants: DashMap::new(),
                owners: DashMap::new(),
                config,
            }),
        }
    }

    /// Allocates a link id and its bounded outbound queue.
    pub fn open_link(&self) -> LinkChannel {
        let (sender, receiver) = mpsc::channel(self.inner.config.per_link_buffer);
        LinkChannel {
            link: TransportLink {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn owner_of(&self, link_id: LinkId) -> Option<ParticipantId> {
        self.inner
            .owners
            .get(&link_id)
            .map(|entry| entry.value().clone())
    }

    pub fn participant_count(&self) -> usize {
        self.inner.participants.len()
    }

    /// Adds `link` to the participant's connection set. Registering the same
    /// link twice is a no-op; registering it under a new id moves it.
    pub async fn join(&self, participant_id: &ParticipantId, link: &TransportLink) -> JoinOutcome {
        if let Some(previous) = self.owner_of(link.id) {
            if &previous == participant_id {
                self.touch(link.id).await;
                return JoinOutcome {
                    links: self.link_count(participant_id).await,
                    created: false,
                    duplicate: true,
                };
            }
            debug!(
                link_id = %link.id,
                from = %previous,
                to = %participant_id,
                "moving link to a different participant"
            );
            self.leave(link.id).await;
        }

        let now = now_millis();
        loop {
            let mut created = false;
            let state = match self.inner.participants.entry(participant_id.clone()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    let state = Arc::new(ParticipantState::new(participant_id.clone()));
                    entry.insert(Arc::clone(&state));
                    created = true;
                    state
                }
            };

            if let Some(links) = state.add_link(link, now).await {
                self.inner.owners.insert(link.id, participant_id.clone());
                gauge!("call_relay_participants_active")
                    .set(self.inner.participants.len() as f64);
                counter!("call_relay_links_joined_total").increment(1);
                return JoinOutcome {
                    links,
                    created,
                    duplicate: false,
                };
            }

            // The entry lost its last link between lookup and lock.
            self.inner
                .participants
                .remove_if(participant_id, |_, current| Arc::ptr_eq(current, &state));
        }
    }

    /// Removes `link_id` from whichever participant owns it.
    pub async fn leave(&self, link_id: LinkId) -> Option<LeaveOutcome> {
        let (_, participant_id) = self.inner.owners.remove(&link_id)?;
        let state = self
            .inner
            .participants
            .get(&participant_id)
            .map(|entry| Arc::clone(entry.value()))?;

        let remaining = state.remove_link(link_id).await;
        if remaining == 0 {
            let removed = self
                .inner
                .participants
                .remove_if(&participant_id, |_, current| Arc::ptr_eq(current, &state))
                .is_some();
            if removed {
                info!(participant_id = %participant_id, "participant has no links left");
            }
        }
        gauge!("call_relay_participants_active").set(self.inner.participants.len() as f64);

        Some(LeaveOutcome {
            participant_id,
            remaining,
        })
    }

    /// Queues `message` on every link registered for `participant_id`.
    /// Returns `None` when the participant has no registered link.
    pub async fn deliver(
        &self,
        participant_id: &ParticipantId,
        message: ServerMessage,
    ) -> Option<DeliveryMetrics> {
        let state = self
            .inner
            .participants
            .get(participant_id)
            .map(|entry| Arc::clone(entry.value()))?;

        let (metrics, closed) = state.deliver(message).await;
        for link_id in closed {
            self.leave(link_id).await;
        }
        if metrics.delivered == 0 && metrics.dropped == 0 {
            return None;
        }
        Some(metrics)
    }

    pub async fn touch(&self, link_id: LinkId) {
        let Some(participant_id) = self.owner_of(link_id) else {
            return;
        };
        let Some(state) = self
            .inner
            .participants
            .get(&participant_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };
        state.touch(link_id, now_millis()).await;
    }

    pub async fn link_count(&self, participant_id: &ParticipantId) -> usize {
        let Some(state) = self
            .inner
            .participants
            .get(participant_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return 0;
        };
        state.link_count().await
    }

    pub async fn force_close_idle(&self, now: u64) -> usize {
        let states: Vec<Arc<ParticipantState>> = self
            .inner
            .participants
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut pruned = 0usize;
        for state in states {
            let idle = state.collect_idle(now, self.inner.config.idle_timeout).await;
            for (link_id, sender) in idle {
                let _ = sender.try_send(LinkFrame::Close {
                    reason: "idle timeout".into(),
                });
                counter!(
                    "call_relay_idle_pruned_total",
                    "participant_id" => state.participant_id.to_string()
                )
                .increment(1);
                self.leave(link_id).await;
                pruned += 1;
            }
        }
        pruned
    }

    pub async fn snapshot(&self) -> Vec<ParticipantSnapshot> {
        let states: Vec<Arc<ParticipantState>> = self
            .inner
            .participants
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshots = Vec::with_capacity(states.len());
        for state in states {
            snapshots.push(ParticipantSnapshot {
                participant_id: state.participant_id.clone(),
                links: state.link_count().await,
            });
        }
        snapshots
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.recycle_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let pruned = registry.force_close_idle(now_millis()).await;
                if pruned > 0 {
                    info!(pruned, "closed idle links");
                }
            }
        })
    }
}

struct ParticipantState {
    participant_id: ParticipantId,
    inner: Mutex<ParticipantInner>,
}

struct ParticipantInner {
    slab: Slab<LinkEntry>,
    index_map: HashMap<LinkId, usize>,
    /// Set once the last link leaves; a retired state never takes new links.
    retired: bool,
}

struct LinkEntry {
    id: LinkId,
    sender: mpsc::Sender<LinkFrame>,
    last_activity: AtomicU64,
}

impl ParticipantState {
    fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            inner: Mutex::new(ParticipantInner {
                slab: Slab::new(),
                index_map: HashMap::new(),
                retired: false,
            }),
        }
    }

    async fn add_link(&self, link: &TransportLink, now: u64) -> Option<usize> {
        let mut guard = self.inner.lock().await;
        if guard.retired {
            return None;
        }
        if !guard.index_map.contains_key(&link.id) {
            let key = guard.slab.insert(LinkEntry {
                id: link.id,
                sender: link.sender.clone(),
                last_activity: AtomicU64::new(now),
            });
            guard.index_map.insert(link.id, key);
        }
        Some(guard.slab.len())
    }

    async fn remove_link(&self, link_id: LinkId) -> usize {
        let mut guard = self.inner.lock().await;
        if let Some(index) = guard.index_map.remove(&link_id) {
            guard.slab.remove(index);
        }
        if guard.slab.is_empty() {
            guard.retired = true;
        }
        guard.slab.len()
    }

    async fn deliver(&self, message: ServerMessage) -> (DeliveryMetrics, Vec<LinkId>) {
        let mut metrics = DeliveryMetrics::default();
        let mut closed = Vec::new();

        let pending: Vec<(LinkId, mpsc::Sender<LinkFrame>)> = {
            let guard = self.inner.lock().await;
            guard
                .slab
                .iter()
                .map(|(_, entry)| (entry.id, entry.sender.clone()))
                .collect()
        };

        for (link_id, sender) in pending {
            match sender.try_send(LinkFrame::Message(message.clone())) {
                Ok(()) => metrics.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics.dropped += 1;
                    counter!(
                        "call_relay_flow_control_drops_total",
                        "participant_id" => self.participant_id.to_string()
                    )
                    .increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    metrics.closed += 1;
                    closed.push(link_id);
                }
            }
        }

        (metrics, closed)
    }

    async fn touch(&self, link_id: LinkId, now: u64) {
        let guard = self.inner.lock().await;
        if let Some(entry) = guard
            .index_map
            .get(&link_id)
            .and_then(|index| guard.slab.get(*index))
        {
            entry.last_activity.store(now, Ordering::Relaxed);
        }
    }

    async fn collect_idle(
        &self,
        now: u64,
        timeout: Duration,
    ) -> Vec<(LinkId, mpsc::Sender<LinkFrame>)> {
        let guard = self.inner.lock().await;
        guard
            .slab
            .iter()
            .filter(|(_, entry)| {
                let last = entry.last_activity.load(Ordering::Relaxed);
                now.saturating_sub(last) > timeout.as_millis() as u64
            })
            .map(|(_, entry)| (entry.id, entry.sender.clone()))
            .collect()
    }

    async fn link_count(&self) -> usize {
        let guard = self.inner.lock().await;
        guard.slab.len()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
