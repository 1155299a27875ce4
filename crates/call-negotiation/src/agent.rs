//! Async driver that feeds the call machine and carries out its effects.

use std::{collections::VecDeque, sync::Arc};

use call_proto::{Envelope, ParticipantId};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    backend::{NegotiationBackend, TransportEvents},
    error::CallError,
    machine::{AttemptId, CallEvent, CallMachine, CallNotice, CallState, Effect},
    signaling::{SignalSink, SignalingClient},
};

const NOTICE_CAPACITY: usize = 64;

/// Local user actions accepted by a running agent.
#[derive(Debug, Clone)]
enum Command {
    StartCall {
        peer: ParticipantId,
        appointment_ref: Option<String>,
    },
    Accept,
    Decline,
    End,
}

impl From<Command> for CallEvent {
    fn from(command: Command) -> Self {
        match command {
            Command::StartCall {
                peer,
                appointment_ref,
            } => CallEvent::StartCall {
                peer,
                appointment_ref,
            },
            Command::Accept => CallEvent::Accept,
            Command::Decline => CallEvent::Decline,
            Command::End => CallEvent::End,
        }
    }
}

/// Snapshot published after every dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub retry_count: u32,
}

impl CallStatus {
    fn of(machine: &CallMachine) -> Self {
        Self {
            state: machine.state(),
            retry_count: machine.retry_count(),
        }
    }
}

/// Control surface of a running [`CallAgent`]. Dropping every handle stops
/// the agent and tears down any live call.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<CallNotice>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    pub fn start_call(
        &self,
        peer: impl Into<ParticipantId>,
        appointment_ref: Option<String>,
    ) -> Result<(), CallError> {
        self.command(Command::StartCall {
            peer: peer.into(),
            appointment_ref,
        })
    }

    pub fn accept(&self) -> Result<(), CallError> {
        self.command(Command::Accept)
    }

    pub fn decline(&self) -> Result<(), CallError> {
        self.command(Command::Decline)
    }

    pub fn end(&self) -> Result<(), CallError> {
        self.command(Command::End)
    }

    pub fn state(&self) -> CallState {
        self.status.borrow().state
    }

    pub fn status(&self) -> CallStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Resolves once the machine settles in `target`.
    pub async fn wait_for_state(&self, target: CallState) -> Result<(), CallError> {
        let mut status = self.status.clone();
        status
            .wait_for(|current| current.state == target)
            .await
            .map(|_| ())
            .map_err(|_| CallError::AgentClosed)
    }

    fn command(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .map_err(|_| CallError::AgentClosed)
    }
}

pub struct CallAgent<B: NegotiationBackend> {
    machine: CallMachine,
    backend: Arc<B>,
    sink: Arc<dyn SignalSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: Option<mpsc::UnboundedReceiver<Envelope>>,
    feedback_tx: mpsc::UnboundedSender<CallEvent>,
    feedback_rx: mpsc::UnboundedReceiver<CallEvent>,
    notices: broadcast::Sender<CallNotice>,
    status_tx: watch::Sender<CallStatus>,
    timers: Vec<JoinHandle<()>>,
}

impl<B: NegotiationBackend> CallAgent<B> {
    /// Starts the driver on the current runtime using an established
    /// signaling connection.
    pub fn spawn(
        machine: CallMachine,
        backend: Arc<B>,
        signaling: Arc<SignalingClient>,
    ) -> Result<CallHandle, CallError> {
        let inbound = signaling
            .take_inbound()
            .ok_or_else(|| CallError::Backend("signaling inbound stream already taken".into()))?;
        Ok(Self::spawn_with(machine, backend, signaling, inbound))
    }

    /// Starts the driver on an arbitrary signal sink and inbound stream.
    pub fn spawn_with(
        machine: CallMachine,
        backend: Arc<B>,
        sink: Arc<dyn SignalSink>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> CallHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(CallStatus::of(&machine));

        let agent = CallAgent {
            machine,
            backend,
            sink,
            commands,
            inbound: Some(inbound),
            feedback_tx,
            feedback_rx,
            notices: notices.clone(),
            status_tx,
            timers: Vec::new(),
        };
        tokio::spawn(agent.run());

        CallHandle {
            commands: commands_tx,
            notices,
            status: status_rx,
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                biased;
                Some(event) = self.feedback_rx.recv() => event,
                command = self.commands.recv() => match command {
                    Some(command) => command.into(),
                    None => break,
                },
                envelope = recv_inbound(&mut self.inbound) => match envelope {
                    Some(envelope) => CallEvent::Inbound(envelope),
                    None => {
                        warn!(target = "call", "signaling stream closed");
                        self.inbound = None;
                        continue;
                    }
                },
            };
            self.dispatch(event).await;
        }

        if self.machine.state() != CallState::Idle {
            self.dispatch(CallEvent::End).await;
        }
        self.cancel_timers();
        debug!(target = "call", participant = %self.machine.participant_id(), "call agent stopped");
    }

    /// Runs one event and every feedback event its effects produce, in order,
    /// before yielding back to the channels.
    async fn dispatch(&mut self, event: CallEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let effects = self.machine.handle(event, now_millis());
            for effect in effects {
                if let Some(feedback) = self.execute(effect).await {
                    queue.push_back(feedback);
                }
            }
        }
        let current = CallStatus::of(&self.machine);
        self.status_tx.send_if_modified(|status| {
            let changed = *status != current;
            *status = current;
            changed
        });
    }

    async fn execute(&mut self, effect: Effect) -> Option<CallEvent> {
        match effect {
            Effect::Send(envelope) => {
                let kind = envelope.kind.as_str();
                if let Err(err) = self.sink.send(envelope) {
                    warn!(target = "call", kind, error = %err, "failed to send envelope");
                }
                None
            }
            Effect::AcquireMedia { attempt } => match self.backend.acquire_media().await {
                Ok(()) => Some(CallEvent::MediaGranted { attempt }),
                Err(err) => {
                    if !matches!(err, CallError::PermissionDenied) {
                        warn!(target = "call", error = %err, "media acquisition failed");
                    }
                    Some(CallEvent::MediaDenied { attempt })
                }
            },
            Effect::OpenLink { attempt, settings } => {
                let events = TransportEvents::new(attempt, self.feedback_tx.clone());
                self.backend
                    .open(settings, events)
                    .await
                    .err()
                    .map(|err| failed(attempt, err))
            }
            Effect::CreateOffer {
                attempt,
                ice_restart,
            } => Some(match self.backend.create_offer(ice_restart).await {
                Ok(description) => CallEvent::LocalDescription {
                    attempt,
                    description,
                },
                Err(err) => failed(attempt, err),
            }),
            Effect::CreateAnswer { attempt } => Some(match self.backend.create_answer().await {
                Ok(description) => CallEvent::LocalDescription {
                    attempt,
                    description,
                },
                Err(err) => failed(attempt, err),
            }),
            Effect::ApplyRemote {
                attempt,
                description,
            } => Some(
                match self.backend.apply_remote_description(description).await {
                    Ok(()) => CallEvent::RemoteDescriptionApplied { attempt },
                    Err(err) => failed(attempt, err),
                },
            ),
            Effect::AddCandidate { attempt, candidate } => {
                if let Err(err) = self.backend.add_candidate(candidate).await {
                    debug!(target = "call", %attempt, error = %err, "candidate rejected by link");
                }
                None
            }
            Effect::ScheduleRetry { attempt, delay } => {
                self.schedule(delay, CallEvent::RetryDue { attempt });
                None
            }
            Effect::ScheduleProbe { attempt, delay } => {
                self.schedule(delay, CallEvent::ProbeDue { attempt });
                None
            }
            Effect::Teardown => {
                self.cancel_timers();
                self.backend.close().await;
                self.backend.release_media().await;
                None
            }
            Effect::Notify(notice) => {
                let _ = self.notices.send(notice);
                None
            }
        }
    }

    fn schedule(&mut self, delay: std::time::Duration, event: CallEvent) {
        self.timers.retain(|timer| !timer.is_finished());
        let tx = self.feedback_tx.clone();
        self.timers.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        }));
    }

    fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }
}

async fn recv_inbound(inbound: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn failed(attempt: AttemptId, err: CallError) -> CallEvent {
    CallEvent::NegotiationFailed {
        attempt,
        reason: err.to_string(),
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
