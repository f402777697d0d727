//! Negotiation session: one offer/answer exchange plus the candidate streams
//! of both sides.
//!
//! Every session runs as its own task. The task owns the descriptions, the
//! per-role candidate queues and the senders towards the attached candidate
//! receivers; the initiator and responder paths reach it only through a
//! bounded command queue held by [`SessionHandle`].
//!
//! ```text
//! AwaitingOffer -> OfferReceived -> AwaitingAnswer -> Connected -> Closed
//!        \_______________\_______________\________________\-----> Cancelled
//! ```

use std::{collections::VecDeque, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, OwnedPermit},
        oneshot,
    },
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::{
    entity::{Candidate, Role, SessionDescription, SessionId},
    error::{RelayError, TransitionError},
};

pub const DEFAULT_COUNTERPART_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CANDIDATE_QUEUE_CAPACITY: usize = 8;
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 16;

/// Lifecycle of a session. The declaration order is the only direction a
/// session may move in.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingOffer,
    OfferReceived,
    AwaitingAnswer,
    Connected,
    Closed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Cancelled)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingOffer => "awaiting_offer",
            SessionState::OfferReceived => "offer_received",
            SessionState::AwaitingAnswer => "awaiting_answer",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// How long a session may wait for its counterpart: for the second
    /// description, then for both candidate receivers to attach.
    pub counterpart_timeout: Duration,
    /// Candidates a role may have queued before it is told to back off.
    pub candidate_queue_capacity: usize,
    pub command_queue_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            counterpart_timeout: DEFAULT_COUNTERPART_TIMEOUT,
            candidate_queue_capacity: DEFAULT_CANDIDATE_QUEUE_CAPACITY,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

type Reply<T> = oneshot::Sender<crate::Result<T>>;

enum Command {
    Describe(SessionDescription, Reply<SessionState>),
    Dispatch(Reply<SessionDescription>),
    AwaitDescription(Role, Reply<SessionDescription>),
    Candidate(Candidate, Reply<()>),
    Complete(Role, Reply<()>),
    Attach(Role, Reply<mpsc::Receiver<Candidate>>),
    Status(oneshot::Sender<SessionState>),
    Close(oneshot::Sender<SessionState>),
}

/// Submission side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    created_at: DateTime<Utc>,
    tx: mpsc::Sender<Command>,
    token: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn submit_description(
        &self,
        description: SessionDescription,
    ) -> crate::Result<SessionState> {
        self.request(|reply| Command::Describe(description, reply))
            .await?
    }

    /// Hand the offer to the responder.
    pub async fn dispatch(&self) -> crate::Result<SessionDescription> {
        self.request(Command::Dispatch).await?
    }

    /// Wait until `role` has submitted its description.
    pub async fn await_description(&self, role: Role) -> crate::Result<SessionDescription> {
        self.request(|reply| Command::AwaitDescription(role, reply))
            .await?
    }

    pub async fn submit_candidate(&self, candidate: Candidate) -> crate::Result<()> {
        self.request(|reply| Command::Candidate(candidate, reply))
            .await?
    }

    /// End of candidates for `role`.
    pub async fn complete_candidates(&self, role: Role) -> crate::Result<()> {
        self.request(|reply| Command::Complete(role, reply)).await?
    }

    /// Subscribe the transport serving `role` to the candidates of the
    /// opposite role. Dropping the receiver once connected closes the session.
    pub async fn attach(&self, role: Role) -> crate::Result<mpsc::Receiver<Candidate>> {
        self.request(|reply| Command::Attach(role, reply)).await?
    }

    pub async fn status(&self) -> crate::Result<SessionStatus> {
        let state = self.request(Command::Status).await?;
        Ok(SessionStatus {
            id: self.id,
            state,
            created_at: self.created_at,
        })
    }

    /// `Closed` when connected, `Cancelled` otherwise.
    pub async fn close(&self) -> crate::Result<SessionState> {
        self.request(Command::Close).await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> crate::Result<T> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(make(reply)).await.is_err() {
            return Err(self.gone());
        }
        rx.await.map_err(|_| self.gone())
    }

    fn gone(&self) -> RelayError {
        if self.token.is_cancelled() {
            RelayError::Cancelled(self.id)
        } else {
            RelayError::SessionClosed(self.id)
        }
    }
}

/// Candidates flowing out of one role.
#[derive(Default)]
struct Lane {
    /// Submitted but not yet handed to the receiver.
    pending: VecDeque<Candidate>,
    /// Towards the receiver attached by the opposite role.
    outbound: Option<mpsc::Sender<Candidate>>,
    /// The source role signalled the end of its candidates.
    complete: bool,
    /// Complete and fully handed over; the receiver has seen end of stream.
    finished: bool,
}

impl Lane {
    fn watch(&self, state: SessionState) -> Option<(mpsc::Sender<Candidate>, bool)> {
        if state != SessionState::Connected {
            return None;
        }
        self.outbound
            .clone()
            .map(|tx| (tx, !self.pending.is_empty()))
    }
}

enum LaneEvent {
    Writable(OwnedPermit<Candidate>),
    Gone,
}

/// Resolves when a backlogged lane can move a candidate, or when an idle
/// lane's receiver goes away.
async fn lane_event(watch: Option<(mpsc::Sender<Candidate>, bool)>) -> LaneEvent {
    match watch {
        Some((tx, true)) => match tx.reserve_owned().await {
            Ok(permit) => LaneEvent::Writable(permit),
            Err(_) => LaneEvent::Gone,
        },
        Some((tx, false)) => {
            tx.closed().await;
            LaneEvent::Gone
        }
        None => std::future::pending().await,
    }
}

pub struct Session {
    id: SessionId,
    state: SessionState,
    options: SessionOptions,
    descriptions: [Option<SessionDescription>; 2],
    waiters: [Vec<Reply<SessionDescription>>; 2],
    lanes: [Lane; 2],
    commands: mpsc::Receiver<Command>,
    token: CancellationToken,
}

impl Session {
    /// Build a session from its first description. The returned `Session`
    /// does nothing until [`Session::run`] is polled.
    pub fn new(
        description: SessionDescription,
        options: SessionOptions,
        token: CancellationToken,
    ) -> (SessionHandle, Session) {
        let id = SessionId::new();
        let (tx, commands) = mpsc::channel(options.command_queue_capacity.max(1));
        let role = description.role;
        let state = match role {
            Role::Initiator => SessionState::OfferReceived,
            Role::Responder => SessionState::AwaitingOffer,
        };
        let mut descriptions = [None, None];
        descriptions[role.index()] = Some(description);

        let handle = SessionHandle {
            id,
            created_at: Utc::now(),
            tx,
            token: token.clone(),
        };
        let session = Session {
            id,
            state,
            options,
            descriptions,
            waiters: [Vec::new(), Vec::new()],
            lanes: [Lane::default(), Lane::default()],
            commands,
            token,
        };
        (handle, session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drive the session until it is closed or cancelled.
    pub async fn run(mut self) -> SessionState {
        info!(session = %self.id, state = %self.state, "session started");
        let mut deadline = Instant::now() + self.options.counterpart_timeout;

        while !self.state.is_terminal() {
            let was_connected = self.state == SessionState::Connected;
            let initiator = lane_event(self.lanes[Role::Initiator.index()].watch(self.state));
            let responder = lane_event(self.lanes[Role::Responder.index()].watch(self.state));

            tokio::select! {
                _ = self.token.cancelled() => self.cancel("cancelled by owner"),
                _ = time::sleep_until(deadline), if self.awaiting_counterpart() => self.expire(),
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.apply(cmd),
                    None => self.cancel("no handle left"),
                },
                event = initiator => self.on_lane_event(Role::Initiator, event),
                event = responder => self.on_lane_event(Role::Responder, event),
            }

            if !was_connected && self.state == SessionState::Connected {
                deadline = Instant::now() + self.options.counterpart_timeout;
            }
        }

        self.release();
        info!(session = %self.id, state = %self.state, "session finished");
        self.state
    }

    fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::Describe(description, reply) => {
                let _ = reply.send(self.describe(description));
            }
            Command::Dispatch(reply) => {
                let _ = reply.send(self.dispatch());
            }
            Command::AwaitDescription(role, reply) => self.await_description(role, reply),
            Command::Candidate(candidate, reply) => {
                let _ = reply.send(self.enqueue(candidate));
            }
            Command::Complete(role, reply) => {
                let _ = reply.send(self.complete(role));
            }
            Command::Attach(role, reply) => {
                let _ = reply.send(self.attach(role));
            }
            Command::Status(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Close(reply) => {
                self.close();
                let _ = reply.send(self.state);
            }
        }
    }

    fn describe(&mut self, description: SessionDescription) -> crate::Result<SessionState> {
        let role = description.role;
        if self.descriptions[role.index()].is_some() {
            return Err(self.rejected(TransitionError::DuplicateDescription(role)));
        }
        trace!(session = %self.id, %role, "description stored");
        for waiter in self.waiters[role.index()].drain(..) {
            let _ = waiter.send(Ok(description.clone()));
        }
        self.descriptions[role.index()] = Some(description);

        if self.descriptions.iter().all(Option::is_some) {
            self.advance(SessionState::Connected);
            self.flush(Role::Initiator);
            self.flush(Role::Responder);
        } else if role == Role::Initiator {
            self.advance(SessionState::OfferReceived);
        }
        Ok(self.state)
    }

    fn dispatch(&mut self) -> crate::Result<SessionDescription> {
        let offer = match (self.state, &self.descriptions[Role::Initiator.index()]) {
            (SessionState::OfferReceived | SessionState::AwaitingAnswer, Some(offer)) => {
                offer.clone()
            }
            (SessionState::AwaitingOffer, _) => {
                return Err(self.rejected(TransitionError::MissingDescription(Role::Initiator)))
            }
            _ => return Err(self.rejected(TransitionError::NotDispatchable)),
        };
        self.advance(SessionState::AwaitingAnswer);
        Ok(offer)
    }

    fn await_description(&mut self, role: Role, reply: Reply<SessionDescription>) {
        match &self.descriptions[role.index()] {
            Some(description) => {
                let _ = reply.send(Ok(description.clone()));
            }
            None => {
                let waiters = &mut self.waiters[role.index()];
                waiters.retain(|waiter| !waiter.is_closed());
                waiters.push(reply);
            }
        }
    }

    fn enqueue(&mut self, candidate: Candidate) -> crate::Result<()> {
        let role = candidate.role;
        if self.descriptions[role.index()].is_none() {
            return Err(self.rejected(TransitionError::MissingDescription(role)));
        }
        let lane = &self.lanes[role.index()];
        if lane.complete {
            return Err(self.rejected(TransitionError::CandidatesComplete(role)));
        }
        if lane.pending.len() >= self.options.candidate_queue_capacity {
            return Err(RelayError::QueueFull(role));
        }
        self.lanes[role.index()].pending.push_back(candidate);
        self.flush(role);
        Ok(())
    }

    fn complete(&mut self, role: Role) -> crate::Result<()> {
        if self.descriptions[role.index()].is_none() {
            return Err(self.rejected(TransitionError::MissingDescription(role)));
        }
        self.lanes[role.index()].complete = true;
        self.flush(role);
        Ok(())
    }

    fn attach(&mut self, role: Role) -> crate::Result<mpsc::Receiver<Candidate>> {
        let source = role.opposite();
        let lane = &self.lanes[source.index()];
        let attached = lane.finished
            || lane
                .outbound
                .as_ref()
                .is_some_and(|tx| !tx.is_closed());
        if attached {
            return Err(self.rejected(TransitionError::AlreadyAttached(role)));
        }

        let (tx, rx) = mpsc::channel(self.options.candidate_queue_capacity.max(1));
        self.lanes[source.index()].outbound = Some(tx);
        debug!(session = %self.id, %role, "candidate receiver attached");
        self.flush(source);
        Ok(rx)
    }

    fn close(&mut self) {
        if self.state == SessionState::Connected {
            info!(session = %self.id, "session closed by owner");
            self.advance(SessionState::Closed);
        } else {
            self.cancel("retired before connecting");
        }
    }

    /// Hand queued candidates of `source` to its receiver, in order, as far as
    /// the receiver has room. Only once connected.
    fn flush(&mut self, source: Role) {
        if self.state != SessionState::Connected {
            return;
        }
        let lane = &mut self.lanes[source.index()];
        let Some(tx) = lane.outbound.clone() else {
            return;
        };
        while let Some(candidate) = lane.pending.pop_front() {
            match tx.try_send(candidate) {
                Ok(()) => {}
                Err(TrySendError::Full(candidate)) => {
                    lane.pending.push_front(candidate);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.receiver_gone(source.opposite());
                    return;
                }
            }
        }
        if lane.complete && lane.pending.is_empty() {
            lane.outbound = None;
            lane.finished = true;
            debug!(session = %self.id, %source, "all candidates delivered");
        }
        if self.lanes.iter().all(|lane| lane.finished) {
            info!(session = %self.id, "both sides drained");
            self.advance(SessionState::Closed);
        }
    }

    fn on_lane_event(&mut self, source: Role, event: LaneEvent) {
        match event {
            LaneEvent::Writable(permit) => {
                if let Some(candidate) = self.lanes[source.index()].pending.pop_front() {
                    permit.send(candidate);
                }
                self.flush(source);
            }
            LaneEvent::Gone => self.receiver_gone(source.opposite()),
        }
    }

    /// The transport serving `role` stopped listening.
    fn receiver_gone(&mut self, role: Role) {
        if self.state == SessionState::Connected {
            info!(session = %self.id, %role, "candidate receiver went away");
            self.advance(SessionState::Closed);
        } else {
            self.lanes[role.opposite().index()].outbound = None;
        }
    }

    /// Before connecting the session waits for the second description; after,
    /// for both candidate receivers.
    fn awaiting_counterpart(&self) -> bool {
        self.state < SessionState::Connected
            || self
                .lanes
                .iter()
                .any(|lane| lane.outbound.is_none() && !lane.finished)
    }

    fn expire(&mut self) {
        if self.state < SessionState::Connected {
            self.cancel("counterpart timed out");
        } else {
            info!(session = %self.id, "candidate receivers never attached");
            self.advance(SessionState::Closed);
        }
    }

    fn cancel(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        info!(session = %self.id, state = %self.state, reason, "session cancelled");
        self.state = SessionState::Cancelled;
        self.token.cancel();
        for waiters in self.waiters.iter_mut() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(Err(RelayError::Cancelled(self.id)));
            }
        }
    }

    fn advance(&mut self, next: SessionState) {
        if self.state.is_terminal() || next <= self.state {
            return;
        }
        debug!(session = %self.id, from = %self.state, to = %next, "session transition");
        self.state = next;
    }

    fn rejected(&self, reason: TransitionError) -> RelayError {
        RelayError::InvalidTransition {
            state: self.state,
            reason,
        }
    }

    fn release(&mut self) {
        for lane in self.lanes.iter_mut() {
            lane.outbound = None;
            lane.pending.clear();
        }
        for waiters in self.waiters.iter_mut() {
            for waiter in waiters.drain(..) {
                let _ = waiter.send(Err(RelayError::SessionClosed(self.id)));
            }
        }
        self.commands.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(description: SessionDescription, options: SessionOptions) -> SessionHandle {
        let (handle, session) = Session::new(description, options, CancellationToken::new());
        tokio::spawn(session.run());
        handle
    }

    #[test]
    fn states_only_order_forward() {
        use SessionState::*;
        let order = [AwaitingOffer, OfferReceived, AwaitingAnswer, Connected, Closed];
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(Connected < Cancelled);
        assert!(Closed.is_terminal() && Cancelled.is_terminal());
        assert!(!Connected.is_terminal());
        assert_eq!(AwaitingAnswer.to_string(), "awaiting_answer");
    }

    #[tokio::test]
    async fn offer_dispatch_answer() -> crate::Result<()> {
        let handle = spawn(SessionDescription::offer("offer"), SessionOptions::default());
        assert_eq!(handle.status().await?.state, SessionState::OfferReceived);

        assert_eq!(handle.dispatch().await?.body, "offer");
        assert_eq!(handle.status().await?.state, SessionState::AwaitingAnswer);
        // A retried fetch gets the same offer without moving the session.
        assert_eq!(handle.dispatch().await?.body, "offer");

        let state = handle
            .submit_description(SessionDescription::answer("answer"))
            .await?;
        assert_eq!(state, SessionState::Connected);

        let err = handle.dispatch().await.unwrap_err();
        assert!(matches!(
            err,
            RelayError::InvalidTransition {
                state: SessionState::Connected,
                reason: TransitionError::NotDispatchable,
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn responder_first_session_waits_for_offer() -> crate::Result<()> {
        let handle = spawn(SessionDescription::answer("answer"), SessionOptions::default());
        assert_eq!(handle.status().await?.state, SessionState::AwaitingOffer);
        assert!(matches!(
            handle.dispatch().await,
            Err(RelayError::InvalidTransition {
                reason: TransitionError::MissingDescription(Role::Initiator),
                ..
            })
        ));

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.await_description(Role::Initiator).await })
        };
        let state = handle
            .submit_description(SessionDescription::offer("offer"))
            .await?;
        assert_eq!(state, SessionState::Connected);
        assert_eq!(waiter.await??.body, "offer");
        Ok(())
    }

    #[tokio::test]
    async fn close_before_connecting_cancels() -> crate::Result<()> {
        let handle = spawn(SessionDescription::offer("offer"), SessionOptions::default());
        assert_eq!(handle.close().await?, SessionState::Cancelled);
        assert!(matches!(
            handle.status().await,
            Err(RelayError::Cancelled(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn close_after_connecting_closes() -> crate::Result<()> {
        let handle = spawn(SessionDescription::offer("offer"), SessionOptions::default());
        handle
            .submit_description(SessionDescription::answer("answer"))
            .await?;
        assert_eq!(handle.close().await?, SessionState::Closed);
        assert!(matches!(
            handle.submit_description(SessionDescription::answer("again")).await,
            Err(RelayError::SessionClosed(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn backlog_drains_as_receiver_reads() -> crate::Result<()> {
        let options = SessionOptions {
            candidate_queue_capacity: 2,
            ..SessionOptions::default()
        };
        let handle = spawn(SessionDescription::offer("offer"), options);
        handle
            .submit_description(SessionDescription::answer("answer"))
            .await?;
        let mut rx = handle.attach(Role::Responder).await?;

        let candidate = |body: &str| Candidate {
            session_id: handle.id(),
            role: Role::Initiator,
            body: body.to_string(),
        };
        // Two fill the channel, two more wait in the queue, the fifth bounces.
        for body in ["c1", "c2", "c3", "c4"] {
            handle.submit_candidate(candidate(body)).await?;
        }
        assert!(matches!(
            handle.submit_candidate(candidate("c5")).await,
            Err(RelayError::QueueFull(Role::Initiator))
        ));

        for body in ["c1", "c2", "c3", "c4"] {
            let received = time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(received.body, body);
        }
        Ok(())
    }

    #[tokio::test]
    async fn connected_without_receivers_closes_on_deadline() -> crate::Result<()> {
        let options = SessionOptions {
            counterpart_timeout: Duration::from_millis(50),
            ..SessionOptions::default()
        };
        let (handle, session) = Session::new(
            SessionDescription::offer("offer"),
            options,
            CancellationToken::new(),
        );
        let task = tokio::spawn(session.run());
        handle
            .submit_description(SessionDescription::answer("answer"))
            .await?;

        // Connected sessions end as closed, not cancelled.
        let state = time::timeout(Duration::from_secs(1), task).await.unwrap()?;
        assert_eq!(state, SessionState::Closed);
        assert!(matches!(
            handle.status().await,
            Err(RelayError::SessionClosed(_))
        ));
        Ok(())
    }
}
