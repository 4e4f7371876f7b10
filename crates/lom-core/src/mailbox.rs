//! Per-client mailbox: pending pulls, pending pushes, and the task matching them.
//!
//! Every registered client gets one [`Mailbox`] and one worker task. The
//! push queue is the bounded channel itself: the worker only takes a push
//! off the channel when a pull is waiting for it, so a client that stops
//! pulling fills its channel and further pushes fail instead of piling up.
//!
//! Matching order: pulls with a deadline before pulls without one, earliest
//! deadline first, FIFO among equals.

use crate::cancel::AbortSignal;
use crate::config::MailboxConfig;
use crate::error::{EngineError, Result};
use crate::transport::ReplySlot;
use crate::types::{ClientRequest, ClientResponse, ResponsePayload, ServerRequest};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A pull request waiting for work.
#[derive(Debug)]
pub(crate) struct PendingPull {
    request: ClientRequest,
    reply: ReplySlot,
    due: Option<Instant>,
}

impl PendingPull {
    fn new(request: ClientRequest, reply: ReplySlot, now: Instant) -> Self {
        let due = match request.timeout_secs {
            0 => None,
            secs => Some(now + Duration::from_secs(secs).min(MailboxConfig::MAX_PULL_TIMEOUT)),
        };
        Self {
            request,
            reply,
            due,
        }
    }

    fn reply_error(self, err: &EngineError) {
        // A caller that already left needs no answer.
        let _ = self.reply.send(ClientResponse::from_error(err));
    }
}

/// Queue capacities for a mailbox.
#[derive(Debug, Clone, Copy)]
pub struct MailboxLimits {
    pub pull_capacity: usize,
    pub push_capacity: usize,
    pub idle_wake: Duration,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            pull_capacity: MailboxConfig::PULL_QUEUE_CAPACITY,
            push_capacity: MailboxConfig::PUSH_QUEUE_CAPACITY,
            idle_wake: MailboxConfig::IDLE_WAKE_INTERVAL,
        }
    }
}

/// Registry-side handle of a client's mailbox.
#[derive(Debug)]
pub struct Mailbox {
    client: String,
    actions: BTreeSet<String>,
    limits: MailboxLimits,
    pull_tx: mpsc::Sender<PendingPull>,
    push_tx: mpsc::Sender<ServerRequest>,
    abort: AbortSignal,
    task: JoinHandle<()>,
}

impl Mailbox {
    /// Create the mailbox and start its worker task.
    pub fn spawn(client: impl Into<String>, limits: MailboxLimits) -> Self {
        let client = client.into();
        let (pull_tx, pull_rx) = mpsc::channel(limits.pull_capacity.max(1));
        let (push_tx, push_rx) = mpsc::channel(limits.push_capacity.max(1));
        let abort = AbortSignal::new();

        let worker = MailboxWorker {
            client: client.clone(),
            pulls: PendingPulls::default(),
            carry: None,
            pull_capacity: limits.pull_capacity.max(1),
            idle_wake: limits.idle_wake,
        };
        let task = tokio::spawn(worker.run(pull_rx, push_rx, abort.clone()));

        Self {
            client,
            actions: BTreeSet::new(),
            limits,
            pull_tx,
            push_tx,
            abort,
            task,
        }
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    /// Hand a pull request to the worker.
    ///
    /// On failure the caller has already been answered with the error.
    pub fn enqueue_pull(&self, request: ClientRequest, reply: ReplySlot) -> Result<()> {
        let pull = PendingPull::new(request, reply, Instant::now());
        match self.pull_tx.try_send(pull) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(pull)) => {
                let err = EngineError::QueueFull {
                    queue: "pull",
                    capacity: self.limits.pull_capacity,
                };
                pull.reply_error(&err);
                Err(err)
            }
            Err(mpsc::error::TrySendError::Closed(pull)) => {
                let err = EngineError::Shutdown;
                pull.reply_error(&err);
                Err(err)
            }
        }
    }

    /// Queue a work item for this client. Never blocks.
    pub fn enqueue_push(&self, request: ServerRequest) -> Result<()> {
        self.push_tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull {
                queue: "push",
                capacity: self.limits.push_capacity,
            },
            mpsc::error::TrySendError::Closed(_) => EngineError::Shutdown,
        })
    }

    /// Stop the worker without waiting for it.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// True once the worker task has exited.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn add_action(&mut self, action: &str) {
        self.actions.insert(action.to_string());
    }

    pub(crate) fn remove_action(&mut self, action: &str) {
        self.actions.remove(action);
    }

    /// Names of the actions owned by this client, sorted.
    pub fn actions(&self) -> Vec<String> {
        self.actions.iter().cloned().collect()
    }
}

/// Pending pulls split by priority.
#[derive(Debug, Default)]
struct PendingPulls {
    timed: BTreeMap<(Instant, u64), PendingPull>,
    untimed: VecDeque<PendingPull>,
    seq: u64,
}

impl PendingPulls {
    fn insert(&mut self, pull: PendingPull) {
        match pull.due {
            Some(due) => {
                self.seq += 1;
                self.timed.insert((due, self.seq), pull);
            }
            None => self.untimed.push_back(pull),
        }
    }

    fn is_empty(&self) -> bool {
        self.timed.is_empty() && self.untimed.is_empty()
    }

    fn len(&self) -> usize {
        self.timed.len() + self.untimed.len()
    }

    /// Next pull to serve, skipping callers that stopped waiting.
    fn pop_next(&mut self) -> Option<PendingPull> {
        loop {
            let pull = match self.timed.pop_first() {
                Some((_, pull)) => pull,
                None => self.untimed.pop_front()?,
            };
            if !pull.reply.is_closed() {
                return Some(pull);
            }
            debug!("Discarding pull whose caller has gone away");
        }
    }

    /// Drop pulls whose caller stopped waiting.
    fn sweep_closed(&mut self) -> usize {
        let before = self.len();
        self.timed.retain(|_, pull| !pull.reply.is_closed());
        self.untimed.retain(|pull| !pull.reply.is_closed());
        before - self.len()
    }

    /// Answer every timed pull due at or before `now` with a timeout.
    fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while let Some(entry) = self.timed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let pull = entry.remove();
            let secs = pull.request.timeout_secs;
            pull.reply_error(&EngineError::Timeout { secs });
            expired += 1;
        }
        expired
    }

    fn next_due(&self) -> Option<Instant> {
        self.timed.keys().next().map(|(due, _)| *due)
    }

    fn drain(&mut self) -> impl Iterator<Item = PendingPull> + '_ {
        let timed = std::mem::take(&mut self.timed).into_values();
        timed.chain(self.untimed.drain(..))
    }
}

struct MailboxWorker {
    client: String,
    pulls: PendingPulls,
    /// Push taken off the channel but not yet delivered.
    carry: Option<ServerRequest>,
    pull_capacity: usize,
    idle_wake: Duration,
}

impl MailboxWorker {
    async fn run(
        mut self,
        mut pull_rx: mpsc::Receiver<PendingPull>,
        mut push_rx: mpsc::Receiver<ServerRequest>,
        abort: AbortSignal,
    ) {
        debug!("Mailbox worker for {} started", self.client);

        loop {
            let now = Instant::now();
            let expired = self.pulls.expire(now);
            if expired > 0 {
                debug!("{} pull(s) for {} timed out", expired, self.client);
            }
            let abandoned = self.pulls.sweep_closed();
            if abandoned > 0 {
                debug!("Dropped {} abandoned pull(s) for {}", abandoned, self.client);
            }
            self.match_carry();

            let wake = self.pulls.next_due().unwrap_or(now + self.idle_wake);
            let want_push = self.carry.is_none() && !self.pulls.is_empty();

            tokio::select! {
                biased;
                _ = abort.aborted() => break,
                pull = pull_rx.recv() => match pull {
                    Some(pull) => self.accept_pull(pull),
                    None => break,
                },
                push = push_rx.recv(), if want_push => match push {
                    Some(request) => self.carry = Some(request),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        pull_rx.close();
        push_rx.close();
        while let Ok(pull) = pull_rx.try_recv() {
            self.pulls.insert(pull);
        }
        self.pulls.expire(Instant::now());

        // Work already queued still reaches pulls that are waiting for it.
        loop {
            self.match_carry();
            if self.carry.is_some() || self.pulls.is_empty() {
                break;
            }
            match push_rx.try_recv() {
                Ok(request) => self.carry = Some(request),
                Err(_) => break,
            }
        }

        let mut dropped = 0;
        for pull in self.pulls.drain() {
            pull.reply_error(&EngineError::Shutdown);
            dropped += 1;
        }
        info!(
            "Mailbox worker for {} stopped, {} pending pull(s) answered with shutdown",
            self.client, dropped
        );
    }

    /// Queue a pull unless the client already has a full set waiting.
    fn accept_pull(&mut self, pull: PendingPull) {
        self.pulls.sweep_closed();
        if self.pulls.len() >= self.pull_capacity {
            warn!(
                "Rejecting pull for {}: {} already pending",
                self.client,
                self.pulls.len()
            );
            pull.reply_error(&EngineError::QueueFull {
                queue: "pull",
                capacity: self.pull_capacity,
            });
            return;
        }
        self.pulls.insert(pull);
    }

    /// Deliver the carried push to the best waiting pull, if any.
    fn match_carry(&mut self) {
        while let Some(request) = self.carry.take() {
            let Some(pull) = self.pulls.pop_next() else {
                self.carry = Some(request);
                return;
            };
            match pull.reply.send(ClientResponse::server_request(request)) {
                Ok(()) => {
                    debug!(
                        "Delivered work to {} ({} pull(s) still waiting)",
                        self.client,
                        self.pulls.len()
                    );
                }
                Err(unsent) => {
                    let ResponsePayload::ServerRequest(request) = unsent.payload else {
                        error!("Undelivered reply for {} held no work item", self.client);
                        return;
                    };
                    warn!("Pull for {} closed during delivery, retrying", self.client);
                    self.carry = Some(request);
                }
            }
        }
    }
}
