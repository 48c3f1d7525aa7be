//! Outgoing command queue
//!
//! The mesh gateway handles one command at a time and only confirms a command
//! by eventually notifying a state report from the addressed sub-device. The
//! queue therefore keeps a single command in flight, retransmits it when no
//! report arrives, and merges duplicate requests that are still waiting.
//!
//! The queue does no I/O and owns no timers. The controller drives it with
//! explicit instants through [`CommandQueue::poll`] and sleeps until
//! [`CommandQueue::next_deadline`].

use meshlight_protocol::MeshFrame;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::QueueConfig;

/// Identifier assigned to every submission
pub type TransactionTag = u32;

/// Final result of a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    /// A matching state report arrived
    Success,
    /// No report after every retransmission
    Timeout,
    /// The link dropped before the command was confirmed
    LinkLost,
    /// Waited in the queue longer than the staleness window
    Expired,
    /// Cancelled by the caller before dispatch
    Cancelled,
}

impl CommandOutcome {
    /// Whether the command was confirmed
    pub fn is_success(self) -> bool {
        self == CommandOutcome::Success
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandOutcome::Success => write!(f, "success"),
            CommandOutcome::Timeout => write!(f, "timeout"),
            CommandOutcome::LinkLost => write!(f, "link_lost"),
            CommandOutcome::Expired => write!(f, "expired"),
            CommandOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Completion sender handed in by the caller
pub type CompletionSender = oneshot::Sender<CommandOutcome>;

#[derive(Debug)]
struct Waiter {
    tag: TransactionTag,
    /// Frame this caller asked for
    frame: MeshFrame,
    tx: CompletionSender,
}

/// A command waiting for dispatch or confirmation
#[derive(Debug)]
struct PendingCommand {
    frame: MeshFrame,
    /// Tag of the latest submission merged into this command
    tag: TransactionTag,
    /// Number of times the frame was handed out for writing
    attempts: u32,
    /// Retransmissions allowed after the first write
    retry_limit: u32,
    submitted_at: Instant,
    waiters: Vec<Waiter>,
}

impl PendingCommand {
    fn has_waiter(&self, tag: TransactionTag) -> bool {
        self.waiters.iter().any(|w| w.tag == tag)
    }

    fn merges_with(&self, frame: &MeshFrame) -> bool {
        self.frame.address() == frame.address() && self.frame.opcode() == frame.opcode()
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    AwaitingAck { deadline: Instant },
    Backoff { until: Instant },
}

#[derive(Debug)]
struct InFlight {
    command: PendingCommand,
    phase: Phase,
}

/// A frame the controller must write now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Tag of the command being written
    pub tag: TransactionTag,
    /// Frame to encode and write
    pub frame: MeshFrame,
    /// 1 for the first write, higher for retransmissions
    pub attempt: u32,
}

/// A command that reached its final outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// Command tag
    pub tag: TransactionTag,
    /// Final frame of the command
    pub frame: MeshFrame,
    /// Outcome delivered to every waiter
    pub outcome: CommandOutcome,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The submission was removed
    Cancelled,
    /// Already dispatched; cannot be cancelled
    InFlight,
    /// No pending submission with that tag
    Unknown,
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Submissions accepted
    pub submitted: u64,
    /// Submissions merged into a queued command
    pub coalesced: u64,
    /// First writes handed out
    pub dispatched: u64,
    /// Retransmissions handed out
    pub retransmitted: u64,
    /// Commands confirmed by a report
    pub succeeded: u64,
    /// Commands that ran out of retries
    pub timed_out: u64,
    /// Commands lost to a link drop
    pub link_lost: u64,
    /// Commands that went stale in the queue
    pub expired: u64,
    /// Cancelled submissions
    pub cancelled: u64,
}

/// Single-flight command queue with coalescing and retries
#[derive(Debug)]
pub struct CommandQueue {
    config: QueueConfig,
    next_tag: TransactionTag,
    queued: VecDeque<PendingCommand>,
    in_flight: Option<InFlight>,
    completed: Vec<Completed>,
    stats: QueueStats,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            next_tag: 1,
            queued: VecDeque::new(),
            in_flight: None,
            completed: Vec::new(),
            stats: QueueStats::default(),
        }
    }

    fn allocate_tag(&mut self) -> TransactionTag {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        tag
    }

    /// Queue a frame; `tx` resolves with the final outcome
    ///
    /// A frame with the same address and opcode as a command still waiting
    /// for dispatch replaces that command's frame, and `tx` joins its
    /// waiters.
    pub fn submit(&mut self, frame: MeshFrame, tx: CompletionSender, now: Instant) -> TransactionTag {
        let retry_limit = self.config.retry_limit;
        self.enqueue(frame, tx, now, retry_limit)
    }

    /// Queue a frame that is written once and never retransmitted
    pub fn submit_once(&mut self, frame: MeshFrame, tx: CompletionSender, now: Instant) -> TransactionTag {
        self.enqueue(frame, tx, now, 0)
    }

    fn enqueue(
        &mut self,
        frame: MeshFrame,
        tx: CompletionSender,
        now: Instant,
        retry_limit: u32,
    ) -> TransactionTag {
        let tag = self.allocate_tag();
        self.stats.submitted += 1;

        if let Some(existing) = self.queued.iter_mut().find(|c| c.merges_with(&frame)) {
            debug!(tag, merged_into = existing.tag, frame = %frame, "Coalescing command");
            existing.frame = frame;
            existing.tag = tag;
            existing.submitted_at = now;
            existing.retry_limit = existing.retry_limit.max(retry_limit);
            existing.waiters.push(Waiter { tag, frame, tx });
            self.stats.coalesced += 1;
            return tag;
        }

        trace!(tag, frame = %frame, "Command queued");
        self.queued.push_back(PendingCommand {
            frame,
            tag,
            attempts: 0,
            retry_limit,
            submitted_at: now,
            waiters: vec![Waiter { tag, frame, tx }],
        });
        tag
    }

    /// Resolve a submission immediately without queueing it
    pub fn reject(&mut self, frame: MeshFrame, tx: CompletionSender, outcome: CommandOutcome) -> TransactionTag {
        let tag = self.allocate_tag();
        self.stats.submitted += 1;
        self.finish(
            PendingCommand {
                frame,
                tag,
                attempts: 0,
                retry_limit: 0,
                submitted_at: Instant::now(),
                waiters: vec![Waiter { tag, frame, tx }],
            },
            outcome,
        );
        tag
    }

    /// Withdraw a submission that has not been dispatched yet
    pub fn cancel(&mut self, tag: TransactionTag) -> CancelResult {
        if self
            .in_flight
            .as_ref()
            .is_some_and(|f| f.command.has_waiter(tag))
        {
            return CancelResult::InFlight;
        }

        let Some(index) = self.queued.iter().position(|c| c.has_waiter(tag)) else {
            return CancelResult::Unknown;
        };

        let command = &mut self.queued[index];
        let mut frame = command.frame;
        if let Some(pos) = command.waiters.iter().position(|w| w.tag == tag) {
            let waiter = command.waiters.remove(pos);
            frame = waiter.frame;
            let _ = waiter.tx.send(CommandOutcome::Cancelled);
        }
        // The newest remaining caller's request becomes the command again
        match command.waiters.last().map(|w| (w.frame, w.tag)) {
            Some((latest_frame, latest_tag)) => {
                command.frame = latest_frame;
                command.tag = latest_tag;
            }
            None => {
                self.queued.remove(index);
            }
        }

        debug!(tag, "Command cancelled");
        self.stats.cancelled += 1;
        self.completed.push(Completed {
            tag,
            frame,
            outcome: CommandOutcome::Cancelled,
        });
        CancelResult::Cancelled
    }

    /// Advance timers and return the next frame to write, if any
    ///
    /// `link_ready` is false while the link cannot accept writes; queued
    /// commands then stay queued.
    pub fn poll(&mut self, now: Instant, link_ready: bool) -> Option<Dispatch> {
        self.expire(now);

        let exhausted = match &self.in_flight {
            Some(InFlight {
                phase: Phase::AwaitingAck { deadline },
                command,
            }) if now >= *deadline => Some(command.attempts > command.retry_limit),
            _ => None,
        };
        match exhausted {
            Some(true) => self.finish_in_flight(CommandOutcome::Timeout),
            Some(false) => self.enter_backoff(now),
            None => {}
        }

        let ack_timeout = self.config.ack_timeout;
        if let Some(flight) = &mut self.in_flight {
            let Phase::Backoff { until } = flight.phase else {
                return None;
            };
            if now < until {
                return None;
            }
            if !link_ready {
                self.finish_in_flight(CommandOutcome::LinkLost);
                return None;
            }
            flight.command.attempts += 1;
            flight.phase = Phase::AwaitingAck {
                deadline: now + ack_timeout,
            };
            self.stats.retransmitted += 1;
            debug!(
                tag = flight.command.tag,
                attempt = flight.command.attempts,
                "Retransmitting command"
            );
            return Some(Dispatch {
                tag: flight.command.tag,
                frame: flight.command.frame,
                attempt: flight.command.attempts,
            });
        }

        if !link_ready {
            return None;
        }
        let mut command = self.queued.pop_front()?;
        command.attempts = 1;
        let dispatch = Dispatch {
            tag: command.tag,
            frame: command.frame,
            attempt: 1,
        };
        trace!(tag = dispatch.tag, frame = %dispatch.frame, "Dispatching command");
        self.in_flight = Some(InFlight {
            command,
            phase: Phase::AwaitingAck {
                deadline: now + ack_timeout,
            },
        });
        self.stats.dispatched += 1;
        Some(dispatch)
    }

    /// Record that writing the in-flight frame failed
    ///
    /// The failed write counts as an attempt. Once retries are exhausted the
    /// command completes `LinkLost`.
    pub fn write_failed(&mut self, now: Instant) {
        let Some(flight) = &self.in_flight else {
            return;
        };
        if flight.command.attempts > flight.command.retry_limit {
            self.finish_in_flight(CommandOutcome::LinkLost);
        } else {
            self.enter_backoff(now);
        }
    }

    /// Match a state report against the in-flight command
    ///
    /// Returns the tag of the acknowledged command.
    pub fn acknowledge(&mut self, report: &MeshFrame) -> Option<TransactionTag> {
        let command = &self.in_flight.as_ref()?.command;
        if command.frame.address() != report.address() && !command.frame.is_broadcast() {
            return None;
        }
        let tag = command.tag;
        self.finish_in_flight(CommandOutcome::Success);
        Some(tag)
    }

    /// The link dropped and is reconnecting; only the in-flight command is lost
    pub fn link_dropped(&mut self) {
        if self.in_flight.is_some() {
            self.finish_in_flight(CommandOutcome::LinkLost);
        }
    }

    /// The link is down for good; every pending command is lost
    pub fn link_down(&mut self) {
        self.link_dropped();
        while let Some(command) = self.queued.pop_front() {
            self.finish(command, CommandOutcome::LinkLost);
        }
    }

    /// Earliest instant at which [`poll`](Self::poll) has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        let flight = self.in_flight.as_ref().map(|f| match f.phase {
            Phase::AwaitingAck { deadline } => deadline,
            Phase::Backoff { until } => until,
        });
        let expiry = self
            .queued
            .iter()
            .map(|c| c.submitted_at + self.config.max_staleness)
            .min();
        match (flight, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Take the commands completed since the last call
    pub fn drain_completed(&mut self) -> Vec<Completed> {
        std::mem::take(&mut self.completed)
    }

    /// Tag of the in-flight command
    pub fn in_flight_tag(&self) -> Option<TransactionTag> {
        self.in_flight.as_ref().map(|f| f.command.tag)
    }

    /// Number of commands waiting for dispatch
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// No command queued or in flight
    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.in_flight.is_none()
    }

    /// Queue counters
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    fn expire(&mut self, now: Instant) {
        let max_staleness = self.config.max_staleness;
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .queued
            .drain(..)
            .partition(|c| now.saturating_duration_since(c.submitted_at) >= max_staleness);
        self.queued = kept.into();
        for command in expired {
            debug!(tag = command.tag, frame = %command.frame, "Command expired in queue");
            self.finish(command, CommandOutcome::Expired);
        }
    }

    fn enter_backoff(&mut self, now: Instant) {
        if let Some(flight) = &mut self.in_flight {
            let until = now + self.config.retry_backoff * flight.command.attempts;
            flight.phase = Phase::Backoff { until };
        }
    }

    fn finish_in_flight(&mut self, outcome: CommandOutcome) {
        if let Some(flight) = self.in_flight.take() {
            self.finish(flight.command, outcome);
        }
    }

    fn finish(&mut self, command: PendingCommand, outcome: CommandOutcome) {
        match outcome {
            CommandOutcome::Success => self.stats.succeeded += 1,
            CommandOutcome::Timeout => {
                warn!(
                    tag = command.tag,
                    address = command.frame.address(),
                    attempts = command.attempts,
                    "Command timed out"
                );
                self.stats.timed_out += 1;
            }
            CommandOutcome::LinkLost => self.stats.link_lost += 1,
            CommandOutcome::Expired => self.stats.expired += 1,
            CommandOutcome::Cancelled => self.stats.cancelled += 1,
        }
        for waiter in command.waiters {
            // Receiver may have been dropped by an uninterested caller
            let _ = waiter.tx.send(outcome);
        }
        self.completed.push(Completed {
            tag: command.tag,
            frame: command.frame,
            outcome,
        });
    }
}
