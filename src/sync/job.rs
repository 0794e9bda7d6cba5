//! Per-resource reconciliation job.
//!
//! `Idle → Pending → InFlight → {Idle | Backoff}`, `Backoff → Pending` once the
//! retry delay elapses. The job state alone enforces single-flight: triggers
//! that arrive while a job is not `Idle` are folded into it.

use std::time::Duration;
use tokio::time::Instant;

use crate::event::{SyncTrigger, TriggerCause};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
  Idle,
  Pending,
  InFlight,
  Backoff,
}

/// Exponential retry delay with a ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
  pub initial: Duration,
  pub max: Duration,
}

impl Backoff {
  /// Delay before retry number `attempt` (1-based).
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    self
      .initial
      .checked_mul(1u32 << exp)
      .unwrap_or(self.max)
      .min(self.max)
  }
}

/// Trailing debounce for local writes. Each write pushes the deadline out by
/// `window`, but never past `max_wait` after the first write of the burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Debounce {
  pub window: Duration,
  pub max_wait: Duration,
}

impl Debounce {
  fn deadline(&self, first: Instant, now: Instant) -> Instant {
    (now + self.window).min(first + self.max_wait.max(self.window))
  }
}

#[derive(Debug, Clone)]
pub struct ReconciliationJob {
  pub resource: String,
  pub state: JobState,
  /// Consecutive failed attempts
  pub attempt: u32,
  /// When a `Pending` job may start, or a `Backoff` job may retry
  due: Option<Instant>,
  /// First write of a burst, while pending only because of local writes
  debounce_since: Option<Instant>,
  started_at: Option<Instant>,
  /// A trigger arrived after the in-flight pull started
  rerun: bool,
}

impl ReconciliationJob {
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      state: JobState::Idle,
      attempt: 0,
      due: None,
      debounce_since: None,
      started_at: None,
      rerun: false,
    }
  }

  /// Fold a trigger into the job. Returns true if the job became `Pending`.
  pub fn on_trigger(&mut self, trigger: &SyncTrigger, now: Instant, debounce: &Debounce) -> bool {
    let local_write = trigger.cause == TriggerCause::LocalWrite;

    match self.state {
      JobState::Idle => {
        self.state = JobState::Pending;
        if local_write {
          self.debounce_since = Some(now);
          self.due = Some(debounce.deadline(now, now));
        } else {
          self.debounce_since = None;
          self.due = Some(now);
        }
        true
      }
      JobState::Pending => {
        if !local_write {
          self.debounce_since = None;
          self.due = Some(now);
        } else if let Some(first) = self.debounce_since {
          self.due = Some(debounce.deadline(first, now));
        }
        false
      }
      JobState::InFlight => {
        // A trigger that predates the pull is answered by its result
        if self.started_at.is_some_and(|s| trigger.occurred_at > s) {
          self.rerun = true;
        }
        false
      }
      // The scheduled retry pulls the latest state anyway
      JobState::Backoff => false,
    }
  }

  /// Move an elapsed `Backoff` to `Pending`.
  pub fn wake(&mut self, now: Instant) {
    if self.state == JobState::Backoff && self.due.is_some_and(|d| d <= now) {
      self.state = JobState::Pending;
      self.debounce_since = None;
      self.due = Some(now);
    }
  }

  /// Start the pull if the job is due. Returns true if it is now `InFlight`.
  pub fn start(&mut self, now: Instant) -> bool {
    if self.state != JobState::Pending || self.due.is_some_and(|d| d > now) {
      return false;
    }
    self.state = JobState::InFlight;
    self.due = None;
    self.debounce_since = None;
    self.started_at = Some(now);
    self.rerun = false;
    true
  }

  pub fn on_success(&mut self, now: Instant) {
    self.attempt = 0;
    self.started_at = None;
    if std::mem::take(&mut self.rerun) {
      self.state = JobState::Pending;
      self.due = Some(now);
    } else {
      self.state = JobState::Idle;
      self.due = None;
    }
  }

  /// Enter `Backoff`; returns the retry delay.
  pub fn on_transient_failure(&mut self, now: Instant, backoff: &Backoff) -> Duration {
    self.attempt += 1;
    let delay = backoff.delay(self.attempt);
    self.state = JobState::Backoff;
    self.due = Some(now + delay);
    self.started_at = None;
    self.rerun = false;
    delay
  }

  /// The remote refused the pull: retrying won't help until the user acts.
  pub fn on_rejected(&mut self) {
    self.state = JobState::Idle;
    self.attempt = 0;
    self.due = None;
    self.started_at = None;
    self.rerun = false;
  }

  /// Next instant at which this job needs attention
  pub fn next_due(&self) -> Option<Instant> {
    match self.state {
      JobState::Pending | JobState::Backoff => self.due,
      _ => None,
    }
  }
}
