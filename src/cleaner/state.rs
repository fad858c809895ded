//! Per-partition cleaning state and the store that arbitrates it.
//!
//! A partition with no recorded state is idle. Every read-modify-write goes
//! through one mutex so that claiming, pausing and completion never act on a
//! stale view of the same partition.

use crate::partition::TopicPartition;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCleaningState {
    /// Exclusively claimed by a cleaner.
    InProgress,
    /// Claimed, but a pause was requested; the claimant must finish promptly.
    Aborted,
    /// Paused by `n >= 1` nested requests.
    Paused(u32),
}

impl fmt::Display for LogCleaningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCleaningState::InProgress => write!(f, "InProgress"),
            LogCleaningState::Aborted => write!(f, "Aborted"),
            LogCleaningState::Paused(n) => write!(f, "Paused({})", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningEvent {
    Claim,
    PauseForRetention,
    AbortAndPause,
    Resume,
    Done,
}

/// Applies `event` to `current`. `None` stands for idle on both sides.
pub fn transition(
    partition: &TopicPartition,
    current: Option<LogCleaningState>,
    event: CleaningEvent,
) -> Result<Option<LogCleaningState>> {
    use CleaningEvent::*;
    use LogCleaningState::*;

    let next = match (current, event) {
        (None, Claim) => Some(InProgress),
        (None, PauseForRetention) | (None, AbortAndPause) => Some(Paused(1)),
        (Some(Paused(n)), PauseForRetention) | (Some(Paused(n)), AbortAndPause) => {
            Some(Paused(n + 1))
        }
        (Some(InProgress), AbortAndPause) => Some(Aborted),
        (Some(Paused(n)), Resume) if n <= 1 => None,
        (Some(Paused(n)), Resume) => Some(Paused(n - 1)),
        (Some(InProgress), Done) => None,
        (Some(Aborted), Done) => Some(Paused(1)),
        (state, event) => {
            return Err(Error::InvalidStateTransition {
                partition: partition.clone(),
                state,
                event,
            })
        }
    };
    Ok(next)
}

#[derive(Default)]
struct StoreInner {
    states: HashMap<TopicPartition, LogCleaningState>,
    uncleanable: HashMap<PathBuf, HashSet<TopicPartition>>,
}

impl StoreInner {
    fn get(&self, tp: &TopicPartition) -> Option<LogCleaningState> {
        self.states.get(tp).copied()
    }

    fn put(&mut self, tp: &TopicPartition, state: Option<LogCleaningState>) {
        match state {
            // A pause count of zero is no pause at all.
            Some(LogCleaningState::Paused(0)) | None => {
                self.states.remove(tp);
            }
            Some(state) => {
                self.states.insert(tp.clone(), state);
            }
        }
    }

    fn apply(
        &mut self,
        tp: &TopicPartition,
        event: CleaningEvent,
    ) -> Result<Option<LogCleaningState>> {
        let current = self.get(tp);
        let next = transition(tp, current, event)?;
        log::debug!(
            "{}: cleaning state {} -> {} on {:?}",
            tp,
            display_state(current),
            display_state(next),
            event
        );
        self.put(tp, next);
        Ok(next)
    }

    fn is_uncleanable(&self, dir: &Path, tp: &TopicPartition) -> bool {
        self.uncleanable
            .get(dir)
            .map_or(false, |partitions| partitions.contains(tp))
    }
}

fn display_state(state: Option<LogCleaningState>) -> String {
    state.map_or_else(|| "Idle".to_string(), |s| s.to_string())
}

#[derive(Default)]
pub struct CleaningStateStore {
    inner: Mutex<StoreInner>,
    state_changed: Condvar,
}

impl CleaningStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally overwrites the state. `None` resets to idle.
    pub fn set_state(&self, tp: &TopicPartition, state: Option<LogCleaningState>) {
        self.inner.lock().put(tp, state);
        self.state_changed.notify_all();
    }

    pub fn state(&self, tp: &TopicPartition) -> Option<LogCleaningState> {
        self.inner.lock().get(tp)
    }

    /// Partitions from `candidates` that are idle and not marked uncleanable.
    pub fn idle_among<'a, I>(&self, candidates: I) -> Vec<TopicPartition>
    where
        I: IntoIterator<Item = (&'a TopicPartition, &'a Path)>,
    {
        let inner = self.inner.lock();
        candidates
            .into_iter()
            .filter(|(tp, dir)| inner.get(tp).is_none() && !inner.is_uncleanable(dir, tp))
            .map(|(tp, _)| tp.clone())
            .collect()
    }

    /// Claims the first partition in `candidates` that is still idle.
    pub fn claim_for_compaction(&self, candidates: &[TopicPartition]) -> Option<TopicPartition> {
        let mut inner = self.inner.lock();
        let chosen = candidates.iter().find(|tp| inner.get(tp).is_none())?;
        inner.put(chosen, Some(LogCleaningState::InProgress));
        log::debug!("{}: claimed for compaction", chosen);
        Some(chosen.clone())
    }

    /// Claims every idle, cleanable partition in `candidates` in one step.
    pub fn claim_all<'a, I>(&self, candidates: I) -> Vec<TopicPartition>
    where
        I: IntoIterator<Item = (&'a TopicPartition, &'a Path)>,
    {
        let mut inner = self.inner.lock();
        let mut claimed = Vec::new();
        for (tp, dir) in candidates {
            if inner.get(tp).is_none() && !inner.is_uncleanable(dir, tp) {
                inner.put(tp, Some(LogCleaningState::InProgress));
                claimed.push(tp.clone());
            }
        }
        claimed
    }

    /// Pauses each partition for retention unless a cleaner currently owns it.
    /// Returns the partitions that are now paused, with their payload.
    pub fn pause_non_compacted<T>(
        &self,
        candidates: Vec<(TopicPartition, T)>,
    ) -> Vec<(TopicPartition, T)> {
        let mut inner = self.inner.lock();
        candidates
            .into_iter()
            .filter(|(tp, _)| inner.apply(tp, CleaningEvent::PauseForRetention).is_ok())
            .collect()
    }

    /// Releases one pause on each partition. Partitions that are not paused are
    /// left untouched.
    pub fn resume(&self, partitions: &[TopicPartition]) {
        let mut inner = self.inner.lock();
        for tp in partitions {
            if let Err(e) = inner.apply(tp, CleaningEvent::Resume) {
                log::warn!("Ignoring resume request: {}", e);
            }
        }
        drop(inner);
        self.state_changed.notify_all();
    }

    /// Fails unless a cleaner currently owns `tp`. Leaves the state untouched.
    pub fn check_done(&self, tp: &TopicPartition) -> Result<()> {
        let inner = self.inner.lock();
        transition(tp, inner.get(tp), CleaningEvent::Done).map(|_| ())
    }

    /// Finalizes a cleaning pass. Returns the state the partition is left in.
    pub fn done(&self, tp: &TopicPartition) -> Result<Option<LogCleaningState>> {
        let next = self.inner.lock().apply(tp, CleaningEvent::Done);
        self.state_changed.notify_all();
        next
    }

    /// Finalizes a batch. Every partition is processed; the first contract
    /// violation is reported after the rest have been finalized.
    pub fn done_many(&self, partitions: &[TopicPartition]) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut first_error = None;
        for tp in partitions {
            if let Err(e) = inner.apply(tp, CleaningEvent::Done) {
                log::error!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        drop(inner);
        self.state_changed.notify_all();
        first_error.map_or(Ok(()), Err)
    }

    /// Pauses cleaning of `tp`. If a cleaner owns the partition, marks the pass
    /// aborted and blocks until the cleaner's completion turns it into a pause.
    pub fn abort_and_pause(&self, tp: &TopicPartition) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.apply(tp, CleaningEvent::AbortAndPause)?;
        while !matches!(inner.get(tp), Some(LogCleaningState::Paused(_))) {
            if inner.get(tp).is_none() {
                // Someone reset the state administratively; nothing left to wait for.
                break;
            }
            self.state_changed.wait(&mut inner);
        }
        log::info!("{}: cleaning paused", tp);
        Ok(())
    }

    /// Stops any cleaning of `tp` and leaves it idle.
    pub fn abort(&self, tp: &TopicPartition) -> Result<()> {
        self.abort_and_pause(tp)?;
        self.resume(std::slice::from_ref(tp));
        log::info!("{}: cleaning aborted", tp);
        Ok(())
    }

    pub fn is_aborted(&self, tp: &TopicPartition) -> bool {
        self.state(tp) == Some(LogCleaningState::Aborted)
    }

    pub fn check_aborted(&self, tp: &TopicPartition) -> Result<()> {
        if self.is_aborted(tp) {
            return Err(Error::CleaningAborted(tp.clone()));
        }
        Ok(())
    }

    pub fn mark_uncleanable(&self, dir: &Path, tp: &TopicPartition) {
        self.inner
            .lock()
            .uncleanable
            .entry(dir.to_path_buf())
            .or_default()
            .insert(tp.clone());
    }

    pub fn is_uncleanable(&self, dir: &Path, tp: &TopicPartition) -> bool {
        self.inner.lock().is_uncleanable(dir, tp)
    }

    pub fn uncleanable_count(&self) -> usize {
        self.inner.lock().uncleanable.values().map(HashSet::len).sum()
    }

    pub fn handle_dir_failure(&self, dir: &Path) {
        self.inner.lock().uncleanable.remove(dir);
    }

    /// Forgets everything recorded for a partition that no longer exists.
    pub fn remove_partition(&self, tp: &TopicPartition) {
        let mut inner = self.inner.lock();
        inner.states.remove(tp);
        for partitions in inner.uncleanable.values_mut() {
            partitions.remove(tp);
        }
        drop(inner);
        self.state_changed.notify_all();
    }
}
