//! Pattern detection over the command stream.
//!
//! The detector keeps a sliding window of recent commands and a rolling
//! count of every contiguous subsequence of length `2..=max_length` inside
//! it. Counts are added when a command arrives and removed when it leaves
//! the window, so each push costs O(n·L) at worst.
//!
//! A subsequence that reaches `min_occurrences` becomes a workflow
//! candidate. When the history shows it is usually followed by the same
//! command, the candidate is held back for one step to see whether the
//! longer sequence qualifies instead; this keeps one workflow from being
//! split into its prefixes. Rotations of an already promoted workflow
//! (the same cycle entered at a different step) are never promoted.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

use crate::config::PatternConfig;

/// A step sequence ready to become a skill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternCandidate {
    pub steps: Vec<String>,
    pub occurrences: usize,
}

pub struct PatternDetector {
    min_occurrences: usize,
    max_length: usize,
    window_size: usize,
    window: VecDeque<String>,
    counts: HashMap<Vec<String>, usize>,
    promoted: HashSet<Vec<String>>,
    pending: Option<Vec<String>>,
}

impl PatternDetector {
    pub fn new(config: &PatternConfig) -> Self {
        let max_length = config.max_length.max(2);
        Self {
            min_occurrences: config.min_occurrences.max(2),
            max_length,
            window_size: config.window_size.max(max_length),
            window: VecDeque::with_capacity(config.window_size),
            counts: HashMap::new(),
            promoted: HashSet::new(),
            pending: None,
        }
    }

    /// Feed one command. Returns the candidates promoted by this step.
    pub fn push(&mut self, command: &str) -> Vec<PatternCandidate> {
        if !self.record(command) {
            return Vec::new();
        }

        let mut promoted = Vec::new();

        if let Some(pending) = self.pending.take() {
            match self.extension_of(&pending) {
                Some(extended) => {
                    if self.can_extend(&extended) {
                        self.pending = Some(extended);
                    } else {
                        promoted.push(self.promote(extended));
                    }
                    return promoted;
                }
                None => promoted.push(self.promote(pending)),
            }
        }

        if let Some(best) = self.best_suffix() {
            if self.can_extend(&best) {
                debug!(steps = best.len(), "holding candidate for a longer match");
                self.pending = Some(best);
            } else {
                promoted.push(self.promote(best));
            }
        }
        promoted
    }

    /// Replay commands from an earlier run into the window, oldest first.
    ///
    /// Only the counts are rebuilt. Nothing is promoted or held back, so a
    /// workflow that was already at the threshold is picked up by the next
    /// live command that completes it.
    pub fn seed<I, S>(&mut self, commands: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        commands
            .into_iter()
            .filter(|command| self.record(command.as_ref()))
            .count()
    }

    /// Promote a held-back candidate. Called when a session ends.
    pub fn flush(&mut self) -> Option<PatternCandidate> {
        let pending = self.pending.take()?;
        Some(self.promote(pending))
    }

    /// Record a sequence as already promoted (e.g. an existing skill).
    pub fn mark_promoted(&mut self, steps: Vec<String>) {
        self.promoted.insert(steps);
    }

    /// Occurrences of `steps` inside the current window.
    pub fn count(&self, steps: &[String]) -> usize {
        self.counts.get(steps).copied().unwrap_or(0)
    }

    pub fn pending(&self) -> Option<&[String]> {
        self.pending.as_deref()
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Append to the window and update the rolling counts. Blank commands
    /// are dropped.
    fn record(&mut self, command: &str) -> bool {
        let command = command.trim();
        if command.is_empty() {
            return false;
        }
        self.window.push_back(command.to_string());
        for len in 2..=self.max_length.min(self.window.len()) {
            let suffix = self.suffix(len);
            *self.counts.entry(suffix).or_insert(0) += 1;
        }
        if self.window.len() > self.window_size {
            self.evict_front();
        }
        true
    }

    fn suffix(&self, len: usize) -> Vec<String> {
        let start = self.window.len() - len;
        self.window.range(start..).cloned().collect()
    }

    fn evict_front(&mut self) {
        for len in 2..=self.max_length.min(self.window.len()) {
            let prefix: Vec<String> = self.window.range(..len).cloned().collect();
            let remaining = match self.counts.get_mut(&prefix) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => continue,
            };
            if remaining == 0 {
                self.counts.remove(&prefix);
            }
            // Once a workflow drops below the threshold it may be detected again.
            if remaining < self.min_occurrences {
                self.promoted.remove(&prefix);
            }
        }
        self.window.pop_front();
    }

    /// The pending candidate grown by the command that just arrived, if
    /// that longer sequence qualifies on its own.
    fn extension_of(&self, pending: &[String]) -> Option<Vec<String>> {
        let len = pending.len() + 1;
        if len > self.max_length || len > self.window.len() {
            return None;
        }
        let extended = self.suffix(len);
        let next = extended.last()?;
        let qualifies = extended[..pending.len()] == *pending
            && next != &pending[0]
            && self.count(&extended) >= self.min_occurrences
            && self.is_new(&extended);
        qualifies.then_some(extended)
    }

    /// Longest qualifying sequence ending at the newest command.
    fn best_suffix(&self) -> Option<Vec<String>> {
        (2..=self.max_length.min(self.window.len()))
            .rev()
            .map(|len| self.suffix(len))
            .find(|candidate| self.count(candidate) >= self.min_occurrences && self.is_new(candidate))
    }

    /// Whether earlier occurrences of `steps` were followed by the same
    /// command often enough that the longer sequence will qualify on its
    /// next appearance.
    fn can_extend(&self, steps: &[String]) -> bool {
        if steps.len() >= self.max_length {
            return false;
        }
        let n = self.window.len();
        let len = steps.len();
        let mut followers: HashMap<&str, usize> = HashMap::new();
        // Only occurrences that end before the newest command have a follower.
        for start in 0..n.saturating_sub(len) {
            if (0..len).all(|i| self.window[start + i] == steps[i]) {
                let next = &self.window[start + len];
                if next != &steps[0] {
                    *followers.entry(next.as_str()).or_insert(0) += 1;
                }
            }
        }
        followers.into_iter().any(|(next, seen)| {
            if seen + 1 < self.min_occurrences {
                return false;
            }
            let mut extended = steps.to_vec();
            extended.push(next.to_string());
            self.is_new(&extended)
        })
    }

    fn is_new(&self, steps: &[String]) -> bool {
        !self.promoted.contains(steps) && !self.is_rotation_of_promoted(steps)
    }

    /// True if `steps` walks some promoted workflow as a cycle, starting at
    /// any of its steps.
    fn is_rotation_of_promoted(&self, steps: &[String]) -> bool {
        self.promoted.iter().any(|workflow| {
            let period = workflow.len();
            (0..period).any(|offset| {
                steps
                    .iter()
                    .enumerate()
                    .all(|(i, step)| *step == workflow[(offset + i) % period])
            })
        })
    }

    fn promote(&mut self, steps: Vec<String>) -> PatternCandidate {
        let occurrences = self.count(&steps);
        self.promoted.insert(steps.clone());
        debug!(steps = steps.len(), occurrences, "promoted workflow candidate");
        PatternCandidate { steps, occurrences }
    }
}
