//! Wait-for graph and deadlock detection.
//!
//! The detector keeps a dynamic multigraph of which threads hold and
//! wait for which resources, stored as an adjacency matrix: one row per
//! thread, one column per resource, entry `-1` while the thread waits,
//! `n > 0` while it holds at reentrance `n`. Rows and columns are pruned
//! as soon as they empty, so the matrix stays proportional to live
//! contention rather than to history.
//!
//! All mutation happens under the manager's graph mutex. Every operation
//! reports impossible states as a [`GraphError`] instead of panicking;
//! the manager responds by disabling detection for good.

use std::sync::Arc;
use std::thread::{Thread, ThreadId};

use crate::lock::OrderedLock;
use crate::rule::Resource;

/// Entry marking "no relation" between a thread and a resource.
const NO_STATE: i32 = 0;
/// Entry marking "thread waits for resource".
const WAITING_FOR: i32 = -1;

/// Internal inconsistency observed by a graph operation.
///
/// Any of these disables the detector permanently; none of them surface
/// to lock callers.
#[derive(Debug, thiserror::Error)]
pub(crate) enum GraphError {
    /// A release or wait-stop referenced a thread the graph never saw.
    #[error("thread {0:?} is not present in the wait graph")]
    UnknownThread(ThreadId),
    /// A release or wait-stop referenced a resource the graph never saw.
    #[error("resource {0} is not present in the wait graph")]
    UnknownResource(String),
    /// A release was recorded for a resource the thread does not hold.
    #[error("thread {thread:?} does not hold {resource}")]
    NotHeld {
        /// The releasing thread.
        thread: ThreadId,
        /// The resource it claimed to hold.
        resource: String,
    },
    /// A wait-stop was recorded for a thread that is not waiting.
    #[error("thread {thread:?} is not waiting for {resource}")]
    NotWaiting {
        /// The thread claimed to be waiting.
        thread: ThreadId,
        /// The resource it claimed to wait for.
        resource: String,
    },
    /// A cycle was found but every candidate holds a scheduling rule on
    /// the cycle, and rules cannot be suspended.
    #[error("deadlock is unresolvable: every victim candidate holds a scheduling rule")]
    Unresolvable,
}

/// A detected deadlock, with the resolution the manager should apply.
#[derive(Debug)]
pub(crate) struct Deadlock {
    /// The thread whose locks will be suspended.
    pub(crate) candidate: Thread,
    /// The candidate's cycle-participating locks, all suspendable.
    pub(crate) locks: Vec<Arc<OrderedLock>>,
}

/// The wait-for graph.
#[derive(Debug, Default)]
pub(crate) struct DeadlockDetector {
    /// Row owners. A thread stays listed while any entry in its row is
    /// nonzero.
    threads: Vec<Thread>,
    /// Column owners, in step with every row's entries.
    resources: Vec<Resource>,
    /// `graph[t][r]`: `WAITING_FOR`, `NO_STATE`, or a positive
    /// reentrance count.
    graph: Vec<Vec<i32>>,
}

impl DeadlockDetector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that `thread` holds `resource`, one more time if it
    /// already does. A pending wait edge collapses into the hold.
    pub(crate) fn lock_acquired(
        &mut self,
        thread: &Thread,
        resource: &Resource,
    ) -> Result<(), GraphError> {
        let ti = self.ensure_thread(thread);
        let ri = self.ensure_resource(resource);
        let entry = &mut self.graph[ti][ri];
        if *entry == WAITING_FOR {
            *entry = 1;
        } else {
            *entry += 1;
        }
        tracing::trace!(thread = ?thread.id(), resource = %resource, depth = self.graph[ti][ri], "graph: acquired");
        Ok(())
    }

    /// Records that `thread` starts waiting for `resource`, then
    /// searches for a cycle through it.
    ///
    /// No edge is recorded when the thread already holds a resource
    /// containing `resource`; nested acquisition of a covered rule is
    /// not a wait.
    pub(crate) fn lock_wait_start(
        &mut self,
        thread: &Thread,
        resource: &Resource,
    ) -> Result<Option<Deadlock>, GraphError> {
        let ti = self.ensure_thread(thread);
        let ri = self.ensure_resource(resource);

        let covered = self.graph[ti]
            .iter()
            .enumerate()
            .any(|(i, &entry)| entry > 0 && self.resources[i].contains(resource));
        if covered {
            self.prune(ti, ri);
            return Ok(None);
        }

        self.graph[ti][ri] = WAITING_FOR;
        tracing::trace!(thread = ?thread.id(), resource = %resource, "graph: wait start");

        let Some(cycle) = self.find_cycle(ti) else {
            return Ok(None);
        };
        let deadlock = self.select_victim(&cycle)?;
        tracing::debug!(
            victim = ?deadlock.candidate.id(),
            locks = deadlock.locks.len(),
            "deadlock detected"
        );
        Ok(Some(deadlock))
    }

    /// Removes the wait edge `(thread, resource)`.
    ///
    /// A hold entry is left untouched: it means the wait was elided by
    /// the containment rule or already collapsed into an acquisition.
    pub(crate) fn lock_wait_stop(
        &mut self,
        thread: &Thread,
        resource: &Resource,
    ) -> Result<(), GraphError> {
        let (ti, ri) = self.indices(thread, resource)?;
        match self.graph[ti][ri] {
            WAITING_FOR => {
                self.graph[ti][ri] = NO_STATE;
                self.prune(ti, ri);
                Ok(())
            }
            n if n > 0 => Ok(()),
            _ => Err(GraphError::NotWaiting {
                thread: thread.id(),
                resource: resource.to_string(),
            }),
        }
    }

    /// Records one release of `resource` by `thread`; the hold edge
    /// disappears when the reentrance count reaches zero.
    pub(crate) fn lock_released(
        &mut self,
        thread: &Thread,
        resource: &Resource,
    ) -> Result<(), GraphError> {
        let (ti, ri) = self.indices(thread, resource)?;
        if self.graph[ti][ri] <= 0 {
            return Err(GraphError::NotHeld {
                thread: thread.id(),
                resource: resource.to_string(),
            });
        }
        self.graph[ti][ri] -= 1;
        tracing::trace!(thread = ?thread.id(), resource = %resource, depth = self.graph[ti][ri], "graph: released");
        self.prune(ti, ri);
        Ok(())
    }

    /// Drops the hold edge regardless of its multiplicity. Used on
    /// forced release, where the suspended depth is restored wholesale
    /// on resume, and by hosts ending a rule acquired several times.
    pub(crate) fn lock_released_completely(
        &mut self,
        thread: &Thread,
        resource: &Resource,
    ) -> Result<(), GraphError> {
        let (ti, ri) = self.indices(thread, resource)?;
        if self.graph[ti][ri] <= 0 {
            return Err(GraphError::NotHeld {
                thread: thread.id(),
                resource: resource.to_string(),
            });
        }
        self.graph[ti][ri] = NO_STATE;
        tracing::trace!(thread = ?thread.id(), resource = %resource, "graph: released completely");
        self.prune(ti, ri);
        Ok(())
    }

    /// Returns true while `thread` holds or waits for anything.
    pub(crate) fn contains_thread(&self, thread: ThreadId) -> bool {
        self.thread_index(thread).is_some()
    }

    /// Returns true when no relation at all is recorded.
    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Renders the matrix for the degradation diagnostic.
    pub(crate) fn to_debug_string(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("wait graph:\n");
        for (ti, thread) in self.threads.iter().enumerate() {
            let _ = write!(
                out,
                "  {:?} ({})",
                thread.id(),
                thread.name().unwrap_or("unnamed")
            );
            for (ri, resource) in self.resources.iter().enumerate() {
                match self.graph[ti][ri] {
                    NO_STATE => {}
                    WAITING_FOR => {
                        let _ = write!(out, " waits[{resource}]");
                    }
                    n => {
                        let _ = write!(out, " holds[{resource} x{n}]");
                    }
                }
            }
            out.push('\n');
        }
        if self.threads.is_empty() {
            out.push_str("  (empty)\n");
        }
        out
    }

    // === index bookkeeping ===

    fn thread_index(&self, id: ThreadId) -> Option<usize> {
        self.threads.iter().position(|t| t.id() == id)
    }

    fn resource_index(&self, resource: &Resource) -> Option<usize> {
        let key = resource.key();
        self.resources.iter().position(|r| r.key() == key)
    }

    fn ensure_thread(&mut self, thread: &Thread) -> usize {
        self.thread_index(thread.id()).unwrap_or_else(|| {
            self.threads.push(thread.clone());
            self.graph.push(vec![NO_STATE; self.resources.len()]);
            self.threads.len() - 1
        })
    }

    fn ensure_resource(&mut self, resource: &Resource) -> usize {
        self.resource_index(resource).unwrap_or_else(|| {
            self.resources.push(resource.clone());
            for row in &mut self.graph {
                row.push(NO_STATE);
            }
            self.resources.len() - 1
        })
    }

    fn indices(&self, thread: &Thread, resource: &Resource) -> Result<(usize, usize), GraphError> {
        let ti = self
            .thread_index(thread.id())
            .ok_or(GraphError::UnknownThread(thread.id()))?;
        let ri = self
            .resource_index(resource)
            .ok_or_else(|| GraphError::UnknownResource(resource.to_string()))?;
        Ok((ti, ri))
    }

    /// Drops the thread row and resource column if they emptied.
    fn prune(&mut self, ti: usize, ri: usize) {
        if self.graph[ti].iter().all(|&e| e == NO_STATE) {
            self.graph.remove(ti);
            self.threads.remove(ti);
        }
        if self.graph.iter().all(|row| row[ri] == NO_STATE) {
            for row in &mut self.graph {
                row.remove(ri);
            }
            self.resources.remove(ri);
        }
    }

    // === cycle search and victim selection ===

    /// Threads blocking a wait on the resource at `ri`: every other
    /// thread holding a resource that conflicts with it. For locks this
    /// is exactly the owner; for rules it follows the conflict relation.
    fn blockers(&self, ti: usize, ri: usize) -> Vec<usize> {
        let waited = &self.resources[ri];
        (0..self.threads.len())
            .filter(|&other| other != ti)
            .filter(|&other| {
                self.graph[other]
                    .iter()
                    .enumerate()
                    .any(|(i, &entry)| entry > 0 && self.resources[i].conflicts_with(waited))
            })
            .collect()
    }

    /// Depth-first search for a cycle through `start`, following
    /// "waits for → blocked by" edges. Returns the cycle's thread
    /// indices in discovery order, starting at `start`.
    fn find_cycle(&self, start: usize) -> Option<Vec<usize>> {
        let mut visited = vec![false; self.threads.len()];
        let mut path = vec![start];
        visited[start] = true;
        if self.visit(start, start, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn visit(&self, current: usize, start: usize, visited: &mut [bool], path: &mut Vec<usize>) -> bool {
        for ri in 0..self.resources.len() {
            if self.graph[current][ri] != WAITING_FOR {
                continue;
            }
            for blocker in self.blockers(current, ri) {
                if blocker == start {
                    return true;
                }
                if !visited[blocker] {
                    visited[blocker] = true;
                    path.push(blocker);
                    if self.visit(blocker, start, visited, path) {
                        return true;
                    }
                    path.pop();
                }
            }
        }
        false
    }

    /// Picks the victim deterministically: order candidates by (number
    /// of cycle resources held, total resources held, smallest lock id
    /// among cycle-held locks, cycle position) and take the first whose
    /// cycle-held resources are all locks.
    fn select_victim(&self, cycle: &[usize]) -> Result<Deadlock, GraphError> {
        let cycle_waits: Vec<usize> = cycle
            .iter()
            .flat_map(|&t| {
                self.graph[t]
                    .iter()
                    .enumerate()
                    .filter(|&(_, &e)| e == WAITING_FOR)
                    .map(|(ri, _)| ri)
            })
            .collect();

        struct Candidate {
            thread: usize,
            position: usize,
            cycle_held: Vec<usize>,
            total_held: usize,
            min_lock_id: u64,
        }

        let mut candidates: Vec<Candidate> = cycle
            .iter()
            .enumerate()
            .map(|(position, &thread)| {
                let cycle_held: Vec<usize> = self.graph[thread]
                    .iter()
                    .enumerate()
                    .filter(|&(_, &e)| e > 0)
                    .map(|(ri, _)| ri)
                    .filter(|&ri| {
                        cycle_waits
                            .iter()
                            .any(|&w| self.resources[ri].conflicts_with(&self.resources[w]))
                    })
                    .collect();
                let total_held = self.graph[thread].iter().filter(|&&e| e > 0).count();
                let min_lock_id = cycle_held
                    .iter()
                    .filter_map(|&ri| self.resources[ri].as_lock())
                    .map(|lock| lock.id())
                    .min()
                    .unwrap_or(u64::MAX);
                Candidate {
                    thread,
                    position,
                    cycle_held,
                    total_held,
                    min_lock_id,
                }
            })
            .collect();

        candidates.sort_by_key(|c| {
            (
                c.cycle_held.len(),
                c.total_held,
                c.min_lock_id,
                c.position,
            )
        });

        for candidate in &candidates {
            let locks: Option<Vec<Arc<OrderedLock>>> = candidate
                .cycle_held
                .iter()
                .map(|&ri| self.resources[ri].as_lock().cloned())
                .collect();
            if let Some(locks) = locks {
                return Ok(Deadlock {
                    candidate: self.threads[candidate.thread].clone(),
                    locks,
                });
            }
        }
        Err(GraphError::Unresolvable)
    }

    /// Test-only view of an entry's raw value.
    #[cfg(test)]
    pub(crate) fn entry(&self, thread: ThreadId, resource: &Resource) -> i32 {
        match (self.thread_index(thread), self.resource_index(resource)) {
            (Some(ti), Some(ri)) => self.graph[ti][ri],
            _ => NO_STATE,
        }
    }
}
