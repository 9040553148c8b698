//! Container and TTL znode reaper.
//!
//! A leader-only periodic task that proposes the deletion of container
//! znodes that have become empty and of TTL znodes whose age exceeds their
//! TTL. Deletions go through the regular request pipeline as
//! `DeleteContainer` operations, at a bounded global rate, so a large batch
//! of empty containers cannot flood the proposal path.

use failure::Error;
use serde_derive::Deserialize;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::proto::OpCode;
use crate::{EphemeralKind, SessionId, Timestamp, Version};

/// Narrow read interface over the replicated data tree.
pub trait DataTreeView: Send + Sync {
    /// Paths of all container znodes.
    fn container_paths(&self) -> Vec<String>;

    /// Paths of all TTL znodes.
    fn ttl_paths(&self) -> Vec<String>;

    /// Reads one node, `None` if it no longer exists.
    fn node(&self, path: &str) -> Option<NodeView>;
}

/// The node attributes the reaper decides on.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub cversion: Version,
    pub mtime: Timestamp,
    pub ephemeral_owner: SessionId,
    pub children: Vec<String>,
}

/// A request handed to the leader's request pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: OpCode,
    pub path: String,
}

pub trait RequestPipeline: Send + Sync {
    /// Submits a request for proposal. May fail; the reaper treats failures
    /// as non-fatal and reconsiders the node on the next sweep.
    fn submit(&self, request: Request) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Sweep period in milliseconds.
    pub check_interval_ms: u64,
    /// Global cap on delete submissions per minute.
    pub max_per_minute: u64,
    /// Grace period in milliseconds before a container that never had
    /// children (cversion 0) is deleted. 0 disables this rule.
    pub max_never_used_interval_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> ContainerConfig {
        ContainerConfig {
            check_interval_ms: 60_000,
            max_per_minute: 10_000,
            max_never_used_interval_ms: 0,
        }
    }
}

/// Minimum wall-clock spacing between successive delete submissions.
fn delete_spacing_ms(max_per_minute: u64) -> u64 {
    if max_per_minute == 0 {
        0
    } else {
        60_000 / max_per_minute
    }
}

/// Cancellable sleep shared between the sweep loop and `stop()`.
struct Sleeper {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Sleeper {
    fn new() -> Sleeper {
        Sleeper {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    /// Sleeps for `ms` milliseconds. Returns `false` as soon as the sleeper
    /// is stopped, without waiting out the remainder.
    fn sleep(&self, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        let mut stopped = self.stopped.lock().expect("reaper lock poisoned");
        loop {
            if *stopped {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let (guard, _) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .expect("reaper lock poisoned");
            stopped = guard;
        }
    }

    fn stop(&self) {
        let mut stopped = self.stopped.lock().expect("reaper lock poisoned");
        *stopped = true;
        self.wake.notify_all();
    }

    fn reset(&self) {
        let mut stopped = self.stopped.lock().expect("reaper lock poisoned");
        *stopped = false;
    }
}

/// Periodic reaper for empty container znodes and expired TTL znodes.
pub struct ContainerManager {
    tree: Arc<dyn DataTreeView>,
    pipeline: Arc<dyn RequestPipeline>,
    clock: Arc<dyn Clock>,
    config: ContainerConfig,
    sleeper: Arc<Sleeper>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerManager {
    pub fn new(
        tree: Arc<dyn DataTreeView>,
        pipeline: Arc<dyn RequestPipeline>,
        clock: Arc<dyn Clock>,
        config: ContainerConfig,
    ) -> ContainerManager {
        ContainerManager {
            tree,
            pipeline,
            clock,
            config,
            sleeper: Arc::new(Sleeper::new()),
            worker: Mutex::new(None),
        }
    }

    /// Schedules a sweep every `check_interval_ms`. Calling this again while
    /// the sweeper is running has no effect.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("reaper lock poisoned");
        if worker.is_some() {
            return;
        }
        self.sleeper.reset();

        let tree = Arc::clone(&self.tree);
        let pipeline = Arc::clone(&self.pipeline);
        let clock = Arc::clone(&self.clock);
        let config = self.config.clone();
        let sleeper = Arc::clone(&self.sleeper);

        let handle = thread::Builder::new()
            .name("container-manager".to_string())
            .spawn(move || {
                info!(
                    "container manager started, sweeping every {} ms",
                    config.check_interval_ms
                );
                while sleeper.sleep(config.check_interval_ms) {
                    if !sweep_once(&*tree, &*pipeline, &*clock, &config, &sleeper) {
                        break;
                    }
                }
                info!("container manager stopped");
            })
            .expect("failed to spawn the container manager thread");

        *worker = Some(handle);
    }

    /// Cancels the sweep, interrupting an in-flight pass at its next pause.
    /// Safe to call repeatedly, or without `start()` ever having run.
    pub fn stop(&self) {
        self.sleeper.stop();
        let handle = self.worker.lock().expect("reaper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Performs one sweep pass immediately. Only useful on the leader:
    /// elsewhere the submitted deletions fail at the proposal stage, which
    /// the sweep tolerates.
    pub fn sweep(&self) {
        sweep_once(
            &*self.tree,
            &*self.pipeline,
            &*self.clock,
            &self.config,
            &self.sleeper,
        );
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One pass. Returns `false` when interrupted by `stop()`.
fn sweep_once(
    tree: &dyn DataTreeView,
    pipeline: &dyn RequestPipeline,
    clock: &dyn Clock,
    config: &ContainerConfig,
    sleeper: &Sleeper,
) -> bool {
    let spacing = delete_spacing_ms(config.max_per_minute);
    let candidates = candidates(tree, clock, config);
    debug!("container sweep selected {} deletable nodes", candidates.len());

    for path in candidates {
        let started = clock.elapsed_now();
        let request = Request {
            op: OpCode::DeleteContainer,
            path: path.clone(),
        };
        match pipeline.submit(request) {
            Ok(()) => debug!("proposed deletion of container {}", path),
            // Not fatal: the next sweep reconsiders the node
            Err(e) => warn!("could not propose deletion of {}: {}", path, e),
        }

        let elapsed = clock.elapsed_now().saturating_sub(started);
        let pause = spacing.saturating_sub(elapsed);
        if pause > 0 && !sleeper.sleep(pause) {
            return false;
        }
    }

    true
}

/// Selects the paths to propose for deletion in this pass.
fn candidates(tree: &dyn DataTreeView, clock: &dyn Clock, config: &ContainerConfig) -> Vec<String> {
    let now = clock.wall_now();
    let mut result = Vec::new();

    for path in tree.container_paths() {
        if let Some(node) = tree.node(&path) {
            if !node.children.is_empty() {
                continue;
            }
            if node.cversion > Version(0) {
                // Had children at some point and is empty now
                result.push(path);
            } else if config.max_never_used_interval_ms != 0
                && now.0.saturating_sub(node.mtime.0) > config.max_never_used_interval_ms
            {
                // Never used and past the grace period
                result.push(path);
            }
        }
    }

    for path in tree.ttl_paths() {
        if let Some(node) = tree.node(&path) {
            if !node.children.is_empty() {
                continue;
            }
            if let EphemeralKind::Ttl(ttl) = EphemeralKind::of(node.ephemeral_owner) {
                if ttl != 0 && now.0.saturating_sub(node.mtime.0) > ttl {
                    result.push(path);
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct ManualClock {
        wall: Mutex<u64>,
    }

    impl ManualClock {
        fn at(wall_ms: u64) -> ManualClock {
            ManualClock {
                wall: Mutex::new(wall_ms),
            }
        }
    }

    impl Clock for ManualClock {
        fn wall_now(&self) -> Timestamp {
            Timestamp(*self.wall.lock().unwrap())
        }

        fn elapsed_now(&self) -> u64 {
            0
        }
    }

    #[derive(Default)]
    struct MemTree {
        containers: BTreeMap<String, NodeView>,
        ttls: BTreeMap<String, NodeView>,
    }

    impl MemTree {
        fn container(mut self, path: &str, cversion: i32, mtime: u64, children: &[&str]) -> MemTree {
            self.containers.insert(
                path.to_string(),
                NodeView {
                    cversion: Version(cversion),
                    mtime: Timestamp(mtime),
                    ephemeral_owner: crate::CONTAINER_EPHEMERAL_OWNER,
                    children: children.iter().map(|c| c.to_string()).collect(),
                },
            );
            self
        }

        fn ttl(mut self, path: &str, ttl_ms: u64, mtime: u64, children: &[&str]) -> MemTree {
            self.ttls.insert(
                path.to_string(),
                NodeView {
                    cversion: Version(1),
                    mtime: Timestamp(mtime),
                    ephemeral_owner: EphemeralKind::ttl_owner(ttl_ms),
                    children: children.iter().map(|c| c.to_string()).collect(),
                },
            );
            self
        }
    }

    impl DataTreeView for MemTree {
        fn container_paths(&self) -> Vec<String> {
            self.containers.keys().cloned().collect()
        }

        fn ttl_paths(&self) -> Vec<String> {
            self.ttls.keys().cloned().collect()
        }

        fn node(&self, path: &str) -> Option<NodeView> {
            self.containers
                .get(path)
                .or_else(|| self.ttls.get(path))
                .cloned()
        }
    }

    #[derive(Default)]
    struct RecordingPipeline {
        submitted: Mutex<Vec<Request>>,
        fail: bool,
    }

    impl RequestPipeline for RecordingPipeline {
        fn submit(&self, request: Request) -> Result<(), Error> {
            self.submitted.lock().unwrap().push(request);
            if self.fail {
                Err(failure::err_msg("not the leader"))
            } else {
                Ok(())
            }
        }
    }

    fn manager(
        tree: MemTree,
        pipeline: Arc<RecordingPipeline>,
        clock: ManualClock,
        config: ContainerConfig,
    ) -> ContainerManager {
        ContainerManager::new(Arc::new(tree), pipeline, Arc::new(clock), config)
    }

    fn submitted_paths(pipeline: &RecordingPipeline) -> Vec<String> {
        pipeline
            .submitted
            .lock()
            .unwrap()
            .iter()
            .map(|r| {
                assert_eq!(r.op, OpCode::DeleteContainer);
                r.path.clone()
            })
            .collect()
    }

    #[test]
    fn used_empty_container_is_deleted() {
        let tree = MemTree::default()
            .container("/app/job", 3, 1_000, &[])
            .container("/app/busy", 3, 1_000, &["child"]);
        let pipeline = Arc::new(RecordingPipeline::default());
        let manager = manager(
            tree,
            Arc::clone(&pipeline),
            ManualClock::at(10_000),
            ContainerConfig::default(),
        );

        manager.sweep();
        assert_eq!(submitted_paths(&pipeline), vec!["/app/job".to_string()]);
    }

    #[test]
    fn never_used_container_honors_grace_period() {
        let config = ContainerConfig {
            max_never_used_interval_ms: 5_000,
            ..ContainerConfig::default()
        };
        let tree = MemTree::default()
            .container("/fresh", 0, 8_000, &[])
            .container("/stale", 0, 1_000, &[]);
        let pipeline = Arc::new(RecordingPipeline::default());
        let manager = manager(tree, Arc::clone(&pipeline), ManualClock::at(10_000), config);

        manager.sweep();
        assert_eq!(submitted_paths(&pipeline), vec!["/stale".to_string()]);
    }

    #[test]
    fn never_used_rule_disabled_by_default() {
        let tree = MemTree::default().container("/stale", 0, 0, &[]);
        let pipeline = Arc::new(RecordingPipeline::default());
        let manager = manager(
            tree,
            Arc::clone(&pipeline),
            ManualClock::at(1_000_000),
            ContainerConfig::default(),
        );

        manager.sweep();
        assert!(submitted_paths(&pipeline).is_empty());
    }

    #[test]
    fn ttl_node_deleted_only_past_its_ttl() {
        let tree = MemTree::default()
            .ttl("/ttl/young", 30_000, 9_000, &[])
            .ttl("/ttl/expired", 3_000, 1_000, &[])
            .ttl("/ttl/busy", 3_000, 1_000, &["child"]);
        let pipeline = Arc::new(RecordingPipeline::default());
        let manager = manager(
            tree,
            Arc::clone(&pipeline),
            ManualClock::at(10_000),
            ContainerConfig::default(),
        );

        manager.sweep();
        assert_eq!(submitted_paths(&pipeline), vec!["/ttl/expired".to_string()]);
    }

    #[test]
    fn failed_submission_is_reconsidered_next_sweep() {
        let tree = MemTree::default().container("/app/job", 3, 1_000, &[]);
        let pipeline = Arc::new(RecordingPipeline {
            fail: true,
            ..RecordingPipeline::default()
        });
        let manager = manager(
            tree,
            Arc::clone(&pipeline),
            ManualClock::at(10_000),
            ContainerConfig::default(),
        );

        manager.sweep();
        manager.sweep();
        assert_eq!(
            submitted_paths(&pipeline),
            vec!["/app/job".to_string(), "/app/job".to_string()]
        );
    }

    #[test]
    fn stop_interrupts_the_inter_delete_pause() {
        let tree = MemTree::default()
            .container("/a", 3, 0, &[])
            .container("/b", 3, 0, &[]);
        let pipeline = Arc::new(RecordingPipeline::default());
        // One delete per minute: a full pause would hang the test
        let config = ContainerConfig {
            max_per_minute: 1,
            ..ContainerConfig::default()
        };
        let manager = manager(tree, Arc::clone(&pipeline), ManualClock::at(10_000), config);

        manager.stop();
        manager.sweep();
        assert_eq!(submitted_paths(&pipeline), vec!["/a".to_string()]);
    }

    #[test]
    fn delete_spacing_honors_the_per_minute_cap() {
        assert_eq!(delete_spacing_ms(1), 60_000);
        assert_eq!(delete_spacing_ms(60), 1_000);
        assert_eq!(delete_spacing_ms(10_000), 6);
        assert_eq!(delete_spacing_ms(0), 0);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let tree = MemTree::default();
        let pipeline = Arc::new(RecordingPipeline::default());
        let config = ContainerConfig {
            check_interval_ms: 3_600_000,
            ..ContainerConfig::default()
        };
        let manager = manager(tree, pipeline, ManualClock::at(0), config);

        manager.stop(); // never started: no effect

        manager.start();
        manager.start();

        manager.stop();
        manager.stop();
    }
}
