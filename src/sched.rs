//! Cooperative tasklet scheduler.
//!
//! A scheduler is one OS thread running a list of tasklets to completion
//! in a tight loop — no preemption, no hidden suspension. Handlers must
//! never block; an empty iteration yields the CPU briefly so an idle
//! scheduler does not spin at 100%.
//!
//! Each scheduler carries a bandwidth quota in Mbps. Session registration
//! declares its load; when a scheduler's quota is exhausted the manager
//! spawns the next one. Stop is cooperative: every handler observes the
//! stop flag within one iteration and runs its `stop` hook.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::Result;
use crate::stats::Counter;

/// What a handler iteration accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskletTick {
    /// Work was done; poll again immediately.
    Busy,
    /// Nothing to do right now.
    Idle,
    /// The tasklet is finished and should be removed.
    Done,
}

/// A cooperatively scheduled unit.
pub trait Tasklet: Send {
    fn name(&self) -> &str {
        "tasklet"
    }

    /// Called once on the scheduler thread before the first iteration.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// One non-blocking iteration.
    fn handler(&mut self) -> TaskletTick;

    /// Called once on the scheduler thread during shutdown.
    fn stop(&mut self) {}
}

struct SchedShared {
    name: String,
    stop: AtomicBool,
    incoming: Mutex<Vec<Box<dyn Tasklet>>>,
    stat_iterations: Counter,
}

/// One scheduler thread.
pub struct Scheduler {
    shared: Arc<SchedShared>,
    thread: Option<JoinHandle<()>>,
    quota_mbps: u32,
    used_mbps: AtomicU32,
}

impl Scheduler {
    pub fn new(name: &str, quota_mbps: u32) -> Scheduler {
        let shared = Arc::new(SchedShared {
            name: name.to_string(),
            stop: AtomicBool::new(false),
            incoming: Mutex::new(Vec::new()),
            stat_iterations: Counter::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(thread_shared))
            .expect("spawn scheduler thread");
        tracing::info!(name, quota_mbps, "scheduler started");
        Scheduler {
            shared,
            thread: Some(thread),
            quota_mbps,
            used_mbps: AtomicU32::new(0),
        }
    }

    /// Remaining bandwidth quota.
    pub fn available_mbps(&self) -> u32 {
        self.quota_mbps
            .saturating_sub(self.used_mbps.load(Ordering::Relaxed))
    }

    /// Hand a tasklet to this scheduler, accounting `mbps` against the
    /// quota. The tasklet starts on the scheduler thread.
    pub fn add(&self, tasklet: Box<dyn Tasklet>, mbps: u32) {
        self.used_mbps.fetch_add(mbps, Ordering::Relaxed);
        tracing::debug!(
            scheduler = %self.shared.name,
            tasklet = tasklet.name(),
            mbps,
            "tasklet registered"
        );
        self.shared.incoming.lock().push(tasklet);
    }

    /// Signal stop and join the thread.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: Arc<SchedShared>) {
    let mut tasklets: Vec<Box<dyn Tasklet>> = Vec::new();
    loop {
        // adopt newly registered tasklets
        {
            let mut incoming = shared.incoming.lock();
            for mut t in incoming.drain(..) {
                match t.start() {
                    Ok(()) => tasklets.push(t),
                    Err(e) => {
                        tracing::error!(tasklet = t.name(), error = %e, "tasklet start failed");
                    }
                }
            }
        }

        if shared.stop.load(Ordering::Acquire) {
            for t in &mut tasklets {
                t.stop();
            }
            tracing::info!(scheduler = %shared.name, "scheduler stopped");
            return;
        }

        let mut any_busy = false;
        tasklets.retain_mut(|t| match t.handler() {
            TaskletTick::Busy => {
                any_busy = true;
                true
            }
            TaskletTick::Idle => true,
            TaskletTick::Done => {
                t.stop();
                false
            }
        });
        shared.stat_iterations.inc();

        if !any_busy {
            // idle: give the core back without leaving the run queue
            std::thread::yield_now();
        }
    }
}

/// Quota-driven pool of schedulers.
pub struct SchedulerPool {
    schedulers: Mutex<Vec<Arc<Scheduler>>>,
    quota_mbps: u32,
}

impl SchedulerPool {
    pub fn new(quota_mbps: u32) -> SchedulerPool {
        SchedulerPool {
            schedulers: Mutex::new(Vec::new()),
            quota_mbps: quota_mbps.max(1),
        }
    }

    /// Place a tasklet on the first scheduler with room, spawning a new
    /// scheduler when every existing one is at quota.
    pub fn register(&self, tasklet: Box<dyn Tasklet>, mbps: u32) -> Arc<Scheduler> {
        let mut schedulers = self.schedulers.lock();
        if let Some(sch) = schedulers.iter().find(|s| s.available_mbps() >= mbps) {
            sch.add(tasklet, mbps);
            return sch.clone();
        }
        let name = format!("mt-sch-{}", schedulers.len());
        let sch = Arc::new(Scheduler::new(&name, self.quota_mbps));
        sch.add(tasklet, mbps);
        schedulers.push(sch.clone());
        sch
    }

    pub fn len(&self) -> usize {
        self.schedulers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.schedulers.lock().is_empty()
    }

    pub fn shutdown(&self) {
        let schedulers = std::mem::take(&mut *self.schedulers.lock());
        for sch in schedulers {
            if let Ok(mut sch) = Arc::try_unwrap(sch) {
                sch.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingTasklet {
        hits: Arc<AtomicUsize>,
        stopped: Arc<AtomicBool>,
        limit: usize,
    }

    impl Tasklet for CountingTasklet {
        fn name(&self) -> &str {
            "counting"
        }

        fn handler(&mut self) -> TaskletTick {
            let n = self.hits.fetch_add(1, Ordering::SeqCst);
            if n + 1 >= self.limit {
                TaskletTick::Done
            } else {
                TaskletTick::Busy
            }
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !cond() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(cond(), "condition not reached in time");
    }

    #[test]
    fn tasklet_runs_until_done_then_stops() {
        let hits = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut sch = Scheduler::new("test-sch", 1000);
        sch.add(
            Box::new(CountingTasklet {
                hits: hits.clone(),
                stopped: stopped.clone(),
                limit: 100,
            }),
            10,
        );
        wait_for(|| hits.load(Ordering::SeqCst) >= 100);
        assert!(stopped.load(Ordering::SeqCst), "Done must run stop hook");
        sch.shutdown();
    }

    #[test]
    fn shutdown_stops_running_tasklets() {
        let hits = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut sch = Scheduler::new("test-sch2", 1000);
        sch.add(
            Box::new(CountingTasklet {
                hits: hits.clone(),
                stopped: stopped.clone(),
                limit: usize::MAX,
            }),
            10,
        );
        wait_for(|| hits.load(Ordering::SeqCst) > 0);
        sch.shutdown();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn pool_spawns_on_quota_exhaustion() {
        let pool = SchedulerPool::new(100);
        let hits = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        let make = || {
            Box::new(CountingTasklet {
                hits: hits.clone(),
                stopped: stopped.clone(),
                limit: 1,
            })
        };
        pool.register(make(), 60);
        assert_eq!(pool.len(), 1);
        // 60 + 60 > 100: needs a second scheduler
        pool.register(make(), 60);
        assert_eq!(pool.len(), 2);
        // 30 fits the first scheduler's remaining 40
        pool.register(make(), 30);
        assert_eq!(pool.len(), 2);
        pool.shutdown();
    }
}
