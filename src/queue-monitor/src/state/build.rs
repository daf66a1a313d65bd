use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use hashbrown::{HashMap, HashSet};

use super::{Jobset, Step};
use db::models::BuildID;
use store_utils::StorePath;

#[derive(Debug)]
pub struct Build {
    pub id: BuildID,
    pub drv_path: StorePath,
    pub project_name: String,
    pub jobset_name: String,
    pub job_name: String,
    pub timestamp: jiff::Timestamp,
    pub max_silent_time: i32,
    pub timeout: i32,
    pub local_priority: i32,
    pub global_priority: AtomicI32,

    toplevel: arc_swap::ArcSwapOption<Step>,
    pub jobset: Arc<Jobset>,

    finished_in_db: AtomicBool,
}

impl Build {
    #[tracing::instrument(skip(v, jobset), err)]
    pub fn new(v: db::models::Build, jobset: Arc<Jobset>) -> anyhow::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            id: v.id,
            drv_path: StorePath::new(&v.drvpath),
            project_name: v.project,
            jobset_name: v.jobset,
            job_name: v.job,
            timestamp: jiff::Timestamp::from_second(v.timestamp)?,
            max_silent_time: v.maxsilent.unwrap_or(3600),
            timeout: v.timeout.unwrap_or(36000),
            local_priority: v.priority,
            global_priority: v.globalpriority.into(),
            toplevel: arc_swap::ArcSwapOption::from(None),
            jobset,
            finished_in_db: false.into(),
        }))
    }

    #[inline]
    pub fn full_job_name(&self) -> String {
        format!(
            "{}:{}:{}",
            self.project_name, self.jobset_name, self.job_name
        )
    }

    #[inline]
    pub fn get_finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_finished_in_db(&self, v: bool) {
        self.finished_in_db.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn set_toplevel_step(&self, step: Arc<Step>) {
        self.toplevel.store(Some(step));
    }

    #[inline]
    pub fn get_toplevel_step(&self) -> Option<Arc<Step>> {
        self.toplevel.load_full()
    }

    /// Push this build's priorities and id down to every reachable step, so
    /// the dispatcher starts steps in descending global priority and
    /// ascending build id. The updates are monotonic (max/min/set-union),
    /// which makes the traversal idempotent and safe to interleave.
    pub fn propagate_priorities(&self) {
        let mut queued = HashSet::new();
        let mut todo = std::collections::VecDeque::new();
        if let Some(toplevel) = self.toplevel.load().as_ref() {
            todo.push_back(toplevel.clone());
        }

        while let Some(step) = todo.pop_front() {
            step.atomic_state.highest_global_priority.fetch_max(
                self.global_priority.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            step.atomic_state
                .highest_local_priority
                .fetch_max(self.local_priority, Ordering::Relaxed);
            step.atomic_state
                .lowest_build_id
                .fetch_min(self.id, Ordering::Relaxed);
            step.add_jobset(self.jobset.clone());

            for dep in step.get_all_deps_not_queued(&queued) {
                queued.insert(dep.clone());
                todo.push_back(dep);
            }
        }
    }
}

/// Registry of admitted builds, keyed by id.
#[derive(Clone)]
pub struct Builds {
    inner: Arc<parking_lot::RwLock<HashMap<BuildID, Arc<Build>>>>,
}

impl Default for Builds {
    fn default() -> Self {
        Self::new()
    }
}

impl Builds {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(1000))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    #[must_use]
    pub fn has(&self, id: BuildID) -> bool {
        self.inner.read().contains_key(&id)
    }

    #[must_use]
    pub fn get(&self, id: BuildID) -> Option<Arc<Build>> {
        self.inner.read().get(&id).cloned()
    }

    pub fn insert(&self, build: Arc<Build>) {
        let mut builds = self.inner.write();
        builds.insert(build.id, build);
    }

    /// Reconcile the registry against a fresh db snapshot: drop builds that
    /// vanished from the queue and re-propagate bumped global priorities.
    pub fn update_priorities(&self, curr_ids: &HashMap<BuildID, i32>) {
        let mut builds = self.inner.write();
        builds.retain(|id, _| {
            if curr_ids.contains_key(id) {
                true
            } else {
                tracing::info!("discarding cancelled build {id}");
                // in-flight steps of the build keep running to completion
                false
            }
        });
        for (id, build) in builds.iter() {
            let Some(new_priority) = curr_ids.get(id) else {
                continue;
            };

            if build.global_priority.load(Ordering::Relaxed) < *new_priority {
                tracing::info!("priority of build {id} increased");
                build
                    .global_priority
                    .store(*new_priority, Ordering::Relaxed);
                build.propagate_priorities();
            }
        }
    }
}
