use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};

use super::{Build, Jobset};
use db::models::BuildID;
use store_utils::{Store, StorePath};

/// Lock-free timestamp for the runnable-since marker. Second precision is
/// plenty for wait-time accounting.
#[derive(Debug)]
pub struct AtomicDateTime {
    seconds: AtomicI64,
}

impl AtomicDateTime {
    fn new(dt: jiff::Timestamp) -> Self {
        Self {
            seconds: AtomicI64::new(dt.as_second()),
        }
    }

    pub fn load(&self) -> jiff::Timestamp {
        jiff::Timestamp::from_second(self.seconds.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn store(&self, dt: jiff::Timestamp) {
        self.seconds.store(dt.as_second(), Ordering::Relaxed);
    }
}

/// Deepest recipe chain the expander follows before giving up on the build.
/// Must stay small enough that the recursion fits a worker thread's stack.
pub const MAX_EXPANSION_DEPTH: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ExpandError {
    #[error("dependency chain of `{0}` exceeds the expansion depth limit")]
    DepthExceeded(StorePath),

    #[error(transparent)]
    Store(#[from] store_utils::Error),
}

#[derive(Debug)]
pub struct StepAtomicState {
    created: AtomicBool, // Whether the step has finished initialisation.
    pub highest_global_priority: AtomicI32, // The highest global priority of any build depending on this step.
    pub highest_local_priority: AtomicI32, // The highest local priority of any build depending on this step.
    pub lowest_build_id: AtomicI32, // The lowest ID of any build depending on this step.
    pub runnable_since: AtomicDateTime, // The time at which this step became runnable.
}

impl StepAtomicState {
    fn new() -> Self {
        Self {
            created: false.into(),
            highest_global_priority: 0.into(),
            highest_local_priority: 0.into(),
            lowest_build_id: BuildID::MAX.into(),
            runnable_since: AtomicDateTime::new(jiff::Timestamp::UNIX_EPOCH),
        }
    }

    #[inline]
    pub fn get_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_created(&self) {
        self.created.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct StepState {
    deps: HashSet<Arc<Step>>,      // The build steps on which this step depends.
    rdeps: Vec<Weak<Step>>,        // The build steps that depend on this step.
    builds: Vec<Weak<Build>>,      // Builds that have this step as the top-level derivation.
    jobsets: HashSet<Arc<Jobset>>, // Jobsets to which this step belongs. Used for scheduling priority.
}

#[derive(Debug)]
pub struct Step {
    drv_path: StorePath,
    drv: arc_swap::ArcSwapOption<store_utils::Derivation>,

    prefer_local_build: AtomicBool,
    runnable: AtomicBool,
    pub atomic_state: StepAtomicState,
    state: parking_lot::RwLock<StepState>,
}

impl PartialEq for Step {
    fn eq(&self, other: &Self) -> bool {
        self.drv_path == other.drv_path
    }
}

impl Eq for Step {}

impl std::hash::Hash for Step {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // drv_path is never mutated after construction
        self.drv_path.hash(state);
    }
}

impl Step {
    #[must_use]
    fn new(drv_path: StorePath) -> Arc<Self> {
        Arc::new(Self {
            drv_path,
            drv: arc_swap::ArcSwapOption::from(None),
            prefer_local_build: false.into(),
            runnable: false.into(),
            atomic_state: StepAtomicState::new(),
            state: parking_lot::RwLock::new(StepState::default()),
        })
    }

    #[inline]
    pub const fn get_drv_path(&self) -> &StorePath {
        &self.drv_path
    }

    fn set_drv(&self, drv: store_utils::Derivation) {
        self.drv.store(Some(Arc::new(drv)));
    }

    pub fn get_platform(&self) -> Option<String> {
        let drv = self.drv.load_full();
        drv.as_ref().map(|drv| drv.platform.clone())
    }

    pub fn get_input_drvs(&self) -> Vec<StorePath> {
        let drv = self.drv.load_full();
        drv.as_ref()
            .map(|drv| drv.input_drvs.to_vec())
            .unwrap_or_default()
    }

    pub fn get_outputs(&self) -> Vec<store_utils::DerivationOutput> {
        let drv = self.drv.load_full();
        drv.as_ref()
            .map(|drv| drv.outputs.to_vec())
            .unwrap_or_default()
    }

    pub fn get_required_features(&self) -> Vec<String> {
        let drv = self.drv.load_full();
        drv.as_ref()
            .map(|drv| {
                drv.env
                    .get_required_system_features()
                    .into_iter()
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    #[inline]
    pub fn get_prefer_local_build(&self) -> bool {
        self.prefer_local_build.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_prefer_local_build(&self, v: bool) {
        self.prefer_local_build.store(v, Ordering::SeqCst);
    }

    #[inline]
    pub fn get_runnable(&self) -> bool {
        self.runnable.load(Ordering::SeqCst)
    }

    /// Publish the step to the builder pool. A step is runnable iff it is
    /// created and has no remaining dependencies; it is published at most
    /// once.
    #[tracing::instrument(skip(self))]
    pub fn make_runnable(&self) {
        debug_assert!(self.atomic_state.get_created());
        #[cfg(debug_assertions)]
        {
            let state = self.state.read();
            debug_assert!(state.deps.is_empty());
        }

        if !self.runnable.swap(true, Ordering::SeqCst) {
            tracing::info!("step '{}' is now runnable", self.get_drv_path());
            self.atomic_state.runnable_since.store(jiff::Timestamp::now());
        }
    }

    fn add_dep(&self, dep: Arc<Self>) {
        debug_assert!(!self.atomic_state.get_created());
        let mut state = self.state.write();
        state.deps.insert(dep);
    }

    /// Freeze the dependency set. Returns whether the step is immediately
    /// runnable (no dependencies left to build).
    fn mark_created(&self) -> bool {
        let state = self.state.read();
        debug_assert!(!self.atomic_state.get_created());
        self.atomic_state.set_created();
        state.deps.is_empty()
    }

    fn add_referring_data(
        &self,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Self>>,
    ) {
        if referring_build.is_none() && referring_step.is_none() {
            return;
        }

        let mut state = self.state.write();
        if let Some(referring_build) = referring_build {
            state.builds.push(Arc::downgrade(referring_build));
        }
        if let Some(referring_step) = referring_step {
            state.rdeps.push(Arc::downgrade(referring_step));
        }
    }

    pub fn add_jobset(&self, jobset: Arc<Jobset>) {
        let mut state = self.state.write();
        state.jobsets.insert(jobset);
    }

    pub fn get_direct_builds(&self) -> Vec<Arc<Build>> {
        let state = self.state.read();
        state
            .builds
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|b| !b.get_finished_in_db())
            .collect()
    }

    pub fn get_all_deps_not_queued(&self, queued: &HashSet<Arc<Self>>) -> Vec<Arc<Self>> {
        let state = self.state.read();
        state
            .deps
            .iter()
            .filter(|dep| !queued.contains(*dep))
            .map(Clone::clone)
            .collect()
    }

    pub fn get_deps(&self) -> Vec<Arc<Self>> {
        let state = self.state.read();
        state.deps.iter().map(Clone::clone).collect()
    }

    pub fn get_rdeps(&self) -> Vec<Arc<Self>> {
        let state = self.state.read();
        state.rdeps.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn has_jobset(&self, jobset: &Arc<Jobset>) -> bool {
        let state = self.state.read();
        state.jobsets.contains(jobset)
    }
}

/// The shared step graph: one entry per derivation path, holding non-owning
/// handles. Strong ownership flows from `Build::toplevel` and each step's
/// `deps` edges, so a step disappears once no live build or reverse
/// dependency reaches it; lookups sweep the stale entries left behind.
#[derive(Clone)]
pub struct Steps {
    inner: Arc<parking_lot::RwLock<HashMap<StorePath, Weak<Step>>>>,
}

impl Default for Steps {
    fn default() -> Self {
        Self::new()
    }
}

impl Steps {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(10000))),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let mut steps = self.inner.write();
        steps.retain(|_, s| s.upgrade().is_some());
        steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, drv_path: &StorePath) -> Option<Arc<Step>> {
        let steps = self.inner.read();
        steps.get(drv_path).and_then(Weak::upgrade)
    }

    /// Snapshot of the runnable steps, for the builder pool.
    #[must_use]
    pub fn clone_runnable(&self) -> Vec<Arc<Step>> {
        let mut steps = self.inner.write();
        let mut runnable = Vec::with_capacity(steps.len());
        steps.retain(|_, r| {
            let Some(step) = r.upgrade() else {
                return false;
            };
            if step.get_runnable() {
                runnable.push(step);
            }
            true
        });
        runnable
    }

    /// Look up or allocate the step for `drv_path` and link it to the
    /// referring build or step, atomically with respect to the graph lock so
    /// the step cannot be dropped between lookup and linking.
    fn create(
        &self,
        drv_path: &StorePath,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Step>>,
    ) -> (Arc<Step>, bool) {
        let mut is_new = false;
        let mut steps = self.inner.write();
        let step = if let Some(prev) = steps.get(drv_path) {
            prev.upgrade().map_or_else(
                || {
                    // stale entry
                    steps.remove(drv_path);
                    is_new = true;
                    Step::new(drv_path.to_owned())
                },
                |step| step,
            )
        } else {
            is_new = true;
            Step::new(drv_path.to_owned())
        };

        // A freshly allocated step is not created yet; a found one must be.
        // Holds because only the queue monitor task inserts into the graph.
        debug_assert!(step.atomic_state.get_created() != is_new);

        step.add_referring_data(referring_build, referring_step);
        steps.insert(drv_path.to_owned(), Arc::downgrade(&step));
        (step, is_new)
    }

    /// Materialize the step for `drv_path` and, recursively, its input
    /// recipes. Returns `None` when every output is already valid (the
    /// result is memoized in `finished_drvs` for this loader call).
    #[allow(clippy::too_many_arguments)]
    pub fn expand(
        &self,
        store: &dyn Store,
        local_platforms: &[String],
        drv_path: &StorePath,
        referring_build: Option<&Arc<Build>>,
        referring_step: Option<&Arc<Step>>,
        finished_drvs: &mut HashSet<StorePath>,
        new_steps: &mut HashSet<Arc<Step>>,
        new_runnable: &mut HashSet<Arc<Step>>,
        depth: usize,
    ) -> Result<Option<Arc<Step>>, ExpandError> {
        if depth >= MAX_EXPANSION_DEPTH {
            return Err(ExpandError::DepthExceeded(drv_path.clone()));
        }
        if finished_drvs.contains(drv_path) {
            return Ok(None);
        }

        let (step, is_new) = self.create(drv_path, referring_build, referring_step);
        if !is_new {
            // The sub-DAG below this step is already materialized (or being
            // materialized further up the call stack).
            return Ok(Some(step));
        }

        tracing::debug!("considering derivation '{drv_path}'");

        // The step is visible in the graph from here on, but created is
        // still false, so nothing treats it as runnable yet.
        let drv = store.read_derivation(drv_path)?;
        step.set_prefer_local_build(
            drv.env.get_prefer_local_build() && local_platforms.contains(&drv.platform),
        );
        let valid = drv
            .outputs
            .iter()
            .all(|o| store.is_valid_path(&o.path));
        step.set_drv(drv);

        if valid {
            finished_drvs.insert(drv_path.clone());
            return Ok(None);
        }

        tracing::debug!("creating build step '{drv_path}'");
        new_steps.insert(step.clone());

        for input in step.get_input_drvs() {
            let dep = self.expand(
                store,
                local_platforms,
                &input,
                None,
                Some(&step),
                finished_drvs,
                new_steps,
                new_runnable,
                depth + 1,
            )?;
            if let Some(dep) = dep {
                step.add_dep(dep);
            }
        }

        if step.mark_created() {
            new_runnable.insert(step.clone());
        }

        Ok(Some(step))
    }
}


#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::testing::{MemStore, mk_build, mk_drv};
    use super::*;

    fn expand_for_build(
        steps: &Steps,
        store: &MemStore,
        build: &Arc<Build>,
        new_runnable: &mut HashSet<Arc<Step>>,
    ) -> Result<(Option<Arc<Step>>, HashSet<Arc<Step>>), ExpandError> {
        let mut finished_drvs = HashSet::new();
        let mut new_steps = HashSet::new();
        let top = steps.expand(
            store,
            &[],
            &build.drv_path,
            Some(build),
            None,
            &mut finished_drvs,
            &mut new_steps,
            new_runnable,
            0,
        )?;
        Ok((top, new_steps))
    }

    #[test]
    fn test_single_build_without_deps() {
        let store = MemStore::new();
        store.add_drv(mk_drv("/d/a.drv", &[], &[("out", "/d/a-out")], &[]));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut new_runnable = HashSet::new();
        let (top, new_steps) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();

        let top = top.unwrap();
        assert_eq!(new_steps.len(), 1);
        assert_eq!(new_runnable.len(), 1);
        assert!(new_runnable.contains(&top));
        assert!(top.atomic_state.get_created());
        assert_eq!(top.get_direct_builds().len(), 1);
        assert_eq!(steps.len(), 1);
    }

    #[test]
    fn test_dependency_chain() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &["/d/b.drv"],
            &[("out", "/d/a-out")],
            &[],
        ));
        store.add_drv(mk_drv("/d/b.drv", &[], &[("out", "/d/b-out")], &[]));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 10, 0);
        let mut new_runnable = HashSet::new();
        let (top, new_steps) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();

        let a = top.unwrap();
        let b = steps.get(&StorePath::new("/d/b.drv")).unwrap();
        assert_eq!(new_steps.len(), 2);

        // only the leaf is runnable
        assert_eq!(new_runnable.len(), 1);
        assert!(new_runnable.contains(&b));

        assert_eq!(a.get_deps(), vec![b.clone()]);
        assert_eq!(b.get_rdeps(), vec![a.clone()]);
        assert_eq!(a.get_direct_builds().len(), 1);
        assert!(b.get_direct_builds().is_empty());

        build.set_toplevel_step(a.clone());
        build.propagate_priorities();
        for s in [&a, &b] {
            assert_eq!(
                s.atomic_state.highest_global_priority.load(Ordering::Relaxed),
                10
            );
            assert_eq!(s.atomic_state.lowest_build_id.load(Ordering::Relaxed), 1);
            assert!(s.has_jobset(&build.jobset));
        }
    }

    #[test]
    fn test_clone_runnable_snapshots_published_steps() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &["/d/b.drv"],
            &[("out", "/d/a-out")],
            &[],
        ));
        store.add_drv(mk_drv("/d/b.drv", &[], &[("out", "/d/b-out")], &[]));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut new_runnable = HashSet::new();
        let (top, _) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();
        let a = top.unwrap();
        let b = steps.get(&StorePath::new("/d/b.drv")).unwrap();

        // nothing published yet
        assert!(steps.clone_runnable().is_empty());

        for r in &new_runnable {
            r.make_runnable();
        }

        // the builder pool sees exactly the published leaf
        let runnable = steps.clone_runnable();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0], b);
        assert!(b.get_runnable());
        assert!(!a.get_runnable());
        assert!(b.atomic_state.runnable_since.load() > jiff::Timestamp::UNIX_EPOCH);

        // publishing is sticky and happens at most once
        let since = b.atomic_state.runnable_since.load();
        b.make_runnable();
        assert_eq!(b.atomic_state.runnable_since.load(), since);
    }

    #[test]
    fn test_shared_dependency_is_one_step() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &["/d/b.drv"],
            &[("out", "/d/a-out")],
            &[],
        ));
        store.add_drv(mk_drv(
            "/d/c.drv",
            &["/d/b.drv"],
            &[("out", "/d/c-out")],
            &[],
        ));
        store.add_drv(mk_drv("/d/b.drv", &[], &[("out", "/d/b-out")], &[]));

        let steps = Steps::new();
        // globalPriority DESC order: build 2 first, then build 1
        let build2 = mk_build(2, "/d/c.drv", 7, 0);
        let build1 = mk_build(1, "/d/a.drv", 5, 0);

        let mut new_runnable = HashSet::new();
        let (top2, _) = expand_for_build(&steps, &store, &build2, &mut new_runnable).unwrap();
        let (top1, new_steps1) = expand_for_build(&steps, &store, &build1, &mut new_runnable).unwrap();

        let c = top2.unwrap();
        let a = top1.unwrap();
        let b = steps.get(&StorePath::new("/d/b.drv")).unwrap();

        // the second expansion only added its own top-level step
        assert_eq!(new_steps1.len(), 1);
        assert_eq!(steps.len(), 3);
        assert!(b.get_direct_builds().is_empty());
        let rdeps = b.get_rdeps();
        assert_eq!(rdeps.len(), 2);
        assert!(rdeps.contains(&a));
        assert!(rdeps.contains(&c));

        build2.set_toplevel_step(c);
        build2.propagate_priorities();
        build1.set_toplevel_step(a);
        build1.propagate_priorities();

        assert_eq!(
            b.atomic_state.highest_global_priority.load(Ordering::Relaxed),
            7
        );
        assert_eq!(b.atomic_state.lowest_build_id.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_valid_outputs_are_memoized() {
        let store = MemStore::new();
        store.add_drv(mk_drv("/d/a.drv", &[], &[("out", "/d/a-out")], &[]));
        store.add_valid("/d/a-out");

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut finished_drvs = HashSet::new();
        let mut new_steps = HashSet::new();
        let mut new_runnable = HashSet::new();

        let top = steps
            .expand(
                &store,
                &[],
                &build.drv_path,
                Some(&build),
                None,
                &mut finished_drvs,
                &mut new_steps,
                &mut new_runnable,
                0,
            )
            .unwrap();
        assert!(top.is_none());
        assert!(finished_drvs.contains(&build.drv_path));
        assert!(new_steps.is_empty());
        assert!(new_runnable.is_empty());
        // the allocation left no live graph entry behind
        assert_eq!(steps.len(), 0);

        // memoized: a second call short-circuits without touching the store
        let top = steps
            .expand(
                &store,
                &[],
                &build.drv_path,
                Some(&build),
                None,
                &mut finished_drvs,
                &mut new_steps,
                &mut new_runnable,
                0,
            )
            .unwrap();
        assert!(top.is_none());
    }

    #[test]
    fn test_expanding_twice_is_idempotent() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &["/d/b.drv"],
            &[("out", "/d/a-out")],
            &[],
        ));
        store.add_drv(mk_drv("/d/b.drv", &[], &[("out", "/d/b-out")], &[]));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut new_runnable = HashSet::new();
        let (first, _) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();
        let (second, new_steps2) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();

        // same shared node, nothing new materialized
        assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
        assert!(new_steps2.is_empty());
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_stale_entry_is_swept() {
        let store = MemStore::new();
        store.add_drv(mk_drv("/d/a.drv", &[], &[("out", "/d/a-out")], &[]));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut new_runnable = HashSet::new();
        {
            let (top, _) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();
            assert!(top.is_some());
        }
        new_runnable.clear();

        // all strong references are gone; the next expansion allocates anew
        assert_eq!(steps.len(), 0);
        let (top, new_steps) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();
        assert!(top.is_some());
        assert_eq!(new_steps.len(), 1);
    }

    #[test]
    fn test_prefer_local_build_requires_local_platform() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &[],
            &[("out", "/d/a-out")],
            &[("preferLocalBuild", "1")],
        ));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut finished_drvs = HashSet::new();
        let mut new_steps = HashSet::new();
        let mut new_runnable = HashSet::new();

        let top = steps
            .expand(
                &store,
                &["x86_64-linux".to_owned()],
                &build.drv_path,
                Some(&build),
                None,
                &mut finished_drvs,
                &mut new_steps,
                &mut new_runnable,
                0,
            )
            .unwrap()
            .unwrap();
        assert!(top.get_prefer_local_build());

        // same recipe, but the platform is not local
        let steps = Steps::new();
        let top = steps
            .expand(
                &store,
                &["aarch64-darwin".to_owned()],
                &build.drv_path,
                Some(&build),
                None,
                &mut HashSet::new(),
                &mut HashSet::new(),
                &mut HashSet::new(),
                0,
            )
            .unwrap()
            .unwrap();
        assert!(!top.get_prefer_local_build());
    }

    #[test]
    fn test_required_features_are_tokenized() {
        let store = MemStore::new();
        store.add_drv(mk_drv(
            "/d/a.drv",
            &[],
            &[("out", "/d/a-out")],
            &[("requiredSystemFeatures", "kvm  big-parallel")],
        ));

        let steps = Steps::new();
        let build = mk_build(1, "/d/a.drv", 0, 0);
        let mut new_runnable = HashSet::new();
        let (top, _) = expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap();
        assert_eq!(
            top.unwrap().get_required_features(),
            vec!["kvm".to_owned(), "big-parallel".to_owned()]
        );
    }

    #[test]
    fn test_expansion_depth_is_bounded() {
        // the recursion is deliberately deep, give it room
        std::thread::Builder::new()
            .stack_size(32 * 1024 * 1024)
            .spawn(|| {
                let store = MemStore::new();
                let n = MAX_EXPANSION_DEPTH + 4;
                for i in 0..n {
                    let path = format!("/d/chain-{i}.drv");
                    let out = format!("/d/chain-{i}-out");
                    let next = format!("/d/chain-{}.drv", i + 1);
                    let inputs: Vec<&str> =
                        if i + 1 < n { vec![next.as_str()] } else { vec![] };
                    store.add_drv(mk_drv(&path, &inputs, &[("out", &out)], &[]));
                }

                let steps = Steps::new();
                let build = mk_build(1, "/d/chain-0.drv", 0, 0);
                let mut new_runnable = HashSet::new();
                let err =
                    expand_for_build(&steps, &store, &build, &mut new_runnable).unwrap_err();
                assert!(matches!(err, ExpandError::DepthExceeded(_)));
            })
            .unwrap()
            .join()
            .unwrap();
    }
}
