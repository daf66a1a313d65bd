use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use hashbrown::HashMap;

/// Time horizon over which recent step durations inform fair-share
/// scheduling. History is preloaded over ten times this window.
pub const SCHEDULING_WINDOW: i64 = 60 * 60;

#[derive(Debug)]
pub struct Jobset {
    pub project_name: String,
    pub name: String,

    seconds: AtomicI64,
    shares: AtomicU32,
    // The start time and duration of the most recent build steps.
    steps: parking_lot::RwLock<BTreeMap<i64, i64>>,
}

impl PartialEq for Jobset {
    fn eq(&self, other: &Self) -> bool {
        self.project_name == other.project_name && self.name == other.name
    }
}

impl Eq for Jobset {}

impl std::hash::Hash for Jobset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.project_name.hash(state);
        self.name.hash(state);
    }
}

impl Jobset {
    pub fn new<S: Into<String>>(project_name: S, name: S) -> Self {
        Self {
            project_name: project_name.into(),
            name: name.into(),
            seconds: 0.into(),
            shares: 1.into(),
            steps: parking_lot::RwLock::new(BTreeMap::new()),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}:{}", self.project_name, self.name)
    }

    /// Fraction of the jobset's share consumed inside the scheduling window.
    pub fn share_used(&self) -> f64 {
        let seconds = self.seconds.load(Ordering::Relaxed);
        let shares = self.shares.load(Ordering::Relaxed);

        #[allow(clippy::cast_precision_loss)]
        ((seconds as f64) / f64::from(shares))
    }

    /// A share count of 0 in the database means "no weight configured";
    /// coerce it to 1 so `share_used` stays finite.
    pub fn set_shares(&self, shares: i32) {
        let shares = u32::try_from(shares).unwrap_or(0).max(1);
        self.shares.store(shares, Ordering::Relaxed);
    }

    pub fn get_shares(&self) -> u32 {
        self.shares.load(Ordering::Relaxed)
    }

    pub fn get_seconds(&self) -> i64 {
        self.seconds.load(Ordering::Relaxed)
    }

    pub fn add_step(&self, start_time: i64, duration: i64) {
        self.steps.write().insert(start_time, duration);
        self.seconds.fetch_add(duration, Ordering::Relaxed);
    }

    /// Drop history records that have aged out of the scheduling window.
    pub fn prune_steps(&self) {
        let now = jiff::Timestamp::now().as_second();
        let mut steps = self.steps.write();

        loop {
            let Some(first) = steps.first_entry() else {
                break;
            };
            let start_time = *first.key();

            if start_time > now - SCHEDULING_WINDOW {
                break;
            }
            self.seconds.fetch_sub(*first.get(), Ordering::Relaxed);
            steps.remove(&start_time);
        }
    }
}

// Projectname, Jobsetname
type JobsetName = (String, String);

#[derive(Clone)]
pub struct Jobsets {
    inner: Arc<parking_lot::RwLock<HashMap<JobsetName, Arc<Jobset>>>>,
}

impl Default for Jobsets {
    fn default() -> Self {
        Self::new()
    }
}

impl Jobsets {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(parking_lot::RwLock::new(HashMap::with_capacity(100))),
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

    #[tracing::instrument(skip(self))]
    pub fn prune(&self) {
        let jobsets = self.inner.read();
        for ((project_name, jobset_name), jobset) in jobsets.iter() {
            let s1 = jobset.share_used();
            jobset.prune_steps();
            let s2 = jobset.share_used();
            if (s1 - s2).abs() > f64::EPSILON {
                tracing::debug!(
                    "pruned scheduling window of '{project_name}:{jobset_name}' from {s1} to {s2}"
                );
            }
        }
    }

    /// Memoized lookup. The first access reads the scheduling shares and
    /// preloads the step history of the last `10 × SCHEDULING_WINDOW`
    /// seconds; a missing row is an invariant violation the operator has to
    /// repair, so it fails the current build load.
    #[tracing::instrument(skip(self, conn), err)]
    pub async fn create(
        &self,
        conn: &mut db::Connection,
        project_name: &str,
        jobset_name: &str,
    ) -> anyhow::Result<Arc<Jobset>> {
        let key = (project_name.to_owned(), jobset_name.to_owned());
        {
            let jobsets = self.inner.read();
            if let Some(jobset) = jobsets.get(&key) {
                return Ok(jobset.clone());
            }
        }

        let shares = conn
            .get_jobset_scheduling_shares(project_name, jobset_name)
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing jobset {project_name}:{jobset_name}"))?;
        let jobset = Jobset::new(project_name, jobset_name);
        jobset.set_shares(shares);

        let since = jiff::Timestamp::now().as_second() - SCHEDULING_WINDOW * 10;
        for step in conn
            .get_jobset_build_steps(project_name, jobset_name, since)
            .await?
        {
            let Some(starttime) = step.starttime else {
                continue;
            };
            let Some(stoptime) = step.stoptime else {
                continue;
            };
            jobset.add_step(i64::from(starttime), i64::from(stoptime - starttime));
        }

        let jobset = Arc::new(jobset);
        {
            let mut jobsets = self.inner.write();
            jobsets.insert(key, jobset.clone());
        }

        Ok(jobset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shares_are_coerced_to_at_least_one() {
        let jobset = Jobset::new("p", "j");
        jobset.set_shares(0);
        assert_eq!(jobset.get_shares(), 1);
        jobset.set_shares(-5);
        assert_eq!(jobset.get_shares(), 1);
        jobset.set_shares(100);
        assert_eq!(jobset.get_shares(), 100);
    }

    #[test]
    fn test_share_used_accounts_recorded_steps() {
        let jobset = Jobset::new("p", "j");
        jobset.set_shares(4);
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now - 10, 60);
        jobset.add_step(now - 5, 40);

        assert_eq!(jobset.get_seconds(), 100);
        assert!((jobset.share_used() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prune_drops_aged_out_steps() {
        let jobset = Jobset::new("p", "j");
        let now = jiff::Timestamp::now().as_second();
        jobset.add_step(now - SCHEDULING_WINDOW * 2, 500);
        jobset.add_step(now - 10, 30);

        jobset.prune_steps();
        assert_eq!(jobset.get_seconds(), 30);

        // nothing left to prune
        jobset.prune_steps();
        assert_eq!(jobset.get_seconds(), 30);
    }

    #[test]
    fn test_full_name() {
        let jobset = Jobset::new("proj", "nightly");
        assert_eq!(jobset.full_name(), "proj:nightly");
    }
}
