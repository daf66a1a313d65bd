mod build;
mod jobset;
mod machine;
mod metrics;
pub mod step;

pub use build::{Build, Builds};
pub use jobset::{Jobset, Jobsets, SCHEDULING_WINDOW};
pub use machine::{Machine, Machines};
pub use metrics::PromMetrics;
pub use step::{ExpandError, Step, Steps};

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context as _;
use futures::TryStreamExt as _;
use hashbrown::{HashMap, HashSet};
use secrecy::ExposeSecret as _;

use db::models::{BuildID, BuildStatus};
use store_utils::{LocalStore, Store, StorePath};

use crate::config::{App, Cli};

const QUEUE_CHANNELS: [&str; 5] = [
    "builds_added",
    "builds_restarted",
    "builds_cancelled",
    "builds_deleted",
    "builds_bumped",
];

/// Builds of the current pass that are still waiting for their loader call.
struct NewBuilds {
    by_id: HashMap<BuildID, Arc<Build>>,
    // several queued builds may share one derivation path; the set is
    // ordered so the lowest id wins the top-level attribution
    by_path: HashMap<StorePath, BTreeSet<BuildID>>,
}

pub struct State {
    pub store: Arc<dyn Store>,
    pub config: App,
    pub cli: Cli,
    pub db: db::Database,

    pub machines: Machines,

    pub builds: Builds,
    pub jobsets: Jobsets,
    pub steps: Steps,

    pub metrics: PromMetrics,
    pub notify_builders: tokio::sync::Notify,

    last_build_id: AtomicI32,
}

fn now_as_i32() -> anyhow::Result<i32> {
    Ok(i32::try_from(jiff::Timestamp::now().as_second())?)
}

impl State {
    #[tracing::instrument(err)]
    pub async fn new() -> anyhow::Result<Arc<Self>> {
        let cli = Cli::new();
        let config = App::init(&cli.config_path)?;
        let db = db::Database::new(
            config.get_db_url().expose_secret(),
            config.get_max_db_connections(),
        )
        .await?;
        let store: Arc<dyn Store> = Arc::new(LocalStore::new(config.get_store_dir()));

        let machines = Machines::new();
        machines.replace_all(config.get_machines());

        Ok(Arc::new(Self {
            store,
            cli,
            db,
            machines,
            builds: Builds::new(),
            jobsets: Jobsets::new(),
            steps: Steps::new(),
            metrics: PromMetrics::new()?,
            notify_builders: tokio::sync::Notify::new(),
            last_build_id: 0.into(),
            config,
        }))
    }

    #[tracing::instrument(skip(self, new_config), err)]
    pub fn reload_config_callback(&self, new_config: &crate::config::PreparedApp) -> anyhow::Result<()> {
        if self.config.get_db_url().expose_secret() != new_config.db_url.expose_secret() {
            tracing::warn!("Changing dbUrl requires a restart!");
        }
        if self.config.get_store_dir() != new_config.store_dir {
            tracing::warn!("Changing storeDir requires a restart!");
        }
        self.machines.replace_all(new_config.machines.clone());
        Ok(())
    }

    /// Wake the builder pool; it pulls fresh work via `Steps::clone_runnable`.
    #[tracing::instrument(skip(self))]
    pub fn trigger_builders(&self) {
        self.notify_builders.notify_one();
    }

    #[tracing::instrument(skip(self))]
    pub fn start_queue_monitor_loop(self: Arc<Self>) -> tokio::task::AbortHandle {
        let task = tokio::task::spawn({
            async move {
                if let Err(e) = Box::pin(self.queue_monitor_loop()).await {
                    tracing::error!("Failed to run queue monitor loop. e={e:#}");
                }
            }
        });
        task.abort_handle()
    }

    /// The monitor: snapshot the queue, load what is new, then sleep until
    /// the database signals a change (or the keepalive timer fires).
    #[tracing::instrument(skip(self), err)]
    async fn queue_monitor_loop(&self) -> anyhow::Result<()> {
        let mut listener = self.db.listener(QUEUE_CHANNELS.to_vec()).await?;

        loop {
            if let Err(e) = self.get_queued_builds().await {
                // probably a DB problem, so don't retry right away; the
                // watermark is untouched and the next pass re-reads the rest
                tracing::error!("queue monitor: {e:#}");
                tokio::time::sleep(self.config.get_error_backoff()).await;
                continue;
            }

            let queue_trigger_timer = self.config.get_queue_trigger_timer();
            let notification = if let Some(timer) = queue_trigger_timer {
                tokio::select! {
                    () = tokio::time::sleep(timer) => "timer_reached".to_owned(),
                    v = listener.try_next() => match v {
                        Ok(Some(v)) => v.channel().to_owned(),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("PgListener failed with e={e}");
                            tokio::time::sleep(self.config.get_error_backoff()).await;
                            continue;
                        }
                    },
                }
            } else {
                match listener.try_next().await {
                    Ok(Some(v)) => v.channel().to_owned(),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("PgListener failed with e={e}");
                        tokio::time::sleep(self.config.get_error_backoff()).await;
                        continue;
                    }
                }
            };
            self.metrics.nr_queue_wakeups.inc();
            tracing::trace!("New notification from PgListener. notification={notification:?}");

            match notification.as_ref() {
                "builds_added" => {
                    tracing::debug!("got notification: new builds added to the queue");
                }
                "builds_restarted" => {
                    tracing::debug!("got notification: builds restarted");
                    // check all builds on the next pass
                    self.last_build_id.store(0, Ordering::SeqCst);
                }
                "builds_cancelled" | "builds_deleted" | "builds_bumped" => {
                    tracing::info!("got notification: builds cancelled or bumped");
                    if let Err(e) = self.process_queue_change().await {
                        tracing::error!("Failed to process queue change. e={e:#}");
                        tokio::time::sleep(self.config.get_error_backoff()).await;
                    }
                }
                _ => (),
            }
        }
    }

    /// One monitor pass: snapshot pending builds above the watermark in one
    /// short read, then run the loader for each outside the transaction.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_queued_builds(&self) -> anyhow::Result<()> {
        let last_build_id = self.last_build_id.load(Ordering::SeqCst);
        tracing::info!("checking the queue for builds > {last_build_id}...");
        self.metrics.queue_checks_started.inc();
        self.jobsets.prune();

        let mut new_ids = Vec::with_capacity(100);
        let mut new_builds = NewBuilds {
            by_id: HashMap::with_capacity(100),
            by_path: HashMap::with_capacity(100),
        };
        let mut max_seen_id = last_build_id;

        {
            let mut conn = self.db.get().await?;
            for row in conn.get_queued_builds(last_build_id).await? {
                max_seen_id = max_seen_id.max(row.id);
                if self.builds.has(row.id) {
                    continue;
                }

                let jobset = self
                    .jobsets
                    .create(&mut conn, &row.project, &row.jobset)
                    .await?;
                let build = Build::new(row, jobset)?;
                new_ids.push(build.id);
                new_builds
                    .by_path
                    .entry(build.drv_path.clone())
                    .or_default()
                    .insert(build.id);
                new_builds.by_id.insert(build.id, build);
            }
        }

        // Builds are expanded in (globalPriority desc, id asc) order. The
        // builder pool gets the runnable steps of each build as soon as that
        // build is loaded, not at the end of the pass.
        for id in new_ids {
            let Some(build) = new_builds.by_id.get(&id).cloned() else {
                continue;
            };

            let mut new_runnable = HashSet::new();
            let mut nr_added = 0u64;
            Box::pin(self.create_build(build, &mut new_builds, &mut new_runnable, &mut nr_added))
                .await
                .with_context(|| format!("while loading build {id}"))?;

            tracing::info!(
                "got {} new runnable steps from {nr_added} new builds",
                new_runnable.len()
            );
            for r in &new_runnable {
                r.make_runnable();
            }
            if !new_runnable.is_empty() {
                self.trigger_builders();
            }
            self.metrics.nr_builds_read.inc_by(nr_added);
        }

        // Only advance the watermark once the whole pass went through, so a
        // failing build is re-read on the next wakeup. Already-admitted
        // builds are protected by the registry check above.
        self.last_build_id.store(max_seen_id, Ordering::SeqCst);

        self.metrics
            .nr_builds_unfinished
            .set(i64::try_from(self.builds.len()).unwrap_or_default());
        self.metrics
            .nr_steps_unfinished
            .set(i64::try_from(self.steps.len()).unwrap_or_default());
        self.metrics.queue_checks_finished.inc();
        Ok(())
    }

    /// Load one build: expand its step DAG, classify early failures, and
    /// either finalize it in the database or admit it to the registry.
    #[tracing::instrument(
        skip(self, build, new_builds, new_runnable, nr_added),
        fields(build_id = build.id)
    )]
    async fn create_build(
        &self,
        build: Arc<Build>,
        new_builds: &mut NewBuilds,
        new_runnable: &mut HashSet<Arc<Step>>,
        nr_added: &mut u64,
    ) -> anyhow::Result<()> {
        self.metrics.queue_build_loads.inc();
        tracing::info!("loading build {} ({})", build.id, build.full_job_name());
        *nr_added += 1;
        // guard against re-entry via the dependency chain below
        new_builds.by_id.remove(&build.id);

        if !self.store.is_valid_path(&build.drv_path) {
            // derivation has been GC'ed prematurely
            self.abort_gced_build(&build).await?;
            return Ok(());
        }

        // Create steps for this derivation and its dependencies.
        let mut finished_drvs = HashSet::new();
        let mut new_steps = HashSet::new();
        let step = self.steps.expand(
            self.store.as_ref(),
            &self.config.get_local_platforms(),
            &build.drv_path,
            Some(&build),
            None,
            &mut finished_drvs,
            &mut new_steps,
            new_runnable,
            0,
        )?;
        self.metrics
            .queue_steps_created
            .inc_by(u64::try_from(new_steps.len()).unwrap_or_default());

        // Some of the new steps may be the top level of builds we haven't
        // processed yet, so do those now. If build A depends on the
        // top-level derivation of build B, this attributes the shared step
        // to B rather than A.
        let queued: Vec<BuildID> = new_steps
            .iter()
            .filter_map(|r| new_builds.by_path.get(r.get_drv_path()))
            .flatten()
            .copied()
            .collect();
        for id in queued {
            let Some(other) = new_builds.by_id.get(&id).cloned() else {
                continue;
            };
            Box::pin(self.create_build(other, new_builds, new_runnable, nr_added)).await?;
        }

        let Some(step) = step else {
            // If we didn't get a step, the derivation's outputs are all
            // valid, so this is a finished, cached build.
            self.handle_cached_build(&build).await?;
            return Ok(());
        };

        // If any step previously failed or no machine can run it, fail the
        // build right away instead of admitting it.
        let mut bad_step = false;
        for r in &new_steps {
            let build_status = if self.check_cached_failure(r).await? {
                tracing::error!("marking build {} as cached failure", build.id);
                if Arc::ptr_eq(r, &step) {
                    BuildStatus::Failed
                } else {
                    BuildStatus::DepFailed
                }
            } else if self.machines.support_step(r) {
                BuildStatus::Success
            } else {
                tracing::error!("aborting unsupported build {}", build.id);
                BuildStatus::Unsupported
            };
            if build_status == BuildStatus::Success {
                continue;
            }

            let step_status = if build_status == BuildStatus::Unsupported {
                BuildStatus::Unsupported
            } else {
                BuildStatus::Failed
            };
            if !build.get_finished_in_db() {
                let now = now_as_i32()?;
                let platform = r.get_platform();
                let mut conn = self.db.get().await?;
                let mut tx = conn.begin_transaction().await?;
                tx.create_build_step(db::models::InsertBuildStep {
                    build_id: build.id,
                    drv_path: r.get_drv_path().as_str(),
                    status: step_status,
                    platform: platform.as_deref(),
                    error_msg: None,
                    start_time: now,
                    stop_time: now,
                })
                .await?;
                tx.finish_build(
                    build.id,
                    build_status,
                    now,
                    build_status != BuildStatus::Unsupported,
                )
                .await?;
                tx.commit().await?;
                build.set_finished_in_db(true);
                self.metrics.nr_builds_done.inc();
            }
            bad_step = true;
            break;
        }
        if bad_step {
            return Ok(());
        }

        {
            if !build.get_finished_in_db() {
                self.builds.insert(build.clone());
            }
            build.set_toplevel_step(step.clone());
        }
        build.propagate_priorities();

        tracing::info!(
            "added build {} (top-level step {}, {} new steps)",
            build.id,
            step.get_drv_path(),
            new_steps.len()
        );
        Ok(())
    }

    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    async fn abort_gced_build(&self, build: &Arc<Build>) -> anyhow::Result<()> {
        tracing::error!("aborting GC'ed build {}", build.id);
        if !build.get_finished_in_db() {
            let now = now_as_i32()?;
            let mut conn = self.db.get().await?;
            let mut tx = conn.begin_transaction().await?;
            tx.abort_build(
                build.id,
                "derivation was garbage-collected prior to build",
                now,
            )
            .await?;
            tx.commit().await?;
            build.set_finished_in_db(true);
            self.metrics.nr_builds_done.inc();
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, build), fields(build_id = build.id), err)]
    async fn handle_cached_build(&self, build: &Arc<Build>) -> anyhow::Result<()> {
        let drv = self.store.read_derivation(&build.drv_path)?;
        let res = self.store.build_output(&drv)?;
        tracing::info!(
            "marking build {} as succeeded (cached, {} outputs, {} bytes)",
            build.id,
            res.outputs.len(),
            res.size
        );

        let now = now_as_i32()?;
        let mut conn = self.db.get().await?;
        let mut tx = conn.begin_transaction().await?;
        tx.mark_succeeded_build(build.id, true, now, now).await?;
        tx.commit().await?;

        build.set_finished_in_db(true);
        self.metrics.nr_builds_done.inc();
        Ok(())
    }

    /// Consult the cached-failure table for any of the step's outputs.
    #[tracing::instrument(skip(self, step), ret(level = "debug"), err)]
    async fn check_cached_failure(&self, step: &Arc<Step>) -> anyhow::Result<bool> {
        let outputs = step.get_outputs();
        if outputs.is_empty() {
            return Ok(false);
        }

        let paths: Vec<String> = outputs.iter().map(|o| o.path.to_string()).collect();
        let mut conn = self.db.get().await?;
        Ok(conn.check_if_paths_failed(&paths).await?)
    }

    /// Reconcile the registry against the database after a cancellation,
    /// deletion, or priority bump.
    #[tracing::instrument(skip(self), err)]
    async fn process_queue_change(&self) -> anyhow::Result<()> {
        let mut conn = self.db.get().await?;
        let curr_ids: HashMap<BuildID, i32> = conn
            .get_queued_builds_fast()
            .await?
            .into_iter()
            .map(|b| (b.id, b.globalpriority))
            .collect();
        self.builds.update_priorities(&curr_ids);
        Ok(())
    }
}
