use sqlx::Acquire as _;

use super::models::{Build, BuildID, BuildSmall, BuildStatus, BuildStepTimes, InsertBuildStep};

pub struct Connection {
    conn: sqlx::pool::PoolConnection<sqlx::Postgres>,
}

pub struct Transaction<'a> {
    tx: sqlx::PgTransaction<'a>,
}

impl Connection {
    #[must_use]
    pub const fn new(conn: sqlx::pool::PoolConnection<sqlx::Postgres>) -> Self {
        Self { conn }
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn begin_transaction(&mut self) -> sqlx::Result<Transaction<'_>> {
        let tx = self.conn.begin().await?;
        Ok(Transaction { tx })
    }

    /// Snapshot of pending builds above the watermark, most urgent first.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_queued_builds(&mut self, last_build_id: BuildID) -> sqlx::Result<Vec<Build>> {
        sqlx::query_as::<_, Build>(
            r"
            SELECT
              id,
              project,
              jobset,
              job,
              drvPath,
              maxsilent,
              timeout,
              timestamp,
              globalPriority,
              priority
            FROM builds
            WHERE id > $1 AND finished = 0
            ORDER BY globalPriority DESC, id",
        )
        .bind(last_build_id)
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_queued_builds_fast(&mut self) -> sqlx::Result<Vec<BuildSmall>> {
        sqlx::query_as::<_, BuildSmall>(
            r"
            SELECT
              id,
              globalPriority
            FROM builds
            WHERE finished = 0",
        )
        .fetch_all(&mut *self.conn)
        .await
    }

    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_scheduling_shares(
        &mut self,
        project: &str,
        jobset: &str,
    ) -> sqlx::Result<Option<i32>> {
        sqlx::query_scalar::<_, i32>(
            "SELECT schedulingShares FROM jobsets WHERE project = $1 AND name = $2",
        )
        .bind(project)
        .bind(jobset)
        .fetch_optional(&mut *self.conn)
        .await
    }

    /// Finished step times of a jobset since `since` (epoch seconds), used to
    /// seed the scheduling-share history.
    #[tracing::instrument(skip(self), err)]
    pub async fn get_jobset_build_steps(
        &mut self,
        project: &str,
        jobset: &str,
        since: i64,
    ) -> sqlx::Result<Vec<BuildStepTimes>> {
        sqlx::query_as::<_, BuildStepTimes>(
            r"
            SELECT s.startTime, s.stopTime
            FROM buildsteps s JOIN builds b ON s.build = b.id
            WHERE
              s.startTime IS NOT NULL AND
              s.stopTime > $1 AND
              b.project = $2 AND
              b.jobset = $3",
        )
        .bind(since)
        .bind(project)
        .bind(jobset)
        .fetch_all(&mut *self.conn)
        .await
    }

    /// Whether any of the paths has a recorded failure.
    #[tracing::instrument(skip(self, paths), err)]
    pub async fn check_if_paths_failed(&mut self, paths: &[String]) -> sqlx::Result<bool> {
        Ok(
            sqlx::query_scalar::<_, String>("SELECT path FROM failedpaths WHERE path = ANY($1)")
                .bind(paths)
                .fetch_optional(&mut *self.conn)
                .await?
                .is_some(),
        )
    }
}

impl Transaction<'_> {
    #[tracing::instrument(skip(self), err)]
    pub async fn commit(self) -> sqlx::Result<()> {
        self.tx.commit().await
    }

    /// Finalize a build that can never run, recording why.
    #[tracing::instrument(skip(self, error_msg), err)]
    pub async fn abort_build(
        &mut self,
        build_id: BuildID,
        error_msg: &str,
        now: i32,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              busy = 0,
              buildStatus = $2,
              startTime = $3,
              stopTime = $3,
              errorMsg = $4
            WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(BuildStatus::Aborted as i32)
        .bind(now)
        .bind(error_msg)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Finalize a build with a failure classification.
    #[tracing::instrument(skip(self, status), err)]
    pub async fn finish_build(
        &mut self,
        build_id: BuildID,
        status: BuildStatus,
        now: i32,
        is_cached_build: bool,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              busy = 0,
              buildStatus = $2,
              startTime = $3,
              stopTime = $3,
              isCachedBuild = $4
            WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(status as i32)
        .bind(now)
        .bind(i32::from(is_cached_build))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Finalize a build whose outputs are all valid already.
    #[tracing::instrument(skip(self), err)]
    pub async fn mark_succeeded_build(
        &mut self,
        build_id: BuildID,
        is_cached_build: bool,
        start_time: i32,
        stop_time: i32,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r"
            UPDATE builds SET
              finished = 1,
              busy = 0,
              buildStatus = $2,
              startTime = $3,
              stopTime = $4,
              isCachedBuild = $5
            WHERE id = $1 AND finished = 0",
        )
        .bind(build_id)
        .bind(BuildStatus::Success as i32)
        .bind(start_time)
        .bind(stop_time)
        .bind(i32::from(is_cached_build))
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Insert a `BuildSteps` row with the next step number for the build.
    #[tracing::instrument(skip(self, step), err)]
    pub async fn create_build_step(&mut self, step: InsertBuildStep<'_>) -> sqlx::Result<i32> {
        sqlx::query_scalar::<_, i32>(
            r"
            INSERT INTO buildsteps
              (build, stepnr, type, drvPath, busy, status, startTime, stopTime, platform, errorMsg, machine)
            VALUES
              ($1,
               (SELECT COALESCE(MAX(stepnr), 0) + 1 FROM buildsteps WHERE build = $1),
               0, $2, 0, $3, $4, $5, $6, $7, '')
            RETURNING stepnr",
        )
        .bind(step.build_id)
        .bind(step.drv_path)
        .bind(step.status as i32)
        .bind(step.start_time)
        .bind(step.stop_time)
        .bind(step.platform)
        .bind(step.error_msg)
        .fetch_one(&mut *self.tx)
        .await
    }
}
