pub type BuildID = i32;

/// Status codes shared with the dispatcher and the UI; the numeric values
/// are part of the database contract and must not change.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    DepFailed = 2, // builds only
    Aborted = 3,
    Cancelled = 4,
    TimedOut = 7,
    CachedFailure = 8, // steps only
    Unsupported = 9,
    Busy = 100, // not stored
}

impl BuildStatus {
    #[must_use]
    pub const fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Success),
            1 => Some(Self::Failed),
            2 => Some(Self::DepFailed),
            3 => Some(Self::Aborted),
            4 => Some(Self::Cancelled),
            7 => Some(Self::TimedOut),
            8 => Some(Self::CachedFailure),
            9 => Some(Self::Unsupported),
            100 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// One row of the queue snapshot (`finished = 0`, above the watermark).
#[derive(Debug, sqlx::FromRow)]
pub struct Build {
    pub id: BuildID,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub drvpath: String,
    pub maxsilent: Option<i32>, // maxsilent integer default 3600
    pub timeout: Option<i32>,   // timeout integer default 36000
    pub timestamp: i64,
    pub globalpriority: i32,
    pub priority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BuildSmall {
    pub id: BuildID,
    pub globalpriority: i32,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BuildStepTimes {
    pub starttime: Option<i32>,
    pub stoptime: Option<i32>,
}

pub struct InsertBuildStep<'a> {
    pub build_id: BuildID,
    pub drv_path: &'a str,
    pub status: BuildStatus,
    pub platform: Option<&'a str>,
    pub error_msg: Option<&'a str>,
    pub start_time: i32,
    pub stop_time: i32,
}
