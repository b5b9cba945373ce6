// Core encoding engine - independent of the CLI front-end

pub mod command;
pub mod detect;
pub mod paths;
pub mod pipeline;
pub mod planner;
pub mod probe;
pub mod process;
pub mod scheduler;
pub mod worker;

pub use command::{AttemptSpec, AudioPlan, Codec, DecodeMode, EncodeCommand, Encoder};
pub use detect::DetectedEncoders;
pub use paths::{PathError, PlannedPaths, is_video_file, scan};
pub use pipeline::{
    AttemptRecord, AttemptRunner, TaskContext, TaskFailure, TaskOutcome, TaskReport,
    build_attempt_plan, run_task, run_task_with_probe,
};
pub use planner::plan_target_bitrate;
pub use probe::{MediaInfo, probe};
pub use process::{AttemptError, CancelToken, ProcessRunner, ProcessTable, dynamic_timeout};
pub use scheduler::{Lease, Scheduler, SchedulerSnapshot};
pub use worker::{WorkerEvent, WorkerPool};
