mod events;
mod maintenance;
mod model;
mod runner;
mod scheduler;
mod store;
mod writer;

pub use events::{EventHub, EventSink, JobEvent};
pub use maintenance::MaintenanceReport;
pub use model::{JOB_CONFIG_VERSION, Job, JobConfig, JobResult, JobStatus, RenderMode};
pub use runner::{JobContext, JobFuture, JobRunner, PdfJobRunner, ProgressReporter};
pub use scheduler::{
    Admission, DeleteError, DeleteReport, JobView, ResumeReport, Scheduler, SchedulerConfig,
    Submission,
};
pub use store::{JobStore, JsonFileStore, MemoryStore};
