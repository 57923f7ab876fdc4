use structopt::StructOpt;

/// Process-level overrides applied on top of file and environment configuration.
#[derive(StructOpt, Debug, Clone, Default)]
pub struct Options {
    /// Config filename
    #[structopt(name = "config", short = "f", long)]
    pub cfg_name: Option<String>,

    /// Force the fake asynchronous store on or off, --fake-async true
    #[structopt(name = "fake-async", long)]
    pub fake_async: Option<bool>,

    /// Override the per-thread job queue capacity
    #[structopt(name = "thread-job-queue-capacity", long)]
    pub thread_job_queue_capacity: Option<usize>,
}
