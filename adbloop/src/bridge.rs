//! The [`Bridge`] front end and its background worker.
//!
//! Every operation is queued to a single worker thread and runs on its own
//! connection: reset connection, connect, handshake, command(s), close. Callers
//! never block on the network. They get an [`Operation`] whose event channel
//! reports progress and ends with exactly one [`Event::Finished`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, info_span, warn};

use crate::auth::Handshake;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{CancelToken, Event, EventSink};
use crate::keys::KeyStore;
use crate::runner::{self, GrantPlan};
use crate::transport;

/// Work the bridge can be asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Job {
    /// Run the configured grant plan.
    Grant,
    /// `pm install` an on-device package file.
    Install(String),
    /// `sh` an on-device script, streaming its output.
    Script(String),
}

impl Job {
    /// Short name for logs.
    const fn kind(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Install(_) => "install",
            Self::Script(_) => "script",
        }
    }
}

/// A queued job with its reporting and cancellation handles.
#[derive(Debug)]
struct Request {
    /// What to do.
    job: Job,
    /// Where progress goes.
    sink: EventSink,
    /// Polled between commands.
    token: CancelToken,
}

/// Handle to an embedded debug-bridge client.
///
/// Dropping the bridge cancels every outstanding operation and waits for the
/// worker to wind down.
#[derive(Debug)]
pub struct Bridge {
    /// Queue to the worker; `None` once shutting down.
    jobs: Option<mpsc::Sender<Request>>,
    /// Bumped by [`cancel`](Self::cancel).
    epoch: Arc<AtomicU64>,
    /// The worker thread.
    worker: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts the worker thread.
    pub fn new(config: Config) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("adbloop-worker".into())
            .spawn(move || worker_loop(&config, &rx))?;
        Ok(Self {
            jobs: Some(tx),
            epoch: Arc::new(AtomicU64::new(0)),
            worker: Some(worker),
        })
    }

    /// Grants every configured permission, app-op and setting to the target
    /// package, counting failures without stopping.
    pub fn grant_all_permissions(&self) -> Operation {
        self.submit(Job::Grant)
    }

    /// Installs the package file at `path` on the device.
    pub fn install_apk(&self, path: impl Into<String>) -> Operation {
        self.submit(Job::Install(path.into()))
    }

    /// Runs the shell script at `path` on the device, streaming each line.
    pub fn execute_script_file(&self, path: impl Into<String>) -> Operation {
        self.submit(Job::Script(path.into()))
    }

    /// Cancels every operation submitted before this call. Operations
    /// submitted afterwards are unaffected.
    pub fn cancel(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "cancel all");
    }

    /// Queues `job` and returns its handle.
    fn submit(&self, job: Job) -> Operation {
        let (sink, events) = EventSink::channel();
        let token = CancelToken::with_epoch(Arc::clone(&self.epoch));
        let request = Request {
            job,
            sink,
            token: token.clone(),
        };
        let sent = match &self.jobs {
            Some(jobs) => jobs.send(request).map_err(|e| e.0),
            None => Err(request),
        };
        if let Err(request) = sent {
            warn!(job = request.job.kind(), "worker is gone");
            request.sink.log("Bridge worker is not running.");
            request.sink.finish(false);
        }
        Operation { events, token }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel();
        drop(self.jobs.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

/// Caller-side handle to one submitted operation.
#[derive(Debug)]
pub struct Operation {
    /// Progress events, ending with [`Event::Finished`].
    events: UnboundedReceiver<Event>,
    /// Cancels this operation only.
    token: CancelToken,
}

impl Operation {
    /// Requests cancellation; takes effect before the next command.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The operation's cancellation token.
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Next event, or `None` after [`Event::Finished`] has been taken.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Blocking variant of [`next_event`](Self::next_event). Must not be
    /// called from inside an async runtime.
    pub fn blocking_next_event(&mut self) -> Option<Event> {
        self.events.blocking_recv()
    }

    /// Blocks until the operation finishes, handing every log line to
    /// `on_log`. Returns the operation's verdict.
    pub fn wait(mut self, mut on_log: impl FnMut(&str)) -> bool {
        while let Some(event) = self.blocking_next_event() {
            match event {
                Event::Log(line) => on_log(&line),
                Event::Finished { success } => return success,
            }
        }
        false
    }
}

/// Serves requests until every [`Bridge`] sender is dropped.
fn worker_loop(config: &Config, jobs: &mpsc::Receiver<Request>) {
    let mut keys = KeyStore::new(config.key_dir.clone());
    for request in jobs {
        process(config, &mut keys, request);
    }
    debug!("worker exiting");
}

/// Runs one request to completion and sends its terminal event.
fn process(config: &Config, keys: &mut KeyStore, request: Request) {
    let Request { job, sink, token } = request;
    let span = info_span!("job", kind = job.kind());
    let _enter = span.enter();

    if token.is_cancelled() {
        info!("cancelled before start");
        sink.log("Cancelled.");
        sink.finish(false);
        return;
    }

    let success = match execute(config, keys, &job, &token, &sink) {
        Ok(success) => success,
        Err(Error::Cancelled) => false,
        Err(e) => {
            warn!("{e}");
            sink.log(format!("Error: {e}"));
            if let Some(hint) = e.guidance() {
                sink.log(hint);
            }
            false
        }
    };
    info!(success, "finished");
    sink.finish(success);
}

/// Connects, authenticates and runs `job`. The connection is closed on
/// every return path.
fn execute(
    config: &Config,
    keys: &mut KeyStore,
    job: &Job,
    token: &CancelToken,
    sink: &EventSink,
) -> Result<bool> {
    let plan = match job {
        Job::Grant => Some(GrantPlan::from_config(config)?),
        Job::Install(_) | Job::Script(_) => None,
    };

    sink.log("Connecting to debug daemon...");
    let mut conn = transport::connect(config)?;
    Handshake::new(config).run(&mut conn, keys, sink)?;

    if token.is_cancelled() {
        conn.close();
        sink.log("Cancelled.");
        return Err(Error::Cancelled);
    }

    match job {
        Job::Grant => runner::run_plan(&mut conn, &plan.unwrap_or_default(), token, sink)
            .map(|tally| tally.all_succeeded()),
        Job::Install(path) => runner::install_package(&mut conn, path, config, sink),
        Job::Script(path) => runner::run_script(&mut conn, path, config, sink),
    }
}
