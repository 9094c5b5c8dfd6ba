//! Session Controller: choose mode, wire the chosen engine,
//! enforce the time budget, surface failures through the test's
//! [`Reporter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::SnapConfig;
use crate::error::SnapError;
use crate::listener::SnapListener;
use crate::proxy::run_proxy;
use crate::replay::run_replay;
use crate::reporter::{PanicReporter, Reporter};
use crate::snapshot::read_steps;

type CleanupFn = Box<dyn FnOnce() -> Result<(), String> + Send>;

/// What the session decided to run, purely for diagnostics/tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Replay,
    Record,
}

pub struct SnapSession {
    listener: Arc<SnapListener>,
    mode: Mode,
    engine_task: Option<JoinHandle<Result<(), SnapError>>>,
    done_tx: watch::Sender<bool>,
    timeout_task: Option<JoinHandle<()>>,
    timed_out: Arc<AtomicBool>,
    cleanups: Vec<CleanupFn>,
    reporter: Arc<dyn Reporter>,
}

impl SnapSession {
    /// Open the listener, decide replay vs record, and start the chosen
    /// engine in the background. `name` is used only for the tracing span.
    pub async fn start(name: &str, config: SnapConfig) -> Result<Self, SnapError> {
        Self::start_with_reporter(name, config, Arc::new(PanicReporter::default())).await
    }

    pub async fn start_with_reporter(
        name: &str,
        config: SnapConfig,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self, SnapError> {
        crate::init_tracing(config.debug);

        let span = tracing::info_span!("pgsnap", test = %name);
        let _enter = span.clone();

        let listener = Arc::new(SnapListener::bind().await?);
        let (mode, steps) = decide_mode(&config)?;

        let (done_tx, done_rx) = watch::channel(false);

        let engine_task: JoinHandle<Result<(), SnapError>> = match mode {
            Mode::Replay => {
                let listener = listener.clone();
                let reporter = reporter.clone();
                let span = span.clone();
                let mut accept_done = done_rx.clone();
                tokio::spawn(
                    async move {
                        match listener.accept_until_done(&mut accept_done).await? {
                            Some(mut stream) => {
                                run_replay(&mut stream, steps.unwrap_or_default(), reporter.as_ref())
                                    .await
                            }
                            None => Ok(()),
                        }
                    }
                    .instrument(span),
                )
            }
            Mode::Record => {
                let listener = listener.clone();
                let reporter = reporter.clone();
                let upstream_dsn = config.upstream_dsn.clone();
                let snapshot_path = config.snapshot_path.clone();
                let span = span.clone();
                let mut accept_done = done_rx.clone();
                let splice_done = done_rx.clone();
                tokio::spawn(
                    async move {
                        match listener.accept_until_done(&mut accept_done).await? {
                            Some(stream) => {
                                run_proxy(stream, &upstream_dsn, &snapshot_path, reporter, splice_done)
                                    .await
                            }
                            None => Ok(()),
                        }
                    }
                    .instrument(span),
                )
            }
        };

        let timed_out = Arc::new(AtomicBool::new(false));

        let timeout_task = {
            let done_tx = done_tx.clone();
            let reporter = reporter.clone();
            let timeout = config.timeout;
            let timed_out = timed_out.clone();
            let mut watch_done = done_tx.subscribe();
            Some(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        if !*watch_done.borrow() {
                            timed_out.store(true, Ordering::SeqCst);
                            reporter.fail_now("pgsnap: session timed out waiting for a client connection");
                            let _ = done_tx.send(true);
                        }
                    }
                    _ = watch_done.changed() => {}
                }
            }))
        };

        Ok(SnapSession {
            listener,
            mode,
            engine_task: Some(engine_task),
            done_tx,
            timeout_task,
            timed_out,
            cleanups: Vec::new(),
            reporter,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn connection_url(&self) -> String {
        self.listener.connection_url()
    }

    pub fn reporter(&self) -> Arc<dyn Reporter> {
        self.reporter.clone()
    }

    /// Register a teardown callback; callbacks run in registration order
    /// after the engine is known quiescent.
    pub fn on_finish(&mut self, cleanup: impl FnOnce() -> Result<(), String> + Send + 'static) {
        self.cleanups.push(Box::new(cleanup));
    }

    /// Close the listener, wait for the engine, run cleanups, and fail the
    /// test if the engine reported a mismatch.
    pub async fn finish(mut self) -> Result<(), SnapError> {
        drop(self.listener);
        let _ = self.done_tx.send(true);

        let mut engine_result = match self.engine_task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| Err(SnapError::Teardown(format!("engine task panicked: {e}")))),
            None => Ok(()),
        };

        if let Some(task) = self.timeout_task.take() {
            let _ = task.await;
        }

        if self.timed_out.load(Ordering::SeqCst) && engine_result.is_ok() {
            engine_result = Err(SnapError::Timeout);
        }

        let mut first_cleanup_err = None;
        for cleanup in self.cleanups.drain(..) {
            if let Err(e) = cleanup() {
                self.reporter.error(&format!("pgsnap: teardown callback failed: {e}"));
                first_cleanup_err.get_or_insert(e);
            }
        }

        match (engine_result, first_cleanup_err) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(e)) => Err(SnapError::Teardown(e)),
            (Ok(()), None) => Ok(()),
        }
    }
}

/// Mode selection rule: forceRecord wins outright; otherwise
/// record unless a non-empty, non-prelude-only snapshot is already there.
fn decide_mode(config: &SnapConfig) -> Result<(Mode, Option<Vec<crate::snapshot::Step>>), SnapError> {
    if config.force_record {
        return Ok((Mode::Record, None));
    }
    if !config.snapshot_path.exists() {
        return Ok((Mode::Record, None));
    }
    let steps = read_steps(&config.snapshot_path)?;
    if steps.is_empty() {
        return Ok((Mode::Record, None));
    }
    Ok((Mode::Replay, Some(steps)))
}
