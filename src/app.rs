//! Wiring of the serving process.

use crate::capture::placeholder_jpeg;
use crate::config::{Config, ConfigError, Isolation};
use crate::metrics::Metrics;
use crate::serve::{self, server, AppState, Credentials, FrameFeed, ServerError, StreamSettings, ViewerAdmission};
use crate::worker::{
    frame_channel, CaptureWorker, Dispatch, ProcessWorker, ThreadWorker, WorkerCommand, WorkerError,
    WorkerStatus,
};
use crate::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// A running camera server: HTTP listener, frame feed and capture worker.
pub struct App {
    addr: SocketAddr,
    worker: Box<dyn CaptureWorker>,
    feed: FrameFeed,
    stop_server: oneshot::Sender<()>,
    server: JoinHandle<Result<(), ServerError>>,
    join_timeout: Duration,
}

impl App {
    /// Starts everything, re-executing this binary for a process worker.
    pub async fn start(config: Config) -> Result<Self, Error> {
        let command = match config.worker.isolation {
            Isolation::Process => Some(WorkerCommand::current_exe().map_err(WorkerError::Spawn)?),
            Isolation::Thread => None,
        };
        Self::launch(config, command).await
    }

    /// Starts everything with an explicit worker command.
    pub async fn start_with_command(config: Config, command: WorkerCommand) -> Result<Self, Error> {
        Self::launch(config, Some(command)).await
    }

    async fn launch(config: Config, command: Option<WorkerCommand>) -> Result<Self, Error> {
        config.validate()?;
        let credentials = match (&config.server.username, &config.server.password) {
            (Some(user), Some(pass)) => Credentials::new(user, pass),
            _ => return Err(ConfigError::MissingCredentials.into()),
        };
        let metrics = Arc::new(Metrics::new()?);
        let placeholder = placeholder_jpeg()?;

        let (frame_tx, frame_rx) = frame_channel();
        let (status_tx, status) = watch::channel(WorkerStatus::default());
        let dispatch = Dispatch::new(frame_tx, status_tx, Arc::clone(&metrics));
        let feed = FrameFeed::spawn(frame_rx).map_err(WorkerError::Spawn)?;

        let listener = server::bind(config.server.bind_addr()).await?;
        let addr = listener.local_addr().map_err(ServerError::Serve)?;

        let settings = config.worker_settings();
        let worker: Box<dyn CaptureWorker> = match (config.worker.isolation, command) {
            (Isolation::Process, Some(command)) => Box::new(ProcessWorker::spawn(
                command,
                &settings,
                dispatch,
                config.worker.restart.clone(),
            )?),
            _ => Box::new(ThreadWorker::spawn(&settings, dispatch).map_err(WorkerError::Spawn)?),
        };
        tracing::info!(worker = %worker.describe(), "capture worker launched");

        let state = AppState {
            frames: feed.subscribe(),
            status,
            admission: Arc::new(ViewerAdmission::new(config.server.max_viewers, Arc::clone(&metrics))),
            metrics,
            stream: StreamSettings {
                boundary: Arc::from(config.server.boundary.as_str()),
                frame_timeout: config.server.frame_timeout(),
                placeholder,
            },
            display_name: Arc::from(config.server.display_name.as_str()),
            unit: config.sensor.unit,
        };
        let router = serve::router(state, credentials);

        let (stop_server, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(server::serve(listener, router, async move {
            let _ = stopped.await;
        }));

        Ok(Self {
            addr,
            worker,
            feed,
            stop_server,
            server,
            join_timeout: config.worker.join_timeout(),
        })
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn worker_description(&self) -> String {
        self.worker.describe()
    }

    /// Stops accepting connections, ends open streams, then tears down the
    /// capture worker within the join timeout.
    pub async fn shutdown(self) -> Result<(), Error> {
        let Self {
            worker,
            mut feed,
            stop_server,
            server,
            join_timeout,
            ..
        } = self;

        let _ = stop_server.send(());
        if tokio::task::spawn_blocking(move || feed.close()).await.is_err() {
            tracing::error!("frame feed shutdown panicked");
        }
        match tokio::time::timeout(join_timeout, server).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => tracing::error!(error = %e, "server task failed"),
            Err(_) => tracing::warn!(?join_timeout, "open connections outlived shutdown"),
        }

        match tokio::task::spawn_blocking(move || worker.shutdown(join_timeout)).await {
            Ok(result) => result?,
            Err(e) => tracing::error!(error = %e, "worker shutdown panicked"),
        }
        Ok(())
    }
}
