//! Dogcam server
//!
//! Serves the live feed, and (through a hidden subcommand) runs the capture
//! worker that the server spawns as a child process.

use clap::{Parser, Subcommand};
use dogcam::config::{CameraBackend, Config, ConfigError, Isolation, SensorBackend, TempUnit, WorkerSettings};
use dogcam::App;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "dogcam", version, about = "Live camera feed with a temperature overlay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file; flags and environment override it.
    #[arg(long, short, env = "DOGCAM_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "PORT")]
    port: Option<u16>,

    #[arg(long, env = "BIND_ADDR")]
    bind: Option<IpAddr>,

    /// Concurrent viewers allowed.
    #[arg(long, env = "MAX_VIEWERS")]
    max_viewers: Option<usize>,

    /// Name shown on the page.
    #[arg(long, env = "DOG_NAME")]
    name: Option<String>,

    #[arg(long, env = "BASIC_AUTH_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "BASIC_AUTH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Milliseconds a viewer waits for a frame before a placeholder is sent.
    #[arg(long, env = "FRAME_TIMEOUT_MS")]
    frame_timeout_ms: Option<u64>,

    #[arg(long, env = "CAMERA_BACKEND", value_enum)]
    camera: Option<CameraBackend>,

    #[arg(long, env = "CAMERA_RETRIES")]
    camera_retries: Option<u32>,

    #[arg(long, env = "CAMERA_RETRY_DELAY_MS")]
    camera_retry_delay_ms: Option<u64>,

    #[arg(long, env = "SENSOR_BACKEND", value_enum)]
    sensor: Option<SensorBackend>,

    /// GPIO line of the DHT sensor's data pin.
    #[arg(long, env = "SENSOR_GPIO")]
    sensor_gpio: Option<u32>,

    #[arg(long, env = "SENSOR_RETRIES")]
    sensor_retries: Option<u32>,

    #[arg(long, env = "SENSOR_RETRY_DELAY_MS")]
    sensor_retry_delay_ms: Option<u64>,

    #[arg(long, env = "TEMP_UNIT", value_enum)]
    unit: Option<TempUnit>,

    #[arg(long, env = "WORKER_ISOLATION", value_enum)]
    isolation: Option<Isolation>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the capture pipeline, writing events to stdout.
    #[command(hide = true)]
    CaptureWorker {
        /// Worker settings as TOML.
        #[arg(long)]
        settings: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let server = &mut config.server;
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(bind) = self.bind {
            server.bind = bind;
        }
        if let Some(max) = self.max_viewers {
            server.max_viewers = max;
        }
        if let Some(name) = &self.name {
            server.display_name = name.clone();
        }
        if let Some(user) = &self.username {
            server.username = Some(user.clone());
        }
        if let Some(pass) = &self.password {
            server.password = Some(pass.clone());
        }
        if let Some(ms) = self.frame_timeout_ms {
            server.frame_timeout_ms = ms;
        }

        let camera = &mut config.camera;
        if let Some(backend) = self.camera {
            camera.backend = backend;
        }
        if let Some(attempts) = self.camera_retries {
            camera.init.attempts = attempts;
        }
        if let Some(ms) = self.camera_retry_delay_ms {
            camera.init.delay_ms = ms;
        }

        let sensor = &mut config.sensor;
        if let Some(backend) = self.sensor {
            sensor.backend = backend;
        }
        if let Some(gpio) = self.sensor_gpio {
            sensor.gpio = gpio;
        }
        if let Some(attempts) = self.sensor_retries {
            sensor.init.attempts = attempts;
        }
        if let Some(ms) = self.sensor_retry_delay_ms {
            sensor.init.delay_ms = ms;
        }
        if let Some(unit) = self.unit {
            sensor.unit = unit;
        }

        if let Some(isolation) = self.isolation {
            config.worker.isolation = isolation;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout belongs to the wire protocol in the worker, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Some(Command::CaptureWorker { settings }) => run_worker(settings),
        None => run_server(&cli),
    }
}

fn run_worker(settings: &str) -> ExitCode {
    let settings = match WorkerSettings::from_toml(settings) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "invalid worker settings");
            return ExitCode::FAILURE;
        }
    };
    info!(version = dogcam::VERSION, pid = std::process::id(), "capture worker starting");
    let exit = dogcam::worker::run_child(&settings);
    info!(?exit, "capture worker exiting");
    ExitCode::SUCCESS
}

fn run_server(cli: &Cli) -> ExitCode {
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "dogcam stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> Result<(), dogcam::Error> {
    info!(
        version = dogcam::VERSION,
        name = %config.server.display_name,
        max_viewers = config.server.max_viewers,
        isolation = ?config.worker.isolation,
        "Dogcam starting"
    );

    let app = App::start(config).await?;
    info!(addr = %app.local_addr(), worker = %app.worker_description(), "Dogcam ready");

    let interrupted = Arc::new(Notify::new());
    let notify = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || notify.notify_one()) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }
    interrupted.notified().await;

    info!("shutdown signal received, stopping");
    app.shutdown().await
}
