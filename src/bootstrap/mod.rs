//! In-worker startup sequence.
//!
//! Runs inside the spawned process:
//! 1. read options (environment) and the app root (argv)
//! 2. load the application and wrap it in `Instrumented`
//! 3. bind the request listener
//! 4. report exactly one `Ready` or `StartupError` on the handshake channel
//! 5. serve until `Shutdown` arrives or the supervisor goes away

pub mod server;

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::analytics::{AnalyticsSink, Instrumented, JsonLinesSink, TracingSink};
use crate::app::{self, AppManifest, Dispatch};
use crate::config::BootstrapConfig;
use crate::error::{ChannelError, ConfigError, StartupFailure};
use crate::handshake::{HandshakeChannel, HandshakeMessage, HandshakeReader};

pub use server::{Reply, Server};

/// Exit status after a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit status after reporting a startup error.
pub const EXIT_STARTUP_FAILED: i32 = 1;

/// Everything the worker was launched with.
#[derive(Debug)]
pub struct Launch {
    pub app_root: Option<PathBuf>,
    pub config: Result<BootstrapConfig, ConfigError>,
}

impl Launch {
    /// `worker-bootstrap <app-root>`, options from `WORKER_LOADER_OPTIONS`.
    pub fn from_env() -> Self {
        Self {
            app_root: std::env::args_os().nth(1).map(PathBuf::from),
            config: BootstrapConfig::from_env(),
        }
    }
}

/// The loaded application, ready to serve.
pub struct Prepared {
    pub listener: TcpListener,
    pub app: Arc<Instrumented<Arc<dyn Dispatch>>>,
    pub config: BootstrapConfig,
}

/// Run the whole worker lifecycle and return the process exit status.
pub async fn run<R, W>(launch: Launch, channel: HandshakeChannel<R, W>) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let (reader, mut writer) = channel.split();

    // A panic outside application code is still a startup failure.
    let prepared = match std::panic::AssertUnwindSafe(prepare(launch))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(payload) => Err(StartupFailure::internal(format!(
            "panic while loading application: {}",
            panic_message(payload.as_ref())
        ))),
    };

    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(failure) => {
            tracing::error!(kind = %failure.kind, "Startup failed: {}", failure.message);
            if let Err(e) = writer.send(&HandshakeMessage::from(&failure)).await {
                tracing::warn!(error = %e, "Could not report startup failure");
            }
            return EXIT_STARTUP_FAILED;
        }
    };

    let listen_address = match prepared.listener.local_addr() {
        Ok(addr) => addr.to_string(),
        Err(e) => {
            let failure = StartupFailure::bind(format!("cannot read bound address: {e}"));
            let _ = writer.send(&HandshakeMessage::from(&failure)).await;
            return EXIT_STARTUP_FAILED;
        }
    };

    let ready = HandshakeMessage::Ready {
        pid: std::process::id(),
        listen_address: listen_address.clone(),
    };
    if let Err(e) = writer.send(&ready).await {
        tracing::error!(error = %e, "Supervisor went away before readiness was reported");
        return EXIT_STARTUP_FAILED;
    }
    tracing::info!(listen = %listen_address, "Worker ready");

    let Prepared {
        listener,
        app,
        config,
    } = prepared;
    let sink = Arc::clone(app.sink());

    Server::new(listener, app, &config)
        .serve(wait_for_shutdown(reader))
        .await;

    sink.close();
    tracing::info!("Worker stopped");
    EXIT_OK
}

/// Load, wrap and bind. Any failure maps to exactly one startup error kind.
pub async fn prepare(launch: Launch) -> Result<Prepared, StartupFailure> {
    let config = launch
        .config
        .map_err(|e| StartupFailure::configuration(e.to_string()))?;

    let app_root = match launch.app_root {
        Some(root) => root,
        None => std::env::current_dir().map_err(|e| {
            StartupFailure::configuration(format!("no app root given and no cwd: {e}"))
        })?,
    };

    let manifest = AppManifest::load(&app_root)?;
    let application = load_application(|| app::load(&manifest))?;
    let sink = build_sink(&config)?;

    let app = Instrumented::new(application, sink)
        .with_request_id_policy(config.request_id_policy);

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(|e| StartupFailure::bind(format!("cannot bind {}: {e}", config.listen)))?;

    Ok(Prepared {
        listener,
        app: Arc::new(app),
        config,
    })
}

/// Run the application loader. A panic inside it is reported as a
/// `LoadError`, the same as a load that returns an error.
fn load_application<F>(load: F) -> Result<Arc<dyn Dispatch>, StartupFailure>
where
    F: FnOnce() -> Result<Arc<dyn Dispatch>, StartupFailure>,
{
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(load)) {
        Ok(result) => result,
        Err(payload) => Err(StartupFailure::load(format!(
            "panic while loading application: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn build_sink(config: &BootstrapConfig) -> Result<Arc<dyn AnalyticsSink>, StartupFailure> {
    match &config.analytics_log {
        Some(path) => {
            let sink = JsonLinesSink::open(path, config.analytics_buffer).map_err(|e| {
                StartupFailure::configuration(format!(
                    "cannot open analytics log {}: {e}",
                    path.display()
                ))
            })?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

/// Resolve once the supervisor asks for shutdown or closes the channel.
pub async fn wait_for_shutdown<R: AsyncRead + Unpin>(mut reader: HandshakeReader<R>) -> String {
    loop {
        match reader.next().await {
            Ok(HandshakeMessage::Shutdown { reason }) => return reason,
            Ok(other) => {
                tracing::warn!(
                    message = other.type_name(),
                    "Ignoring unexpected handshake message"
                );
            }
            Err(ChannelError::Malformed(e)) => {
                tracing::warn!(error = %e, "Ignoring malformed handshake frame");
            }
            Err(e) => return format!("handshake channel lost: {e}"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
