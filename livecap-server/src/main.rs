//! Livecap control server entry point.
//!
//! Exit codes: 0 clean shutdown, 1 fatal configuration error, 2
//! unrecoverable runtime error.

mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use livecap_core::{
    FfmpegSource, HttpRoomResolver, NullRecognizer, PipelineSupervisor, RecognizerHandle,
    StubRecognizer,
};

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "livecap", about = "Live-stream transcription and chat relay server")]
struct Cli {
    /// Listen address for the control surface.
    #[arg(long, env = "LIVECAP_LISTEN", default_value = "127.0.0.1:8470")]
    listen: String,

    /// Path to the ffmpeg binary used as the media transcoder.
    #[arg(long, env = "LIVECAP_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: String,

    /// Recognition backend. A real model integrates via the Recognizer seam.
    #[arg(long, value_enum, default_value_t = RecognizerKind::Stub)]
    recognizer: RecognizerKind,

    /// Recognizer worker count. Values above 1 require a parallel-safe
    /// backend.
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Log filter, e.g. `info` or `livecap_core=debug,info`.
    #[arg(long, env = "LIVECAP_LOG", default_value = "info")]
    log_filter: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RecognizerKind {
    /// Deterministic echo backend.
    Stub,
    /// Always-empty backend (failure-path soak).
    Null,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_new(&cli.log_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("invalid --log-filter {:?}: {e}", cli.log_filter);
            return ExitCode::from(1);
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let listen: SocketAddr = match cli.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid --listen {:?}: {e}", cli.listen);
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };
    match runtime.block_on(serve(cli, listen)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server failed: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn serve(cli: Cli, listen: SocketAddr) -> anyhow::Result<()> {
    let resolver = Arc::new(HttpRoomResolver::new()?);
    let media = Arc::new(FfmpegSource::new(cli.ffmpeg.clone()));
    let recognizer = match cli.recognizer {
        RecognizerKind::Stub => RecognizerHandle::new(StubRecognizer::new()),
        RecognizerKind::Null => RecognizerHandle::new(NullRecognizer),
    };

    let supervisor = PipelineSupervisor::new(resolver, media, recognizer, cli.workers);
    let app = routes::router(AppState {
        supervisor: Arc::clone(&supervisor),
    });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, ffmpeg = %cli.ffmpeg, recognizer = ?cli.recognizer, "livecap server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain the pipeline before reporting a clean exit.
    supervisor.stop().await?;
    supervisor.stop_chat().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {e}");
    }
}
