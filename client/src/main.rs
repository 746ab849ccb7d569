use clap::Parser;
use client::identity::FileIdentityStore;
use client::session::{ClientSession, LogPresenter, PromptSubmission, RunSubmission, SessionConfig};
use log::{error, info};
use shared::Category;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL for registration and progress requests
    #[arg(short = 'r', long, default_value = "http://127.0.0.1:8001")]
    rest_url: String,

    /// Result stream endpoint
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8001/ws")]
    stream_url: String,

    /// Chart feed endpoint
    #[arg(short = 'c', long, default_value = "ws://127.0.0.1:8001/chart")]
    chart_url: String,

    /// Prompt-to-action endpoint
    #[arg(long, default_value = "ws://127.0.0.1:8002/ws")]
    prompt_url: String,

    /// Register this participant id before connecting
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Fetch unlocked stages for the current participant
    #[arg(short = 'p', long)]
    progress: bool,

    /// Stage whose leaderboard is displayed
    #[arg(short = 'g', long, default_value = "A1")]
    stage: String,

    /// Submit one run with this score once the stream is open
    #[arg(long, requires = "duration_ms", allow_negative_numbers = true)]
    score: Option<i64>,

    /// Duration of the submitted run in milliseconds
    #[arg(long, requires = "score", allow_negative_numbers = true)]
    duration_ms: Option<i64>,

    /// Send this prompt once the prompt channel is open
    #[arg(long)]
    prompt: Option<String>,

    /// File holding the saved participant id
    #[arg(long, default_value = ".stage-sync-id")]
    id_file: PathBuf,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    /// Seconds between liveness probes
    #[arg(long, default_value = "20")]
    probe_secs: u64,

    /// Raw records kept for display
    #[arg(long, default_value = "500")]
    retention: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = SessionConfig::default()
        .with_rest_base_url(&args.rest_url)
        .with_stream_url(&args.stream_url)
        .with_chart_url(&args.chart_url)
        .with_prompt_url(&args.prompt_url)
        .with_request_timeout(Duration::from_millis(args.timeout_ms))
        .with_probe_interval(Duration::from_secs(args.probe_secs))
        .with_retention(args.retention)
        .with_watched(Category::from(args.stage.as_str()));

    let mut session = ClientSession::new(
        config,
        Box::new(FileIdentityStore::new(&args.id_file)),
        Box::new(LogPresenter::default()),
    )?;

    if let Some(user) = &args.user {
        if let Err(e) = session.register(user, args.progress).await {
            error!("Registration failed: {}", e);
        }
    } else if args.progress {
        match session.participant_id().map(str::to_string) {
            Some(id) => {
                if let Err(e) = session.refresh_progress(&id).await {
                    error!("Progress fetch failed: {}", e);
                }
            }
            None => error!("No participant id to fetch progress for"),
        }
    }

    info!(
        "Connecting to {}, {} and {}",
        args.stream_url, args.chart_url, args.prompt_url
    );
    session.connect();

    let mut pending_run = args.score.zip(args.duration_ms);
    let mut pending_prompt = args.prompt.clone();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            running = session.next_event() => {
                if !running {
                    break;
                }
                session.drain();

                if session.stream_state().is_open() {
                    if let Some((score, duration_ms)) = pending_run.take() {
                        let run = RunSubmission::new(
                            session.participant_id().unwrap_or_default(),
                            args.stage.as_str(),
                            score,
                            duration_ms,
                        );
                        if let Err(e) = session.submit_run(&run) {
                            error!("Submission failed: {}", e);
                        }
                    }
                }

                if session.prompt_state().is_open() {
                    if let Some(prompt) = pending_prompt.take() {
                        let submission = PromptSubmission::new(
                            session.participant_id().unwrap_or_default(),
                            args.stage.as_str(),
                            prompt,
                        );
                        if let Err(e) = session.submit_prompt(&submission) {
                            error!("Prompt failed: {}", e);
                        }
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    session.shutdown();
    session.drain();

    Ok(())
}
