//! rollcall-ps (Proximity Scanner) - student-side scan and submit tool
//!
//! Runs one discovery window, prints the in-proximity teacher beacons, and
//! optionally submits a verification for the strongest one.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rollcall_common::config::RootFolderResolver;
use rollcall_ps::radio::ReplayRadio;
use rollcall_ps::submit::{VerificationClient, VerifyRequestBody};
use rollcall_ps::{ProximityScanner, SubmitError};

#[derive(Debug, Parser)]
#[command(name = "rollcall-ps", version, about = "Scan for nearby teacher beacons")]
struct Args {
    /// Root folder override (config lookup only)
    #[arg(long)]
    root_folder: Option<PathBuf>,

    /// JSON-lines capture to replay as the radio
    #[arg(long)]
    replay: PathBuf,

    /// Scan window in milliseconds (defaults to config)
    #[arg(long)]
    window_ms: Option<u64>,

    /// RSSI threshold (defaults to config)
    #[arg(long, allow_hyphen_values = true)]
    threshold: Option<i16>,

    /// Verification service base URL; enables submission
    #[arg(long, env = "ROLLCALL_SERVER")]
    server: Option<String>,

    /// Bearer token for the verification service
    #[arg(long, env = "ROLLCALL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Biometric sample image to submit
    #[arg(long)]
    sample: Option<PathBuf>,

    #[arg(long)]
    course: Option<String>,

    #[arg(long)]
    location: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolver = RootFolderResolver::new("rollcall-ps").with_cli_arg(args.root_folder.clone());
    let config = resolver.load_config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str())),
        )
        .init();

    info!(
        "Starting rollcall-ps v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let mut settings = config.scanner.clone();
    if let Some(threshold) = args.threshold {
        settings.proximity_threshold = threshold;
    }
    let window = Duration::from_millis(args.window_ms.unwrap_or(settings.window_ms));

    let radio = ReplayRadio::from_file(&args.replay)
        .await
        .with_context(|| format!("Failed to read replay file {}", args.replay.display()))?;
    info!(entries = radio.len(), "Loaded replay capture");

    let scanner = ProximityScanner::open(Arc::new(radio), settings);
    scanner.run_scan(window).await?;

    let nearby = scanner.nearby();
    if nearby.is_empty() {
        println!("No teachers in proximity");
    }
    for candidate in &nearby {
        println!(
            "{}  {}  {} dBm",
            candidate.device_id, candidate.display_name, candidate.signal_strength
        );
    }

    let best = scanner.best_candidate();
    scanner.close();

    let Some(server) = args.server else {
        return Ok(());
    };
    let Some(best) = best else {
        bail!("No teacher beacon in proximity; nothing to submit");
    };
    let token = args.token.context("--token is required to submit")?;
    let sample_path = args.sample.context("--sample is required to submit")?;
    let course = args.course.context("--course is required to submit")?;

    let sample = tokio::fs::read(&sample_path)
        .await
        .with_context(|| format!("Failed to read sample {}", sample_path.display()))?;
    let body = VerifyRequestBody::new(&sample, &best, course, args.location);

    let client = VerificationClient::new(server, token)?;
    match client.verify(&body).await {
        Ok(response) => {
            println!(
                "Attendance marked ({}), confidence {:.2}",
                response.attendance_id, response.confidence
            );
            Ok(())
        }
        Err(SubmitError::Rejected(_)) => bail!("Verification failed, does not match"),
        Err(SubmitError::Retryable(_)) => bail!("Could not verify right now, please try again"),
        Err(e) => Err(e.into()),
    }
}
