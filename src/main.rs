use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

use location_fusion::dashboard::{self, DashboardState};
use location_fusion::geocode::{HttpReverseGeocoder, ReverseGeocoder};
use location_fusion::sensors::{self, Producer, SimulatedWalk, WalkConfig};
use location_fusion::sync::{HttpSyncClient, SyncClient};
use location_fusion::tracker::{Collaborators, Tracker, TrackerOutput};
use location_fusion::TrackerConfig;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Simulated walking device
    Simulate,
    /// JSON-lines recording given with --replay
    Replay,
}

#[derive(Parser, Debug)]
#[command(name = "location_fusion")]
#[command(about = "Fuse satellite, radio and dead-reckoning sources into one location stream", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until Ctrl-C or end of replay)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// JSON configuration file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "simulate")]
    source: Source,

    /// Recording to replay (one SensorInput JSON object per line)
    #[arg(long, required_if_eq("source", "replay"))]
    replay: Option<PathBuf>,

    /// Replay speed multiplier
    #[arg(long, default_value = "1.0")]
    replay_speed: f64,

    /// Output directory for the journal, address cache and live status
    #[arg(long, default_value = "location_fusion_data")]
    output_dir: PathBuf,

    /// Remote sync endpoint (POST, JSON)
    #[arg(long)]
    sync_url: Option<String>,

    /// Reverse-geocoder base URL (Nominatim-compatible)
    #[arg(long)]
    geocode_url: Option<String>,

    /// Serve /status and /ws on this port
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Withhold satellite fixes between these seconds of the simulated walk
    #[arg(long, num_args = 2, value_names = ["FROM", "TO"])]
    gps_outage: Option<Vec<u64>>,
}

fn build_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)?,
        None => TrackerConfig::default(),
    };

    config.journal_path.get_or_insert_with(|| args.output_dir.join("locations.jsonl"));
    config.address.snapshot_path.get_or_insert_with(|| args.output_dir.join("addresses.json.gz"));
    config.status_path.get_or_insert_with(|| args.output_dir.join("live_status.json"));
    if args.sync_url.is_some() {
        config.sync_endpoint = args.sync_url.clone();
    }
    if args.geocode_url.is_some() {
        config.geocode_endpoint = args.geocode_url.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let config = build_config(&args)?;

    log::info!("[{}] Location fusion starting", ts_now());
    log::info!("  Source: {:?}", args.source);
    log::info!("  Duration: {} seconds (0=continuous)", args.duration);
    log::info!("  Output Dir: {}", args.output_dir.display());

    let collaborators = Collaborators {
        sync_client: config
            .sync_endpoint
            .as_ref()
            .map(|url| Arc::new(HttpSyncClient::new(url.clone(), config.http_timeout_secs)) as Arc<dyn SyncClient>),
        geocoder: config
            .geocode_endpoint
            .as_ref()
            .map(|url| {
                Arc::new(HttpReverseGeocoder::new(url.clone(), config.http_timeout_secs)) as Arc<dyn ReverseGeocoder>
            }),
    };

    let mut tracker = Tracker::new(config, collaborators)?;
    let mut outputs = tracker.subscribe();
    let sender = tracker.start()?;

    let dashboard_tasks = args.dashboard_port.map(|port| {
        let state = DashboardState::new(tracker.output_sender());
        let follower = state.follow_status();
        let server = tokio::spawn({
            let state = state.clone();
            async move {
                if let Err(e) = dashboard::start_dashboard(state, port).await {
                    log::error!("{}", e);
                }
            }
        });
        (state, follower, server)
    });

    // Console echo of fused fixes and addresses
    tokio::spawn(async move {
        while let Ok(output) = outputs.recv().await {
            match output {
                TrackerOutput::Location { location, primary, blended, .. } => log::info!(
                    "fix {:.6}, {:.6} ±{:.1} m via {}{}",
                    location.latitude,
                    location.longitude,
                    location.accuracy_m,
                    primary,
                    if blended { " (blended)" } else { "" }
                ),
                TrackerOutput::Address { text, from_cache, .. } => {
                    log::info!("address: {}{}", text, if from_cache { " (verified)" } else { "" })
                }
                TrackerOutput::Synced { acknowledged, unsynced, .. } => {
                    log::info!("synced {} records, {} pending", acknowledged, unsynced)
                }
                TrackerOutput::Diagnostics(_) => {}
            }
        }
    });

    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let mut producer = match args.source {
        Source::Simulate => {
            let walk = SimulatedWalk::new(WalkConfig {
                gps_outage: args
                    .gps_outage
                    .as_ref()
                    .and_then(|v| Some((v.first()? * 1000, v.get(1)? * 1000))),
                ..WalkConfig::default()
            });
            Producer::spawn(sensors::run_simulation(sender.clone(), walk, duration))
        }
        Source::Replay => {
            let path = args.replay.clone().context("--replay is required with --source replay")?;
            let inputs = sensors::load_replay(&path)?;
            log::info!("Loaded {} inputs from {}", inputs.len(), path.display());
            Producer::spawn(sensors::run_replay(sender.clone(), inputs, args.replay_speed))
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => log::info!("[{}] Interrupted, stopping...", ts_now()),
        result = producer.finished() => {
            match result {
                Ok(()) => log::info!("[{}] Input finished, stopping...", ts_now()),
                Err(e) => log::error!("Producer failed: {}", e),
            }
            // Let the last fusion tick land
            tokio::time::sleep(Duration::from_millis(tracker.config().fusion_interval_ms)).await;
        }
    }

    producer.stop().await;
    let status = sender.status().await?;
    tracker.stop().await?;

    if let Some((state, follower, server)) = dashboard_tasks {
        state.shutdown();
        let _ = follower.await;
        let _ = server.await;
    }

    println!("\n=== Final Stats ===");
    println!("Fused fixes: {}", status.ticks_emitted);
    println!("Skipped ticks: {}", status.ticks_skipped);
    println!("Steps: {}", status.step_count);
    println!("Unsynced records: {}", status.unsynced_count);
    if let Some(fix) = status.last_fix {
        println!("Last fix: {:.6}, {:.6} ±{:.1} m", fix.latitude, fix.longitude, fix.accuracy_m);
    }
    if let Some(address) = status.current_address {
        println!("Address: {}", address);
    }
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
