//! Producer adapters that feed a running tracker the way platform callbacks
//! would: a simulated walking device and a JSON-lines replay source.

use std::f64::consts::PI;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::future::Future;
use std::path::Path;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::dead_reckoning::step_delta_degrees;
use crate::error::{TrackerError, TrackerResult};
use crate::geodesy::haversine_distance;
use crate::ranging::PathLossModel;
use crate::tracker::{SensorInput, TrackerSender};
use crate::types::{
    now_ms, AccelData, GeoPoint, GpsFix, GyroData, MagData, RadioReading, RadioTechnology, TimestampMs,
};

/// Base period of the simulation clock (50 Hz accelerometer).
const SIM_PERIOD_MS: u64 = 20;
const GRAVITY: f64 = 9.81;
const MAG_FIELD_UT: f64 = 30.0;

#[derive(Clone, Debug)]
pub struct WalkConfig {
    pub origin: GeoPoint,
    pub heading_deg: f64,
    pub step_length_m: f64,
    pub steps_per_sec: f64,
    pub gps_interval_ms: u64,
    pub gps_accuracy_m: f64,
    pub scan_interval_ms: u64,
    /// Satellite fixes are withheld inside this window (ms since start).
    pub gps_outage: Option<(u64, u64)>,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            origin: GeoPoint::new(37.7749, -122.4194),
            heading_deg: 90.0,
            step_length_m: 0.762,
            steps_per_sec: 2.0,
            gps_interval_ms: 1_000,
            gps_accuracy_m: 5.0,
            scan_interval_ms: 5_000,
            gps_outage: None,
        }
    }
}

/// A device walking in a straight line at constant cadence.
///
/// Accelerometer magnitude follows a half-wave-rectified sine per step, so
/// each step yields exactly one clean peak of about 12.8 m/s². Radio emitters
/// sit at fixed offsets from the origin and report RSSI from the path-loss
/// model at the true distance.
pub struct SimulatedWalk {
    config: WalkConfig,
    emitters: Vec<(RadioTechnology, String, GeoPoint)>,
    elapsed_ms: u64,
}

impl SimulatedWalk {
    pub fn new(config: WalkConfig) -> Self {
        let o = config.origin;
        let emitters = vec![
            (RadioTechnology::Wifi, "ap-lobby".to_string(), GeoPoint::new(o.latitude + 0.0002, o.longitude)),
            (RadioTechnology::Wifi, "ap-hall".to_string(), GeoPoint::new(o.latitude, o.longitude + 0.0005)),
            (RadioTechnology::Bluetooth, "beacon-door".to_string(), GeoPoint::new(o.latitude, o.longitude + 0.0001)),
        ];
        Self {
            config,
            emitters,
            elapsed_ms: 0,
        }
    }

    /// Ground-truth position `elapsed_ms` into the walk.
    pub fn true_position(&self, elapsed_ms: u64) -> GeoPoint {
        let steps = elapsed_ms as f64 / 1000.0 * self.config.steps_per_sec;
        let (d_lat, d_lng) = step_delta_degrees(
            self.config.step_length_m * steps,
            self.config.heading_deg,
            self.config.origin.latitude,
        );
        GeoPoint::new(self.config.origin.latitude + d_lat, self.config.origin.longitude + d_lng)
    }

    /// Advance one simulation period and return everything the device emits in it.
    pub fn advance(&mut self, start_ms: TimestampMs) -> Vec<SensorInput> {
        let t = self.elapsed_ms;
        let ts = start_ms + t;
        let mut inputs = Vec::with_capacity(4);

        let phase = t as f64 / 1000.0 * self.config.steps_per_sec;
        let bump = (phase * 2.0 * PI).sin().max(0.0) * 3.0;
        inputs.push(SensorInput::Accel(AccelData {
            timestamp_ms: ts,
            x: 0.1,
            y: 0.1,
            z: GRAVITY + bump,
        }));
        inputs.push(SensorInput::Gyro(GyroData {
            timestamp_ms: ts,
            x: 0.0,
            y: 0.0,
            z: (phase * PI).sin() * 0.05,
        }));

        if t % 100 == 0 {
            let heading = self.config.heading_deg.to_radians();
            inputs.push(SensorInput::Mag(MagData {
                timestamp_ms: ts,
                x: heading.cos() * MAG_FIELD_UT,
                y: heading.sin() * MAG_FIELD_UT,
                z: -20.0,
            }));
        }

        let in_outage = self
            .config
            .gps_outage
            .map_or(false, |(from, to)| t >= from && t < to);
        if t % self.config.gps_interval_ms.max(SIM_PERIOD_MS) == 0 && !in_outage {
            let pos = self.true_position(t);
            inputs.push(SensorInput::Gps(GpsFix {
                timestamp_ms: ts,
                latitude: pos.latitude,
                longitude: pos.longitude,
                accuracy_m: self.config.gps_accuracy_m,
            }));
        }

        if t % self.config.scan_interval_ms.max(SIM_PERIOD_MS) == 0 {
            inputs.extend(self.radio_scans(t, ts));
        }

        self.elapsed_ms += SIM_PERIOD_MS;
        inputs
    }

    fn radio_scans(&self, elapsed_ms: u64, ts: TimestampMs) -> Vec<SensorInput> {
        let here = self.true_position(elapsed_ms);
        [RadioTechnology::Wifi, RadioTechnology::Bluetooth]
            .into_iter()
            .map(|technology| {
                let model = match technology {
                    RadioTechnology::Wifi => PathLossModel::WIFI,
                    RadioTechnology::Bluetooth => PathLossModel::BLUETOOTH,
                };
                let readings = self
                    .emitters
                    .iter()
                    .filter(|(tech, _, _)| *tech == technology)
                    .map(|(_, id, pos)| {
                        let d = haversine_distance(here, *pos).max(0.5);
                        RadioReading {
                            emitter_id: id.clone(),
                            rssi_dbm: model.tx_power_dbm - 10.0 * model.path_loss_exponent * d.log10(),
                        }
                    })
                    .collect();
                SensorInput::RadioScan {
                    technology,
                    timestamp_ms: ts,
                    readings,
                }
            })
            .collect()
    }
}

/// Drive a simulated walk in real time until `duration` elapses (or forever
/// when `None`). High-rate samples are dropped when the tracker inbox is full.
pub async fn run_simulation(
    sender: TrackerSender,
    mut walk: SimulatedWalk,
    duration: Option<Duration>,
) -> TrackerResult<()> {
    let start_ms = now_ms();
    let mut ticker = interval(Duration::from_millis(SIM_PERIOD_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut dropped = 0u64;

    loop {
        ticker.tick().await;
        if let Some(limit) = duration {
            if walk.elapsed_ms >= limit.as_millis() as u64 {
                break;
            }
        }

        for input in walk.advance(start_ms) {
            let high_rate = matches!(input, SensorInput::Accel(_) | SensorInput::Gyro(_) | SensorInput::Mag(_));
            if high_rate {
                match sender.try_submit(input) {
                    Ok(true) => {}
                    Ok(false) => {
                        dropped += 1;
                        if dropped % 100 == 0 {
                            log::warn!("[sim] {} inertial samples dropped", dropped);
                        }
                    }
                    Err(TrackerError::NotRunning) => return Ok(()),
                    Err(e) => return Err(e),
                }
            } else if sender.submit(input).await.is_err() {
                return Ok(());
            }
        }
    }

    log::info!("[sim] Walk finished after {} ms", walk.elapsed_ms);
    Ok(())
}

// ─── Replay ──────────────────────────────────────────────────────────────────

/// Load a recording: one `SensorInput` JSON object per line. Unparseable lines
/// are skipped with a warning.
pub fn load_replay(path: &Path) -> TrackerResult<Vec<SensorInput>> {
    let file = File::open(path)
        .map_err(|e| TrackerError::InvalidConfig(format!("open replay {}: {}", path.display(), e)))?;

    let mut inputs = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| TrackerError::InvalidConfig(format!("read replay: {}", e)))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<SensorInput>(line) {
            Ok(input) => inputs.push(input),
            Err(e) => log::warn!("Skipping replay line {}: {}", line_no + 1, e),
        }
    }
    Ok(inputs)
}

fn input_timestamp(input: &SensorInput) -> Option<TimestampMs> {
    match input {
        SensorInput::Gps(fix) => Some(fix.timestamp_ms),
        SensorInput::Accel(a) => Some(a.timestamp_ms),
        SensorInput::Gyro(g) => Some(g.timestamp_ms),
        SensorInput::Mag(m) => Some(m.timestamp_ms),
        SensorInput::RadioScan { timestamp_ms, .. } => Some(*timestamp_ms),
        SensorInput::Permission { .. } | SensorInput::Network { .. } => None,
    }
}

/// Move a recorded timestamp onto the live clock.
fn restamp(input: &mut SensorInput, recorded_start: TimestampMs, live_start: TimestampMs) {
    let shift = |ts: &mut TimestampMs| *ts = live_start + ts.saturating_sub(recorded_start);
    match input {
        SensorInput::Gps(fix) => shift(&mut fix.timestamp_ms),
        SensorInput::Accel(a) => shift(&mut a.timestamp_ms),
        SensorInput::Gyro(g) => shift(&mut g.timestamp_ms),
        SensorInput::Mag(m) => shift(&mut m.timestamp_ms),
        SensorInput::RadioScan { timestamp_ms, .. } => shift(timestamp_ms),
        SensorInput::Permission { .. } | SensorInput::Network { .. } => {}
    }
}

/// Feed a recording at `speed`× real time, re-stamped onto the live clock so
/// staleness checks behave as they did when it was captured.
pub async fn run_replay(sender: TrackerSender, inputs: Vec<SensorInput>, speed: f64) -> TrackerResult<()> {
    if !(speed.is_finite() && speed > 0.0) {
        return Err(TrackerError::InvalidConfig(format!("replay speed must be positive, got {}", speed)));
    }
    let Some(recorded_start) = inputs.iter().find_map(input_timestamp) else {
        log::warn!("Replay contains no timestamped samples");
        return Ok(());
    };

    let live_start = now_ms();
    let total = inputs.len();
    let mut previous = recorded_start;

    for mut input in inputs {
        if let Some(ts) = input_timestamp(&input) {
            let gap = ts.saturating_sub(previous);
            if gap > 0 {
                sleep(Duration::from_secs_f64(gap as f64 / 1000.0 / speed)).await;
            }
            previous = previous.max(ts);
        }
        restamp(&mut input, recorded_start, live_start);
        if sender.submit(input).await.is_err() {
            log::warn!("Tracker stopped during replay");
            return Ok(());
        }
    }

    log::info!("Replay finished: {} inputs", total);
    Ok(())
}

// ─── Producer task ───────────────────────────────────────────────────────────

/// A spawned producer task. Dropping the handle aborts the task instead of
/// detaching it, so a producer never outlives the tracker it feeds.
pub struct Producer {
    handle: JoinHandle<TrackerResult<()>>,
    done: bool,
}

impl Producer {
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = TrackerResult<()>> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(task),
            done: false,
        }
    }

    /// Wait for the producer to run out of input. Cancel-safe, so it can sit
    /// in a `select!` next to a shutdown signal. Pends forever once the
    /// result has been taken.
    pub async fn finished(&mut self) -> TrackerResult<()> {
        if self.done {
            return std::future::pending().await;
        }
        let joined = (&mut self.handle).await;
        self.done = true;
        joined.map_err(|e| TrackerError::Internal(format!("producer task: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.done || self.handle.is_finished()
    }

    /// Abort the task and wait until it has actually stopped.
    pub async fn stop(&mut self) {
        if self.done {
            return;
        }
        self.handle.abort();
        match (&mut self.handle).await {
            Err(e) if e.is_cancelled() => log::debug!("Producer aborted"),
            Err(e) => log::error!("Producer task failed: {}", e),
            Ok(Err(e)) => log::error!("Producer failed: {}", e),
            Ok(Ok(())) => {}
        }
        self.done = true;
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
