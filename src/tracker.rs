// tracker.rs — single-owner actor around the fusion core
//
// All mutable estimation state lives in one tokio task. Producers (sensor
// adapters, timers, network reports, finished uploads and geocodes) only ever
// send messages into its inbox, so updates are applied in arrival order and
// every fusion tick reads a consistent registry.
//
// Outputs leave through a broadcast channel: fused locations, addresses,
// per-tick diagnostics and sync results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::address_cache::{AddressVerificationCache, VerifiedAddress};
use crate::config::TrackerConfig;
use crate::dead_reckoning::DeadReckoningEngine;
use crate::error::{TrackerError, TrackerResult};
use crate::geocode::{self, AddressEnricher, EnrichmentDecision, ReverseGeocoder};
use crate::live_status::{classify_sources, LiveStatus};
use crate::ranging::RadioRangingEstimator;
use crate::registry::SourceRegistry;
use crate::sensor_fusion::{FusionEngine, FusionEvent};
use crate::storage::LocationPersistenceQueue;
use crate::sync::{self, NetworkMonitor, SyncClient, SyncReport, SyncTrigger};
use crate::types::{
    now_ms, AccelData, FusedLocation, GeoPoint, GpsFix, GyroData, MagData, RadioReading, RadioTechnology, SourceKind,
    SourceSample, TimestampMs,
};

pub type Clock = Arc<dyn Fn() -> TimestampMs + Send + Sync>;

// ─── Inputs ──────────────────────────────────────────────────────────────────

/// Everything a platform adapter can deliver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorInput {
    Gps(GpsFix),
    Accel(AccelData),
    Gyro(GyroData),
    Mag(MagData),
    RadioScan {
        technology: RadioTechnology,
        timestamp_ms: TimestampMs,
        readings: Vec<RadioReading>,
    },
    Permission {
        kind: SourceKind,
        granted: bool,
    },
    Network {
        online: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    Fusion,
    Scan,
    DeadReckoning,
    Sync,
}

enum TrackerMessage {
    Input(SensorInput),
    Timer(TimerKind),
    SyncNow,
    SyncCompleted(SyncReport),
    GeocodeCompleted {
        point: GeoPoint,
        result: TrackerResult<String>,
    },
    ConfirmAddress {
        point: GeoPoint,
        text: String,
        reply: oneshot::Sender<VerifiedAddress>,
    },
    Status {
        reply: oneshot::Sender<LiveStatus>,
    },
    Stop,
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerOutput {
    Location {
        location: FusedLocation,
        primary: SourceKind,
        blended: bool,
        source_count: usize,
    },
    Address {
        text: String,
        latitude: f64,
        longitude: f64,
        from_cache: bool,
    },
    Diagnostics(LiveStatus),
    Synced {
        trigger: SyncTrigger,
        acknowledged: usize,
        unsynced: usize,
    },
}

/// External services the tracker calls. Both are optional.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub sync_client: Option<Arc<dyn SyncClient>>,
    pub geocoder: Option<Arc<dyn ReverseGeocoder>>,
}

// ─── Timers ──────────────────────────────────────────────────────────────────

/// One flag per timer, set while its tick sits in the inbox. A timer never
/// queues a second tick before the actor has handled the first.
#[derive(Clone, Default)]
struct TimerGates {
    fusion: Arc<AtomicBool>,
    scan: Arc<AtomicBool>,
    dead_reckoning: Arc<AtomicBool>,
    sync: Arc<AtomicBool>,
}

impl TimerGates {
    fn gate(&self, kind: TimerKind) -> &Arc<AtomicBool> {
        match kind {
            TimerKind::Fusion => &self.fusion,
            TimerKind::Scan => &self.scan,
            TimerKind::DeadReckoning => &self.dead_reckoning,
            TimerKind::Sync => &self.sync,
        }
    }
}

fn spawn_timer(
    kind: TimerKind,
    period_ms: u64,
    gate: Arc<AtomicBool>,
    inbox: mpsc::Sender<TrackerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            if gate.swap(true, Ordering::AcqRel) {
                log::trace!("{:?} tick still pending, skipping", kind);
                continue;
            }
            if inbox.send(TrackerMessage::Timer(kind)).await.is_err() {
                break;
            }
        }
    })
}

// ─── Public handle ───────────────────────────────────────────────────────────

/// Cheap, cloneable submission side of a running tracker.
#[derive(Clone)]
pub struct TrackerSender {
    inbox: mpsc::Sender<TrackerMessage>,
}

impl TrackerSender {
    pub async fn submit(&self, input: SensorInput) -> TrackerResult<()> {
        self.inbox
            .send(TrackerMessage::Input(input))
            .await
            .map_err(|_| TrackerError::NotRunning)
    }

    /// Non-blocking submit for high-rate producers. Returns `Ok(false)` when
    /// the inbox is full and the sample was dropped.
    pub fn try_submit(&self, input: SensorInput) -> TrackerResult<bool> {
        match self.inbox.try_send(TrackerMessage::Input(input)) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TrackerError::NotRunning),
        }
    }

    pub async fn confirm_address(&self, point: GeoPoint, text: impl Into<String>) -> TrackerResult<VerifiedAddress> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(TrackerMessage::ConfirmAddress {
                point,
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| TrackerError::NotRunning)?;
        rx.await.map_err(|_| TrackerError::NotRunning)
    }

    pub async fn status(&self) -> TrackerResult<LiveStatus> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(TrackerMessage::Status { reply })
            .await
            .map_err(|_| TrackerError::NotRunning)?;
        rx.await.map_err(|_| TrackerError::NotRunning)
    }

    /// Upload pending records now, subject to the usual in-flight guard.
    pub async fn sync_now(&self) -> TrackerResult<()> {
        self.inbox
            .send(TrackerMessage::SyncNow)
            .await
            .map_err(|_| TrackerError::NotRunning)
    }
}

struct Running {
    sender: TrackerSender,
    timers: Vec<JoinHandle<()>>,
    actor: JoinHandle<()>,
}

/// Owns the actor lifecycle. `start` and `stop` are explicit; stopping twice
/// is a no-op.
pub struct Tracker {
    config: TrackerConfig,
    collaborators: Collaborators,
    clock: Clock,
    outputs: broadcast::Sender<TrackerOutput>,
    running: Option<Running>,
}

impl Tracker {
    pub fn new(config: TrackerConfig, collaborators: Collaborators) -> TrackerResult<Self> {
        config.validate()?;
        let (outputs, _) = broadcast::channel(config.channel_capacity);
        Ok(Self {
            config,
            collaborators,
            clock: Arc::new(now_ms),
            outputs,
            running: None,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerOutput> {
        self.outputs.subscribe()
    }

    /// For consumers that subscribe lazily, such as one per WebSocket client.
    pub fn output_sender(&self) -> broadcast::Sender<TrackerOutput> {
        self.outputs.clone()
    }

    pub fn sender(&self) -> TrackerResult<TrackerSender> {
        self.running
            .as_ref()
            .map(|running| running.sender.clone())
            .ok_or(TrackerError::NotRunning)
    }

    /// Spawn the actor and its timers. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> TrackerResult<TrackerSender> {
        if self.running.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.channel_capacity);
        let gates = TimerGates::default();
        let actor = TrackerActor::new(
            self.config.clone(),
            self.collaborators.clone(),
            self.clock.clone(),
            self.outputs.clone(),
            inbox_rx,
            inbox_tx.downgrade(),
            gates.clone(),
        );
        let actor = tokio::spawn(actor.run());

        let timers = [
            (TimerKind::Fusion, self.config.fusion_interval_ms),
            (TimerKind::Scan, self.config.scan_interval_ms),
            (TimerKind::DeadReckoning, self.config.dead_reckoning_fallback_ms),
            (TimerKind::Sync, self.config.sync_interval_ms),
        ]
        .into_iter()
        .map(|(kind, period)| spawn_timer(kind, period, gates.gate(kind).clone(), inbox_tx.clone()))
        .collect();

        let sender = TrackerSender { inbox: inbox_tx };
        self.running = Some(Running {
            sender: sender.clone(),
            timers,
            actor,
        });
        log::info!("Tracker started");
        Ok(sender)
    }

    /// Cancel every timer, drain the inbox up to the stop marker and wait for
    /// the actor to exit. Senders handed out earlier report `NotRunning` after.
    pub async fn stop(&mut self) -> TrackerResult<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        for timer in &running.timers {
            timer.abort();
        }
        let _ = running.sender.inbox.send(TrackerMessage::Stop).await;
        running
            .actor
            .await
            .map_err(|e| TrackerError::Internal(format!("tracker actor failed: {}", e)))?;
        log::info!("Tracker stopped");
        Ok(())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            for timer in &running.timers {
                timer.abort();
            }
            running.actor.abort();
        }
    }
}

// ─── The actor ───────────────────────────────────────────────────────────────

struct TrackerActor {
    config: TrackerConfig,
    clock: Clock,
    started_at_ms: TimestampMs,

    registry: SourceRegistry,
    fusion: FusionEngine,
    wifi: RadioRangingEstimator,
    bluetooth: RadioRangingEstimator,
    dead_reckoning: DeadReckoningEngine,
    denied: BTreeSet<SourceKind>,
    reset_pending: bool,
    last_fix: Option<FusedLocation>,
    signal_lost: bool,
    sources_evicted: u64,
    gyro_samples: u64,

    queue: LocationPersistenceQueue,
    persistence_failures: u64,
    network: NetworkMonitor,
    sync_client: Option<Arc<dyn SyncClient>>,
    sync_in_flight: bool,
    last_sync_ms: Option<TimestampMs>,

    cache: AddressVerificationCache,
    enricher: AddressEnricher,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,

    outputs: broadcast::Sender<TrackerOutput>,
    inbox: mpsc::Receiver<TrackerMessage>,
    self_tx: mpsc::WeakSender<TrackerMessage>,
    gates: TimerGates,
}

impl TrackerActor {
    fn new(
        config: TrackerConfig,
        collaborators: Collaborators,
        clock: Clock,
        outputs: broadcast::Sender<TrackerOutput>,
        inbox: mpsc::Receiver<TrackerMessage>,
        self_tx: mpsc::WeakSender<TrackerMessage>,
        gates: TimerGates,
    ) -> Self {
        let queue = match &config.journal_path {
            Some(path) => LocationPersistenceQueue::open(path, config.fsync_appends).unwrap_or_else(|e| {
                log::error!("{}; queueing in memory only", e);
                LocationPersistenceQueue::in_memory()
            }),
            None => LocationPersistenceQueue::in_memory(),
        };

        let tolerance = config.address.confirm_tolerance_deg;
        let cache = match &config.address.snapshot_path {
            Some(path) => AddressVerificationCache::load(path, tolerance).unwrap_or_else(|e| {
                log::error!("{}; starting with an empty address cache", e);
                AddressVerificationCache::new(tolerance)
            }),
            None => AddressVerificationCache::new(tolerance),
        };

        let started_at_ms = clock();
        Self {
            registry: SourceRegistry::new(),
            fusion: FusionEngine::new(config.fusion.clone()),
            wifi: RadioRangingEstimator::new(RadioTechnology::Wifi, config.wifi, config.emitter_staleness_ms),
            bluetooth: RadioRangingEstimator::new(
                RadioTechnology::Bluetooth,
                config.bluetooth,
                config.emitter_staleness_ms,
            ),
            dead_reckoning: DeadReckoningEngine::new(config.dead_reckoning.clone()),
            denied: BTreeSet::new(),
            reset_pending: false,
            last_fix: None,
            signal_lost: false,
            sources_evicted: 0,
            gyro_samples: 0,

            queue,
            persistence_failures: 0,
            network: NetworkMonitor::new(),
            sync_client: collaborators.sync_client,
            sync_in_flight: false,
            last_sync_ms: None,

            cache,
            enricher: AddressEnricher::new(config.address.min_displacement_m, config.address.lookup_radius_m),
            geocoder: collaborators.geocoder,

            outputs,
            inbox,
            self_tx,
            gates,
            clock,
            started_at_ms,
            config,
        }
    }

    async fn run(mut self) {
        log::debug!("Tracker actor running, {} unsynced records", self.queue.unsynced_count());
        while let Some(message) = self.inbox.recv().await {
            if self.handle(message).is_break() {
                break;
            }
        }
        if let Some(path) = &self.config.status_path {
            let status = self.build_status((self.clock)());
            if let Err(e) = status.save(path) {
                log::warn!("Failed to write final status: {}", e);
            }
        }
        log::debug!("Tracker actor exited");
    }

    fn handle(&mut self, message: TrackerMessage) -> ControlFlow<()> {
        match message {
            TrackerMessage::Input(input) => self.on_input(input),
            TrackerMessage::Timer(kind) => {
                match kind {
                    TimerKind::Fusion => self.on_fusion_tick(),
                    TimerKind::Scan => self.on_scan_tick(),
                    TimerKind::DeadReckoning => self.on_dead_reckoning_tick(),
                    TimerKind::Sync => self.start_sync(SyncTrigger::Periodic),
                }
                self.gates.gate(kind).store(false, Ordering::Release);
            }
            TrackerMessage::SyncNow => self.start_sync(SyncTrigger::Manual),
            TrackerMessage::SyncCompleted(report) => self.on_sync_completed(report),
            TrackerMessage::GeocodeCompleted { point, result } => self.on_geocode_completed(point, result),
            TrackerMessage::ConfirmAddress { point, text, reply } => {
                let entry = self.confirm_address(point, &text);
                let _ = reply.send(entry);
            }
            TrackerMessage::Status { reply } => {
                let _ = reply.send(self.build_status((self.clock)()));
            }
            TrackerMessage::Stop => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    // ── Inputs ──

    fn on_input(&mut self, input: SensorInput) {
        match input {
            SensorInput::Gps(fix) => self.on_gps(fix),
            SensorInput::Accel(accel) => {
                if self.denied.contains(&SourceKind::DeadReckoning) {
                    return;
                }
                if let Some(sample) = self.dead_reckoning.on_accelerometer(&accel) {
                    self.registry.upsert(sample);
                }
            }
            SensorInput::Gyro(_) => self.gyro_samples += 1,
            SensorInput::Mag(mag) => self.dead_reckoning.on_magnetometer(&mag),
            SensorInput::RadioScan {
                technology,
                timestamp_ms,
                readings,
            } => self.on_radio_scan(technology, timestamp_ms, &readings),
            SensorInput::Permission { kind, granted } => self.on_permission(kind, granted),
            SensorInput::Network { online } => {
                if self.network.observe(online) {
                    log::info!("Network restored, syncing pending records");
                    self.start_sync(SyncTrigger::NetworkRestored);
                }
            }
        }
    }

    fn on_gps(&mut self, fix: GpsFix) {
        if self.denied.contains(&SourceKind::Satellite) {
            log::debug!("Ignoring satellite fix while permission is denied");
            return;
        }
        let valid = fix.latitude.is_finite()
            && fix.longitude.is_finite()
            && fix.accuracy_m.is_finite()
            && fix.accuracy_m > 0.0
            && !(fix.latitude == 0.0 && fix.longitude == 0.0);
        if !valid {
            log::debug!("Discarding unusable satellite fix {:?}", fix);
            return;
        }

        let point = GeoPoint::new(fix.latitude, fix.longitude);
        let satellite_fresh =
            self.registry
                .is_fresh(SourceKind::Satellite, fix.timestamp_ms, self.config.fusion.source_timeout_ms);
        if self.reset_pending || !satellite_fresh {
            let event = self.fusion.reset_to(point);
            log_fusion_event(&event);
            self.reset_pending = false;
        }

        self.registry.upsert(SourceSample::Satellite {
            position: point,
            accuracy_m: fix.accuracy_m,
            captured_at_ms: fix.timestamp_ms,
        });
        self.dead_reckoning.set_trusted_position(point);
    }

    fn on_radio_scan(&mut self, technology: RadioTechnology, timestamp_ms: TimestampMs, readings: &[RadioReading]) {
        if self.denied.contains(&technology.source_kind()) {
            return;
        }
        let estimator = match technology {
            RadioTechnology::Wifi => &mut self.wifi,
            RadioTechnology::Bluetooth => &mut self.bluetooth,
        };
        estimator.ingest_scan(readings, timestamp_ms);
        estimator.prune(timestamp_ms);
        if let Some(sample) = estimator.contribution() {
            self.registry.upsert(sample);
        }
    }

    fn on_permission(&mut self, kind: SourceKind, granted: bool) {
        if granted {
            if self.denied.remove(&kind) {
                log::info!("Permission granted for {} source", kind);
            }
            if kind == SourceKind::Satellite {
                self.reset_pending = true;
            }
        } else {
            if self.denied.insert(kind) {
                log::warn!("{}", TrackerError::PermissionDenied(kind));
            }
            self.registry.remove(kind);
        }
    }

    // ── Timers ──

    fn on_fusion_tick(&mut self) {
        let now = (self.clock)();
        let tick = self.fusion.tick(&self.registry, now);
        for event in &tick.events {
            log_fusion_event(event);
        }

        match (&tick.outcome, self.signal_lost) {
            (None, false) if self.last_fix.is_some() => {
                self.signal_lost = true;
                log::warn!(
                    "{}",
                    TrackerError::SignalUnavailable(format!(
                        "no positioned source within {} ms",
                        self.config.fusion.source_timeout_ms
                    ))
                );
            }
            (Some(_), true) => {
                self.signal_lost = false;
                log::info!("Positioning signal recovered");
            }
            _ => {}
        }

        if let Some(outcome) = tick.outcome {
            let fix = outcome.location;
            self.last_fix = Some(fix);

            if let Err(e) = self.queue.append(&fix, &outcome.sources) {
                self.persistence_failures += 1;
                log::error!("Fix at {} not recorded: {}", fix.produced_at_ms, e);
            }

            let _ = self.outputs.send(TrackerOutput::Location {
                location: fix,
                primary: outcome.primary,
                blended: outcome.blended,
                source_count: outcome.sources.len(),
            });

            self.enrich(fix.point());
        }

        let status = self.build_status(now);
        if let Some(path) = &self.config.status_path {
            if let Err(e) = status.save(path) {
                log::debug!("Failed to write status file: {}", e);
            }
        }
        let _ = self.outputs.send(TrackerOutput::Diagnostics(status));
    }

    fn on_scan_tick(&mut self) {
        let now = (self.clock)();
        for kind in self.registry.evict_stale(now, self.config.source_eviction_ms) {
            self.sources_evicted += 1;
            log::info!("{} source silent for over {} ms, dropped", kind, self.config.source_eviction_ms);
        }

        for estimator in [&mut self.wifi, &mut self.bluetooth] {
            let pruned = estimator.prune(now);
            if pruned > 0 {
                log::debug!("Pruned {} stale {:?} emitters", pruned, estimator.technology());
            }
            if let Some(sample) = estimator.contribution() {
                self.registry.upsert(sample);
            }
        }
    }

    fn on_dead_reckoning_tick(&mut self) {
        if self.denied.contains(&SourceKind::DeadReckoning) {
            return;
        }
        if let Some(sample) = self.dead_reckoning.on_fallback_tick((self.clock)()) {
            self.registry.upsert(sample);
        }
    }

    // ── Sync ──

    fn start_sync(&mut self, trigger: SyncTrigger) {
        let Some(client) = self.sync_client.clone() else {
            return;
        };
        if self.sync_in_flight {
            log::debug!("Sync already in flight, skipping {:?} trigger", trigger);
            return;
        }
        if !self.network.is_online() {
            log::debug!("Network offline, deferring sync");
            return;
        }
        let batch = self.queue.drain_batch(self.config.sync_batch_size);
        if batch.is_empty() {
            return;
        }
        let Some(inbox) = self.self_tx.upgrade() else {
            return;
        };

        self.sync_in_flight = true;
        log::debug!("Uploading {} records ({:?})", batch.len(), trigger);
        tokio::spawn(async move {
            let report = sync::upload_batch(client, trigger, batch).await;
            let _ = inbox.send(TrackerMessage::SyncCompleted(report)).await;
        });
    }

    fn on_sync_completed(&mut self, report: SyncReport) {
        self.sync_in_flight = false;
        if report.result.is_err() {
            return;
        }

        let ids = report.acknowledged_ids();
        match self.queue.acknowledge(&ids) {
            Ok(acknowledged) => {
                self.last_sync_ms = Some((self.clock)());
                log::info!(
                    "Synced {} of {} records, {} pending",
                    acknowledged,
                    report.sent.len(),
                    self.queue.unsynced_count()
                );
                let _ = self.outputs.send(TrackerOutput::Synced {
                    trigger: report.trigger,
                    acknowledged,
                    unsynced: self.queue.unsynced_count(),
                });
            }
            Err(e) => {
                self.persistence_failures += 1;
                log::error!("Acknowledgment not recorded, records will be resent: {}", e);
            }
        }
    }

    // ── Addresses ──

    fn enrich(&mut self, point: GeoPoint) {
        let now = (self.clock)();
        match self.enricher.evaluate(point, now, &self.cache, self.geocoder.is_some()) {
            EnrichmentDecision::Skip => {}
            EnrichmentDecision::CacheHit(text) => {
                let _ = self.outputs.send(TrackerOutput::Address {
                    text,
                    latitude: point.latitude,
                    longitude: point.longitude,
                    from_cache: true,
                });
            }
            EnrichmentDecision::Geocode(point) => {
                let (Some(geocoder), Some(inbox)) = (self.geocoder.clone(), self.self_tx.upgrade()) else {
                    self.enricher.complete(
                        &Err(TrackerError::GeocodeFailure("tracker shutting down".to_string())),
                        now,
                    );
                    return;
                };
                tokio::spawn(async move {
                    let result = geocode::resolve(geocoder, point).await;
                    let _ = inbox.send(TrackerMessage::GeocodeCompleted { point, result }).await;
                });
            }
        }
    }

    fn on_geocode_completed(&mut self, point: GeoPoint, result: TrackerResult<String>) {
        self.enricher.complete(&result, (self.clock)());
        if let Ok(text) = result {
            let _ = self.outputs.send(TrackerOutput::Address {
                text,
                latitude: point.latitude,
                longitude: point.longitude,
                from_cache: false,
            });
        }
    }

    fn confirm_address(&mut self, point: GeoPoint, text: &str) -> VerifiedAddress {
        let entry = self.cache.confirm(point, text, (self.clock)());
        if let Some(path) = &self.config.address.snapshot_path {
            if let Err(e) = self.cache.save(path) {
                self.persistence_failures += 1;
                log::error!("Address cache snapshot not saved: {}", e);
            }
        }
        entry
    }

    // ── Diagnostics ──

    fn build_status(&self, now: TimestampMs) -> LiveStatus {
        let snapshot = self.fusion.get_snapshot();
        let mut status = LiveStatus::new(now);
        status.uptime_seconds = now.saturating_sub(self.started_at_ms) / 1000;
        status.sources = classify_sources(&self.registry, &self.denied, now, self.config.fusion.source_timeout_ms);
        status.last_fix = self.last_fix;
        status.current_address = self.enricher.current_address().map(str::to_string);
        status.step_count = self.dead_reckoning.step_count();
        status.heading_deg = self
            .dead_reckoning
            .heading_known()
            .then(|| self.dead_reckoning.heading_deg());
        status.wifi_emitters = self.wifi.emitter_count();
        status.bluetooth_emitters = self.bluetooth.emitter_count();
        status.radio_scans = self.wifi.scans_ingested() + self.bluetooth.scans_ingested();
        status.ticks_emitted = snapshot.ticks_emitted;
        status.ticks_skipped = snapshot.ticks_skipped;
        status.sources_evicted = self.sources_evicted;
        status.signal_lost = self.signal_lost;
        status.unsynced_count = self.queue.unsynced_count();
        status.persistence_failures = self.persistence_failures;
        status.network = self.network.state();
        status.sync_in_flight = self.sync_in_flight;
        status.last_sync_ms = self.last_sync_ms;
        status.verified_addresses = self.cache.len();
        status
    }
}

fn log_fusion_event(event: &FusionEvent) {
    match event {
        FusionEvent::TickSkipped { stale_or_absent } => {
            log::debug!("Fusion tick skipped: no active source ({} stale)", stale_or_absent)
        }
        FusionEvent::PrimarySelected { kind, score } => log::debug!("Primary source {} (score {:.1})", kind, score),
        FusionEvent::Blended { sources, accuracy_m } => {
            log::debug!("Blended {} sources, accuracy {:.1} m", sources, accuracy_m)
        }
        FusionEvent::FilterReset { latitude, longitude } => {
            log::info!("Filter reset to trusted fix ({:.6}, {:.6})", latitude, longitude)
        }
    }
}
