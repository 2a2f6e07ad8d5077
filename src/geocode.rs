use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::address_cache::AddressVerificationCache;
use crate::error::{TrackerError, TrackerResult};
use crate::geodesy::haversine_distance;
use crate::types::{GeoPoint, TimestampMs};

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, point: GeoPoint) -> TrackerResult<String>;
}

/// Minimum spacing between outgoing requests
struct RateLimit {
    last_request: Option<Instant>,
    min_interval: Duration,
}

impl RateLimit {
    fn new(min_interval: Duration) -> Self {
        RateLimit {
            last_request: None,
            min_interval,
        }
    }

    fn wait_time(&self, now: Instant) -> Duration {
        match self.last_request {
            Some(last) => self.min_interval.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

#[derive(Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
    error: Option<String>,
}

/// Nominatim-style reverse geocoder.
///
/// # Request
/// `GET {base_url}/reverse?format=jsonv2&lat={lat}&lon={lon}`, reading
/// `display_name` from the response.
///
/// # Rate Limiting
/// - At most one request per `min_interval` (1 s by default, the public
///   Nominatim usage policy)
/// - HTTP 429 is reported as a failure; the enricher retries later
pub struct HttpReverseGeocoder {
    client: reqwest::Client,
    base_url: String,
    rate_limit: Mutex<RateLimit>,
}

impl HttpReverseGeocoder {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("location_fusion/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limit: Mutex::new(RateLimit::new(Duration::from_secs(1))),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.rate_limit = Mutex::new(RateLimit::new(min_interval));
        self
    }

    async fn respect_rate_limit(&self) {
        let mut rate_limit = self.rate_limit.lock().await;
        let wait = rate_limit.wait_time(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        rate_limit.last_request = Some(Instant::now());
    }
}

#[async_trait]
impl ReverseGeocoder for HttpReverseGeocoder {
    async fn reverse_geocode(&self, point: GeoPoint) -> TrackerResult<String> {
        self.respect_rate_limit().await;

        let url = format!("{}/reverse", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", point.latitude.to_string()),
                ("lon", point.longitude.to_string()),
            ])
            .send()
            .await
            .map_err(|e| TrackerError::GeocodeFailure(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            log::warn!("Rate limited by reverse geocoder");
            return Err(TrackerError::GeocodeFailure("rate limited".to_string()));
        } else if !status.is_success() {
            return Err(TrackerError::GeocodeFailure(format!("HTTP error: {}", status.as_u16())));
        }

        let body: ReverseResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::GeocodeFailure(format!("bad response body: {}", e)))?;
        parse_reverse_response(body)
    }
}

fn parse_reverse_response(body: ReverseResponse) -> TrackerResult<String> {
    if let Some(err) = body.error {
        return Err(TrackerError::GeocodeFailure(err));
    }
    match body.display_name {
        Some(name) if !name.trim().is_empty() => Ok(name),
        _ => Err(TrackerError::GeocodeFailure("no address at location".to_string())),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnrichmentDecision {
    /// Not moved far enough, or a lookup is already running.
    Skip,
    CacheHit(String),
    /// Cache miss: call the geocoder for this point.
    Geocode(GeoPoint),
}

/// First wait after a failed geocode at an unchanged position.
pub const INITIAL_RETRY_BACKOFF_MS: u64 = 30_000;
/// Failures keep doubling the wait up to this ceiling.
pub const MAX_RETRY_BACKOFF_MS: u64 = 600_000;

/// Decides when a fused fix warrants an address lookup.
///
/// A lookup happens only after moving more than `min_displacement_m` from the
/// previous one, consults the verified-address cache first, and never has
/// more than one geocode in flight. A failed geocode keeps its anchor and
/// backs off: nothing is requested until the backoff expires, after which
/// the same spot is retried once.
pub struct AddressEnricher {
    min_displacement_m: f64,
    lookup_radius_m: f64,
    last_lookup: Option<GeoPoint>,
    in_flight: bool,
    retry_at_ms: Option<TimestampMs>,
    backoff_ms: u64,
    current_address: Option<String>,
    cache_hits: u64,
    geocode_calls: u64,
}

impl AddressEnricher {
    pub fn new(min_displacement_m: f64, lookup_radius_m: f64) -> Self {
        Self {
            min_displacement_m,
            lookup_radius_m,
            last_lookup: None,
            in_flight: false,
            retry_at_ms: None,
            backoff_ms: INITIAL_RETRY_BACKOFF_MS,
            current_address: None,
            cache_hits: 0,
            geocode_calls: 0,
        }
    }

    /// Without a geocoder a cache miss is a skip, and the anchor still moves.
    pub fn evaluate(
        &mut self,
        point: GeoPoint,
        now_ms: TimestampMs,
        cache: &AddressVerificationCache,
        geocoder_available: bool,
    ) -> EnrichmentDecision {
        if self.in_flight {
            return EnrichmentDecision::Skip;
        }
        let retry_due = match self.retry_at_ms {
            Some(at) if now_ms < at => return EnrichmentDecision::Skip,
            Some(_) => true,
            None => false,
        };
        if !retry_due {
            if let Some(last) = self.last_lookup {
                if haversine_distance(last, point) <= self.min_displacement_m {
                    return EnrichmentDecision::Skip;
                }
            }
        }
        self.last_lookup = Some(point);
        self.retry_at_ms = None;

        if let Some(text) = cache.lookup_text(point, self.lookup_radius_m) {
            self.cache_hits += 1;
            self.current_address = Some(text.clone());
            return EnrichmentDecision::CacheHit(text);
        }
        if !geocoder_available {
            return EnrichmentDecision::Skip;
        }

        self.in_flight = true;
        self.geocode_calls += 1;
        EnrichmentDecision::Geocode(point)
    }

    /// Settle the in-flight lookup. A failure schedules one retry at the same
    /// anchor after the current backoff.
    pub fn complete(&mut self, result: &TrackerResult<String>, now_ms: TimestampMs) {
        self.in_flight = false;
        match result {
            Ok(text) => {
                self.current_address = Some(text.clone());
                self.backoff_ms = INITIAL_RETRY_BACKOFF_MS;
            }
            Err(_) => {
                self.retry_at_ms = Some(now_ms.saturating_add(self.backoff_ms));
                log::debug!("Next reverse geocode attempt in {} s", self.backoff_ms / 1000);
                self.backoff_ms = (self.backoff_ms * 2).min(MAX_RETRY_BACKOFF_MS);
            }
        }
    }

    pub fn current_address(&self) -> Option<&str> {
        self.current_address.as_deref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    pub fn geocode_calls(&self) -> u64 {
        self.geocode_calls
    }
}

/// Run one geocode, logging failures.
pub async fn resolve(geocoder: Arc<dyn ReverseGeocoder>, point: GeoPoint) -> TrackerResult<String> {
    let result = geocoder.reverse_geocode(point).await;
    match &result {
        Err(e) if e.is_transient() => {
            log::warn!("Reverse geocode at ({:.5}, {:.5}) failed: {}", point.latitude, point.longitude, e)
        }
        Err(e) => log::error!("Reverse geocode at ({:.5}, {:.5}) failed: {}", point.latitude, point.longitude, e),
        Ok(_) => {}
    }
    result
}
