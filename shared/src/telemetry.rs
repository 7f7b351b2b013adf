//! Adaptive location reporting.
//!
//! Cadence is Normal or Live and only ever changes on a flag pushed by the
//! remote service. Reports are best-effort: failures are logged and dropped.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    GeoProvider, GeoReadOptions, KvError, KvStore, LocationReport, PositionSource,
    PushChannel, PushMessage, Subscription, TelemetrySink,
};
use crate::geo::{BoundingBox, PositionSample, SignalQuality};
use crate::model::{Clock, DriverId, TrackingMode, TripId, UnixTimeMs};
use crate::position_cache::LastKnownPositionCache;
use crate::{
    DEFAULT_CACHE_MAX_AGE_MS, DEFAULT_LIVE_INTERVAL_MS, DEFAULT_NORMAL_INTERVAL_MS,
};

/// Sources tried in order on every tick until one yields a usable fix.
const FALLBACK_CHAIN: [PositionSource; 2] = [PositionSource::Fresh, PositionSource::Cached];

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(with = "crate::config::duration_ms")]
    pub normal_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub live_interval: Duration,
    pub bounds: BoundingBox,
    #[serde(with = "crate::config::duration_ms")]
    pub cache_max_age: Duration,
    pub gps: GeoReadOptions,
    /// Push topic is this prefix followed by the driver id.
    pub topic_prefix: String,
    /// Field of the pushed row that carries the live-tracking flag.
    pub live_flag_field: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            normal_interval: Duration::from_millis(DEFAULT_NORMAL_INTERVAL_MS),
            live_interval: Duration::from_millis(DEFAULT_LIVE_INTERVAL_MS),
            bounds: BoundingBox::SERVICE_AREA,
            cache_max_age: Duration::from_millis(DEFAULT_CACHE_MAX_AGE_MS),
            gps: GeoReadOptions::default(),
            topic_prefix: "live-tracking-".to_string(),
            live_flag_field: "is_tracked_in_realtime".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> Result<(), TelemetryError> {
        if self.normal_interval.is_zero() || self.live_interval.is_zero() {
            return Err(TelemetryError::Validation(
                "reporting intervals must be > 0".into(),
            ));
        }
        if !self.bounds.is_well_formed() {
            return Err(TelemetryError::Validation(
                "bounds must be a well-formed box".into(),
            ));
        }
        if self.topic_prefix.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "topic_prefix cannot be empty".into(),
            ));
        }
        if self.live_flag_field.trim().is_empty() {
            return Err(TelemetryError::Validation(
                "live_flag_field cannot be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn interval_for(&self, mode: TrackingMode) -> Duration {
        match mode {
            TrackingMode::Normal => self.normal_interval,
            TrackingMode::Live => self.live_interval,
        }
    }

    fn topic_for(&self, driver_id: &DriverId) -> String {
        format!("{}{}", self.topic_prefix, driver_id)
    }
}

/// Per-driver runtime state for one tracking context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub driver_id: DriverId,
    pub trip_id: Option<TripId>,
    pub mode: TrackingMode,
    pub last_good_position: Option<PositionSample>,
}

/// Diagnostics snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub driver_id: DriverId,
    pub trip_id: Option<TripId>,
    pub mode: TrackingMode,
    pub last_position: Option<PositionSample>,
    pub signal: SignalQuality,
    pub subscribed: bool,
    pub reschedules: u64,
    pub reports_sent: u64,
    pub last_report_at: Option<UnixTimeMs>,
}

#[derive(Debug)]
struct TrackingState {
    session: TrackingSession,
    is_tracking: bool,
    subscribed: bool,
    reschedules: u64,
    reports_sent: u64,
    last_report_at: Option<UnixTimeMs>,
}

pub struct TelemetryLoop {
    geo: Arc<dyn GeoProvider>,
    cache: LastKnownPositionCache,
    push: Arc<dyn PushChannel>,
    sink: Arc<dyn TelemetrySink>,
    clock: Arc<dyn Clock>,
    config: TelemetryConfig,
}

impl TelemetryLoop {
    pub fn new(
        geo: Arc<dyn GeoProvider>,
        store: Arc<dyn KvStore>,
        push: Arc<dyn PushChannel>,
        sink: Arc<dyn TelemetrySink>,
        clock: Arc<dyn Clock>,
        config: TelemetryConfig,
    ) -> Result<Self, TelemetryError> {
        config.validate()?;
        let max_age_ms = u64::try_from(config.cache_max_age.as_millis()).unwrap_or(u64::MAX);
        let cache = LastKnownPositionCache::new(store, config.bounds, max_age_ms)?;
        Ok(Self {
            geo,
            cache,
            push,
            sink,
            clock,
            config,
        })
    }

    /// Starts tracking for one driver.
    ///
    /// Loads the cached fix, subscribes to the mode flag, warms the GPS with a
    /// foreground read, then reports right away and on every interval. A
    /// failed subscription leaves tracking running in Normal mode.
    #[instrument(skip_all, fields(driver = %driver_id))]
    pub async fn init(
        self: &Arc<Self>,
        driver_id: DriverId,
        trip_id: Option<TripId>,
    ) -> TrackingHandle {
        let last_good_position = self.cache.get(self.clock.now()).await;

        let topic = self.config.topic_for(&driver_id);
        let subscription = match self.push.subscribe(&topic).await {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                warn!(
                    topic = %topic,
                    error = %e,
                    "mode flag subscription failed, staying in normal mode"
                );
                None
            }
        };

        let state = Arc::new(RwLock::new(TrackingState {
            session: TrackingSession {
                driver_id,
                trip_id,
                mode: TrackingMode::Normal,
                last_good_position,
            },
            is_tracking: true,
            subscribed: subscription.is_some(),
            reschedules: 0,
            reports_sent: 0,
            last_report_at: None,
        }));

        if self.read_fresh(&state).await.is_none() {
            debug!("no first fix, will retry on schedule");
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(self).run(state.clone(), subscription, stop_rx));
        info!("tracking started");

        TrackingHandle {
            state,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    async fn run(
        self: Arc<Self>,
        state: Arc<RwLock<TrackingState>>,
        mut subscription: Option<Subscription>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.ticker(TrackingMode::Normal, Instant::now());

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                message = next_message(&mut subscription) => match message {
                    Some(message) => {
                        if let Some(mode) = self.parse_mode(&message) {
                            if self.switch_mode(&state, mode).await {
                                let interval = self.config.interval_for(mode);
                                ticker = self.ticker(mode, Instant::now() + interval);
                            }
                        }
                    }
                    None => {
                        warn!("mode flag subscription closed");
                        subscription = None;
                        state.write().await.subscribed = false;
                    }
                },
                _ = ticker.tick() => self.report_once(&state).await,
            }
        }

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        state.write().await.is_tracking = false;
        info!("tracking stopped");
    }

    fn ticker(&self, mode: TrackingMode, start: Instant) -> Interval {
        let mut ticker = tokio::time::interval_at(start, self.config.interval_for(mode));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn parse_mode(&self, message: &PushMessage) -> Option<TrackingMode> {
        let flag = match &message.value {
            serde_json::Value::Bool(live) => Some(*live),
            value => value
                .get(&self.config.live_flag_field)
                .and_then(serde_json::Value::as_bool),
        };
        if flag.is_none() {
            debug!(topic = %message.topic, "push message without a tracking flag");
        }
        flag.map(TrackingMode::from_live_flag)
    }

    /// Applies a pushed mode. Repeating the current mode does nothing.
    async fn switch_mode(&self, state: &RwLock<TrackingState>, mode: TrackingMode) -> bool {
        {
            let mut state = state.write().await;
            if state.session.mode == mode {
                return false;
            }
            state.session.mode = mode;
            state.reschedules += 1;
        }
        info!(
            mode = ?mode,
            interval_ms = self.config.interval_for(mode).as_millis() as u64,
            "tracking mode switched"
        );
        self.report_once(state).await;
        true
    }

    async fn report_once(&self, state: &RwLock<TrackingState>) {
        let Some((sample, source)) = self.resolve_position(state).await else {
            debug!("no usable position, skipping report");
            return;
        };

        let report = {
            let state = state.read().await;
            LocationReport {
                driver_id: state.session.driver_id.clone(),
                trip_id: state.session.trip_id.clone(),
                lat: sample.lat,
                lng: sample.lng,
                accuracy: sample.accuracy,
                sampled_at: sample.timestamp,
                source,
                mode: state.session.mode,
            }
        };

        match self.sink.report(&report).await {
            Ok(()) => {
                let mut state = state.write().await;
                state.reports_sent += 1;
                state.last_report_at = Some(self.clock.now());
            }
            Err(e) => warn!(error = %e, "location report failed"),
        }
    }

    async fn resolve_position(
        &self,
        state: &RwLock<TrackingState>,
    ) -> Option<(PositionSample, PositionSource)> {
        for source in FALLBACK_CHAIN {
            let sample = match source {
                PositionSource::Fresh => self.read_fresh(state).await,
                PositionSource::Cached => self.cached(state).await,
            };
            if let Some(sample) = sample {
                return Some((sample, source));
            }
        }
        None
    }

    /// Reads the sensor; a valid fix becomes the new last good position.
    async fn read_fresh(&self, state: &RwLock<TrackingState>) -> Option<PositionSample> {
        let sample = match self.geo.read(self.config.gps).await {
            Ok(sample) => sample,
            Err(e) if !e.is_retryable() => {
                warn!(error = %e, "location unavailable until the user acts");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "gps read failed");
                return None;
            }
        };

        if !sample.is_valid_in(&self.config.bounds) {
            warn!(lat = sample.lat, lng = sample.lng, "discarding invalid fix");
            return None;
        }

        state.write().await.session.last_good_position = Some(sample);
        if let Err(e) = self.cache.put(&sample).await {
            warn!(error = %e, "failed to cache position");
        }
        Some(sample)
    }

    async fn cached(&self, state: &RwLock<TrackingState>) -> Option<PositionSample> {
        let last = state.read().await.session.last_good_position?;
        if self.cache.is_usable(&last, self.clock.now()) {
            debug!(sampled_at = %last.timestamp, "falling back to last good position");
            Some(last)
        } else {
            None
        }
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<PushMessage> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

/// Running tracking context. Dropping it stops tracking without waiting.
pub struct TrackingHandle {
    state: Arc<RwLock<TrackingState>>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TrackingHandle {
    pub async fn get_status(&self) -> TrackingStatus {
        let state = self.state.read().await;
        let last_position = state.session.last_good_position;
        TrackingStatus {
            is_tracking: state.is_tracking,
            driver_id: state.session.driver_id.clone(),
            trip_id: state.session.trip_id.clone(),
            mode: state.session.mode,
            last_position,
            signal: SignalQuality::from_accuracy(last_position.and_then(|p| p.accuracy)),
            subscribed: state.subscribed,
            reschedules: state.reschedules,
            reports_sent: state.reports_sent,
            last_report_at: state.last_report_at,
        }
    }

    pub async fn session(&self) -> TrackingSession {
        self.state.read().await.session.clone()
    }

    /// Cancels the timer and drops the subscription. A report already in
    /// flight finishes first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "tracking task ended abnormally");
            }
        }
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{BroadcastPushChannel, GpsError, MemoryKvStore, RemoteError};
    use crate::model::ManualClock;
    use crate::test_support::{RecordingSink, ScriptedGeo};
    use serde_json::json;

    const DRIVER: &str = "U100";
    const TOPIC: &str = "live-tracking-U100";
    const HOUR_MS: u64 = 60 * 60 * 1000;
    const BANGKOK: (f64, f64) = (13.7563, 100.5018);

    struct Harness {
        geo: Arc<ScriptedGeo>,
        store: Arc<MemoryKvStore>,
        push: BroadcastPushChannel,
        sink: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                geo: Arc::new(ScriptedGeo::fixed(BANGKOK.0, BANGKOK.1)),
                store: Arc::new(MemoryKvStore::new()),
                push: BroadcastPushChannel::new(),
                sink: Arc::new(RecordingSink::new()),
                clock: Arc::new(ManualClock::new(UnixTimeMs(0))),
            }
        }

        fn telemetry(&self) -> Arc<TelemetryLoop> {
            Arc::new(
                TelemetryLoop::new(
                    self.geo.clone(),
                    self.store.clone(),
                    Arc::new(self.push.clone()),
                    self.sink.clone(),
                    self.clock.clone(),
                    TelemetryConfig::default(),
                )
                .unwrap(),
            )
        }

        async fn start(&self) -> TrackingHandle {
            let handle = self
                .telemetry()
                .init(DriverId::new(DRIVER).unwrap(), Some(TripId::new("T9").unwrap()))
                .await;
            settle().await;
            handle
        }
    }

    /// Lets the tracking task run without crossing a reporting boundary.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    fn normal() -> Duration {
        Duration::from_millis(DEFAULT_NORMAL_INTERVAL_MS)
    }

    fn live() -> Duration {
        Duration::from_millis(DEFAULT_LIVE_INTERVAL_MS)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_immediately_then_on_normal_interval() {
        let h = Harness::new();
        let handle = h.start().await;

        assert_eq!(h.sink.reports().len(), 1);
        // Foreground warm-up read plus the first report.
        assert_eq!(h.geo.reads(), 2);

        tokio::time::sleep(normal()).await;
        let reports = h.sink.reports();
        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| r.source == PositionSource::Fresh && r.mode == TrackingMode::Normal));
        assert_eq!(reports[0].trip_id.as_ref().map(TripId::as_str), Some("T9"));

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_flag_switches_cadence_once() {
        let h = Harness::new();
        let handle = h.start().await;
        assert_eq!(h.sink.reports().len(), 1);

        h.push.publish(TOPIC, json!({ "is_tracked_in_realtime": true }));
        settle().await;
        h.push.publish(TOPIC, json!({ "is_tracked_in_realtime": true }));
        settle().await;

        let status = handle.get_status().await;
        assert_eq!(status.mode, TrackingMode::Live);
        assert_eq!(status.reschedules, 1);
        let reports = h.sink.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].mode, TrackingMode::Live);

        tokio::time::sleep(live()).await;
        assert_eq!(h.sink.reports().len(), 3);

        h.push.publish(TOPIC, json!(false));
        settle().await;
        let status = handle.get_status().await;
        assert_eq!(status.mode, TrackingMode::Normal);
        assert_eq!(status.reschedules, 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_without_flag_are_ignored() {
        let h = Harness::new();
        let handle = h.start().await;

        h.push.publish(TOPIC, json!({ "lat": 13.0 }));
        settle().await;

        let status = handle.get_status().await;
        assert_eq!(status.mode, TrackingMode::Normal);
        assert_eq!(status.reschedules, 0);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_cached_position() {
        let h = Harness::new();
        h.clock.set(UnixTimeMs(10 * HOUR_MS));
        let handle = h.start().await;

        h.geo.set_fallback(Err(GpsError::Timeout));
        tokio::time::sleep(normal()).await;

        let reports = h.sink.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].source, PositionSource::Cached);
        assert_eq!((reports[1].lat, reports[1].lng), BANGKOK);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_uses_cache_until_granted() {
        let h = Harness::new();
        h.clock.set(UnixTimeMs(HOUR_MS));
        let handle = h.start().await;

        h.geo.push(Err(GpsError::PermissionDenied));
        tokio::time::sleep(normal()).await;
        tokio::time::sleep(normal()).await;

        let sources: Vec<PositionSource> = h.sink.reports().iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![PositionSource::Fresh, PositionSource::Cached, PositionSource::Fresh]
        );
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_reports_nothing() {
        let h = Harness::new();
        let stale = PositionSample::new(BANGKOK.0, BANGKOK.1, UnixTimeMs(0));
        let cache = LastKnownPositionCache::new(
            h.store.clone(),
            BoundingBox::SERVICE_AREA,
            DEFAULT_CACHE_MAX_AGE_MS,
        )
        .unwrap();
        cache.put(&stale).await.unwrap();

        h.clock.set(UnixTimeMs(25 * HOUR_MS));
        h.geo.set_fallback(Err(GpsError::Unavailable));
        let handle = h.start().await;

        tokio::time::sleep(normal()).await;
        assert!(h.sink.reports().is_empty());
        assert_eq!(handle.get_status().await.last_position, None);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_fixes_are_never_sent_or_cached() {
        let h = Harness::new();
        h.geo
            .set_fallback(Ok(PositionSample::new(0.0, 0.0, UnixTimeMs(0))));
        let handle = h.start().await;
        tokio::time::sleep(normal()).await;

        h.geo
            .set_fallback(Ok(PositionSample::new(48.85, 2.35, UnixTimeMs(0))));
        tokio::time::sleep(normal()).await;

        assert!(h.sink.reports().is_empty());
        assert!(h.store.is_empty().await);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_failures_are_swallowed() {
        let h = Harness::new();
        h.sink.set_failure(Some(RemoteError::network("offline")));
        let handle = h.start().await;
        tokio::time::sleep(normal()).await;

        let status = handle.get_status().await;
        assert!(status.is_tracking);
        assert_eq!(status.reports_sent, 0);
        assert_eq!(h.sink.reports().len(), 2);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_and_unsubscribes() {
        let h = Harness::new();
        let handle = h.start().await;
        assert_eq!(h.push.subscriber_count(TOPIC), 1);

        let status_before = handle.get_status().await;
        assert!(status_before.is_tracking);
        assert_eq!(status_before.signal, SignalQuality::Excellent);

        handle.stop().await;
        assert_eq!(h.push.subscriber_count(TOPIC), 0);

        tokio::time::sleep(normal() * 3).await;
        assert_eq!(h.sink.reports().len(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(TelemetryConfig::default().validate().is_ok());
        let bad = TelemetryConfig {
            live_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = TelemetryConfig {
            bounds: BoundingBox {
                min_lat: 10.0,
                max_lat: 5.0,
                min_lng: 97.0,
                max_lng: 106.0,
            },
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
