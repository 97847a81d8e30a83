//! Broadcast loop: delivers queued replies, then streams new frames to every
//! subscribed client, pacing itself by the measured cost per frame.

use crate::client_registry::{drop_client, SharedRegistry};
use crate::command::reply::build_reply_messages;
use crate::command::{CommandQueue, CommandResponse};
use crate::config::ServerConfig;
use crate::control::{LoopControl, StoppedGuard};
use crate::frame::{FrameSource, TrackedFrame};
use crate::packer::build_frame_messages;
use crate::pending::{PendingMessage, PendingMessageQueue};
use crate::retry::retry;
use crate::session::SendTarget;
use log::{debug, info, log, warn, Level};
use shared::{CodecError, Message, MessageBody, StatusBody};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Sleep while nobody is connected.
pub const IDLE_INTERVAL: Duration = Duration::from_millis(200);
/// Sleep when the source has nothing new.
pub const NO_DATA_DELAY: Duration = Duration::from_millis(5);
/// Added to the oldest available timestamp when the watermark has fallen
/// out of the source's history.
pub const WATERMARK_SAFETY_MARGIN_SEC: f64 = 0.1;

/// Frames to request this tick so that processing stays within
/// `budget_ms`: `clamp(budget / cost, 1, max_batch)`, with costs below one
/// millisecond (or not yet measured) counted as one.
pub fn frames_to_fetch(budget_ms: f64, ms_per_frame: f64, max_batch: usize) -> usize {
    let cost = ms_per_frame.max(1.0);
    let frames = (budget_ms / cost).floor();
    (frames as usize).clamp(1, max_batch.max(1))
}

/// New watermark when `watermark` predates everything the source still holds.
pub fn skip_evicted(watermark: f64, oldest_available: f64) -> Option<f64> {
    (watermark < oldest_available).then(|| oldest_available + WATERMARK_SAFETY_MARGIN_SEC)
}

/// Adaptive batch size estimate, owned by the broadcast loop.
#[derive(Debug, Clone)]
pub struct BatchPacer {
    budget_ms: f64,
    max_batch: usize,
    ms_per_frame: f64,
}

impl BatchPacer {
    pub fn new(budget_ms: f64, max_batch: usize) -> Self {
        Self {
            budget_ms,
            max_batch,
            ms_per_frame: 0.0,
        }
    }

    pub fn frames_to_fetch(&self) -> usize {
        frames_to_fetch(self.budget_ms, self.ms_per_frame, self.max_batch)
    }

    pub fn record(&mut self, elapsed: Duration, frames: usize) {
        if frames > 0 {
            self.ms_per_frame = elapsed.as_secs_f64() * 1000.0 / frames as f64;
        }
    }

    pub fn ms_per_frame(&self) -> f64 {
        self.ms_per_frame
    }
}

/// Tracks time since the last data-bearing message.
#[derive(Debug, Clone)]
pub struct KeepAliveTimer {
    interval: Duration,
    last_activity: Instant,
}

impl KeepAliveTimer {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_activity: now,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.interval
    }

    pub fn reset(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Reports a "no data" stretch once: at debug level during the start-up
/// grace period, at warn level afterwards.
#[derive(Debug, Clone)]
pub struct MissingInputLog {
    started: Instant,
    grace: Duration,
    warn_enabled: bool,
    reported: bool,
}

impl MissingInputLog {
    pub fn new(started: Instant, grace: Duration, warn_enabled: bool) -> Self {
        Self {
            started,
            grace,
            warn_enabled,
            reported: false,
        }
    }

    /// The level to log at, or `None` if this stretch was already reported.
    pub fn report(&mut self, now: Instant) -> Option<Level> {
        if self.reported {
            return None;
        }
        self.reported = true;
        let in_grace = now.saturating_duration_since(self.started) < self.grace;
        Some(if self.warn_enabled && !in_grace {
            Level::Warn
        } else {
            Level::Debug
        })
    }

    pub fn reset(&mut self) {
        self.reported = false;
    }
}

/// Broadcast parameters taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub processing_budget_ms: f64,
    pub max_messages_per_batch: usize,
    pub send_retry_attempts: u32,
    pub send_retry_delay: Duration,
    pub keep_alive_interval: Duration,
    pub valid_transforms_only: bool,
    pub missing_input_grace_period: Duration,
    pub warn_on_no_data: bool,
}

impl From<&ServerConfig> for BroadcastSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            processing_budget_ms: config.max_time_spent_with_processing_ms,
            max_messages_per_batch: config.max_messages_per_batch,
            send_retry_attempts: config.send_retry_attempts,
            send_retry_delay: config.send_retry_delay(),
            keep_alive_interval: config.keep_alive_interval(),
            valid_transforms_only: config.send_valid_transforms_only,
            missing_input_grace_period: config.missing_input_grace_period(),
            warn_on_no_data: config.warn_on_no_data_available,
        }
    }
}

/// The single streaming loop. Pacing state lives here and is only touched by
/// the task running [`BroadcastScheduler::run`].
pub struct BroadcastScheduler {
    registry: SharedRegistry,
    pending: Arc<PendingMessageQueue>,
    responses: mpsc::UnboundedReceiver<CommandResponse>,
    commands: CommandQueue,
    source: Arc<dyn FrameSource>,
    settings: BroadcastSettings,
    watermark: f64,
    pacer: BatchPacer,
    keep_alive: KeepAliveTimer,
    missing_input: MissingInputLog,
}

impl BroadcastScheduler {
    pub fn new(
        registry: SharedRegistry,
        pending: Arc<PendingMessageQueue>,
        responses: mpsc::UnboundedReceiver<CommandResponse>,
        commands: CommandQueue,
        source: Arc<dyn FrameSource>,
        settings: BroadcastSettings,
    ) -> Self {
        let now = Instant::now();
        Self {
            watermark: source.most_recent_timestamp().unwrap_or(0.0),
            pacer: BatchPacer::new(settings.processing_budget_ms, settings.max_messages_per_batch),
            keep_alive: KeepAliveTimer::new(settings.keep_alive_interval, now),
            missing_input: MissingInputLog::new(
                now,
                settings.missing_input_grace_period,
                settings.warn_on_no_data,
            ),
            registry,
            pending,
            responses,
            commands,
            source,
            settings,
        }
    }

    pub async fn run(mut self, control: Arc<LoopControl>, guard: StoppedGuard) {
        let _guard = guard;
        info!(
            "Broadcasting channel '{}' (budget {} ms, batch <= {})",
            self.source.channel_id(),
            self.settings.processing_budget_ms,
            self.settings.max_messages_per_batch
        );
        while control.is_running() {
            let pause = self.tick().await;
            if pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(pause).await;
            }
        }
        info!("Broadcast loop stopped");
    }

    /// Last streamed frame timestamp.
    pub fn watermark(&self) -> f64 {
        self.watermark
    }

    /// One scheduler iteration. Returns how long to pause before the next.
    pub async fn tick(&mut self) -> Duration {
        if self.registry.read().await.is_empty() {
            if let Some(latest) = self.source.most_recent_timestamp() {
                self.watermark = latest;
            }
            self.keep_alive.reset(Instant::now());
            self.discard_orphaned_replies().await;
            return IDLE_INTERVAL;
        }

        self.deliver_replies().await;

        if !self.source.data_available() {
            if let Some(level) = self.missing_input.report(Instant::now()) {
                log!(
                    level,
                    "No data available on channel '{}'",
                    self.source.channel_id()
                );
            }
            self.send_keep_alive_if_due().await;
            return NO_DATA_DELAY;
        }

        if let Some(oldest) = self.source.oldest_timestamp() {
            if let Some(skipped) = skip_evicted(self.watermark, oldest) {
                warn!(
                    "Frames after {:.3} are no longer available on '{}', skipping to {:.3}",
                    self.watermark,
                    self.source.channel_id(),
                    skipped
                );
                self.watermark = skipped;
            }
        }

        let frames = match self
            .source
            .frames_after(self.watermark, self.pacer.frames_to_fetch())
        {
            Ok(frames) => frames,
            Err(e) => {
                debug!("Frame query failed: {}", e);
                Vec::new()
            }
        };
        if frames.is_empty() {
            self.send_keep_alive_if_due().await;
            return NO_DATA_DELAY;
        }
        self.missing_input.reset();

        let started = Instant::now();
        let sent_any = self.stream_frames(&frames).await;
        self.pacer.record(started.elapsed(), frames.len());

        if sent_any {
            self.keep_alive.reset(Instant::now());
        } else {
            self.send_keep_alive_if_due().await;
        }
        Duration::ZERO
    }

    async fn stream_frames(&mut self, frames: &[TrackedFrame]) -> bool {
        let mut targets = self.registry.read().await.targets();
        let mut failed: HashSet<u32> = HashSet::new();
        let mut sent_any = false;

        for frame in frames {
            for target in targets.iter_mut() {
                if failed.contains(&target.id) {
                    continue;
                }
                let packet =
                    build_frame_messages(frame, target, self.settings.valid_transforms_only);
                if packet.is_empty() {
                    continue;
                }
                let bytes = match pack_all(&packet.messages) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(
                            "Client {}: failed to pack frame {:.3}: {}",
                            target.id, frame.timestamp, e
                        );
                        continue;
                    }
                };
                match self.send(target, &bytes).await {
                    Ok(()) => {
                        sent_any = true;
                        target.last_sent_timestamp = frame.timestamp;
                        if packet.includes_tracking_data {
                            target.last_tracking_timestamp = frame.timestamp;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Client {}: giving up after {} send attempts: {}",
                            target.id, self.settings.send_retry_attempts, e
                        );
                        failed.insert(target.id);
                    }
                }
            }
            self.watermark = frame.timestamp;
        }

        {
            let mut registry = self.registry.write().await;
            for target in targets.iter().filter(|t| !failed.contains(&t.id)) {
                registry.record_sent(target);
            }
        }
        for client_id in failed {
            self.disconnect(client_id).await;
        }
        sent_any
    }

    /// Sends queued replies first, then finished command responses, each in
    /// order per client.
    async fn deliver_replies(&mut self) {
        let mut outgoing: BTreeMap<u32, Vec<PendingMessage>> = BTreeMap::new();
        for (client_id, messages) in self.pending.take_all().await {
            outgoing.entry(client_id).or_default().extend(messages);
        }

        while let Ok(response) = self.responses.try_recv() {
            let client_id = response.client_id();
            let Some(version) = self.registry.read().await.header_version(client_id) else {
                debug!(
                    "Dropping reply to command uid {} for departed client {}",
                    response.request.uid, client_id
                );
                continue;
            };
            for message in build_reply_messages(&response, version) {
                match PendingMessage::pack(&message) {
                    Ok(packed) => outgoing.entry(client_id).or_default().push(packed),
                    Err(e) => warn!(
                        "Client {}: failed to pack reply to uid {}: {}",
                        client_id, response.request.uid, e
                    ),
                }
            }
        }

        if outgoing.is_empty() {
            return;
        }

        let targets = self.registry.read().await.targets();
        let mut failed = Vec::new();
        for (client_id, messages) in outgoing {
            let Some(target) = targets.iter().find(|t| t.id == client_id) else {
                debug!(
                    "Dropping {} replies for departed client {}",
                    messages.len(),
                    client_id
                );
                continue;
            };
            for message in messages {
                if let Err(e) = self.send(target, &message.bytes).await {
                    warn!(
                        "Client {}: failed to deliver {} reply on '{}': {}",
                        client_id,
                        message.kind.type_name(),
                        message.device_name,
                        e
                    );
                    failed.push(client_id);
                    break;
                }
                debug!(
                    "Client {}: sent {} reply on '{}'",
                    client_id,
                    message.kind.type_name(),
                    message.device_name
                );
            }
        }
        for client_id in failed {
            self.disconnect(client_id).await;
        }
    }

    async fn send_keep_alive_if_due(&mut self) {
        if !self.keep_alive.is_due(Instant::now()) {
            return;
        }
        let targets = self.registry.read().await.targets();
        let mut failed = Vec::new();
        for target in &targets {
            let keep_alive = Message::new("", MessageBody::Status(StatusBody::ok()))
                .with_version(target.header_version);
            let result = match keep_alive.pack() {
                Ok(bytes) => self.send(target, &bytes).await,
                Err(e) => {
                    warn!("Failed to pack keep-alive: {}", e);
                    return;
                }
            };
            if let Err(e) = result {
                warn!("Client {}: keep-alive failed: {}", target.id, e);
                failed.push(target.id);
            }
        }
        debug!("Sent keep-alive to {} clients", targets.len() - failed.len());
        self.keep_alive.reset(Instant::now());

        for client_id in failed {
            self.disconnect(client_id).await;
        }
    }

    /// Each retry resumes after the bytes the previous attempt got out.
    async fn send(&self, target: &SendTarget, bytes: &[u8]) -> std::io::Result<()> {
        let written = AtomicUsize::new(0);
        let written = &written;
        retry(
            self.settings.send_retry_attempts,
            self.settings.send_retry_delay,
            move || target.send_from(bytes, written),
        )
        .await
    }

    async fn disconnect(&self, client_id: u32) {
        if drop_client(&self.registry, client_id).await {
            info!("Client {} dropped after failed sends", client_id);
        }
        self.pending.forget(client_id).await;
        self.commands.forget_client(client_id);
    }

    async fn discard_orphaned_replies(&mut self) {
        let orphaned = self.pending.take_all().await;
        if !orphaned.is_empty() {
            debug!("Discarded replies for {} departed clients", orphaned.len());
        }
        while self.responses.try_recv().is_ok() {}
    }
}

fn pack_all(messages: &[Message]) -> Result<Vec<u8>, CodecError> {
    let mut bytes = Vec::new();
    for message in messages {
        bytes.extend(message.pack()?);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_registry::ClientRegistry;
    use crate::command::{CommandProcessor, CommandRegistry};
    use crate::frame::{FrameBuffer, ToolStatus};
    use crate::session::{ClientWriter, SessionDefaults};
    use shared::message::IDENTITY;
    use shared::{ClientInfo, MessageKind, TransformName, HEADER_SIZE};
    use tokio::io::{AsyncReadExt, DuplexStream};

    #[test]
    fn test_frames_to_fetch_follows_budget() {
        assert_eq!(frames_to_fetch(50.0, 5.0, 100), 10);
        assert_eq!(frames_to_fetch(50.0, 5.0, 4), 4);
        assert_eq!(frames_to_fetch(50.0, 200.0, 100), 1);
    }

    #[test]
    fn test_frames_to_fetch_treats_unmeasured_cost_as_one_ms() {
        assert_eq!(frames_to_fetch(50.0, 0.0, 100), 50);
        assert_eq!(frames_to_fetch(50.0, -3.0, 100), 50);
        assert_eq!(frames_to_fetch(50.0, f64::NAN, 100), 50);
        assert_eq!(frames_to_fetch(500.0, 0.0, 100), 100);
    }

    #[test]
    fn test_pacer_adapts_to_measured_cost() {
        let mut pacer = BatchPacer::new(50.0, 100);
        assert_eq!(pacer.frames_to_fetch(), 50);

        pacer.record(Duration::from_millis(50), 10);
        assert_eq!(pacer.ms_per_frame(), 5.0);
        assert_eq!(pacer.frames_to_fetch(), 10);

        pacer.record(Duration::from_millis(30), 0);
        assert_eq!(pacer.frames_to_fetch(), 10);
    }

    #[test]
    fn test_skip_evicted_watermark() {
        assert_eq!(skip_evicted(1.0, 5.0), Some(5.0 + WATERMARK_SAFETY_MARGIN_SEC));
        assert_eq!(skip_evicted(5.0, 5.0), None);
        assert_eq!(skip_evicted(6.0, 5.0), None);
    }

    #[test]
    fn test_keep_alive_timer() {
        let start = Instant::now();
        let mut timer = KeepAliveTimer::new(Duration::from_millis(250), start);

        assert!(!timer.is_due(start + Duration::from_millis(250)));
        assert!(timer.is_due(start + Duration::from_millis(251)));

        let later = start + Duration::from_secs(1);
        timer.reset(later);
        assert_eq!(timer.elapsed(later), Duration::ZERO);
        assert!(!timer.is_due(later));
    }

    #[test]
    fn test_missing_input_log_levels() {
        let start = Instant::now();
        let mut log = MissingInputLog::new(start, Duration::from_secs(2), true);

        assert_eq!(log.report(start + Duration::from_secs(1)), Some(Level::Debug));
        assert_eq!(log.report(start + Duration::from_secs(3)), None);

        log.reset();
        assert_eq!(log.report(start + Duration::from_secs(3)), Some(Level::Warn));

        let mut quiet = MissingInputLog::new(start, Duration::ZERO, false);
        assert_eq!(quiet.report(start + Duration::from_secs(3)), Some(Level::Debug));
    }

    struct Fixture {
        scheduler: BroadcastScheduler,
        registry: SharedRegistry,
        pending: Arc<PendingMessageQueue>,
        source: Arc<FrameBuffer>,
        _processor: CommandProcessor,
    }

    fn settings() -> BroadcastSettings {
        BroadcastSettings::from(&ServerConfig::new(0, "Tracker"))
    }

    fn fixture(settings: BroadcastSettings) -> Fixture {
        let registry = ClientRegistry::shared();
        let pending = Arc::new(PendingMessageQueue::new());
        let source = Arc::new(FrameBuffer::new("Tracker", 100));
        let (processor, queue, responses) = CommandProcessor::start(CommandRegistry::new());
        let scheduler = BroadcastScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            responses,
            queue,
            source.clone(),
            settings,
        );
        Fixture {
            scheduler,
            registry,
            pending,
            source,
            _processor: processor,
        }
    }

    fn subscribed(names: &[&str]) -> ClientInfo {
        ClientInfo {
            transform_names: names
                .iter()
                .map(|n| TransformName::parse(n).unwrap())
                .collect(),
            ..Default::default()
        }
    }

    /// Registers a client whose receive side stays idle; returns its id, the
    /// peer end of its socket and the guard keeping its receive loop "alive".
    async fn add_client(
        registry: &SharedRegistry,
        info: ClientInfo,
        buffer: usize,
    ) -> (u32, DuplexStream, crate::control::StoppedGuard) {
        let (server_side, peer) = tokio::io::duplex(buffer);
        let defaults = SessionDefaults {
            client_info: info,
            send_timeout: Duration::from_millis(20),
            receive_timeout: Duration::from_millis(20),
        };
        let writer: ClientWriter = Box::new(server_side);
        let (id, control) = registry.write().await.add_client(
            "127.0.0.1:1".parse().unwrap(),
            writer,
            &defaults,
        );
        (id, peer, control.stopped_guard())
    }

    async fn read_message(peer: &mut DuplexStream) -> Message {
        let mut header = [0u8; HEADER_SIZE];
        peer.read_exact(&mut header).await.unwrap();
        let header = shared::MessageHeader::unpack(&header).unwrap();
        let mut body = vec![0u8; header.body_size as usize];
        peer.read_exact(&mut body).await.unwrap();
        Message::unpack_body(&header, &body, true).unwrap()
    }

    fn tool_frame(t: f64) -> TrackedFrame {
        TrackedFrame::new(t)
            .with_transform("ToolToTracker", IDENTITY, ToolStatus::Ok)
            .with_transform("ProbeToTracker", IDENTITY, ToolStatus::Ok)
    }

    #[tokio::test]
    async fn test_idle_tick_resets_watermark_to_latest() {
        let mut f = fixture(settings());
        f.source.push(tool_frame(1.0));
        f.source.push(tool_frame(2.0));

        assert_eq!(f.scheduler.tick().await, IDLE_INTERVAL);
        assert_eq!(f.scheduler.watermark(), 2.0);
    }

    /// Seeds the watermark through an idle tick so later frames are not
    /// treated as evicted history.
    async fn seed(f: &mut Fixture, t: f64) {
        f.source.push(tool_frame(t));
        assert_eq!(f.scheduler.tick().await, IDLE_INTERVAL);
    }

    #[tokio::test]
    async fn test_frames_follow_each_subscription() {
        let mut f = fixture(settings());
        seed(&mut f, 0.5).await;
        let (tool_id, mut tool_peer, _g1) =
            add_client(&f.registry, subscribed(&["ToolToTracker"]), 64 * 1024).await;
        let (_, mut both_peer, _g2) = add_client(
            &f.registry,
            subscribed(&["ToolToTracker", "ProbeToTracker"]),
            64 * 1024,
        )
        .await;

        f.source.push(tool_frame(1.0));
        assert_eq!(f.scheduler.tick().await, Duration::ZERO);

        let message = read_message(&mut tool_peer).await;
        assert_eq!(message.device_name, "ToolToTracker");
        assert_eq!(message.kind(), MessageKind::Transform);

        let first = read_message(&mut both_peer).await;
        let second = read_message(&mut both_peer).await;
        assert_eq!(first.device_name, "ToolToTracker");
        assert_eq!(second.device_name, "ProbeToTracker");

        assert_eq!(f.scheduler.watermark(), 1.0);
        let snapshot = f.registry.read().await.snapshot(tool_id).unwrap();
        assert_eq!(snapshot.last_sent_timestamp, 1.0);

        assert_eq!(f.scheduler.tick().await, NO_DATA_DELAY);
    }

    #[tokio::test]
    async fn test_evicted_watermark_skips_forward() {
        let mut f = fixture(settings());
        let (_, _peer, _g) = add_client(&f.registry, ClientInfo::default(), 1024).await;
        for t in 10..20 {
            f.source.push(tool_frame(t as f64 / 10.0));
        }
        // watermark 0.0 predates the oldest frame (1.0)
        f.scheduler.tick().await;
        assert!(f.scheduler.watermark() >= 1.0 + WATERMARK_SAFETY_MARGIN_SEC - 1e-9);
    }

    #[tokio::test]
    async fn test_failed_client_is_removed_once() {
        let mut config = ServerConfig::new(0, "Tracker");
        config.send_retry_attempts = 2;
        config.send_retry_delay_sec = 0.001;
        let mut f = fixture(BroadcastSettings::from(&config));
        seed(&mut f, 0.5).await;

        // A 16 byte socket buffer that nobody drains cannot take a message.
        let (stuck_id, _stuck_peer, stuck_guard) =
            add_client(&f.registry, subscribed(&["ToolToTracker"]), 16).await;
        let (ok_id, mut ok_peer, _ok_guard) =
            add_client(&f.registry, subscribed(&["ToolToTracker"]), 64 * 1024).await;
        drop(stuck_guard);

        f.source.push(tool_frame(1.0));
        f.source.push(tool_frame(2.0));
        f.scheduler.tick().await;

        let registry = f.registry.read().await;
        assert!(!registry.contains(stuck_id));
        assert!(registry.contains(ok_id));
        drop(registry);

        assert_eq!(read_message(&mut ok_peer).await.timestamp, 1.0);
        assert_eq!(read_message(&mut ok_peer).await.timestamp, 2.0);
    }

    #[tokio::test]
    async fn test_retried_send_continues_without_repeating_bytes() {
        let mut config = ServerConfig::new(0, "Tracker");
        config.send_retry_attempts = 10;
        config.send_retry_delay_sec = 0.01;
        let mut f = fixture(BroadcastSettings::from(&config));
        seed(&mut f, 0.5).await;

        // 16 bytes of buffer and a reader that only shows up after the
        // first 20 ms attempt has timed out part way through the message
        let (id, mut peer, _g) =
            add_client(&f.registry, subscribed(&["ToolToTracker"]), 16).await;
        let late_reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let message = read_message(&mut peer).await;
            (message, peer)
        });

        f.source.push(tool_frame(1.0));
        f.scheduler.tick().await;

        let (message, mut peer) = late_reader.await.unwrap();
        assert_eq!(message.device_name, "ToolToTracker");
        assert_eq!(message.timestamp, 1.0);
        assert!(f.registry.read().await.contains(id));

        let mut trailing = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(50), peer.read(&mut trailing)).await;
        assert!(read.is_err(), "unexpected bytes after the message");
    }

    #[tokio::test]
    async fn test_keep_alive_when_nothing_is_streamed() {
        let mut config = ServerConfig::new(0, "Tracker");
        config.keep_alive_interval_sec = Some(0.02);
        let mut f = fixture(BroadcastSettings::from(&config));
        let (_, mut peer, _g) = add_client(&f.registry, ClientInfo::default(), 1024).await;

        assert_eq!(f.scheduler.tick().await, NO_DATA_DELAY);
        tokio::time::sleep(Duration::from_millis(30)).await;
        f.scheduler.tick().await;

        let keep_alive = read_message(&mut peer).await;
        assert_eq!(keep_alive.body, MessageBody::Status(StatusBody::ok()));
        assert!(!f.scheduler.keep_alive.is_due(Instant::now()));
    }

    #[tokio::test]
    async fn test_pending_replies_are_delivered_then_cleared() {
        let mut f = fixture(settings());
        let (id, mut peer, _g) = add_client(&f.registry, ClientInfo::default(), 1024).await;
        f.pending
            .push(id, &Message::new("", MessageBody::Status(StatusBody::ok())))
            .await
            .unwrap();

        f.scheduler.tick().await;

        assert_eq!(read_message(&mut peer).await.kind(), MessageKind::Status);
        assert_eq!(f.pending.len(id).await, 0);
    }
}
