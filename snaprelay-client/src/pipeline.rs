use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use snaprelay_core::{
    NormalizedImage, ProtocolMessage, ScreenshotBatch, ScreenshotSingle, dedup_fingerprint,
    normalize_image,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cooldown::{Admission, StopCooldownGuard};
use crate::dedup::DedupCache;

const ADVISORY_TEXT: &str = "please wait a moment before the next analysis";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOutcome {
    pub success: bool,
    pub reason: Option<String>,
}

/// External AI pipeline accepting an ordered set of normalized images.
/// Forwarding is fire-and-forget; failures come back as an outcome reason
/// (e.g. `limit_reached`) and are logged, never fatal.
#[async_trait]
pub trait AnalysisSink: Send + Sync {
    async fn analyze(&self, images: Vec<NormalizedImage>, text: Option<String>) -> AnalysisOutcome;
}

/// Tier/usage service answering admission questions.
pub trait TierPolicy: Send + Sync {
    /// May this tier auto-analyze a set of `image_count` images?
    fn may_auto_analyze(&self, image_count: usize) -> bool;
    /// Bound on the manual-review queue.
    fn manual_queue_cap(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Pro,
}

impl TierPolicy for Tier {
    fn may_auto_analyze(&self, _image_count: usize) -> bool {
        match self {
            Tier::Free => false,
            Tier::Pro => true,
        }
    }

    fn manual_queue_cap(&self) -> usize {
        match self {
            Tier::Free => 1,
            Tier::Pro => 5,
        }
    }
}

/// User-facing effects of ingestion, consumed by the embedding app.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    DisplayImages(Vec<NormalizedImage>),
    UpgradePrompt,
    Advisory(String),
    QueueLimitNotice { cap: usize },
    StatusNote(String),
    HistoryRestored(Value),
}

/// Classifies inbound protocol messages, dedups redeliveries, normalizes
/// image payloads, and gates analysis behind the stop cooldown and the tier
/// policy before forwarding to the [`AnalysisSink`].
pub struct ScreenshotIngestionPipeline {
    dedup: DedupCache,
    guard: StopCooldownGuard,
    policy: Arc<dyn TierPolicy>,
    sink: Arc<dyn AnalysisSink>,
    event_tx: mpsc::UnboundedSender<PipelineEvent>,
    review_queue: VecDeque<Vec<NormalizedImage>>,
    history: Option<Value>,
}

impl ScreenshotIngestionPipeline {
    pub fn new(
        policy: Arc<dyn TierPolicy>,
        sink: Arc<dyn AnalysisSink>,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                dedup: DedupCache::new(),
                guard: StopCooldownGuard::new(),
                policy,
                sink,
                event_tx,
                review_queue: VecDeque::new(),
                history: None,
            },
            event_rx,
        )
    }

    /// User pressed stop; new analysis is gated for the cooldown window.
    pub fn stop(&mut self) {
        self.guard.stop();
    }

    #[must_use]
    pub fn history(&self) -> Option<&Value> {
        self.history.as_ref()
    }

    #[must_use]
    pub fn review_queue_len(&self) -> usize {
        self.review_queue.len()
    }

    pub fn take_review_queue(&mut self) -> Vec<Vec<NormalizedImage>> {
        self.review_queue.drain(..).collect()
    }

    pub fn handle(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::ScreenshotBatch(batch) => self.handle_batch(batch),
            ProtocolMessage::Screenshot(single) => self.handle_single(single),
            ProtocolMessage::HistoryRestore { payload } => self.handle_history_restore(payload),
            ProtocolMessage::PartnerConnected => self.note("Partner connected"),
            ProtocolMessage::PartnerDisconnected => self.note("Partner disconnected"),
            ProtocolMessage::WaitingForClient => self.note("Waiting for the capture client"),
            ProtocolMessage::ConnectionTest | ProtocolMessage::TestConnection => {
                self.note("Connection test received");
            }
            ProtocolMessage::Error { message } => {
                warn!("relay reported error: {message}");
                self.note(&format!("Relay error: {message}"));
            }
            ProtocolMessage::Unrecognized { kind } => {
                warn!(kind = %kind, "ignoring unrecognized message type");
            }
            other => debug!(message = ?other, "inbound message needs no pipeline action"),
        }
    }

    fn note(&self, text: &str) {
        let _ = self
            .event_tx
            .send(PipelineEvent::StatusNote(text.to_owned()));
    }

    fn handle_batch(&mut self, batch: ScreenshotBatch) {
        let Some(first) = batch.images.first() else {
            debug!("empty screenshot batch ignored");
            return;
        };

        let key = dedup_fingerprint(batch.timestamp, batch.images.len(), first);
        if !self.dedup.observe(&key) {
            debug!("duplicate screenshot batch dropped");
            return;
        }

        let images: Vec<NormalizedImage> = batch
            .images
            .iter()
            .map(|raw| normalize_image(raw, "batch"))
            .collect();
        self.ingest(images, batch.process_immediate);
    }

    fn handle_single(&mut self, single: ScreenshotSingle) {
        let Some(raw) = single.data_url.as_deref().or(single.base64.as_deref()) else {
            warn!("screenshot without image payload ignored");
            return;
        };

        let key = dedup_fingerprint(single.timestamp, 1, raw);
        if !self.dedup.observe(&key) {
            debug!("duplicate screenshot dropped");
            return;
        }

        if single.total > 1 {
            // Multi-image runs must arrive as a screenshot_batch; legacy
            // per-image sequences are dropped without reassembly. The key is
            // forgotten because nothing was processed, and no user-facing
            // message is emitted so a burst cannot spam the user.
            self.dedup.forget(&key);
            warn!(
                index = single.index,
                total = single.total,
                "rejecting multipart single screenshot"
            );
            return;
        }

        let image = normalize_image(raw, "single");
        self.ingest(vec![image], single.process_immediate);
    }

    fn ingest(&mut self, images: Vec<NormalizedImage>, process_immediate: bool) {
        if !process_immediate {
            self.queue_for_review(images);
            return;
        }

        if !self.policy.may_auto_analyze(images.len()) {
            // Free sessions never auto-analyze; show the images and nudge.
            let _ = self.event_tx.send(PipelineEvent::DisplayImages(images));
            let _ = self.event_tx.send(PipelineEvent::UpgradePrompt);
            return;
        }

        match self.guard.admit() {
            Admission::Blocked { advise } => {
                if advise {
                    let _ = self
                        .event_tx
                        .send(PipelineEvent::Advisory(ADVISORY_TEXT.to_owned()));
                }
            }
            Admission::Admitted => {
                let _ = self
                    .event_tx
                    .send(PipelineEvent::DisplayImages(images.clone()));
                let sink = Arc::clone(&self.sink);
                let count = images.len();
                tokio::spawn(async move {
                    let outcome = sink.analyze(images, None).await;
                    if outcome.success {
                        info!(count, "analysis request forwarded");
                    } else {
                        warn!(
                            count,
                            reason = outcome.reason.as_deref().unwrap_or("unknown"),
                            "analysis request failed"
                        );
                    }
                });
            }
        }
    }

    fn queue_for_review(&mut self, images: Vec<NormalizedImage>) {
        let cap = self.policy.manual_queue_cap();
        self.review_queue.push_back(images);
        if self.review_queue.len() > cap {
            while self.review_queue.len() > cap {
                self.review_queue.pop_front();
            }
            let _ = self.event_tx.send(PipelineEvent::QueueLimitNotice { cap });
        }
    }

    fn handle_history_restore(&mut self, payload: Value) {
        let empty = match &payload {
            Value::Null => true,
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
            Value::String(text) => text.is_empty(),
            _ => false,
        };
        if empty {
            debug!("empty history restore ignored");
            return;
        }
        self.history = Some(payload.clone());
        let _ = self.event_tx.send(PipelineEvent::HistoryRestored(payload));
    }
}
