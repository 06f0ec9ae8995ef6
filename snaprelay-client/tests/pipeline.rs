use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snaprelay_client::{
    AnalysisOutcome, AnalysisSink, PipelineEvent, ScreenshotIngestionPipeline, Tier,
};
use snaprelay_core::{NormalizedImage, ProtocolMessage, STOP_COOLDOWN_MS, decode_message};
use tokio::sync::mpsc;
use tokio::time::timeout;

struct RecordingSink {
    tx: mpsc::UnboundedSender<Vec<NormalizedImage>>,
}

#[async_trait]
impl AnalysisSink for RecordingSink {
    async fn analyze(&self, images: Vec<NormalizedImage>, _text: Option<String>) -> AnalysisOutcome {
        let _ = self.tx.send(images);
        AnalysisOutcome {
            success: true,
            reason: None,
        }
    }
}

struct Harness {
    pipeline: ScreenshotIngestionPipeline,
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    forwarded: mpsc::UnboundedReceiver<Vec<NormalizedImage>>,
}

fn harness(tier: Tier) -> Harness {
    let (forward_tx, forwarded) = mpsc::unbounded_channel();
    let (pipeline, events) =
        ScreenshotIngestionPipeline::new(Arc::new(tier), Arc::new(RecordingSink { tx: forward_tx }));
    Harness {
        pipeline,
        events,
        forwarded,
    }
}

fn wire(frame: &str) -> ProtocolMessage {
    decode_message(frame).expect("test frame decodes")
}

async fn recv_forwarded(
    harness: &mut Harness,
    wait: Duration,
) -> Option<Vec<NormalizedImage>> {
    timeout(wait, harness.forwarded.recv()).await.ok().flatten()
}

#[tokio::test]
async fn redelivered_batch_is_dropped_silently() {
    let mut harness = harness(Tier::Pro);
    let frame =
        r#"{"type":"screenshot_batch","payload":{"images":["aaaa","bbbb"],"processImmediate":true,"timestamp":1000}}"#;

    harness.pipeline.handle(wire(frame));
    harness.pipeline.handle(wire(frame));

    let first = recv_forwarded(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(first.map(|images| images.len()), Some(2));
    let second = recv_forwarded(&mut harness, Duration::from_millis(200)).await;
    assert!(second.is_none(), "redelivered batch was forwarded");
}

#[tokio::test]
async fn distinct_batches_are_both_forwarded_in_order() {
    let mut harness = harness(Tier::Pro);
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["first-a","first-b"],"timestamp":1}"#,
    ));
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["second-a"],"timestamp":2}"#,
    ));

    let first = recv_forwarded(&mut harness, Duration::from_secs(2))
        .await
        .expect("first batch forwarded");
    assert_eq!(first.len(), 2);
    assert!(first[0].data_url.contains("first-a"));
    assert!(first[1].data_url.contains("first-b"));

    let second = recv_forwarded(&mut harness, Duration::from_secs(2))
        .await
        .expect("second batch forwarded");
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn multipart_single_is_rejected_without_user_noise() {
    let mut harness = harness(Tier::Pro);
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot","base64":"cGFydA==","index":0,"total":3,"processImmediate":true,"timestamp":50}"#,
    ));

    assert!(
        recv_forwarded(&mut harness, Duration::from_millis(200)).await.is_none(),
        "multipart single was forwarded"
    );
    assert!(
        harness.events.try_recv().is_err(),
        "rejection produced a user-facing event"
    );
}

#[tokio::test]
async fn rejected_multipart_key_is_forgotten() {
    let mut harness = harness(Tier::Pro);
    // Same payload and timestamp: first as an unsupported multipart single,
    // then corrected to a standalone shot. The correction must not be
    // mistaken for a redelivery.
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot","base64":"cGFydA==","total":3,"timestamp":60}"#,
    ));
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot","base64":"cGFydA==","total":1,"timestamp":60}"#,
    ));

    let forwarded = recv_forwarded(&mut harness, Duration::from_secs(2)).await;
    assert_eq!(forwarded.map(|images| images.len()), Some(1));
}

#[tokio::test]
async fn free_tier_displays_but_never_auto_analyzes() {
    let mut harness = harness(Tier::Free);
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["imga","imgb"],"processImmediate":true,"timestamp":9}"#,
    ));

    match harness.events.try_recv() {
        Ok(PipelineEvent::DisplayImages(images)) => assert_eq!(images.len(), 2),
        other => panic!("expected displayed images, got {other:?}"),
    }
    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::UpgradePrompt)
    ));
    assert!(
        recv_forwarded(&mut harness, Duration::from_millis(200)).await.is_none(),
        "free tier batch reached the analysis sink"
    );
}

#[tokio::test(start_paused = true)]
async fn stop_blocks_with_one_advisory_then_admits_after_cooldown() {
    let mut harness = harness(Tier::Pro);
    harness.pipeline.stop();

    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["one"],"timestamp":1}"#,
    ));
    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::Advisory(_))
    ));

    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["two"],"timestamp":2}"#,
    ));
    assert!(
        harness.events.try_recv().is_err(),
        "second blocked batch repeated the advisory"
    );

    tokio::time::advance(Duration::from_millis(STOP_COOLDOWN_MS + 50)).await;
    tokio::task::yield_now().await;

    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["three"],"timestamp":3}"#,
    ));
    tokio::task::yield_now().await;
    assert_eq!(
        harness.forwarded.try_recv().map(|images| images.len()).ok(),
        Some(1),
        "batch after cooldown was not forwarded"
    );
}

#[tokio::test]
async fn manual_review_queue_is_capped_per_tier() {
    let mut harness = harness(Tier::Free);
    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["q1"],"processImmediate":false,"timestamp":1}"#,
    ));
    assert_eq!(harness.pipeline.review_queue_len(), 1);
    assert!(harness.events.try_recv().is_err(), "no notice below the cap");

    harness.pipeline.handle(wire(
        r#"{"type":"screenshot_batch","images":["q2"],"processImmediate":false,"timestamp":2}"#,
    ));
    assert_eq!(harness.pipeline.review_queue_len(), 1);
    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::QueueLimitNotice { cap: 1 })
    ));

    // The oldest entry was evicted; the survivor is the newest.
    let queued = harness.pipeline.take_review_queue();
    assert!(queued[0][0].data_url.contains("q2"));
}

#[tokio::test]
async fn history_restore_replaces_snapshot_and_ignores_empty() {
    let mut harness = harness(Tier::Pro);
    harness
        .pipeline
        .handle(wire(r#"{"type":"history_restore","payload":[]}"#));
    assert!(harness.pipeline.history().is_none());
    assert!(harness.events.try_recv().is_err());

    harness.pipeline.handle(wire(
        r#"{"type":"history_restore","payload":[{"role":"user","text":"hi"}]}"#,
    ));
    assert!(harness.pipeline.history().is_some());
    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::HistoryRestored(_))
    ));
}

#[tokio::test]
async fn unrecognized_and_status_messages_are_non_fatal() {
    let mut harness = harness(Tier::Pro);
    harness
        .pipeline
        .handle(wire(r#"{"type":"resync_everything","payload":{}}"#));
    harness.pipeline.handle(wire(r#"{"type":"connection_test"}"#));
    harness
        .pipeline
        .handle(wire(r#"{"type":"error","message":"relay hiccup"}"#));

    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::StatusNote(_))
    ));
    assert!(matches!(
        harness.events.try_recv(),
        Ok(PipelineEvent::StatusNote(_))
    ));
}
