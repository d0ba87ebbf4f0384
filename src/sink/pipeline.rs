//! Asynchronous metric delivery pipeline
//!
//! Decouples metric production (one producer per monitor) from backend
//! writes via a bounded queue drained by exactly one consumer worker. The
//! queue is the backpressure valve: when it is full, producers wait instead
//! of dropping points or growing memory unbounded. Batches are written in
//! FIFO order; a failed batch is reported and dropped (at-most-once
//! delivery, no retry).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::MetricPoint;
use crate::error::SinkError;

/// Capacity of the delivery queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Points accumulated before a write is issued
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// One write call against the backend
#[async_trait]
pub trait BatchWriter: Send + Sync + 'static {
    async fn write(&self, batch: Vec<MetricPoint>) -> Result<(), SinkError>;

    /// Report a failed batch write. Must not block the consumer worker.
    fn report(&self, err: SinkError) {
        error!("{err}");
    }
}

/// Bounded queue plus its single consumer worker
#[derive(Debug)]
pub struct Pipeline {
    point_tx: mpsc::Sender<MetricPoint>,
    stop_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Spawn a consumer worker with default capacity and batch size.
    pub fn start(writer: Arc<dyn BatchWriter>) -> Self {
        Self::with_limits(writer, DEFAULT_QUEUE_CAPACITY, DEFAULT_BATCH_SIZE)
    }

    pub fn with_limits(writer: Arc<dyn BatchWriter>, capacity: usize, batch_size: usize) -> Self {
        let (point_tx, point_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = tokio::spawn(consume(writer, point_rx, stop_rx, batch_size));

        Self {
            point_tx,
            stop_tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Hand one point over to the consumer.
    ///
    /// Waits while the queue is at capacity, so slow backend writes throttle
    /// probe-side metric generation. Once this returns the point is owned by
    /// the queue.
    pub async fn enqueue(&self, point: MetricPoint) {
        if self.point_tx.send(point).await.is_err() {
            warn!("delivery queue is closed, dropping point");
        }
    }

    /// Stop the consumer, draining everything enqueued so far.
    ///
    /// All points accepted before this call are covered by a write attempt,
    /// including a final partially filled batch, before it returns. Calling
    /// it a second time is a no-op.
    pub async fn flush(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            debug!("flush on an already-flushed pipeline");
            return;
        };

        let _ = self.stop_tx.send(true);
        if let Err(e) = worker.await {
            error!("batch consumer worker failed: {e}");
        }
    }
}

/// Consumer worker loop. Exactly one runs per pipeline, which structurally
/// guarantees at most one in-flight batch write at a time.
async fn consume(
    writer: Arc<dyn BatchWriter>,
    mut point_rx: mpsc::Receiver<MetricPoint>,
    mut stop_rx: watch::Receiver<bool>,
    batch_size: usize,
) {
    let mut batch: Vec<MetricPoint> = Vec::with_capacity(batch_size);

    loop {
        tokio::select! {
            point = point_rx.recv() => match point {
                Some(point) => {
                    batch.push(point);
                    if batch.len() >= batch_size {
                        write_batch(writer.as_ref(), &mut batch).await;
                    }
                }
                None => break,
            },

            _ = stop_rx.changed() => {
                debug!("stop signal received, draining delivery queue");
                break;
            }
        }
    }

    // Points enqueued before the stop signal are still in the queue; write
    // them all out before exiting.
    while let Ok(point) = point_rx.try_recv() {
        batch.push(point);
        if batch.len() >= batch_size {
            write_batch(writer.as_ref(), &mut batch).await;
        }
    }

    if !batch.is_empty() {
        write_batch(writer.as_ref(), &mut batch).await;
    }

    debug!("batch consumer stopped");
}

async fn write_batch(writer: &dyn BatchWriter, batch: &mut Vec<MetricPoint>) {
    let points: Vec<MetricPoint> = batch.drain(..).collect();
    trace!("writing batch of {} points", points.len());

    if let Err(e) = writer.write(points).await {
        // The failed batch is dropped, not retried or re-buffered.
        writer.report(e);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::sink::FieldValue;

    fn point(seq: i64) -> MetricPoint {
        MetricPoint {
            name: "ICMP".to_string(),
            timestamp: Utc::now(),
            tags: BTreeMap::new(),
            fields: BTreeMap::from([("seq".to_string(), FieldValue::Integer(seq))]),
        }
    }

    /// Records every batch it is handed, optionally failing the first write.
    #[derive(Default)]
    struct RecordingWriter {
        batches: std::sync::Mutex<Vec<Vec<MetricPoint>>>,
        fail_first: AtomicBool,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BatchWriter for RecordingWriter {
        async fn write(&self, batch: Vec<MetricPoint>) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(SinkError::Write("backend unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    /// Blocks every write until a permit is released.
    struct GatedWriter {
        gate: Semaphore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl BatchWriter for GatedWriter {
        async fn write(&self, _batch: Vec<MetricPoint>) -> Result<(), SinkError> {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn flush_covers_every_enqueued_point() {
        let writer = Arc::new(RecordingWriter::default());
        let pipeline = Pipeline::with_limits(writer.clone(), 100, 10);

        for seq in 0..25 {
            pipeline.enqueue(point(seq)).await;
        }
        pipeline.flush().await;

        let batches = writer.batches.lock().unwrap();
        // ceil(25 / 10) writes, final partial batch included
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[1].len(), 10);
        assert_eq!(batches[2].len(), 5);

        let total: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total, 25);
    }

    #[tokio::test]
    async fn batches_are_written_in_fifo_order() {
        let writer = Arc::new(RecordingWriter::default());
        let pipeline = Pipeline::with_limits(writer.clone(), 100, 2);

        for seq in 0..6 {
            pipeline.enqueue(point(seq)).await;
        }
        pipeline.flush().await;

        let batches = writer.batches.lock().unwrap();
        let order: Vec<i64> = batches
            .iter()
            .flatten()
            .map(|p| match p.fields["seq"] {
                FieldValue::Integer(seq) => seq,
                FieldValue::Float(_) => panic!("unexpected field type"),
            })
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failed_batch_is_dropped_and_later_points_still_deliver() {
        let writer = Arc::new(RecordingWriter {
            fail_first: AtomicBool::new(true),
            ..Default::default()
        });
        let pipeline = Pipeline::with_limits(writer.clone(), 100, 5);

        for seq in 0..10 {
            pipeline.enqueue(point(seq)).await;
        }
        pipeline.flush().await;

        // Two attempts, only the second landed, no stall.
        assert_eq!(writer.attempts.load(Ordering::SeqCst), 2);
        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 5);
    }

    #[tokio::test]
    async fn full_queue_blocks_producer_until_consumer_drains() {
        let writer = Arc::new(GatedWriter {
            gate: Semaphore::new(0),
            writes: AtomicUsize::new(0),
        });
        let pipeline = Arc::new(Pipeline::with_limits(writer.clone(), 2, 1));

        // First point is taken by the worker, which then parks inside the
        // gated write. The next two fill the queue.
        pipeline.enqueue(point(0)).await;
        for seq in 1..3 {
            tokio::time::timeout(Duration::from_secs(1), pipeline.enqueue(point(seq)))
                .await
                .expect("queue should accept points up to capacity");
        }

        // Queue is full now; the producer must block.
        let blocked = pipeline.clone();
        let producer = tokio::spawn(async move { blocked.enqueue(point(3)).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished(), "producer should block on a full queue");

        // One drain cycle frees one slot and unblocks the producer.
        writer.gate.add_permits(1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should unblock after a drain cycle")
            .unwrap();

        writer.gate.add_permits(8);
        pipeline.flush().await;
        assert_eq!(writer.writes.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn second_flush_is_a_no_op() {
        let writer = Arc::new(RecordingWriter::default());
        let pipeline = Pipeline::with_limits(writer.clone(), 10, 10);

        pipeline.enqueue(point(0)).await;
        pipeline.flush().await;
        pipeline.flush().await;

        assert_eq!(writer.batches.lock().unwrap().len(), 1);
    }
}
