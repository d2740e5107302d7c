use crate::metrics::types::MetricPoint;
use tokio::sync::mpsc;
use tracing::debug;

/// Many-producer funnel for samples built during one collection cycle.
#[derive(Debug, Clone)]
pub struct MetricSink {
    tx: mpsc::Sender<MetricPoint>,
}

impl MetricSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MetricPoint>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Waits for channel capacity. A closed receiver drops the sample.
    pub async fn emit(&self, point: MetricPoint) {
        if let Err(e) = self.tx.send(point).await {
            debug!(metric = %e.0.name, "Metric receiver closed, dropping sample");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::definitions::BROKER_TPS;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (sink, mut rx) = MetricSink::channel(4);
        sink.emit(BROKER_TPS.gauge(&["c", "b", "addr"], 1.0)).await;
        sink.emit(BROKER_TPS.gauge(&["c", "b", "addr"], 2.0)).await;
        drop(sink);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!((first.value.as_f64() - 1.0).abs() < f64::EPSILON);
        assert!((second.value.as_f64() - 2.0).abs() < f64::EPSILON);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = MetricSink::channel(1);
        drop(rx);
        sink.emit(BROKER_TPS.gauge(&["c", "b", "addr"], 1.0)).await;
    }
}
