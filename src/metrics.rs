use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Allocation counters, registered on a private registry so tests can build
/// as many instances as they like.
pub struct Metrics {
    registry: Registry,
    pub batches_created: IntCounter,
    pub batch_rejections: IntCounterVec,
    pub device_numbers_generated: IntCounter,
    pub allocation_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let batches_created =
            IntCounter::new("batches_created_total", "Production batches committed")?;
        let batch_rejections = IntCounterVec::new(
            Opts::new("batch_rejections_total", "Batch creation failures by reason"),
            &["reason"],
        )?;
        let device_numbers_generated = IntCounter::new(
            "device_numbers_generated_total",
            "Device numbers committed as part of a batch",
        )?;
        let allocation_seconds = Histogram::with_opts(
            HistogramOpts::new("batch_allocation_seconds", "Wall time of createBatch")
                .buckets(vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(batches_created.clone()))?;
        registry.register(Box::new(batch_rejections.clone()))?;
        registry.register(Box::new(device_numbers_generated.clone()))?;
        registry.register(Box::new(allocation_seconds.clone()))?;

        Ok(Metrics {
            registry,
            batches_created,
            batch_rejections,
            device_numbers_generated,
            allocation_seconds,
        })
    }

    pub fn record_rejection(&self, reason: &str) {
        self.batch_rejections.with_label_values(&[reason]).inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.batches_created.inc();
        metrics.record_rejection("validation");
        metrics.device_numbers_generated.inc_by(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("batches_created_total 1"));
        assert!(text.contains("batch_rejections_total{reason=\"validation\"} 1"));
        assert!(text.contains("device_numbers_generated_total 3"));
    }
}
