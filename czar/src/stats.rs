use parking_lot::Mutex;

/// A weighted moving average of ingest completion times, kept in
/// minutes. The weights decide how quickly the average tracks recent
/// requests; both are configurable.
pub struct CompletionTimeStats {
    weight_old: f64,
    weight_new: f64,
    total_completion_time_min: Mutex<f64>,
}

impl CompletionTimeStats {
    pub fn new(weight_old: f64, weight_new: f64) -> Self {
        Self {
            weight_old,
            weight_new,
            total_completion_time_min: Mutex::new(0.0),
        }
    }

    /// Fold one completed request into the average.
    pub fn record(&self, duration: std::time::Duration) {
        let minutes = duration.as_millis() as f64 / 60000.0;
        let mut avg = self.total_completion_time_min.lock();
        let total_weight = self.weight_old + self.weight_new;
        *avg = (*avg * self.weight_old + minutes * self.weight_new) / total_weight;
    }

    pub fn completion_time_min(&self) -> f64 {
        *self.total_completion_time_min.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn average_tracks_recent_completions_slowly() {
        let stats = CompletionTimeStats::new(99.0, 1.0);
        stats.record(Duration::from_secs(60));
        let first = stats.completion_time_min();
        assert!((first - 0.01).abs() < 1e-9);

        for _ in 0..100 {
            stats.record(Duration::from_secs(60));
        }
        // Converging towards one minute but still well below it.
        let later = stats.completion_time_min();
        assert!(later > first);
        assert!(later < 1.0);
    }
}
