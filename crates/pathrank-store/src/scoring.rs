/// Turns the accumulated reference count of a document into a rank value.
pub trait PathScorer: Send + Sync {
    fn score(&self, repository: &str, document_path: &str, reference_count: i64) -> f64;
}

/// `ln(1 + count)`: monotonic in the count, flattened for very popular paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogScaledScorer;

impl PathScorer for LogScaledScorer {
    fn score(&self, _repository: &str, _document_path: &str, reference_count: i64) -> f64 {
        (reference_count.max(0) as f64).ln_1p()
    }
}
