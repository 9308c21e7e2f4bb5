//! Ready-made traffic analytics
//!
//! Each function builds the [`AggregationJob`] for one standard report. The
//! jobs are ordinary values and can be adjusted before execution.

use crate::query::{AggregationJob, CompareOp, KeyExtractor, Predicate, SortKey};

/// Requests per status code
pub fn status_distribution() -> AggregationJob {
    AggregationJob::count().group_by(KeyExtractor::StatusCode)
}

/// The `k` most requested URLs
pub fn top_pages(k: usize) -> AggregationJob {
    AggregationJob::top_k(k).group_by(KeyExtractor::Url)
}

/// The `k` most frequent user agents
pub fn top_user_agents(k: usize) -> AggregationJob {
    AggregationJob::top_k(k).group_by(KeyExtractor::UserAgent)
}

/// Request volume per timestamp prefix, oldest bucket first
///
/// With `YYYY-MM-DD HH:MM:SS` timestamps, 10 buckets by day and 13 by hour.
pub fn requests_per_bucket(prefix_len: usize) -> AggregationJob {
    AggregationJob::count()
        .group_by(KeyExtractor::TimeBucket { prefix_len })
        .order_by(SortKey::Key, false)
}

/// Clients with more than `threshold` responses in `statuses`
pub fn repeat_failures(statuses: impl IntoIterator<Item = u16>, threshold: u64) -> AggregationJob {
    AggregationJob::count()
        .group_by(KeyExtractor::ClientAddress)
        .filter(Predicate::status_in(statuses))
        .having(CompareOp::Gt, threshold)
        .order_by(SortKey::Value, true)
}

/// Distinct clients per URL
pub fn unique_clients_per_page() -> AggregationJob {
    AggregationJob::count_distinct(KeyExtractor::ClientAddress).group_by(KeyExtractor::Url)
}
