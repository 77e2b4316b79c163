use std::time::Duration;

/// Batching discipline (spec §4.2): never issue a query whose expected
/// samples-count could exceed `query_max_samples`. The three tunables
/// (`query_max_series`, `query_min_samples`, derived `batch_size`) give the
/// operator explicit control over worst-case query cost per tick without
/// knowing cluster size in advance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchPlan {
    pub samples_per_series: u64,
    pub max_labels: u64,
    pub batch_size: u64,
}

/// `samples_per_series = max(ceil(range / scrape_interval), 1)`
/// `max_labels = floor(query_max_samples / (query_max_series * samples_per_series))`
/// `batch_size = clamp(floor(query_min_samples * max_labels), 10, total_uuid_count)`
pub fn plan_batches(
    query_max_samples: u64,
    query_max_series: u64,
    query_min_samples: f64,
    range: Duration,
    scrape_interval: Duration,
    total_uuid_count: u64,
) -> BatchPlan {
    let samples_per_series = {
        let range_s = range.as_secs_f64();
        let scrape_s = scrape_interval.as_secs_f64().max(f64::EPSILON);
        (range_s / scrape_s).ceil().max(1.0) as u64
    };

    let denom = (query_max_series * samples_per_series).max(1);
    let max_labels = query_max_samples / denom;

    let raw_batch = (query_min_samples * max_labels as f64).floor() as i64;
    let lower_clamped = raw_batch.max(10);
    let batch_size = if total_uuid_count == 0 {
        0
    } else {
        (lower_clamped as u64).min(total_uuid_count)
    };

    BatchPlan {
        samples_per_series,
        max_labels,
        batch_size,
    }
}

/// Split `uuids` into chunks of at most `batch_size` (at least one chunk,
/// even if `batch_size` is zero, so a misconfigured budget never produces an
/// infinite loop of empty batches — it degrades to one all-in-one batch).
pub fn chunk_uuids(uuids: &[String], batch_size: u64) -> Vec<Vec<String>> {
    if uuids.is_empty() {
        return vec![];
    }
    let size = if batch_size == 0 { uuids.len() } else { batch_size as usize };
    uuids.chunks(size.max(1)).map(|c| c.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_budget_never_exceeds_query_max_samples() {
        // Testable property 6: query_max_series * samples_per_series <= query_max_samples.
        let plan = plan_batches(10_000, 50, 0.5, Duration::from_secs(900), Duration::from_secs(15), 500);
        assert!(50 * plan.samples_per_series <= 10_000);
        assert_eq!(plan.samples_per_series, 60);
    }

    #[test]
    fn batch_size_is_clamped_to_at_least_ten() {
        let plan = plan_batches(100, 50, 0.5, Duration::from_secs(900), Duration::from_secs(15), 500);
        // max_labels = 100 / (50*60) = 0 -> raw batch = 0 -> clamp to 10
        assert_eq!(plan.batch_size, 10);
    }

    #[test]
    fn batch_size_is_clamped_to_total_uuid_count() {
        let plan = plan_batches(1_000_000, 1, 1.0, Duration::from_secs(60), Duration::from_secs(15), 7);
        assert_eq!(plan.batch_size, 7);
    }

    #[test]
    fn chunk_uuids_splits_evenly() {
        let uuids: Vec<String> = (0..25).map(|i| i.to_string()).collect();
        let chunks = chunk_uuids(&uuids, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    #[test]
    fn chunk_uuids_on_empty_list_is_empty() {
        assert!(chunk_uuids(&[], 10).is_empty());
    }
}
