use crate::feed::types::FeedItem;

/// Result of trimming one raw batch against a watermark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterOutcome {
    /// Items strictly newer than the watermark, oldest first.
    pub items: Vec<FeedItem>,
    /// Largest timestamp among `items`; `None` when nothing was new.
    pub watermark_candidate: Option<i64>,
}

/// Keep only the items of a newest-first batch that are strictly newer than
/// `watermark`, returned oldest first.
///
/// The scan stops at the first item at or below the watermark. Batches are
/// assumed contiguous in time near the boundary, so anything after that
/// point is treated as already delivered even if a stray newer item follows.
pub fn apply(batch_newest_first: Vec<FeedItem>, watermark: i64) -> FilterOutcome {
    let mut fresh = Vec::new();
    let mut newest: Option<i64> = None;

    for item in batch_newest_first {
        if item.timestamp_ms <= watermark {
            break;
        }
        newest = Some(newest.map_or(item.timestamp_ms, |n| n.max(item.timestamp_ms)));
        fresh.push(item);
    }

    fresh.reverse();
    FilterOutcome {
        items: fresh,
        watermark_candidate: newest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::SubscriptionKey;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn batch(times: &[i64]) -> Vec<FeedItem> {
        let key = SubscriptionKey::scoped("room", "group");
        times
            .iter()
            .map(|t| FeedItem::new(key.clone(), *t, json!({ "t": t })))
            .collect()
    }

    fn times(items: &[FeedItem]) -> Vec<i64> {
        items.iter().map(|i| i.timestamp_ms).collect()
    }

    #[test]
    fn test_returns_new_items_ascending() {
        let outcome = apply(batch(&[50, 40, 30, 20]), 25);
        assert_eq!(times(&outcome.items), vec![30, 40, 50]);
        assert_eq!(outcome.watermark_candidate, Some(50));
    }

    #[test]
    fn test_item_at_watermark_is_not_new() {
        let outcome = apply(batch(&[30, 20]), 30);
        assert!(outcome.items.is_empty());
        assert_eq!(outcome.watermark_candidate, None);
    }

    #[test]
    fn test_empty_batch() {
        let outcome = apply(Vec::new(), 100);
        assert_eq!(outcome, FilterOutcome::default());
    }

    #[test]
    fn test_bootstrap_watermark_blocks_backlog() {
        let now = 1_700_000_000_000;
        let outcome = apply(batch(&[now - 1, now - 5_000, now - 60_000]), now);
        assert!(outcome.items.is_empty());
    }

    #[test]
    fn test_scan_stops_at_first_old_item() {
        // 45 sits behind an already-delivered item and is not reached.
        let outcome = apply(batch(&[60, 20, 45]), 30);
        assert_eq!(times(&outcome.items), vec![60]);
        assert_eq!(outcome.watermark_candidate, Some(60));
    }

    proptest! {
        #[test]
        fn prop_never_replays_old_items(
            mut raw in proptest::collection::vec(0i64..1_000, 0..50),
            watermark in 0i64..1_000,
        ) {
            raw.sort_unstable_by(|a, b| b.cmp(a));
            let outcome = apply(batch(&raw), watermark);

            prop_assert!(outcome.items.iter().all(|i| i.timestamp_ms > watermark));
            prop_assert!(outcome.items.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
            let expected = raw.iter().filter(|t| **t > watermark).count();
            prop_assert_eq!(outcome.items.len(), expected);
            prop_assert_eq!(outcome.watermark_candidate, raw.iter().copied().filter(|t| *t > watermark).max());
        }
    }
}
