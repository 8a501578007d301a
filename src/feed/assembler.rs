use crate::feed::types::{DeliveryBatch, FeedItem};

/// Merge the per-subscription results of one polling cycle into a single
/// ascending batch.
///
/// The sort is stable over the concatenation of `per_subscription` in
/// iteration order, so equal timestamps keep subscription order first and
/// within-subscription order second. Nothing is dropped or duplicated.
pub fn merge_cycle<I>(per_subscription: I) -> DeliveryBatch
where
    I: IntoIterator<Item = Vec<FeedItem>>,
{
    let mut items: Vec<FeedItem> = per_subscription.into_iter().flatten().collect();
    items.sort_by_key(|item| item.timestamp_ms);
    DeliveryBatch { items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::SubscriptionKey;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn items(sub: &str, times: &[i64]) -> Vec<FeedItem> {
        let key = SubscriptionKey::scoped(sub, "group");
        times
            .iter()
            .enumerate()
            .map(|(i, t)| FeedItem::new(key.clone(), *t, json!({ "sub": sub, "n": i })))
            .collect()
    }

    #[test]
    fn test_interleaves_two_subscriptions() {
        let batch = merge_cycle(vec![items("a", &[10, 30]), items("b", &[20, 40])]);
        assert_eq!(batch.timestamps(), vec![10, 20, 30, 40]);
    }

    #[test]
    fn test_ties_follow_subscription_then_item_order() {
        let batch = merge_cycle(vec![items("a", &[5, 5]), items("b", &[5]), items("c", &[1])]);
        let order: Vec<(String, i64)> = batch
            .items
            .iter()
            .map(|i| {
                (
                    i.payload["sub"].as_str().unwrap().to_string(),
                    i.payload["n"].as_i64().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("c".to_string(), 0),
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 0),
            ]
        );
    }

    #[test]
    fn test_empty_cycle() {
        assert!(merge_cycle(Vec::<Vec<FeedItem>>::new()).is_empty());
        assert!(merge_cycle(vec![Vec::new(), Vec::new()]).is_empty());
    }

    proptest! {
        #[test]
        fn prop_merge_is_sorted_and_lossless(
            subs in proptest::collection::vec(proptest::collection::vec(0i64..100, 0..20), 0..6)
        ) {
            let inputs: Vec<Vec<FeedItem>> = subs
                .iter()
                .enumerate()
                .map(|(n, times)| {
                    let mut times = times.clone();
                    times.sort_unstable();
                    items(&format!("s{n}"), &times)
                })
                .collect();
            let total: usize = inputs.iter().map(Vec::len).sum();

            let batch = merge_cycle(inputs);
            prop_assert_eq!(batch.len(), total);
            prop_assert!(batch.items.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        }
    }
}
