//! Token budgeting: greedy all-or-nothing packing in rank order.
//!
//! Tokenization is model-specific, so the counter is caller-supplied.
//! A chars/4 estimator ships for callers without a real tokenizer.

use std::collections::HashMap;

use crate::model::{Category, MemoryItem};
use crate::rank::Scored;

/// Outcome of a budgeting pass.
#[derive(Debug)]
pub struct Capped {
    /// Accepted items in rank order.
    pub items: Vec<MemoryItem>,
    /// Token cost of everything accepted.
    pub total_tokens: usize,
    /// Items rejected for budget reasons.
    pub excluded_count: usize,
}

/// Greedily accept items in rank order under `token_budget`.
///
/// Partial inclusion is never allowed, and the first item that would push
/// the running total past the budget *stops* the walk; everything after it
/// is excluded. Per-category shares (fractions of the total budget) are
/// softer: an over-quota item is skipped, not a stop, and later items from
/// other categories are still considered. Deterministic for a fixed input
/// list and budget.
pub fn cap<F>(
    deduped: Vec<Scored>,
    token_budget: usize,
    category_shares: &HashMap<Category, f64>,
    count_tokens: F,
) -> Capped
where
    F: Fn(&MemoryItem) -> usize,
{
    let category_caps: HashMap<Category, usize> = category_shares
        .iter()
        .map(|(category, share)| (*category, (token_budget as f64 * share) as usize))
        .collect();

    let mut items = Vec::new();
    let mut total_tokens = 0usize;
    let mut excluded_count = 0usize;
    let mut per_category: HashMap<Category, usize> = HashMap::new();

    let mut remaining = deduped.into_iter();
    for scored in remaining.by_ref() {
        let cost = count_tokens(&scored.item);

        if total_tokens + cost > token_budget {
            // First globally over-budget item ends the walk; everything
            // from here down is excluded.
            excluded_count += 1 + remaining.len();
            break;
        }

        if let Some(cap) = category_caps.get(&scored.item.category) {
            let spent = per_category.get(&scored.item.category).copied().unwrap_or(0);
            if spent + cost > *cap {
                excluded_count += 1;
                continue;
            }
        }

        total_tokens += cost;
        *per_category.entry(scored.item.category).or_insert(0) += cost;
        items.push(scored.item);
    }

    Capped {
        items,
        total_tokens,
        excluded_count,
    }
}

/// Rough token estimate when no model tokenizer is plugged in:
/// one token per four characters, minimum one.
pub fn estimate_tokens(item: &MemoryItem) -> usize {
    item.lexical_text.chars().count().div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewMemoryItem;
    use chrono::Utc;

    fn scored(category: Category, text: &str, score: f64) -> Scored {
        let item = NewMemoryItem::new(category, vec![1.0, 0.0], text).build(Utc::now());
        Scored { item, score }
    }

    /// Counter that charges a flat 40 tokens per item.
    fn flat_40(_: &MemoryItem) -> usize {
        40
    }

    #[test]
    fn budget_is_never_exceeded() {
        let input = vec![
            scored(Category::Turn, "a", 0.9),
            scored(Category::Turn, "b", 0.8),
            scored(Category::Turn, "c", 0.7),
        ];

        let capped = cap(input, 100, &HashMap::new(), flat_40);
        assert_eq!(capped.items.len(), 2);
        assert_eq!(capped.total_tokens, 80);
        assert_eq!(capped.excluded_count, 1);
    }

    #[test]
    fn first_over_budget_item_stops_the_walk() {
        let input = vec![
            scored(Category::Turn, "big", 0.9),
            scored(Category::Turn, "small", 0.8),
        ];
        let capped = cap(input, 50, &HashMap::new(), |item| {
            if item.lexical_text == "big" { 60 } else { 10 }
        });
        // The 60-token item doesn't fit and ends acceptance; the cheaper
        // lower-ranked item is not considered. No partial inclusion.
        assert!(capped.items.is_empty());
        assert_eq!(capped.total_tokens, 0);
        assert_eq!(capped.excluded_count, 2);
    }

    #[test]
    fn items_after_the_stop_are_all_excluded() {
        let input = vec![
            scored(Category::Turn, "a", 0.9),
            scored(Category::Turn, "b", 0.8),
            scored(Category::Turn, "c", 0.7),
            scored(Category::Turn, "d", 0.6),
        ];
        let capped = cap(input, 50, &HashMap::new(), flat_40);
        assert_eq!(capped.items.len(), 1);
        assert_eq!(capped.items[0].lexical_text, "a");
        assert_eq!(capped.excluded_count, 3);
    }

    #[test]
    fn category_share_skips_without_stopping() {
        let mut shares = HashMap::new();
        shares.insert(Category::EpisodicEvent, 0.2); // 40 of 200

        let input = vec![
            scored(Category::EpisodicEvent, "e1", 0.9),
            scored(Category::EpisodicEvent, "e2", 0.8), // over the 20% share
            scored(Category::Turn, "t1", 0.7),          // still considered
        ];

        let capped = cap(input, 200, &shares, flat_40);
        let texts: Vec<&str> = capped
            .items
            .iter()
            .map(|i| i.lexical_text.as_str())
            .collect();
        assert_eq!(texts, vec!["e1", "t1"]);
        assert_eq!(capped.excluded_count, 1);
    }

    #[test]
    fn estimate_rounds_up_and_floors_at_one() {
        let short = NewMemoryItem::new(Category::Turn, vec![1.0], "ab").build(Utc::now());
        assert_eq!(estimate_tokens(&short), 1);
        let nine = NewMemoryItem::new(Category::Turn, vec![1.0], "123456789").build(Utc::now());
        assert_eq!(estimate_tokens(&nine), 3);
    }
}
