//! Market-basket association: FP-growth frequent itemsets and rules.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use polars::prelude::*;
use tracing::debug;

use crate::config::RuleThresholds;
use crate::error::Result;
use crate::model::OrderBook;
use crate::schema::line;

/// What forms one basket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasketUnit {
    Order,
    Buyer,
}

/// What the basket holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasketItem {
    Category,
    Product,
}

impl BasketItem {
    /// Category itemsets are capped at pairs.
    pub fn max_len(self) -> Option<usize> {
        match self {
            Self::Category => Some(2),
            Self::Product => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrequentItemset {
    /// Sorted item labels.
    pub items: Vec<String>,
    pub support: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRule {
    pub antecedents: Vec<String>,
    pub consequents: Vec<String>,
    pub antecedent_support: f64,
    pub consequent_support: f64,
    pub support: f64,
    pub confidence: f64,
    pub lift: f64,
}

// ── FP-growth ───────────────────────────────────────────────────────────────

const ROOT: usize = 0;

struct FpNode {
    item: usize,
    count: u64,
    parent: usize,
    children: HashMap<usize, usize>,
}

/// Prefix tree over weighted transactions of interned item ids.
struct FpTree {
    nodes: Vec<FpNode>,
    header: BTreeMap<usize, Vec<usize>>,
}

impl FpTree {
    fn build(transactions: &[(Vec<usize>, u64)], min_count: f64) -> Self {
        let mut counts: HashMap<usize, u64> = HashMap::new();
        for (items, weight) in transactions {
            for item in items {
                *counts.entry(*item).or_default() += weight;
            }
        }

        let mut tree = Self {
            nodes: vec![FpNode {
                item: usize::MAX,
                count: 0,
                parent: ROOT,
                children: HashMap::new(),
            }],
            header: BTreeMap::new(),
        };

        for (items, weight) in transactions {
            let mut kept: Vec<usize> = items
                .iter()
                .copied()
                .filter(|i| counts[i] as f64 >= min_count)
                .collect();
            kept.sort_by(|a, b| counts[b].cmp(&counts[a]).then(a.cmp(b)));
            tree.insert(&kept, *weight);
        }
        tree
    }

    fn insert(&mut self, items: &[usize], weight: u64) {
        let mut current = ROOT;
        for &item in items {
            current = match self.nodes[current].children.get(&item) {
                Some(&child) => child,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(FpNode {
                        item,
                        count: 0,
                        parent: current,
                        children: HashMap::new(),
                    });
                    self.nodes[current].children.insert(item, idx);
                    self.header.entry(item).or_default().push(idx);
                    idx
                }
            };
            self.nodes[current].count += weight;
        }
    }

    fn prefix_path(&self, mut node: usize) -> Vec<usize> {
        let mut path = Vec::new();
        node = self.nodes[node].parent;
        while node != ROOT {
            path.push(self.nodes[node].item);
            node = self.nodes[node].parent;
        }
        path
    }

    fn mine(
        &self,
        suffix: &[usize],
        min_count: f64,
        max_len: Option<usize>,
        out: &mut Vec<(Vec<usize>, u64)>,
    ) {
        for (&item, nodes) in &self.header {
            let support: u64 = nodes.iter().map(|&n| self.nodes[n].count).sum();
            if (support as f64) < min_count {
                continue;
            }
            let mut itemset = suffix.to_vec();
            itemset.push(item);
            out.push((itemset.clone(), support));

            if max_len.is_some_and(|m| itemset.len() >= m) {
                continue;
            }
            let base: Vec<(Vec<usize>, u64)> = nodes
                .iter()
                .map(|&n| (self.prefix_path(n), self.nodes[n].count))
                .filter(|(path, _)| !path.is_empty())
                .collect();
            if base.is_empty() {
                continue;
            }
            let conditional = FpTree::build(&base, min_count);
            if !conditional.header.is_empty() {
                conditional.mine(&itemset, min_count, max_len, out);
            }
        }
    }
}

/// All itemsets with `support >= min_support` and at most `max_len` items.
pub fn frequent_itemsets(
    transactions: &[BTreeSet<String>],
    min_support: f64,
    max_len: Option<usize>,
) -> Vec<FrequentItemset> {
    if transactions.is_empty() {
        return Vec::new();
    }
    let vocabulary: Vec<&String> = transactions
        .iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let ids: HashMap<&String, usize> = vocabulary.iter().enumerate().map(|(i, s)| (*s, i)).collect();

    let encoded: Vec<(Vec<usize>, u64)> = transactions
        .iter()
        .map(|t| (t.iter().map(|s| ids[s]).collect(), 1))
        .collect();

    let n = transactions.len() as f64;
    // tolerance keeps e.g. 30 / 1000 at a 0.03 threshold
    let min_count = min_support * n - 1e-9;
    let tree = FpTree::build(&encoded, min_count);
    let mut found = Vec::new();
    tree.mine(&[], min_count, max_len, &mut found);

    let mut itemsets: Vec<FrequentItemset> = found
        .into_iter()
        .map(|(ids, count)| {
            let mut items: Vec<String> = ids.iter().map(|&i| vocabulary[i].clone()).collect();
            items.sort();
            FrequentItemset {
                items,
                support: count as f64 / n,
            }
        })
        .collect();
    itemsets.sort_by(|a, b| {
        b.support
            .total_cmp(&a.support)
            .then_with(|| a.items.cmp(&b.items))
    });
    itemsets
}

/// Split every frequent itemset into antecedent → consequent rules with
/// `confidence >= min_confidence` and `lift > min_lift`.
/// Sorted by support, lift, confidence, all descending.
pub fn association_rules(
    itemsets: &[FrequentItemset],
    min_confidence: f64,
    min_lift: f64,
) -> Vec<AssociationRule> {
    let support_of: HashMap<&[String], f64> = itemsets
        .iter()
        .map(|s| (s.items.as_slice(), s.support))
        .collect();

    let mut rules = Vec::new();
    for set in itemsets.iter().filter(|s| s.items.len() > 1) {
        let k = set.items.len();
        for mask in 1..(1u64 << k) - 1 {
            let (antecedents, consequents): (Vec<(usize, &String)>, Vec<(usize, &String)>) =
                set.items.iter().enumerate().partition(|(i, _)| mask & (1 << i) != 0);
            let antecedents: Vec<String> = antecedents.into_iter().map(|(_, s)| s.clone()).collect();
            let consequents: Vec<String> = consequents.into_iter().map(|(_, s)| s.clone()).collect();

            // subsets of a frequent itemset are frequent
            let (Some(&a_sup), Some(&c_sup)) = (
                support_of.get(antecedents.as_slice()),
                support_of.get(consequents.as_slice()),
            ) else {
                continue;
            };
            let confidence = set.support / a_sup;
            let lift = confidence / c_sup;
            if confidence >= min_confidence && lift > min_lift {
                rules.push(AssociationRule {
                    antecedents,
                    consequents,
                    antecedent_support: a_sup,
                    consequent_support: c_sup,
                    support: set.support,
                    confidence,
                    lift,
                });
            }
        }
    }

    rules.sort_by(|a, b| {
        b.support
            .total_cmp(&a.support)
            .then_with(|| b.lift.total_cmp(&a.lift))
            .then_with(|| b.confidence.total_cmp(&a.confidence))
            .then_with(|| a.antecedents.cmp(&b.antecedents))
    });
    rules
}

// ── Baskets from the order book ─────────────────────────────────────────────

pub struct BasketAnalysis<'a> {
    book: &'a OrderBook,
}

impl<'a> BasketAnalysis<'a> {
    pub fn new(book: &'a OrderBook) -> Self {
        Self { book }
    }

    /// Baskets with more than one distinct item.
    ///
    /// Order baskets only consider orders with several categories
    /// (`cate_num > 1`) or several goods (`goods_type > 1`).
    pub fn baskets(&self, unit: BasketUnit, item: BasketItem) -> Vec<BTreeSet<String>> {
        let mut grouped: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (o, l) in self.book.joined_lines() {
            let key = match unit {
                BasketUnit::Order => {
                    let multi = match item {
                        BasketItem::Category => o.cate_num > 1,
                        BasketItem::Product => o.goods_type > 1,
                    };
                    if !multi {
                        continue;
                    }
                    o.order_id.as_str()
                }
                BasketUnit::Buyer => o.user_id.as_str(),
            };
            let value = match item {
                BasketItem::Category => l.category.clone(),
                BasketItem::Product => l.product_id.clone(),
            };
            grouped.entry(key).or_default().insert(value);
        }
        grouped.into_values().filter(|b| b.len() > 1).collect()
    }

    pub fn rules(
        &self,
        unit: BasketUnit,
        item: BasketItem,
        thresholds: &RuleThresholds,
    ) -> Vec<AssociationRule> {
        let baskets = self.baskets(unit, item);
        let itemsets = frequent_itemsets(&baskets, thresholds.min_support, item.max_len());
        let rules = association_rules(&itemsets, thresholds.min_confidence, thresholds.min_lift);
        debug!(
            ?unit,
            ?item,
            baskets = baskets.len(),
            itemsets = itemsets.len(),
            rules = rules.len(),
            "association rules mined"
        );
        rules
    }

    /// Rule table with human-readable labels. Product rules show the
    /// simplified title and the category of each side.
    pub fn rules_frame(
        &self,
        unit: BasketUnit,
        item: BasketItem,
        thresholds: &RuleThresholds,
    ) -> Result<DataFrame> {
        let rules = self.rules(unit, item, thresholds);

        let mut labels: HashMap<&str, (&str, &str)> = HashMap::new();
        if item == BasketItem::Product {
            for l in &self.book.lines {
                labels
                    .entry(l.product_id.as_str())
                    .or_insert((l.display_title(), l.category.as_str()));
            }
        }
        let title = |ids: &[String]| -> String {
            ids.iter()
                .map(|id| labels.get(id.as_str()).map_or(id.as_str(), |(t, _)| *t))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let category = |ids: &[String]| -> String {
            ids.iter()
                .map(|id| labels.get(id.as_str()).map_or("", |(_, c)| *c))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut columns = vec![
            Column::new("antecedents".into(), rules.iter().map(|r| title(&r.antecedents)).collect::<Vec<_>>()),
            Column::new("consequents".into(), rules.iter().map(|r| title(&r.consequents)).collect::<Vec<_>>()),
        ];
        if item == BasketItem::Product {
            columns.push(Column::new(
                format!("antecedent_{}", line::CATEGORY).into(),
                rules.iter().map(|r| category(&r.antecedents)).collect::<Vec<_>>(),
            ));
            columns.push(Column::new(
                format!("consequent_{}", line::CATEGORY).into(),
                rules.iter().map(|r| category(&r.consequents)).collect::<Vec<_>>(),
            ));
        }
        columns.extend([
            Column::new("antecedent_support".into(), rules.iter().map(|r| r.antecedent_support).collect::<Vec<_>>()),
            Column::new("consequent_support".into(), rules.iter().map(|r| r.consequent_support).collect::<Vec<_>>()),
            Column::new("support".into(), rules.iter().map(|r| r.support).collect::<Vec<_>>()),
            Column::new("confidence".into(), rules.iter().map(|r| r.confidence).collect::<Vec<_>>()),
            Column::new("lift".into(), rules.iter().map(|r| r.lift).collect::<Vec<_>>()),
        ]);
        Ok(DataFrame::new(columns)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, order};

    fn basket(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn repeat(out: &mut Vec<BTreeSet<String>>, items: &[&str], n: usize) {
        out.extend(std::iter::repeat_with(|| basket(items)).take(n));
    }

    #[test]
    fn test_pair_support_and_confidence() {
        // A and B in 100 orders each, 30 together, 1000 orders in all
        let mut orders = Vec::new();
        repeat(&mut orders, &["A", "B"], 30);
        repeat(&mut orders, &["A", "X"], 70);
        repeat(&mut orders, &["B", "Y"], 70);
        repeat(&mut orders, &["Z", "W"], 830);

        let itemsets = frequent_itemsets(&orders, 0.03, Some(2));
        let pair = itemsets
            .iter()
            .find(|s| s.items == vec!["A".to_string(), "B".to_string()])
            .unwrap();
        assert!((pair.support - 0.03).abs() < 1e-12);

        let rules = association_rules(&itemsets, 0.3, 1.0);
        let a_to_b = rules
            .iter()
            .find(|r| r.antecedents == vec!["A"] && r.consequents == vec!["B"])
            .unwrap();
        assert!((a_to_b.confidence - 0.30).abs() < 1e-12);
        assert!((a_to_b.lift - 3.0).abs() < 1e-9);
        assert!((a_to_b.antecedent_support - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_fp_growth_finds_triples_without_cap() {
        let mut t = Vec::new();
        repeat(&mut t, &["a", "b", "c"], 4);
        repeat(&mut t, &["a", "b"], 2);
        repeat(&mut t, &["c", "d"], 4);

        let sets = frequent_itemsets(&t, 0.3, None);
        let find = |items: &[&str]| {
            sets.iter()
                .find(|s| s.items.iter().map(String::as_str).eq(items.iter().copied()))
                .map(|s| s.support)
        };
        assert_eq!(find(&["a", "b", "c"]), Some(0.4));
        assert_eq!(find(&["a", "b"]), Some(0.6));
        assert_eq!(find(&["c"]), Some(0.8));
        assert_eq!(find(&["c", "d"]), Some(0.4));
        assert_eq!(find(&["a", "d"]), None);

        let capped = frequent_itemsets(&t, 0.3, Some(2));
        assert!(capped.iter().all(|s| s.items.len() <= 2));
    }

    #[test]
    fn test_rule_metric_invariants() {
        let mut t = Vec::new();
        repeat(&mut t, &["a", "b", "c"], 5);
        repeat(&mut t, &["a", "c"], 3);
        repeat(&mut t, &["b", "d"], 6);
        repeat(&mut t, &["a", "d", "e"], 2);
        repeat(&mut t, &["c", "e"], 4);

        let rules = association_rules(&frequent_itemsets(&t, 0.05, None), 0.0, 0.0);
        assert!(!rules.is_empty());
        for r in &rules {
            assert!(r.support <= r.antecedent_support.min(r.consequent_support) + 1e-12);
            if r.lift > 1.0 {
                assert!(r.confidence > r.consequent_support);
            }
        }
        for pair in rules.windows(2) {
            assert!(pair[0].support >= pair[1].support);
        }
    }

    #[test]
    fn test_order_and_buyer_baskets() {
        let mut o1 = order("o1", "u1", "2024-01-01 10:00:00", 10.0);
        o1.cate_num = 2;
        o1.goods_type = 2;
        let o2 = order("o2", "u1", "2024-01-05 10:00:00", 10.0);
        let book = OrderBook::new(
            vec![o1, o2],
            vec![
                line("o1", "p1", "sauce", "RT"),
                line("o1", "p2", "spice", "RT"),
                line("o2", "p3", "oil", "RT"),
            ],
        );
        let analysis = BasketAnalysis::new(&book);

        assert_eq!(
            analysis.baskets(BasketUnit::Order, BasketItem::Category),
            vec![basket(&["sauce", "spice"])]
        );
        assert_eq!(
            analysis.baskets(BasketUnit::Buyer, BasketItem::Product),
            vec![basket(&["p1", "p2", "p3"])]
        );

        let df = analysis
            .rules_frame(
                BasketUnit::Order,
                BasketItem::Product,
                &RuleThresholds::new(0.5, 0.5, 0.5),
            )
            .unwrap();
        assert_eq!(df.height(), 2);
        let ante: Vec<&str> = df.column("antecedents").unwrap().str().unwrap().into_no_null_iter().collect();
        assert!(ante.contains(&"title p1"));
        let cats: Vec<&str> = df
            .column("antecedent_category")
            .unwrap()
            .str()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert!(cats.contains(&"sauce"));
    }
}
