//! Per-buyer order sequence numbers continued from the persisted history.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::model::{Order, OrderBook};

/// Highest `nth_order` already persisted for each buyer.
pub fn baselines(history: &[Order]) -> HashMap<String, i64> {
    let mut out: HashMap<String, i64> = HashMap::new();
    for order in history {
        let entry = out.entry(order.user_id.clone()).or_insert(0);
        *entry = (*entry).max(order.nth_order);
    }
    out
}

/// Remove orders (and their lines) whose id is already in the history, and
/// any later repeat of an id within the batch itself.
/// Returns the number of orders removed.
pub fn drop_known(batch: &mut OrderBook, history: &[Order]) -> usize {
    let known: HashSet<String> = history.iter().map(|o| o.order_id.clone()).collect();
    let mut seen: HashSet<String> = HashSet::new();
    let before = batch.orders.len();
    batch
        .orders
        .retain(|o| !known.contains(&o.order_id) && seen.insert(o.order_id.clone()));
    batch.lines.retain(|l| !known.contains(&l.order_id));
    let dropped = before - batch.orders.len();
    if dropped > 0 {
        warn!(dropped, "orders already present in history were skipped");
    }
    dropped
}

/// Number each buyer's new orders after their historical maximum.
///
/// Orders are ranked by `(order_time, order_id)`, so the result does not
/// depend on the input order and re-running with the same baseline is a
/// no-op.
pub fn assign(orders: &mut [Order], baseline: &HashMap<String, i64>) {
    let mut ranked: Vec<usize> = (0..orders.len()).collect();
    ranked.sort_by(|&a, &b| {
        let (x, y) = (&orders[a], &orders[b]);
        (&x.user_id, x.order_time, &x.order_id).cmp(&(&y.user_id, y.order_time, &y.order_id))
    });

    let mut next: HashMap<String, i64> = HashMap::new();
    for idx in ranked {
        let user = orders[idx].user_id.clone();
        let counter = next
            .entry(user)
            .or_insert_with_key(|u| baseline.get(u).copied().unwrap_or(0));
        *counter += 1;
        orders[idx].nth_order = *counter;
        orders[idx].is_rebuy = *counter > 1;
    }

    let rebuys = orders.iter().filter(|o| o.is_rebuy).count();
    info!(orders = orders.len(), rebuys, "sequence numbers assigned");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, order};

    #[test]
    fn test_continues_from_history() {
        let mut old = order("h1", "u1", "2023-12-01 10:00:00", 10.0);
        old.nth_order = 2;
        let baseline = baselines(&[old]);

        let mut batch = vec![
            order("n3", "u1", "2024-02-09 10:00:00", 10.0),
            order("n1", "u1", "2024-01-01 10:00:00", 10.0),
            order("n2", "u1", "2024-01-10 10:00:00", 10.0),
            order("x1", "u2", "2024-01-05 10:00:00", 10.0),
        ];
        assign(&mut batch, &baseline);

        let nth: Vec<(&str, i64, bool)> = batch
            .iter()
            .map(|o| (o.order_id.as_str(), o.nth_order, o.is_rebuy))
            .collect();
        assert_eq!(
            nth,
            vec![("n3", 5, true), ("n1", 3, true), ("n2", 4, true), ("x1", 1, false)]
        );
    }

    #[test]
    fn test_same_timestamp_broken_by_order_id() {
        let mut batch = vec![
            order("b", "u1", "2024-01-01 10:00:00", 10.0),
            order("a", "u1", "2024-01-01 10:00:00", 10.0),
        ];
        assign(&mut batch, &HashMap::new());
        assert_eq!(batch[0].nth_order, 2);
        assert_eq!(batch[1].nth_order, 1);
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let mut batch = vec![
            order("a", "u1", "2024-01-03 10:00:00", 10.0),
            order("b", "u1", "2024-01-01 10:00:00", 10.0),
        ];
        let baseline = HashMap::from([("u1".to_string(), 4)]);
        assign(&mut batch, &baseline);
        let first = batch.clone();
        assign(&mut batch, &baseline);
        assert_eq!(batch, first);
        assert_eq!(batch[1].nth_order, 5);
    }

    #[test]
    fn test_known_orders_dropped_with_lines() {
        let history = vec![order("o1", "u1", "2024-01-01 10:00:00", 10.0)];
        let mut batch = OrderBook::new(
            vec![
                order("o1", "u1", "2024-01-01 10:00:00", 10.0),
                order("o2", "u1", "2024-01-02 10:00:00", 10.0),
            ],
            vec![line("o1", "p1", "c", "RT"), line("o2", "p1", "c", "RT")],
        );
        assert_eq!(drop_known(&mut batch, &history), 1);
        assert_eq!(batch.orders.len(), 1);
        assert_eq!(batch.lines.len(), 1);
        assert_eq!(batch.lines[0].order_id, "o2");
    }

    #[test]
    fn test_repeated_id_in_batch_numbered_once() {
        let mut batch = OrderBook::new(
            vec![
                order("o3", "u2", "2024-01-02 09:00:00", 25.0),
                order("o3", "u2", "2024-01-02 09:00:00", 25.0),
            ],
            vec![line("o3", "p2", "spice", "FS")],
        );
        assert_eq!(drop_known(&mut batch, &[]), 1);
        assign(&mut batch.orders, &HashMap::new());
        assert_eq!(batch.orders.len(), 1);
        assert_eq!((batch.orders[0].nth_order, batch.orders[0].is_rebuy), (1, false));
        assert_eq!(batch.lines.len(), 1);
    }
}
