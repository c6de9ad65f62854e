//! Purchase-path trees: how first-time buyers branch out over their next
//! orders, grouped by promotion type or category.
//!
//! Each tree is a petgraph `DiGraph` whose nodes count the buyers that
//! followed a path and whose edges carry the conversion rate from the
//! parent node. Each tree is written as Graphviz DOT and as an SVG image
//! laid out with layout-rs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use layout::backends::svg::SVGWriter;
use layout::core::base::Orientation;
use layout::core::geometry::Point;
use layout::core::style::StyleAttr;
use layout::std_shapes::shapes::{Arrow, Element, ShapeKind};
use layout::topo::layout::VisualGraph;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tracing::{debug, info};

use crate::config::PathConfig;
use crate::error::Result;
use crate::model::OrderBook;
use crate::table::ratio;

const FIRST_ORDER: &str = "first order";
const ALL_BUYERS: &str = "all buyers";
const PRODUCT_MARK: char = '$';

/// Branch thresholds. Both must be strictly exceeded for a branch to stay.
#[derive(Debug, Clone, Copy)]
pub struct Pruning {
    pub min_rate: f64,
    pub min_buyers: usize,
}

impl Pruning {
    pub fn new(min_rate: f64, min_buyers: usize) -> Self {
        Self {
            min_rate,
            min_buyers,
        }
    }

    pub fn keeps(&self, rate: f64, buyers: usize) -> bool {
        rate > self.min_rate && buyers > self.min_buyers
    }
}

#[derive(Debug, Clone)]
pub struct PathNode {
    pub label: String,
    pub buyers: usize,
}

#[derive(Debug, Clone, Copy)]
struct PathEdge {
    rate: f64,
    level: usize,
}

/// A rooted purchase-path tree.
pub struct PathTree {
    name: String,
    graph: DiGraph<PathNode, PathEdge>,
    root: NodeIndex,
}

impl PathTree {
    fn new(name: impl Into<String>, label: &str, buyers: usize) -> Self {
        let mut graph = DiGraph::new();
        let root = graph.add_node(PathNode {
            label: label.to_string(),
            buyers,
        });
        Self {
            name: name.into(),
            graph,
            root,
        }
    }

    fn add_branch(
        &mut self,
        parent: NodeIndex,
        label: &str,
        buyers: usize,
        rate: f64,
        level: usize,
    ) -> NodeIndex {
        let node = self.graph.add_node(PathNode {
            label: label.to_string(),
            buyers,
        });
        self.graph.add_edge(parent, node, PathEdge { rate, level });
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &PathNode {
        &self.graph[self.root]
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Follow child labels down from the root. Yields the node reached and
    /// the rate on the edge into it (1.0 for the root itself).
    pub fn find(&self, labels: &[&str]) -> Option<(&PathNode, f64)> {
        let mut current = self.root;
        let mut rate = 1.0;
        for label in labels {
            let edge = self
                .graph
                .edges_directed(current, Direction::Outgoing)
                .find(|e| self.graph[e.target()].label == *label)?;
            rate = edge.weight().rate;
            current = edge.target();
        }
        Some((&self.graph[current], rate))
    }

    pub fn to_dot(&self) -> String {
        self.to_string()
    }

    /// Top-down SVG drawing of the tree, one box per node.
    pub fn to_svg(&self) -> String {
        let mut vg = VisualGraph::new(Orientation::TopToBottom);
        let handles: Vec<_> = self
            .graph
            .node_indices()
            .map(|idx| {
                let node = &self.graph[idx];
                let text = format!("{} {}", node.label, node.buyers);
                let width = 14.0 * text.chars().count() as f64 + 20.0;
                vg.add_node(Element::create(
                    ShapeKind::new_box(&text),
                    StyleAttr::simple(),
                    Orientation::TopToBottom,
                    Point::new(width, 40.0),
                ))
            })
            .collect();
        for edge in self.graph.edge_references() {
            let label = format!("{:.1}%", edge.weight().rate * 100.0);
            vg.add_edge(
                Arrow::simple(&label),
                handles[edge.source().index()],
                handles[edge.target().index()],
            );
        }

        let mut svg = SVGWriter::new();
        vg.do_it(false, false, false, &mut svg);
        svg.finalize()
    }

    /// Write `<name>.dot` and `<name>.svg` into `dir`, creating it if needed.
    pub fn write_diagram(&self, dir: &Path) -> Result<Diagram> {
        std::fs::create_dir_all(dir)?;
        let stem = file_stem(&self.name);
        let diagram = Diagram {
            dot: dir.join(format!("{stem}.dot")),
            svg: dir.join(format!("{stem}.svg")),
        };
        std::fs::write(&diagram.dot, self.to_dot())?;
        std::fs::write(&diagram.svg, self.to_svg())?;
        debug!(path = %diagram.svg.display(), nodes = self.node_count(), "path diagram written");
        Ok(diagram)
    }
}

/// Files of one written path diagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagram {
    pub dot: PathBuf,
    pub svg: PathBuf,
}

impl fmt::Display for PathTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "digraph \"{}\" {{", escape(&self.name))?;
        writeln!(f, "    node [shape=box];")?;
        for idx in self.graph.node_indices() {
            let node = &self.graph[idx];
            writeln!(
                f,
                "    n{} [label=\"{} {}\"];",
                idx.index(),
                escape(&node.label),
                node.buyers
            )?;
        }
        for edge in self.graph.edge_references() {
            let weight = edge.weight();
            // the first hop is drawn as a plain split
            let arrow = if weight.level <= 1 { ", arrowhead=none" } else { "" };
            writeln!(
                f,
                "    n{} -> n{} [label=\"{:.1}%\"{}];",
                edge.source().index(),
                edge.target().index(),
                weight.rate * 100.0,
                arrow
            )?;
        }
        writeln!(f, "}}")
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// One buyer reaching a key on their `nth` order.
struct Step {
    user: String,
    nth: i64,
    key: String,
}

struct LineStep {
    user: String,
    nth: i64,
    category: String,
    title: String,
    promo_type: String,
}

/// Groups sorted by buyer count descending, then key.
fn ranked<K: Ord, U: Ord>(groups: BTreeMap<K, BTreeSet<U>>) -> Vec<(K, BTreeSet<U>)> {
    let mut out: Vec<(K, BTreeSet<U>)> = groups.into_iter().collect();
    out.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    out
}

/// Breadth-first expansion: at level k every surviving branch is split by the
/// key its buyers reached on their k-th order.
fn grow(
    tree: &mut PathTree,
    start: Vec<(NodeIndex, BTreeSet<String>)>,
    steps: &[Step],
    max_level: usize,
    first_filter: Option<&dyn Fn(&str) -> bool>,
    first: Pruning,
    rest: Pruning,
) {
    let mut frontier = start;
    for level in 1..=max_level {
        if frontier.is_empty() {
            break;
        }
        let pruning = if level == 1 { first } else { rest };
        let mut next = Vec::new();

        for (parent, buyers) in &frontier {
            let mut groups: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
            for step in steps.iter().filter(|s| s.nth == level as i64) {
                if !buyers.contains(&step.user) {
                    continue;
                }
                if level == 1 && first_filter.is_some_and(|accept| !accept(step.key.as_str())) {
                    continue;
                }
                groups
                    .entry(step.key.as_str())
                    .or_default()
                    .insert(step.user.clone());
            }

            for (key, reached) in ranked(groups) {
                let rate = ratio(reached.len() as f64, buyers.len() as f64);
                if !pruning.keeps(rate, reached.len()) {
                    continue;
                }
                let node = tree.add_branch(*parent, key, reached.len(), rate, level);
                next.push((node, reached));
            }
        }
        frontier = next;
    }
}

/// Purchase-path trees over one order book.
pub struct PathAnalysis {
    orders: Vec<Step>,
    lines: Vec<LineStep>,
}

impl PathAnalysis {
    pub fn new(book: &OrderBook) -> Self {
        let orders = book
            .orders
            .iter()
            .map(|o| Step {
                user: o.user_id.clone(),
                nth: o.nth_order,
                key: o.promo_type.clone(),
            })
            .collect();
        let lines = book
            .joined_lines()
            .into_iter()
            .map(|(o, l)| LineStep {
                user: o.user_id.clone(),
                nth: o.nth_order,
                category: l.category.clone(),
                title: l.display_title().to_string(),
                promo_type: l.promo_type.clone(),
            })
            .collect();
        Self { orders, lines }
    }

    fn first_buyers(&self) -> BTreeSet<String> {
        self.orders
            .iter()
            .filter(|s| s.nth == 1)
            .map(|s| s.user.clone())
            .collect()
    }

    /// First-time buyers split by the promotion type of each successive order.
    pub fn promo_path(&self, max_level: usize, pruning: Pruning) -> PathTree {
        let buyers = self.first_buyers();
        let mut tree = PathTree::new(format!("promo-path-{max_level}"), FIRST_ORDER, buyers.len());
        let root = tree.root;
        grow(
            &mut tree,
            vec![(root, buyers)],
            &self.orders,
            max_level,
            None,
            pruning,
            pruning,
        );
        tree
    }

    /// Buyers of the `nth` order split by line promotion type, then by the
    /// simplified titles they bought. Promotion types are never pruned.
    pub fn promo_entry_products(&self, nth: i64, pruning: Pruning) -> PathTree {
        let mut by_promo: BTreeMap<&str, BTreeMap<&str, BTreeSet<&str>>> = BTreeMap::new();
        let mut buyers: BTreeSet<&str> = BTreeSet::new();
        for line in self.lines.iter().filter(|l| l.nth == nth) {
            buyers.insert(line.user.as_str());
            by_promo
                .entry(line.promo_type.as_str())
                .or_default()
                .entry(line.title.as_str())
                .or_default()
                .insert(line.user.as_str());
        }

        let label = if nth == 1 {
            FIRST_ORDER.to_string()
        } else {
            format!("order #{nth}")
        };
        let mut tree = PathTree::new(format!("entry-products-{nth}"), &label, buyers.len());
        let root = tree.root;

        let promo_groups: BTreeMap<&str, BTreeSet<&str>> = by_promo
            .iter()
            .map(|(promo, titles)| (*promo, titles.values().flatten().copied().collect()))
            .collect();
        for (promo, promo_buyers) in ranked(promo_groups) {
            let rate = ratio(promo_buyers.len() as f64, buyers.len() as f64);
            let promo_node = tree.add_branch(root, promo, promo_buyers.len(), rate, 1);

            let Some(titles) = by_promo.remove(promo) else {
                continue;
            };
            for (title, title_buyers) in ranked(titles) {
                let rate = ratio(title_buyers.len() as f64, promo_buyers.len() as f64);
                if !pruning.keeps(rate, title_buyers.len()) {
                    break;
                }
                tree.add_branch(promo_node, title, title_buyers.len(), rate, 1);
            }
        }
        tree
    }

    /// All first-time buyers split by category at each order; the first level
    /// is limited to `category` when one is given.
    pub fn category_path(&self, category: Option<&str>, max_level: usize, pruning: Pruning) -> PathTree {
        let steps: Vec<Step> = self
            .lines
            .iter()
            .map(|l| Step {
                user: l.user.clone(),
                nth: l.nth,
                key: l.category.clone(),
            })
            .collect();
        let buyers = self.first_buyers();
        let name = format!("category-path-{}", category.unwrap_or("all"));
        let mut tree = PathTree::new(name, ALL_BUYERS, buyers.len());
        let root = tree.root;

        match category {
            Some(category) => {
                let only: &dyn Fn(&str) -> bool = &|key: &str| key == category;
                grow(&mut tree, vec![(root, buyers)], &steps, max_level, Some(only), pruning, pruning);
            }
            None => grow(&mut tree, vec![(root, buyers)], &steps, max_level, None, pruning, pruning),
        }
        tree
    }

    /// Category path for buyers whose first order contains `category`, with
    /// that category broken out into `$<title>` products. The first level
    /// only shows those products.
    pub fn category_product_path(
        &self,
        category: &str,
        first_rate: f64,
        rest_rate: f64,
        min_buyers: usize,
        max_level: usize,
    ) -> PathTree {
        let store = self.first_buyers();
        let cohort: BTreeSet<String> = self
            .lines
            .iter()
            .filter(|l| l.nth == 1 && l.category == category)
            .map(|l| l.user.clone())
            .collect();
        let steps: Vec<Step> = self
            .lines
            .iter()
            .filter(|l| cohort.contains(&l.user))
            .map(|l| Step {
                user: l.user.clone(),
                nth: l.nth,
                key: if l.category == category {
                    format!("{PRODUCT_MARK}{}", l.title)
                } else {
                    l.category.clone()
                },
            })
            .collect();

        let mut tree = PathTree::new(
            format!("category-product-path-{category}"),
            ALL_BUYERS,
            store.len(),
        );
        let root = tree.root;
        let rate = ratio(cohort.len() as f64, store.len() as f64);
        let head = tree.add_branch(root, category, cohort.len(), rate, 0);

        let marked: &dyn Fn(&str) -> bool = &|key: &str| key.starts_with(PRODUCT_MARK);
        grow(
            &mut tree,
            vec![(head, cohort)],
            &steps,
            max_level,
            Some(marked),
            Pruning::new(first_rate, min_buyers),
            Pruning::new(rest_rate, min_buyers),
        );
        tree
    }

    /// Every configured tree.
    pub fn trees(&self, config: &PathConfig) -> Vec<PathTree> {
        let pruning = Pruning::new(config.min_rate, config.min_buyers);
        let mut trees = vec![
            self.promo_path(config.max_level, pruning),
            self.promo_entry_products(
                config.entry_nth_order,
                Pruning::new(config.entry_min_rate, config.entry_min_buyers),
            ),
        ];
        for category in &config.categories {
            trees.push(self.category_path(Some(category), config.max_level, pruning));
        }
        for category in &config.product_categories {
            trees.push(self.category_product_path(
                category,
                config.product_first_rate,
                config.min_rate,
                config.min_buyers,
                config.max_level,
            ));
        }
        trees
    }

    /// Render every configured tree into `dir`.
    pub fn write_all(&self, config: &PathConfig, dir: &Path) -> Result<Vec<Diagram>> {
        let written = self
            .trees(config)
            .iter()
            .map(|tree| tree.write_diagram(dir))
            .collect::<Result<Vec<_>>>()?;
        info!(diagrams = written.len(), dir = %dir.display(), "purchase paths written");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, order};
    use crate::model::Order;

    fn nth(mut o: Order, nth: i64, promo_type: &str) -> Order {
        o.nth_order = nth;
        o.is_rebuy = nth > 1;
        o.promo_type = promo_type.to_string();
        o
    }

    /// u1..u3 start in a big promotion, u4 on an ordinary day;
    /// u1 and u2 come back on an ordinary day.
    fn promo_book() -> OrderBook {
        let orders = vec![
            nth(order("a1", "u1", "2024-06-18 10:00:00", 10.0), 1, "big promotion"),
            nth(order("a2", "u2", "2024-06-18 11:00:00", 10.0), 1, "big promotion"),
            nth(order("a3", "u3", "2024-06-18 12:00:00", 10.0), 1, "big promotion"),
            nth(order("a4", "u4", "2024-06-20 12:00:00", 10.0), 1, "ordinary day"),
            nth(order("b1", "u1", "2024-07-01 10:00:00", 10.0), 2, "ordinary day"),
            nth(order("b2", "u2", "2024-07-02 10:00:00", 10.0), 2, "ordinary day"),
        ];
        let lines = orders
            .iter()
            .map(|o| line(&o.order_id, "p1", "sauce", "RT"))
            .collect();
        OrderBook::new(orders, lines)
    }

    #[test]
    fn test_promo_path_rates() {
        let tree = PathAnalysis::new(&promo_book()).promo_path(3, Pruning::new(0.0, 0));

        assert_eq!(tree.root().buyers, 4);
        let (big, rate) = tree.find(&["big promotion"]).unwrap();
        assert_eq!(big.buyers, 3);
        assert!((rate - 0.75).abs() < 1e-12);

        let (back, rate) = tree.find(&["big promotion", "ordinary day"]).unwrap();
        assert_eq!(back.buyers, 2);
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);

        let (ordinary, _) = tree.find(&["ordinary day"]).unwrap();
        assert_eq!(ordinary.buyers, 1);
        assert!(tree.find(&["ordinary day", "ordinary day"]).is_none());
        assert_eq!(tree.node_count(), 4);
    }

    #[test]
    fn test_branches_need_both_thresholds_strictly() {
        let analysis = PathAnalysis::new(&promo_book());

        // one buyer is not more than one
        let tree = analysis.promo_path(3, Pruning::new(0.0, 1));
        assert!(tree.find(&["ordinary day"]).is_none());
        assert!(tree.find(&["big promotion", "ordinary day"]).is_some());

        // 66.7% does not clear 70%
        let tree = analysis.promo_path(3, Pruning::new(0.7, 0));
        assert!(tree.find(&["big promotion"]).is_some());
        assert!(tree.find(&["big promotion", "ordinary day"]).is_none());

        // a rate equal to the threshold is pruned
        let tree = analysis.promo_path(3, Pruning::new(0.75, 0));
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_max_level_bounds_depth() {
        let tree = PathAnalysis::new(&promo_book()).promo_path(1, Pruning::new(0.0, 0));
        assert!(tree.find(&["big promotion"]).is_some());
        assert!(tree.find(&["big promotion", "ordinary day"]).is_none());
    }

    fn category_book() -> OrderBook {
        let orders = vec![
            order("a1", "u1", "2024-01-01 10:00:00", 10.0),
            order("a2", "u2", "2024-01-01 11:00:00", 10.0),
            order("a3", "u3", "2024-01-01 12:00:00", 10.0),
            order("a4", "u4", "2024-01-01 13:00:00", 10.0),
            nth(order("b1", "u1", "2024-02-01 10:00:00", 10.0), 2, "ordinary day"),
        ];
        let lines = vec![
            line("a1", "pA", "sauce", "RT"),
            line("a2", "pA", "sauce", "RT"),
            line("a3", "pB", "sauce", "RT"),
            line("a4", "pC", "spice", "RT"),
            line("b1", "pC", "spice", "RT"),
        ];
        OrderBook::new(orders, lines)
    }

    #[test]
    fn test_category_path_restricts_first_level() {
        let analysis = PathAnalysis::new(&category_book());

        let tree = analysis.category_path(Some("sauce"), 3, Pruning::new(0.0, 0));
        assert_eq!(tree.root().buyers, 4);
        assert!(tree.find(&["spice"]).is_none());
        let (spice, rate) = tree.find(&["sauce", "spice"]).unwrap();
        assert_eq!(spice.buyers, 1);
        assert!((rate - 1.0 / 3.0).abs() < 1e-12);

        let tree = analysis.category_path(None, 3, Pruning::new(0.0, 0));
        assert_eq!(tree.find(&["spice"]).unwrap().0.buyers, 1);
    }

    #[test]
    fn test_category_product_path_marks_products() {
        let tree = PathAnalysis::new(&category_book()).category_product_path("sauce", 0.0, 0.0, 0, 2);

        let (head, rate) = tree.find(&["sauce"]).unwrap();
        assert_eq!(head.buyers, 3);
        assert!((rate - 0.75).abs() < 1e-12);

        let (product, rate) = tree.find(&["sauce", "$title pA"]).unwrap();
        assert_eq!(product.buyers, 2);
        assert!((rate - 2.0 / 3.0).abs() < 1e-12);

        let (next, rate) = tree.find(&["sauce", "$title pA", "spice"]).unwrap();
        assert_eq!(next.buyers, 1);
        assert!((rate - 0.5).abs() < 1e-12);

        // the first product level uses its own threshold
        let tree = PathAnalysis::new(&category_book()).category_product_path("sauce", 0.5, 0.0, 0, 2);
        assert!(tree.find(&["sauce", "$title pA"]).is_some());
        assert!(tree.find(&["sauce", "$title pB"]).is_none());
    }

    #[test]
    fn test_entry_products_keep_promo_types() {
        let mut book = category_book();
        book.lines[0].promo_type = "live".to_string();
        let tree = PathAnalysis::new(&book).promo_entry_products(1, Pruning::new(0.4, 0));

        assert_eq!(tree.root().label, FIRST_ORDER);
        assert_eq!(tree.root().buyers, 4);
        // promotion types survive any threshold
        let (live, rate) = tree.find(&["live"]).unwrap();
        assert_eq!(live.buyers, 1);
        assert!((rate - 0.25).abs() < 1e-12);
        assert!(tree.find(&["live", "title pA"]).is_some());

        // ordinary day: pA 1/3, pB 1/3, pC 1/3, all under 40%
        let (ordinary, _) = tree.find(&["ordinary day"]).unwrap();
        assert_eq!(ordinary.buyers, 3);
        assert!(tree.find(&["ordinary day", "title pA"]).is_none());
    }

    #[test]
    fn test_dot_rendering() {
        let tree = PathAnalysis::new(&promo_book()).promo_path(3, Pruning::new(0.0, 0));
        let dot = tree.to_dot();

        assert!(dot.starts_with("digraph \"promo-path-3\" {"));
        assert!(dot.contains("[label=\"first order 4\"]"));
        assert!(dot.contains("[label=\"75.0%\", arrowhead=none]"));
        assert!(dot.contains("[label=\"66.7%\"]"));
        assert!(dot.trim_end().ends_with('}'));

        let dir = tempfile::tempdir().unwrap();
        let diagram = tree.write_diagram(&dir.path().join("paths")).unwrap();
        assert_eq!(diagram.dot.file_name().unwrap(), "promo-path-3.dot");
        assert_eq!(std::fs::read_to_string(&diagram.dot).unwrap(), dot);

        assert_eq!(diagram.svg.file_name().unwrap(), "promo-path-3.svg");
        let svg = std::fs::read_to_string(&diagram.svg).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("first order 4"));
    }
}
