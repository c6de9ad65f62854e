//! Export ingestion: order filtering, item splitting, title cleaning and
//! product resolution.

use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDateTime;
use polars::prelude::DataFrame;
use regex::Regex;
use tracing::{info, warn};

use crate::catalog::{ProductCatalog, ProductInfo};
use crate::error::{InsightError, Result};
use crate::model::{parse_datetime, parse_f64, parse_i64};
use crate::schema::export;
use crate::table::{optional_str_values, require_columns, str_values};

/// One row of the marketplace export, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOrder {
    pub order_id: String,
    pub order_time: NaiveDateTime,
    pub order_value: f64,
    pub items: String,
    pub goods_type: i64,
    pub goods_num: i64,
    pub user_id: String,
    pub address: String,
}

/// A line whose title resolved to a catalog product with a category.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLine {
    pub order_id: String,
    pub title_origin: String,
    pub product_id: String,
    pub title: String,
    pub title_refined: Option<String>,
    pub channel: String,
    pub category: String,
}

/// Row counts reported at the end of ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub raw_orders: usize,
    /// Rows repeating an order id seen earlier in the same export.
    pub duplicate_orders: usize,
    pub valid_orders: usize,
    pub valid_lines: usize,
    pub usable_lines: usize,
    pub usable_orders: usize,
}

impl IngestStats {
    pub fn match_rate(&self) -> f64 {
        if self.valid_lines == 0 {
            0.0
        } else {
            self.usable_lines as f64 / self.valid_lines as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestedBatch {
    /// Orders that kept at least one usable line.
    pub orders: Vec<RawOrder>,
    pub lines: Vec<ResolvedLine>,
    pub stats: IngestStats,
}

// ── Title cleaning ──────────────────────────────────────────────────────────

const RESERVATION_MARKERS: [&str; 2] = ["1元预定", "1元秒杀"];
const ANCHOR_PREFIXES: [&str; 2] = ["薇娅推荐", "Anchor Recommends"];
const SHIPPING_PREFIXES: [&str; 2] = ["包邮", "Free Shipping"];
const LISTING_PREFIXES: [&str; 6] = [
    "新品",
    "预售",
    "New Arrival",
    "Pre-order",
    "Presale",
    "Flash Sale",
];
const FLASH_SUFFIXES: [&str; 2] = ["秒杀", "Flash Sale"];

/// Strips promotional markup from listing titles.
///
/// Rules apply in a fixed order: the full-width bracket cut always runs,
/// then the first matching rule among square-bracket campaigns, one-yuan
/// reservations, anchor recommendations, live-stream announcements,
/// shipping prefixes and listing prefixes.
pub struct TitleCleaner {
    live_cn: Regex,
    live_en: Regex,
}

impl TitleCleaner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            live_cn: Regex::new(r"直播.+?\s(.+)")?,
            live_en: Regex::new(r"(?i)\blive(?:[- ]?stream)?\s+(?:exclusive|special|only)\s+(.+)")?,
        })
    }

    pub fn clean(&self, raw: &str) -> String {
        let mut title = raw.trim();

        if let Some(pos) = title.rfind('】') {
            let rest = &title[pos + '】'.len_utf8()..];
            if !rest.trim().is_empty() {
                title = rest.trim();
            }
        }

        if let Some(pos) = title.rfind(']') {
            return title[pos + 1..].trim().to_string();
        }
        if RESERVATION_MARKERS.iter().any(|m| title.contains(m)) {
            return title
                .split_whitespace()
                .last()
                .unwrap_or(title)
                .to_string();
        }
        if let Some(rest) = ANCHOR_PREFIXES.iter().find_map(|p| strip_prefix_ci(title, p)) {
            return rest.trim().to_string();
        }
        if let Some(caps) = self
            .live_cn
            .captures(title)
            .or_else(|| self.live_en.captures(title))
        {
            let mut rest = caps.get(1).map_or(title, |m| m.as_str()).trim();
            if let Some(stripped) = FLASH_SUFFIXES.iter().find_map(|s| strip_suffix_ci(rest, s)) {
                rest = stripped.trim_end();
            }
            return rest.to_string();
        }
        if let Some(rest) = SHIPPING_PREFIXES.iter().find_map(|p| strip_prefix_ci(title, p)) {
            return rest
                .trim_start_matches(|c: char| c.is_whitespace() || c == '|')
                .to_string();
        }
        if let Some(rest) = LISTING_PREFIXES.iter().find_map(|p| strip_prefix_ci(title, p)) {
            return rest.trim().to_string();
        }
        title.to_string()
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = s.len().checked_sub(suffix.len())?;
    let tail = s.get(cut..)?;
    tail.eq_ignore_ascii_case(suffix).then(|| &s[..cut])
}

/// Split a multi-item title on the full-width comma (or `;`).
/// "购，" inside bracketed trade-in notes is not a separator.
pub fn split_items(items: &str) -> Vec<String> {
    items
        .replace("购，", "购")
        .split(['，', ';'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Export parsing ──────────────────────────────────────────────────────────

/// Orders kept from one export.
#[derive(Debug, Clone, Default)]
pub struct ExportRows {
    pub orders: Vec<RawOrder>,
    pub raw_orders: usize,
    pub duplicates: usize,
}

/// Parse the export, keep the first row of every order id and drop closed
/// orders.
pub fn read_export(df: &DataFrame) -> Result<ExportRows> {
    require_columns(df, &export::REQUIRED)?;

    let ids = str_values(df, export::ORDER_ID)?;
    let times = str_values(df, export::ORDER_TIME)?;
    let values = str_values(df, export::ORDER_VALUE)?;
    let items = str_values(df, export::ITEMS)?;
    let goods_types = str_values(df, export::GOODS_TYPE)?;
    let goods_nums = str_values(df, export::GOODS_NUM)?;
    let users = str_values(df, export::USER_ID)?;
    let addresses = str_values(df, export::ADDRESS)?;
    let statuses = optional_str_values(df, export::STATUS)?;

    let mut seen: HashSet<&str> = HashSet::new();
    let mut duplicates = 0;
    let mut orders = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let order_id = ids[i]
            .as_deref()
            .ok_or_else(|| InsightError::InvalidData(format!("Null order_id at row {i}")))?;
        if !seen.insert(order_id) {
            duplicates += 1;
            continue;
        }

        let closed = statuses[i]
            .as_deref()
            .is_some_and(|s| export::CLOSED_STATUSES.iter().any(|c| c.eq_ignore_ascii_case(s)));
        if closed {
            continue;
        }

        let order_id = order_id.to_string();
        let order_time = times[i]
            .as_deref()
            .and_then(parse_datetime)
            .ok_or_else(|| {
                InsightError::InvalidData(format!("Bad order_time for order {order_id}"))
            })?;
        let order_value = values[i]
            .as_deref()
            .and_then(parse_f64)
            .ok_or_else(|| {
                InsightError::InvalidData(format!("Bad order_value for order {order_id}"))
            })?;
        let user_id = users[i]
            .clone()
            .ok_or_else(|| InsightError::InvalidData(format!("Null user_id for order {order_id}")))?;
        let item_text = items[i].clone().unwrap_or_default();

        orders.push(RawOrder {
            goods_type: goods_types[i]
                .as_deref()
                .and_then(parse_i64)
                .unwrap_or_else(|| split_items(&item_text).len().max(1) as i64),
            goods_num: goods_nums[i].as_deref().and_then(parse_i64).unwrap_or(1),
            address: addresses[i].clone().unwrap_or_default(),
            items: item_text,
            order_id,
            order_time,
            order_value,
            user_id,
        });
    }
    if duplicates > 0 {
        warn!(duplicates, "repeated order ids in the export were dropped");
    }
    Ok(ExportRows {
        orders,
        raw_orders: df.height(),
        duplicates,
    })
}

/// Split, clean and resolve every order of the export.
pub fn ingest(df: &DataFrame, catalog: &ProductCatalog) -> Result<IngestedBatch> {
    let cleaner = TitleCleaner::new()?;
    let ExportRows {
        orders,
        raw_orders,
        duplicates,
    } = read_export(df)?;

    let mut stats = IngestStats {
        raw_orders,
        duplicate_orders: duplicates,
        valid_orders: orders.len(),
        ..Default::default()
    };

    let mut lines = Vec::new();
    for order in &orders {
        for title_origin in split_items(&order.items) {
            stats.valid_lines += 1;
            let title_clean = cleaner.clean(&title_origin);
            let Some(product) = catalog.resolve(&title_clean, &title_origin) else {
                continue;
            };
            if let Some(line) = resolved_line(order, title_origin, product, catalog) {
                lines.push(line);
            }
        }
    }
    stats.usable_lines = lines.len();

    let usable: BTreeSet<&str> = lines.iter().map(|l| l.order_id.as_str()).collect();
    let orders: Vec<RawOrder> = orders
        .into_iter()
        .filter(|o| usable.contains(o.order_id.as_str()))
        .collect();
    stats.usable_orders = orders.len();

    info!(
        match_rate = format!("{:.1}%", stats.match_rate() * 100.0),
        usable_lines = stats.usable_lines,
        valid_lines = stats.valid_lines,
        "product matching complete"
    );
    if stats.usable_lines < stats.valid_lines {
        warn!(
            unmatched = stats.valid_lines - stats.usable_lines,
            "lines without a catalog product or category were dropped"
        );
    }

    Ok(IngestedBatch {
        orders,
        lines,
        stats,
    })
}

fn resolved_line(
    order: &RawOrder,
    title_origin: String,
    product: &ProductInfo,
    catalog: &ProductCatalog,
) -> Option<ResolvedLine> {
    let category = product.category.clone()?;
    Some(ResolvedLine {
        order_id: order.order_id.clone(),
        title_origin,
        product_id: product.product_id.clone(),
        title: product.title.clone(),
        title_refined: catalog.refined_title(&product.product_id).map(str::to_string),
        channel: product.channel.clone().unwrap_or_default(),
        category,
    })
}
