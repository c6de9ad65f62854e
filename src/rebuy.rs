//! Repeat-purchase metrics, repeat-interval distribution and promotion
//! outbreak coefficients.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use tracing::{debug, warn};

use crate::catalog::PromotionCalendar;
use crate::config::FocusProduct;
use crate::error::Result;
use crate::model::{parse_date, OrderBook, DATE_FORMAT};
use crate::schema::{derived, line, order};
use crate::table::{ratio_expr, str_values};

/// Grouping dimension for repeat-purchase tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RebuyField {
    Category,
    Product,
    Channel,
    Province,
    Tier,
}

impl RebuyField {
    pub fn column(self) -> &'static str {
        match self {
            Self::Category => line::CATEGORY,
            Self::Product => line::PRODUCT_ID,
            Self::Channel => line::CHANNEL,
            Self::Province => order::PROVINCE,
            Self::Tier => order::TIER,
        }
    }

    /// Line-level fields also report cross-item repeat buyers.
    pub fn is_line_level(self) -> bool {
        matches!(self, Self::Category | Self::Product | Self::Channel)
    }
}

impl fmt::Display for RebuyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Repeat-interval bins in days, right-closed: 0, (0, 7], (7, 15] … (365, ∞).
pub const INTERVAL_BINS: [(&str, i64); 9] = [
    ("0", 0),
    ("1-7", 7),
    ("7-15", 15),
    ("15-30", 30),
    ("30-60", 60),
    ("60-90", 90),
    ("90-180", 180),
    ("180-365", 365),
    ("365+", i64::MAX),
];

/// Outbreak coefficient tables: per promotion type and per promotion window.
#[derive(Debug, Clone)]
pub struct OutbreakTables {
    pub by_type: DataFrame,
    pub by_promotion: DataFrame,
}

impl OutbreakTables {
    pub fn is_empty(&self) -> bool {
        self.by_promotion.height() == 0
    }
}

fn interval_bin_expr() -> Expr {
    let (last, _) = INTERVAL_BINS[INTERVAL_BINS.len() - 1];
    let chain = INTERVAL_BINS[..INTERVAL_BINS.len() - 1]
        .iter()
        .rev()
        .fold(lit(last), |otherwise, (label, upper)| {
            when(col(derived::INTERVAL).lt_eq(lit(*upper)))
                .then(lit(*label))
                .otherwise(otherwise)
        });
    when(col(derived::INTERVAL).is_null())
        .then(lit(NULL).cast(DataType::String))
        .otherwise(chain)
}

pub struct RebuyAnalysis<'a> {
    book: &'a OrderBook,
}

impl<'a> RebuyAnalysis<'a> {
    pub fn new(book: &'a OrderBook) -> Self {
        Self { book }
    }

    /// Distinct (group value, order) rows, with the days since the buyer's
    /// previous order in the same group and whether this is the buyer's
    /// first order in it.
    fn group_orders(&self, field: RebuyField) -> Result<LazyFrame> {
        let key = field.column();
        let base = if field.is_line_level() {
            self.book
                .order_lines_frame()?
                .group_by([col(key), col(order::ORDER_ID)])
                .agg([
                    col(order::USER_ID).first(),
                    col(order::ORDER_TIME).first(),
                    col(order::ORDER_VALUE).first(),
                    col(derived::DAY).first(),
                ])
        } else {
            self.book.dated_orders_frame()?.lazy().select([
                col(key),
                col(order::ORDER_ID),
                col(order::USER_ID),
                col(order::ORDER_TIME),
                col(order::ORDER_VALUE),
                col(derived::DAY),
            ])
        };

        let buyer_in_group = [col(key), col(order::USER_ID)];
        Ok(base
            .filter(col(key).is_not_null().and(col(key).neq(lit(""))))
            .sort(
                [key, order::USER_ID, order::ORDER_TIME, order::ORDER_ID],
                SortMultipleOptions::default(),
            )
            .with_columns([
                (col(derived::DAY) - col(derived::DAY).shift(lit(1)).over(buyer_in_group.clone()))
                    .alias(derived::INTERVAL),
                col(order::ORDER_ID)
                    .first()
                    .over(buyer_in_group)
                    .eq(col(order::ORDER_ID))
                    .alias(derived::FIRST_IN_GROUP),
            ]))
    }

    /// Whether each order is followed by another order of the same buyer.
    fn next_orders(&self) -> Result<LazyFrame> {
        Ok(self
            .book
            .orders_frame()?
            .lazy()
            .sort(
                [order::USER_ID, order::ORDER_TIME, order::ORDER_ID],
                SortMultipleOptions::default(),
            )
            .select([
                col(order::ORDER_ID),
                col(order::ORDER_ID)
                    .shift(lit(-1))
                    .over([col(order::USER_ID)])
                    .is_not_null()
                    .alias(derived::HAS_NEXT),
            ]))
    }

    /// Buyers with at least one resolved line.
    fn store_buyers(&self) -> Result<f64> {
        let df = self
            .book
            .order_lines_frame()?
            .select([col(order::USER_ID).n_unique().cast(DataType::Float64).alias("buyers")])
            .collect()?;
        Ok(df.column("buyers")?.f64()?.get(0).unwrap_or(0.0))
    }

    /// Title, channel and category of every product, from its first line.
    fn product_info(&self) -> Result<LazyFrame> {
        Ok(self
            .book
            .lines_frame()?
            .lazy()
            .group_by([col(line::PRODUCT_ID)])
            .agg([
                col(line::TITLE).first(),
                col(line::CHANNEL).first(),
                col(line::CATEGORY).first(),
            ]))
    }

    /// Per-group repeat metrics, sorted by order count descending.
    ///
    /// Repeat buyers have a later order in the same group; cross-item repeat
    /// buyers (line-level fields only) have any later order after their first
    /// order in the group.
    pub fn rebuy_by(&self, field: RebuyField) -> Result<DataFrame> {
        let key = field.column();
        let store_buyers = self.store_buyers()?;

        let mut grouped = self.group_orders(field)?;
        let mut aggs = vec![
            len().cast(DataType::Int64).alias("orders"),
            col(order::ORDER_VALUE).mean().alias("aov"),
            col(order::USER_ID).n_unique().cast(DataType::Int64).alias("buyers"),
            col(order::USER_ID)
                .filter(col(derived::INTERVAL).is_not_null())
                .n_unique()
                .cast(DataType::Int64)
                .alias("repeat_buyers"),
            col(derived::INTERVAL)
                .cast(DataType::Float64)
                .median()
                .alias("median_interval"),
        ];
        if field.is_line_level() {
            grouped = grouped.join(
                self.next_orders()?,
                [col(order::ORDER_ID)],
                [col(order::ORDER_ID)],
                JoinArgs::new(JoinType::Left),
            );
            aggs.push(
                col(order::USER_ID)
                    .filter(col(derived::FIRST_IN_GROUP).and(col(derived::HAS_NEXT)))
                    .n_unique()
                    .cast(DataType::Int64)
                    .alias("cross_repeat_buyers"),
            );
        }

        let mut table = grouped.group_by([col(key)]).agg(aggs).with_columns([
            ratio_expr(col("buyers"), lit(store_buyers)).alias("buyer_share"),
            ratio_expr(col("repeat_buyers"), col("buyers")).alias("repeat_rate"),
        ]);

        let mut columns = vec![col(key)];
        if field == RebuyField::Product {
            table = table.join(
                self.product_info()?,
                [col(line::PRODUCT_ID)],
                [col(line::PRODUCT_ID)],
                JoinArgs::new(JoinType::Left),
            );
            columns.extend([col(line::TITLE), col(line::CHANNEL), col(line::CATEGORY)]);
        }
        columns.extend(
            [
                "orders",
                "aov",
                "buyers",
                "buyer_share",
                "repeat_buyers",
                "repeat_rate",
                "median_interval",
            ]
            .map(col),
        );
        if field.is_line_level() {
            table = table.with_column(
                ratio_expr(col("cross_repeat_buyers"), col("buyers")).alias("cross_repeat_rate"),
            );
            columns.extend([col("cross_repeat_buyers"), col("cross_repeat_rate")]);
        }

        let df = table
            .sort(
                ["orders", key],
                SortMultipleOptions::default().with_order_descending_multi([true, false]),
            )
            .select(columns)
            .collect()?;
        debug!(field = %field, groups = df.height(), "repeat metrics computed");
        Ok(df)
    }

    /// Share of repeat intervals per bin for every category, plus the count.
    pub fn interval_distribution(&self) -> Result<DataFrame> {
        let mut counts: Vec<Expr> = INTERVAL_BINS
            .iter()
            .map(|(label, _)| {
                col(derived::BIN)
                    .eq(lit(*label))
                    .sum()
                    .cast(DataType::Int64)
                    .alias(*label)
            })
            .collect();
        counts.push(col(derived::INTERVAL).count().cast(DataType::Int64).alias("intervals"));
        let shares: Vec<Expr> = INTERVAL_BINS
            .iter()
            .map(|(label, _)| ratio_expr(col(*label), col("intervals")).alias(*label))
            .collect();

        let df = self
            .group_orders(RebuyField::Category)?
            .with_column(interval_bin_expr().alias(derived::BIN))
            .group_by([col(line::CATEGORY)])
            .agg(counts)
            .with_columns(shares)
            .sort([line::CATEGORY], SortMultipleOptions::default())
            .collect()?;
        Ok(df)
    }

    /// Daily distinct order counts, optionally restricted to one product.
    fn daily_orders(&self, product_id: Option<&str>) -> Result<BTreeMap<NaiveDate, i64>> {
        let frame = match product_id {
            Some(pid) => self
                .book
                .order_lines_frame()?
                .filter(col(line::PRODUCT_ID).eq(lit(pid))),
            None => self.book.orders_frame()?.lazy(),
        };
        let df = frame
            .group_by([col(order::DT)])
            .agg([col(order::ORDER_ID).n_unique().cast(DataType::Int64).alias("orders")])
            .collect()?;

        let days = str_values(&df, order::DT)?;
        let counts = df.column("orders")?.i64()?;
        Ok(days
            .into_iter()
            .zip(counts.into_iter())
            .filter_map(|(day, n)| Some((parse_date(day.as_deref()?)?, n?)))
            .collect())
    }

    /// Promotion-window daily mean over the mean of the `n_days` before it.
    ///
    /// Computed for the whole store and each focus product; returns empty
    /// tables when fewer than `n_days` distinct order dates exist.
    pub fn outbreak_coefficients(
        &self,
        calendar: &PromotionCalendar,
        n_days: usize,
        focus: &[FocusProduct],
    ) -> Result<OutbreakTables> {
        let store = self.daily_orders(None)?;
        let (Some((&first, _)), Some((&last, _))) =
            (store.first_key_value(), store.last_key_value())
        else {
            return empty_outbreak(focus);
        };
        if n_days == 0 || store.len() < n_days {
            warn!(
                dates = store.len(),
                n_days, "too few order dates for outbreak coefficients"
            );
            return empty_outbreak(focus);
        }

        let mut subjects: Vec<(String, BTreeMap<NaiveDate, i64>)> = vec![("store".to_string(), store)];
        for f in focus {
            subjects.push((f.label.clone(), self.daily_orders(Some(&f.product_id))?));
        }

        let mut windows: Vec<_> = calendar.windows().iter().collect();
        windows.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.promotion.cmp(&b.promotion)));

        let mut names = Vec::new();
        let mut types = Vec::new();
        let mut starts = Vec::new();
        let mut days = Vec::new();
        let mut coefficients: Vec<Vec<Option<f64>>> = vec![Vec::new(); subjects.len()];
        for w in windows {
            names.push(w.promotion.clone());
            types.push(w.promo_type.clone());
            starts.push(w.start.format(DATE_FORMAT).to_string());
            days.push(w.days());
            for (slot, (_, daily)) in coefficients.iter_mut().zip(&subjects) {
                slot.push(coefficient(daily, w.start, w.end, n_days, first, last));
            }
        }

        let mut columns = vec![
            Column::new("promotion".into(), names),
            Column::new("promo_type".into(), types),
            Column::new("start_date".into(), starts),
            Column::new("days".into(), days),
        ];
        for ((label, _), values) in subjects.iter().zip(coefficients) {
            columns.push(Column::new(label.as_str().into(), values));
        }
        let by_promotion = DataFrame::new(columns)?;

        let by_type = by_promotion
            .clone()
            .lazy()
            .group_by([col("promo_type")])
            .agg(
                subjects
                    .iter()
                    .map(|(label, _)| col(label.as_str()).mean())
                    .collect::<Vec<_>>(),
            )
            .sort(["promo_type"], SortMultipleOptions::default())
            .collect()?;

        Ok(OutbreakTables {
            by_type,
            by_promotion,
        })
    }
}

/// Mean daily orders over `[start, end]` divided by the mean of the
/// `n_days` before `start`; days without orders count as zero. `None` when
/// either span falls outside the observed dates or the baseline is zero.
fn coefficient(
    daily: &BTreeMap<NaiveDate, i64>,
    start: NaiveDate,
    end: NaiveDate,
    n_days: usize,
    first: NaiveDate,
    last: NaiveDate,
) -> Option<f64> {
    let before = start - Duration::days(n_days as i64);
    if before < first || start > last || end < start {
        return None;
    }
    let sum_range = |from: NaiveDate, to: NaiveDate| -> i64 {
        daily.range(from..=to).map(|(_, n)| *n).sum()
    };

    let baseline = sum_range(before, start - Duration::days(1)) as f64 / n_days as f64;
    let end = end.min(last);
    let span = (end - start).num_days() + 1;
    let during = sum_range(start, end) as f64 / span as f64;
    (baseline > 0.0).then(|| during / baseline)
}

fn empty_outbreak(focus: &[FocusProduct]) -> Result<OutbreakTables> {
    let mut by_type = vec![Column::new("promo_type".into(), Vec::<String>::new())];
    let mut by_promotion = vec![
        Column::new("promotion".into(), Vec::<String>::new()),
        Column::new("promo_type".into(), Vec::<String>::new()),
        Column::new("start_date".into(), Vec::<String>::new()),
        Column::new("days".into(), Vec::<i64>::new()),
    ];
    for label in std::iter::once("store").chain(focus.iter().map(|f| f.label.as_str())) {
        by_type.push(Column::new(label.into(), Vec::<f64>::new()));
        by_promotion.push(Column::new(label.into(), Vec::<f64>::new()));
    }
    Ok(OutbreakTables {
        by_type: DataFrame::new(by_type)?,
        by_promotion: DataFrame::new(by_promotion)?,
    })
}
