//! Buyer segmentation: RFM, CRM comparison and regional category preference.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use polars::prelude::*;
use tracing::info;

use crate::config::RfmThresholds;
use crate::error::Result;
use crate::model::{day_number, OrderBook, DATE_FORMAT};
use crate::pattern::CRM_FLAGS;
use crate::schema::{buyer, line, order};
use crate::table::{ranked_rows, ratio_expr, str_values, RANK};

/// The eight RFM segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RfmSegment {
    KeyValue,
    KeyRetention,
    KeyDevelopment,
    KeyRecovery,
    Potential,
    PromisingNew,
    GeneralMaintenance,
    Lost,
}

impl RfmSegment {
    pub const ALL: [Self; 8] = [
        Self::KeyValue,
        Self::KeyRetention,
        Self::KeyDevelopment,
        Self::KeyRecovery,
        Self::Potential,
        Self::PromisingNew,
        Self::GeneralMaintenance,
        Self::Lost,
    ];

    /// `recent`: recency at or below the threshold; `frequent` and
    /// `valuable`: frequency and monetary above theirs.
    pub fn classify(recent: bool, frequent: bool, valuable: bool) -> Self {
        match (recent, frequent, valuable) {
            (true, true, true) => Self::KeyValue,
            (false, true, true) => Self::KeyRetention,
            (true, false, true) => Self::KeyDevelopment,
            (false, false, true) => Self::KeyRecovery,
            (true, true, false) => Self::Potential,
            (true, false, false) => Self::PromisingNew,
            (false, true, false) => Self::GeneralMaintenance,
            (false, false, false) => Self::Lost,
        }
    }

    /// `(recent, frequent, valuable)` flags of the segment.
    pub fn flags(self) -> (bool, bool, bool) {
        match self {
            Self::KeyValue => (true, true, true),
            Self::KeyRetention => (false, true, true),
            Self::KeyDevelopment => (true, false, true),
            Self::KeyRecovery => (false, false, true),
            Self::Potential => (true, true, false),
            Self::PromisingNew => (true, false, false),
            Self::GeneralMaintenance => (false, true, false),
            Self::Lost => (false, false, false),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::KeyValue => "key value",
            Self::KeyRetention => "key retention",
            Self::KeyDevelopment => "key development",
            Self::KeyRecovery => "key recovery",
            Self::Potential => "potential",
            Self::PromisingNew => "promising new",
            Self::GeneralMaintenance => "general maintenance",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for RfmSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRfm {
    pub user_id: String,
    pub is_crm: String,
    /// Days from the last order to the day after the cutoff.
    pub recency: i64,
    pub frequency: i64,
    pub monetary: f64,
    pub segment: RfmSegment,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedThresholds {
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
}

#[derive(Debug, Clone)]
pub struct RfmResult {
    pub customers: Vec<CustomerRfm>,
    pub thresholds: AppliedThresholds,
    /// Latest order date in the data.
    pub cutoff: NaiveDate,
}

const RECENCY: &str = "recency";
const FREQUENCY: &str = "frequency";
const SEGMENT: &str = "segment";

impl RfmResult {
    /// Buyers per segment and CRM flag with totals and shares; always lists
    /// all eight segments.
    pub fn segment_table(&self) -> Result<DataFrame> {
        let level = |high: bool| if high { "high" } else { "low" };
        let segments = RfmSegment::ALL;
        let grid = ranked_rows(vec![
            Column::new(SEGMENT.into(), segments.map(RfmSegment::label).to_vec()),
            // recent means the recency value is low
            Column::new(RECENCY.into(), segments.map(|s| level(!s.flags().0)).to_vec()),
            Column::new(FREQUENCY.into(), segments.map(|s| level(s.flags().1)).to_vec()),
            Column::new(buyer::MONETARY.into(), segments.map(|s| level(s.flags().2)).to_vec()),
        ])?;

        let groups: Vec<String> = CRM_FLAGS
            .iter()
            .map(|f| f.to_string())
            .chain(std::iter::once("total".to_string()))
            .collect();
        let mut counts: Vec<Expr> = CRM_FLAGS
            .iter()
            .map(|flag| {
                col(order::IS_CRM)
                    .eq(lit(*flag))
                    .sum()
                    .cast(DataType::Int64)
                    .alias(format!("{flag} buyers"))
            })
            .collect();
        counts.push(len().cast(DataType::Int64).alias("total buyers"));
        let per_segment = self
            .customers_frame()?
            .lazy()
            .group_by([col(SEGMENT)])
            .agg(counts);

        let buyers = |g: &String| format!("{g} buyers");
        let share = |g: &String| format!("{g} share");
        let mut columns = vec![
            col(SEGMENT),
            col(RECENCY),
            col(FREQUENCY),
            col(buyer::MONETARY),
        ];
        columns.extend(groups.iter().map(|g| col(buyers(g))));
        columns.extend(groups.iter().map(|g| col(share(g))));

        let df = grid
            .lazy()
            .join(
                per_segment,
                [col(SEGMENT)],
                [col(SEGMENT)],
                JoinArgs::new(JoinType::Left),
            )
            .with_columns(
                groups
                    .iter()
                    .map(|g| col(buyers(g)).fill_null(lit(0i64)))
                    .collect::<Vec<_>>(),
            )
            .with_columns(
                groups
                    .iter()
                    .map(|g| ratio_expr(col(buyers(g)), col(buyers(g)).sum()).alias(share(g)))
                    .collect::<Vec<_>>(),
            )
            .sort([RANK], SortMultipleOptions::default())
            .select(columns)
            .collect()?;
        Ok(df)
    }

    /// One row per buyer, for the per-customer export.
    pub fn customers_frame(&self) -> Result<DataFrame> {
        let c = &self.customers;
        Ok(DataFrame::new(vec![
            Column::new(order::USER_ID.into(), c.iter().map(|x| x.user_id.clone()).collect::<Vec<_>>()),
            Column::new(order::IS_CRM.into(), c.iter().map(|x| x.is_crm.clone()).collect::<Vec<_>>()),
            Column::new(RECENCY.into(), c.iter().map(|x| x.recency).collect::<Vec<_>>()),
            Column::new(FREQUENCY.into(), c.iter().map(|x| x.frequency).collect::<Vec<_>>()),
            Column::new(buyer::MONETARY.into(), c.iter().map(|x| x.monetary).collect::<Vec<_>>()),
            Column::new(SEGMENT.into(), c.iter().map(|x| x.segment.label().to_string()).collect::<Vec<_>>()),
        ])?)
    }

    pub fn export_file_name(&self) -> String {
        format!("rfm-{}.xlsx", self.cutoff.format(DATE_FORMAT))
    }
}

pub struct Segmentation<'a> {
    book: &'a OrderBook,
}

impl<'a> Segmentation<'a> {
    pub fn new(book: &'a OrderBook) -> Self {
        Self { book }
    }

    /// RFM scores and segments of every buyer. Unset thresholds fall back
    /// to the dataset means. `None` for an empty book.
    ///
    /// Recency counts days from the buyer's last order to the day after the
    /// latest order in the book.
    pub fn rfm(&self, overrides: &RfmThresholds) -> Result<Option<RfmResult>> {
        let Some(cutoff) = self.book.latest_date() else {
            return Ok(None);
        };
        let reference = day_number(cutoff) + 1;

        let scored = self
            .book
            .buyers_frame()?
            .lazy()
            .select([
                col(buyer::USER_ID),
                col(buyer::IS_CRM),
                (lit(reference) - col(buyer::LAST_DAY)).alias(RECENCY),
                col(buyer::ORDERS).alias(FREQUENCY),
                col(buyer::MONETARY),
            ])
            .collect()?;
        let means = scored
            .clone()
            .lazy()
            .select([
                col(RECENCY).cast(DataType::Float64).mean(),
                col(FREQUENCY).cast(DataType::Float64).mean(),
                col(buyer::MONETARY).mean(),
            ])
            .collect()?;
        let mean_of = |name: &str| -> Result<f64> {
            Ok(means.column(name)?.f64()?.get(0).unwrap_or(0.0))
        };
        let thresholds = AppliedThresholds {
            recency: match overrides.recency {
                Some(v) => v,
                None => mean_of(RECENCY)?,
            },
            frequency: match overrides.frequency {
                Some(v) => v,
                None => mean_of(FREQUENCY)?,
            },
            monetary: match overrides.monetary {
                Some(v) => v,
                None => mean_of(buyer::MONETARY)?,
            },
        };

        let users = str_values(&scored, buyer::USER_ID)?;
        let flags = str_values(&scored, buyer::IS_CRM)?;
        let recency = scored.column(RECENCY)?.i64()?;
        let frequency = scored.column(FREQUENCY)?.i64()?;
        let monetary = scored.column(buyer::MONETARY)?.f64()?;
        let customers: Vec<CustomerRfm> = users
            .into_iter()
            .zip(flags)
            .zip(recency.into_iter().zip(frequency.into_iter()))
            .zip(monetary.into_iter())
            .map(|(((user, flag), (r, f)), m)| {
                let (recency, frequency, monetary) =
                    (r.unwrap_or_default(), f.unwrap_or_default(), m.unwrap_or_default());
                CustomerRfm {
                    user_id: user.unwrap_or_default(),
                    is_crm: flag.unwrap_or_default(),
                    recency,
                    frequency,
                    monetary,
                    segment: RfmSegment::classify(
                        recency as f64 <= thresholds.recency,
                        frequency as f64 > thresholds.frequency,
                        monetary > thresholds.monetary,
                    ),
                }
            })
            .collect();

        info!(
            buyers = customers.len(),
            recency = thresholds.recency,
            frequency = thresholds.frequency,
            monetary = thresholds.monetary,
            cutoff = %cutoff,
            "RFM segmentation complete"
        );
        Ok(Some(RfmResult {
            customers,
            thresholds,
            cutoff,
        }))
    }

    /// Buyers, orders, orders and value per buyer, and repeat rate per CRM
    /// flag. Buyers are grouped by the flag of their latest order.
    pub fn crm_comparison(&self) -> Result<DataFrame> {
        let per_flag = self
            .book
            .buyers_frame()?
            .lazy()
            .group_by([col(buyer::IS_CRM)])
            .agg([
                len().cast(DataType::Int64).alias("buyers"),
                col(buyer::ORDERS).sum().alias("orders"),
                col(buyer::MONETARY).sum().alias("value"),
                col(buyer::MAX_NTH)
                    .gt(lit(1i64))
                    .sum()
                    .cast(DataType::Int64)
                    .alias("repeat_buyers"),
            ]);

        let df = ranked_rows(vec![Column::new(order::IS_CRM.into(), CRM_FLAGS.to_vec())])?
            .lazy()
            .join(
                per_flag,
                [col(order::IS_CRM)],
                [col(buyer::IS_CRM)],
                JoinArgs::new(JoinType::Left),
            )
            .with_columns([
                col("buyers").fill_null(lit(0i64)),
                col("orders").fill_null(lit(0i64)),
                col("value").fill_null(lit(0.0)),
                col("repeat_buyers").fill_null(lit(0i64)),
            ])
            .with_columns([
                ratio_expr(col("orders"), col("buyers")).alias("orders_per_buyer"),
                ratio_expr(col("value"), col("buyers")).alias("value_per_buyer"),
                ratio_expr(col("repeat_buyers"), col("buyers")).alias("repeat_rate"),
            ])
            .sort([RANK], SortMultipleOptions::default())
            .select([
                col(order::IS_CRM),
                col("buyers"),
                col("orders"),
                col("orders_per_buyer"),
                col("value_per_buyer"),
                col("repeat_rate"),
            ])
            .collect()?;
        Ok(df)
    }

    /// Store-wide order share of each category, and the same share within
    /// every province. An empty `categories` list means all categories.
    pub fn province_category_favor(&self, categories: &[String]) -> Result<(DataFrame, DataFrame)> {
        let wanted: Vec<String> = if categories.is_empty() {
            self.book
                .lines
                .iter()
                .map(|l| l.category.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        } else {
            categories.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
        };
        let total_orders = self.book.orders.len() as f64;

        let wanted_lines = self.book.order_lines_frame()?.filter(
            col(line::CATEGORY).is_in(lit(Series::new("wanted".into(), wanted.clone())), false),
        );
        let store_counts = wanted_lines
            .clone()
            .group_by([col(line::CATEGORY)])
            .agg([col(order::ORDER_ID).n_unique().cast(DataType::Int64).alias("orders")]);
        let store = ranked_rows(vec![Column::new(line::CATEGORY.into(), wanted.clone())])?
            .lazy()
            .join(
                store_counts,
                [col(line::CATEGORY)],
                [col(line::CATEGORY)],
                JoinArgs::new(JoinType::Left),
            )
            .with_column(col("orders").fill_null(lit(0i64)))
            .with_column(ratio_expr(col("orders"), lit(total_orders)).alias("order_share"))
            .sort([RANK], SortMultipleOptions::default())
            .select([col(line::CATEGORY), col("orders"), col("order_share")])
            .collect()?;

        let mut by_province = self
            .book
            .orders_frame()?
            .lazy()
            .filter(col(order::PROVINCE).is_not_null())
            .group_by([col(order::PROVINCE)])
            .agg([len().cast(DataType::Int64).alias("orders")]);
        let mut columns = vec![col(order::PROVINCE)];
        if !wanted.is_empty() {
            let per_category: Vec<Expr> = wanted
                .iter()
                .map(|c| {
                    col(order::ORDER_ID)
                        .filter(col(line::CATEGORY).eq(lit(c.as_str())))
                        .n_unique()
                        .cast(DataType::Int64)
                        .alias(c.as_str())
                })
                .collect();
            let counts = wanted_lines
                .filter(col(order::PROVINCE).is_not_null())
                .group_by([col(order::PROVINCE)])
                .agg(per_category);
            by_province = by_province
                .join(
                    counts,
                    [col(order::PROVINCE)],
                    [col(order::PROVINCE)],
                    JoinArgs::new(JoinType::Left),
                )
                .with_columns(
                    wanted
                        .iter()
                        .map(|c| {
                            ratio_expr(col(c.as_str()).fill_null(lit(0i64)), col("orders"))
                                .alias(c.as_str())
                        })
                        .collect::<Vec<_>>(),
                );
            columns.extend(wanted.iter().map(|c| col(c.as_str())));
        }
        columns.push(col("orders"));

        let province = by_province
            .sort([order::PROVINCE], SortMultipleOptions::default())
            .select(columns)
            .collect()?;
        Ok((store, province))
    }
}
