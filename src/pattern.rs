//! Order time and value distributions, channel sales and buyer order counts.

use std::collections::BTreeSet;

use polars::prelude::*;

use crate::error::Result;
use crate::model::{OrderBook, DATE_FORMAT};
use crate::schema::{buyer, derived, line, order, sentinel};
use crate::table::{ranked_rows, ratio_expr, str_values, RANK};

/// Order value bin edges, left-closed.
pub const VALUE_BINS: [f64; 11] = [
    0.0, 18.0, 28.0, 39.0, 50.0, 60.0, 80.0, 100.0, 130.0, 200.0, 20000.0,
];

pub const CRM_FLAGS: [&str; 2] = [sentinel::CRM, sentinel::NON_CRM];

/// All order-pattern tables of one run.
#[derive(Debug, Clone)]
pub struct PatternTables {
    pub monthly: DataFrame,
    pub weekday: DataFrame,
    pub daily: DataFrame,
    pub value_by_month: DataFrame,
    pub value_by_crm: DataFrame,
    pub channel_sales: DataFrame,
    pub channel_index: DataFrame,
    pub channel_audience: DataFrame,
    pub order_counts: DataFrame,
    pub nth_orders: DataFrame,
}

pub fn analyze(book: &OrderBook) -> Result<PatternTables> {
    Ok(PatternTables {
        monthly: monthly_summary(book)?,
        weekday: weekday_pattern(book)?,
        daily: daily_sales(book)?,
        value_by_month: value_by_month(book)?,
        value_by_crm: value_by_crm(book)?,
        channel_sales: channel_sales(book)?,
        channel_index: channel_monthly_index(book)?,
        channel_audience: channel_audience(book)?,
        order_counts: order_count_distribution(book)?,
        nth_orders: nth_order_table(book)?,
    })
}

/// Orders, GMV, AOV and items per order by month.
pub fn monthly_summary(book: &OrderBook) -> Result<DataFrame> {
    let df = book
        .orders_frame()?
        .lazy()
        .group_by([col(order::MONTH)])
        .agg([
            col(order::ORDER_ID).count().cast(DataType::Int64).alias("orders"),
            col(order::ORDER_VALUE).sum().alias("gmv"),
            col(order::ORDER_VALUE).mean().alias("aov"),
            col(order::GOODS_NUM)
                .cast(DataType::Float64)
                .mean()
                .alias("items_per_order"),
        ])
        .sort([order::MONTH], SortMultipleOptions::default())
        .collect()?;
    Ok(df)
}

/// GMV and order count per calendar day.
pub fn daily_sales(book: &OrderBook) -> Result<DataFrame> {
    let df = book
        .orders_frame()?
        .lazy()
        .group_by([col(order::DT)])
        .agg([
            col(order::ORDER_VALUE).sum().alias("gmv"),
            col(order::ORDER_ID).count().cast(DataType::Int64).alias("orders"),
        ])
        .sort([order::DT], SortMultipleOptions::default())
        .collect()?;
    Ok(df)
}

/// Day-of-week profile of ordinary (non-promotion) days, split by CRM flag.
pub fn weekday_pattern(book: &OrderBook) -> Result<DataFrame> {
    let per_day = book
        .orders_frame()?
        .lazy()
        .filter(col(order::PROMO_TYPE).eq(lit(sentinel::ORDINARY_DAY)))
        .group_by([col(order::IS_CRM), col(order::DAY_OF_WEEK)])
        .agg([
            col(order::DT).n_unique().cast(DataType::Int64).alias("dates"),
            len().cast(DataType::Int64).alias("orders"),
            col(order::ORDER_VALUE).sum().alias("gmv"),
        ]);

    let (flags, dows): (Vec<&str>, Vec<i64>) = CRM_FLAGS
        .iter()
        .flat_map(|flag| (1..=7i64).map(move |dow| (*flag, dow)))
        .unzip();
    let df = ranked_rows(vec![
        Column::new(order::IS_CRM.into(), flags),
        Column::new(order::DAY_OF_WEEK.into(), dows),
    ])?
    .lazy()
    .join(
        per_day,
        [col(order::IS_CRM), col(order::DAY_OF_WEEK)],
        [col(order::IS_CRM), col(order::DAY_OF_WEEK)],
        JoinArgs::new(JoinType::Left),
    )
    .with_columns([
        col("dates").fill_null(lit(0i64)),
        col("orders").fill_null(lit(0i64)),
        col("gmv").fill_null(lit(0.0)),
    ])
    .with_columns([
        ratio_expr(col("orders"), col("dates")).alias("orders_per_day"),
        ratio_expr(col("gmv"), col("dates")).alias("gmv_per_day"),
    ])
    .sort([RANK], SortMultipleOptions::default())
    .select([
        col(order::IS_CRM),
        col(order::DAY_OF_WEEK),
        col("dates"),
        col("orders"),
        col("gmv"),
        col("orders_per_day"),
        col("gmv_per_day"),
    ])
    .collect()?;
    Ok(df)
}

pub fn value_bin_label(index: usize) -> String {
    format!("[{}, {})", VALUE_BINS[index], VALUE_BINS[index + 1])
}

fn bin_labels() -> Vec<String> {
    (0..VALUE_BINS.len() - 1).map(value_bin_label).collect()
}

/// Label of the left-closed bin holding the order value; null outside the
/// bin range.
pub fn value_bin_expr() -> Expr {
    VALUE_BINS
        .windows(2)
        .enumerate()
        .rev()
        .fold(lit(NULL).cast(DataType::String), |otherwise, (i, w)| {
            let value = col(order::ORDER_VALUE);
            when(value.clone().gt_eq(lit(w[0])).and(value.lt(lit(w[1]))))
                .then(lit(value_bin_label(i)))
                .otherwise(otherwise)
        })
}

/// One row per value bin, in bin order, joined with `counts` (keyed by
/// [`derived::BIN`]); missing counts become zero.
fn per_value_bin(counts: LazyFrame, count_columns: &[String]) -> Result<LazyFrame> {
    Ok(
        ranked_rows(vec![Column::new("order_value_bin".into(), bin_labels())])?
            .lazy()
            .join(
                counts,
                [col("order_value_bin")],
                [col(derived::BIN)],
                JoinArgs::new(JoinType::Left),
            )
            .with_columns(
                count_columns
                    .iter()
                    .map(|c| col(c.as_str()).fill_null(lit(0i64)))
                    .collect::<Vec<_>>(),
            )
            .sort([RANK], SortMultipleOptions::default()),
    )
}

fn binned_orders(book: &OrderBook) -> Result<LazyFrame> {
    Ok(book
        .orders_frame()?
        .lazy()
        .with_column(value_bin_expr().alias(derived::BIN))
        .filter(col(derived::BIN).is_not_null()))
}

/// Order counts per value bin, one column per month plus a total.
pub fn value_by_month(book: &OrderBook) -> Result<DataFrame> {
    let months: Vec<String> = book
        .orders
        .iter()
        .map(|o| o.month)
        .collect::<BTreeSet<_>>()
        .iter()
        .map(|m| m.format(DATE_FORMAT).to_string())
        .collect();

    let mut aggs: Vec<Expr> = months
        .iter()
        .map(|m| {
            col(order::MONTH)
                .eq(lit(m.as_str()))
                .sum()
                .cast(DataType::Int64)
                .alias(m.as_str())
        })
        .collect();
    aggs.push(len().cast(DataType::Int64).alias("total"));
    let counts = binned_orders(book)?.group_by([col(derived::BIN)]).agg(aggs);

    let mut count_columns = months.clone();
    count_columns.push("total".to_string());
    let mut columns = vec![col("order_value_bin")];
    columns.extend(count_columns.iter().map(|c| col(c.as_str())));
    let df = per_value_bin(counts, &count_columns)?
        .select(columns)
        .collect()?;
    Ok(df)
}

/// Order counts and shares per value bin for CRM and non-CRM buyers.
pub fn value_by_crm(book: &OrderBook) -> Result<DataFrame> {
    let orders = |flag: &str| format!("{flag} orders");
    let share = |flag: &str| format!("{flag} share");
    let counts = binned_orders(book)?.group_by([col(derived::BIN)]).agg(
        CRM_FLAGS
            .iter()
            .map(|flag| {
                col(order::IS_CRM)
                    .eq(lit(*flag))
                    .sum()
                    .cast(DataType::Int64)
                    .alias(orders(flag))
            })
            .collect::<Vec<_>>(),
    );

    let count_columns: Vec<String> = CRM_FLAGS.iter().map(|f| orders(f)).collect();
    let mut columns = vec![col("order_value_bin")];
    for flag in CRM_FLAGS {
        columns.extend([col(orders(flag)), col(share(flag))]);
    }
    let df = per_value_bin(counts, &count_columns)?
        .with_columns(
            CRM_FLAGS
                .iter()
                .map(|flag| ratio_expr(col(orders(flag)), col(orders(flag)).sum()).alias(share(flag)))
                .collect::<Vec<_>>(),
        )
        .select(columns)
        .collect()?;
    Ok(df)
}

/// Orders whose lines all share one channel, with that channel.
fn single_channel_orders(book: &OrderBook) -> Result<LazyFrame> {
    let channel_of = book
        .lines_frame()?
        .lazy()
        .group_by([col(line::ORDER_ID)])
        .agg([col(line::CHANNEL).first()]);
    Ok(book
        .orders_frame()?
        .lazy()
        .filter(col(order::CHANNEL_NUM).eq(lit(1i64)))
        .join(
            channel_of,
            [col(order::ORDER_ID)],
            [col(line::ORDER_ID)],
            JoinArgs::new(JoinType::Inner),
        ))
}

/// Sales of single-channel orders per channel.
pub fn channel_sales(book: &OrderBook) -> Result<DataFrame> {
    let df = single_channel_orders(book)?
        .group_by([col(line::CHANNEL)])
        .agg([
            len().cast(DataType::Int64).alias("orders"),
            col(order::ORDER_VALUE).sum().alias("gmv"),
            col(order::GOODS_NUM).sum().alias("items"),
        ])
        .with_columns([
            ratio_expr(col("orders"), col("orders").sum()).alias("order_share"),
            ratio_expr(col("gmv"), col("gmv").sum()).alias("gmv_share"),
            ratio_expr(col("items"), col("orders")).alias("items_per_order"),
            ratio_expr(col("gmv"), col("orders")).alias("aov"),
        ])
        .sort([line::CHANNEL], SortMultipleOptions::default())
        .select([
            col(line::CHANNEL),
            col("orders"),
            col("order_share"),
            col("gmv"),
            col("gmv_share"),
            col("items_per_order"),
            col("aov"),
        ])
        .collect()?;
    Ok(df)
}

/// Sorted distinct values of a string column.
fn distinct(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    Ok(str_values(df, name)?
        .into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect())
}

/// Monthly GMV per channel and an index against the first month (= 100).
pub fn channel_monthly_index(book: &OrderBook) -> Result<DataFrame> {
    let monthly = single_channel_orders(book)?
        .group_by([col(line::CHANNEL), col(order::MONTH)])
        .agg([col(order::ORDER_VALUE).sum().alias("gmv")])
        .collect()?;
    let months = distinct(&monthly, order::MONTH)?;
    let channels = distinct(&monthly, line::CHANNEL)?;

    let mut table = DataFrame::new(vec![Column::new(order::MONTH.into(), months)])?.lazy();
    let mut columns = vec![col(order::MONTH)];
    for channel in &channels {
        let gmv = format!("{channel} gmv");
        let index = format!("{channel} index");
        let series = monthly
            .clone()
            .lazy()
            .filter(col(line::CHANNEL).eq(lit(channel.as_str())))
            .select([col(order::MONTH), col("gmv").alias(gmv.as_str())]);
        let base = col(gmv.as_str()).first();
        table = table
            .join(
                series,
                [col(order::MONTH)],
                [col(order::MONTH)],
                JoinArgs::new(JoinType::Left),
            )
            .sort([order::MONTH], SortMultipleOptions::default())
            .with_column(
                when(base.clone().is_null().or(base.clone().eq(lit(0.0))))
                    .then(lit(NULL).cast(DataType::Float64))
                    .otherwise(col(gmv.as_str()) / base * lit(100.0))
                    .alias(index.as_str()),
            );
        columns.extend([col(gmv.as_str()), col(index.as_str())]);
    }
    let df = table
        .sort([order::MONTH], SortMultipleOptions::default())
        .select(columns)
        .collect()?;
    Ok(df)
}

/// Cumulative buyers per month by the set of channels they have bought from:
/// one column per single-channel audience plus the cross-channel audience.
/// Every month of the book has a row, even one that brought no new buyer.
pub fn channel_audience(book: &OrderBook) -> Result<DataFrame> {
    let first_seen = book
        .order_lines_frame()?
        .filter(col(line::CHANNEL).neq(lit("")))
        .group_by([col(order::USER_ID), col(line::CHANNEL)])
        .agg([col(order::MONTH).sort(SortOptions::default()).first()])
        .collect()?;
    let channels = distinct(&first_seen, line::CHANNEL)?;
    let months: Vec<String> = book
        .orders
        .iter()
        .map(|o| o.month)
        .collect::<BTreeSet<_>>()
        .iter()
        .map(|m| m.format(DATE_FORMAT).to_string())
        .collect();

    let buyers = |c: &str| format!("{c} buyers");
    let share = |c: &str| format!("{c} share");
    let mut counts: Vec<Expr> = channels
        .iter()
        .map(|c| {
            col("n")
                .eq(lit(1i64))
                .and(col("only").eq(lit(c.as_str())))
                .sum()
                .cast(DataType::Int64)
                .alias(buyers(c))
        })
        .collect();
    counts.push(col("n").gt(lit(1i64)).sum().cast(DataType::Int64).alias("cross buyers"));
    counts.push(len().cast(DataType::Int64).alias("buyers"));

    let mut rows: Option<DataFrame> = None;
    for month in &months {
        let mut select = vec![lit(month.as_str()).alias(order::MONTH)];
        select.extend(counts.iter().cloned());
        let row = first_seen
            .clone()
            .lazy()
            .filter(col(order::MONTH).lt_eq(lit(month.as_str())))
            .group_by([col(order::USER_ID)])
            .agg([
                col(line::CHANNEL).n_unique().cast(DataType::Int64).alias("n"),
                col(line::CHANNEL).first().alias("only"),
            ])
            .select(select)
            .collect()?;
        match rows.as_mut() {
            Some(df) => {
                df.vstack_mut(&row)?;
            }
            None => rows = Some(row),
        }
    }
    let rows = match rows {
        Some(df) => df,
        None => DataFrame::new(vec![
            Column::new(order::MONTH.into(), Vec::<String>::new()),
            Column::new("cross buyers".into(), Vec::<i64>::new()),
            Column::new("buyers".into(), Vec::<i64>::new()),
        ])?,
    };

    let mut shares: Vec<Expr> = channels
        .iter()
        .map(|c| ratio_expr(col(buyers(c)), col("buyers")).alias(share(c)))
        .collect();
    shares.push(ratio_expr(col("cross buyers"), col("buyers")).alias("cross share"));
    let mut columns = vec![col(order::MONTH)];
    for c in &channels {
        columns.extend([col(buyers(c)), col(share(c))]);
    }
    columns.extend([col("cross buyers"), col("cross share"), col("buyers")]);

    let df = rows.lazy().with_columns(shares).select(columns).collect()?;
    Ok(df)
}

const COUNT_BUCKETS: [&str; 7] = ["1", "2", "3", "4", "5", "6", "7+"];

/// Bucket label of an order count or order index: "1".."6", "7+".
pub fn count_bucket_expr(n: Expr) -> Expr {
    COUNT_BUCKETS[..COUNT_BUCKETS.len() - 1]
        .iter()
        .enumerate()
        .rev()
        .fold(lit(COUNT_BUCKETS[COUNT_BUCKETS.len() - 1]), |otherwise, (i, label)| {
            when(n.clone().lt_eq(lit(i as i64 + 1)))
                .then(lit(*label))
                .otherwise(otherwise)
        })
}

/// Buyers per cumulative order count, by CRM flag, with shares. A buyer
/// counts under the flag of their latest order.
pub fn order_count_distribution(book: &OrderBook) -> Result<DataFrame> {
    let groups: Vec<String> = CRM_FLAGS
        .iter()
        .map(|f| f.to_string())
        .chain(std::iter::once("total".to_string()))
        .collect();
    let buyers = |g: &String| format!("{g} buyers");
    let share = |g: &String| format!("{g} share");

    let mut aggs: Vec<Expr> = CRM_FLAGS
        .iter()
        .map(|flag| {
            col(buyer::IS_CRM)
                .eq(lit(*flag))
                .sum()
                .cast(DataType::Int64)
                .alias(format!("{flag} buyers"))
        })
        .collect();
    aggs.push(len().cast(DataType::Int64).alias("total buyers"));
    let counts = book
        .buyers_frame()?
        .lazy()
        .with_column(count_bucket_expr(col(buyer::MAX_NTH)).alias(derived::BIN))
        .group_by([col(derived::BIN)])
        .agg(aggs);

    let mut columns = vec![col("order_count")];
    columns.extend(groups.iter().map(|g| col(buyers(g))));
    columns.extend(groups.iter().map(|g| col(share(g))));

    let df = ranked_rows(vec![Column::new("order_count".into(), COUNT_BUCKETS.to_vec())])?
        .lazy()
        .join(
            counts,
            [col("order_count")],
            [col(derived::BIN)],
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

/// Orders, GMV and AOV by order index bucket and CRM flag.
pub fn nth_order_table(book: &OrderBook) -> Result<DataFrame> {
    let per_bucket = book
        .orders_frame()?
        .lazy()
        .with_column(count_bucket_expr(col(order::NTH_ORDER)).alias(derived::BIN))
        .group_by([col(derived::BIN), col(order::IS_CRM)])
        .agg([
            len().cast(DataType::Int64).alias("orders"),
            col(order::ORDER_VALUE).sum().alias("gmv"),
        ]);

    let (buckets, flags): (Vec<&str>, Vec<&str>) = COUNT_BUCKETS
        .iter()
        .flat_map(|bucket| CRM_FLAGS.iter().map(move |flag| (*bucket, *flag)))
        .unzip();
    let df = ranked_rows(vec![
        Column::new(order::NTH_ORDER.into(), buckets),
        Column::new(order::IS_CRM.into(), flags),
    ])?
    .lazy()
    .join(
        per_bucket,
        [col(order::NTH_ORDER), col(order::IS_CRM)],
        [col(derived::BIN), col(order::IS_CRM)],
        JoinArgs::new(JoinType::Left),
    )
    .with_columns([
        col("orders").fill_null(lit(0i64)),
        col("gmv").fill_null(lit(0.0)),
    ])
    .with_column(ratio_expr(col("gmv"), col("orders")).alias("aov"))
    .sort([RANK], SortMultipleOptions::default())
    .select([
        col(order::NTH_ORDER),
        col(order::IS_CRM),
        col("orders"),
        col("gmv"),
        col("aov"),
    ])
    .collect()?;
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, order};
    use crate::table::str_values;

    fn book() -> OrderBook {
        let mut o1 = order("o1", "u1", "2024-01-01 10:00:00", 20.0); // Monday
        let mut o2 = order("o2", "u1", "2024-02-05 10:00:00", 100.0); // Monday
        o2.nth_order = 2;
        o2.is_rebuy = true;
        let mut o3 = order("o3", "u2", "2024-01-08 10:00:00", 15.0); // Monday
        o3.is_crm = sentinel::CRM.to_string();
        let mut o4 = order("o4", "u3", "2024-01-02 10:00:00", 55.0);
        o4.promo_type = "major".to_string();
        o4.channel_num = 2;
        o1.goods_num = 3;
        OrderBook::new(
            vec![o1, o2, o3, o4],
            vec![
                line("o1", "p1", "sauce", "RT"),
                line("o2", "p2", "spice", "RT"),
                line("o3", "p3", "oil", "FS"),
                line("o4", "p1", "sauce", "RT"),
                line("o4", "p3", "oil", "FS"),
            ],
        )
    }

    #[test]
    fn test_value_bins_are_left_closed() {
        let df = df!(order::ORDER_VALUE => [0.0, 17.99, 18.0, 199.0, 20000.0])
            .unwrap()
            .lazy()
            .select([value_bin_expr().alias(derived::BIN)])
            .collect()
            .unwrap();
        let bins: Vec<Option<String>> = str_values(&df, derived::BIN).unwrap();
        assert_eq!(
            bins,
            vec![
                Some(value_bin_label(0)),
                Some(value_bin_label(0)),
                Some("[18, 28)".to_string()),
                Some(value_bin_label(8)),
                None,
            ]
        );

        let by_crm = value_by_crm(&book()).unwrap();
        assert_eq!(by_crm.height(), VALUE_BINS.len() - 1);
        let crm: Vec<i64> = by_crm
            .column(&format!("{} orders", sentinel::CRM))
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        // the single CRM order of 15 sits in the first bin
        assert_eq!(crm[0], 1);
        assert_eq!(crm.iter().sum::<i64>(), 1);

        let by_month = value_by_month(&book()).unwrap();
        let jan: Vec<i64> = by_month.column("2024-01-01").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(jan.iter().sum::<i64>(), 3);
        let total: Vec<i64> = by_month.column("total").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(total.iter().sum::<i64>(), 4);
    }

    #[test]
    fn test_monthly_summary() {
        let df = monthly_summary(&book()).unwrap();
        assert_eq!(df.height(), 2);
        let orders: Vec<Option<i64>> = df.column("orders").unwrap().i64().unwrap().into_iter().collect();
        assert_eq!(orders, vec![Some(3), Some(1)]);
        let items: Vec<Option<f64>> = df
            .column("items_per_order")
            .unwrap()
            .f64()
            .unwrap()
            .into_iter()
            .collect();
        assert!((items[0].unwrap() - 5.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_weekday_skips_promotion_days() {
        let df = weekday_pattern(&book()).unwrap();
        assert_eq!(df.height(), 14);
        let orders: Vec<i64> = df.column("orders").unwrap().i64().unwrap().into_no_null_iter().collect();
        // non-CRM Monday rows are at index 7; CRM Monday at index 0
        assert_eq!(orders[0], 1);
        assert_eq!(orders[7], 2);
        // the promotion-day Tuesday order is excluded
        assert_eq!(orders[8], 0);
    }

    #[test]
    fn test_channel_tables() {
        let b = book();
        let sales = channel_sales(&b).unwrap();
        assert_eq!(
            str_values(&sales, "channel").unwrap(),
            vec![Some("FS".to_string()), Some("RT".to_string())]
        );
        let orders: Vec<i64> = sales.column("orders").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(orders, vec![1, 2]);

        let index = channel_monthly_index(&b).unwrap();
        let rt: Vec<Option<f64>> = index.column("RT index").unwrap().f64().unwrap().into_iter().collect();
        assert_eq!(rt, vec![Some(100.0), Some(500.0)]);

        let audience = channel_audience(&b).unwrap();
        let cross: Vec<i64> = audience.column("cross buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(cross, vec![1, 1]);
        let total: Vec<i64> = audience.column("buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(total, vec![3, 3]);
        let rt: Vec<i64> = audience.column("RT buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(rt, vec![1, 1]);
    }

    #[test]
    fn test_audience_lists_months_without_new_buyers() {
        let mut b = book();
        b.orders.push(order("o5", "u1", "2024-03-04 10:00:00", 30.0));
        b.lines.push(line("o5", "p1", "sauce", "RT"));
        let audience = channel_audience(&b).unwrap();
        assert_eq!(
            str_values(&audience, order::MONTH).unwrap(),
            vec![
                Some("2024-01-01".to_string()),
                Some("2024-02-01".to_string()),
                Some("2024-03-01".to_string()),
            ]
        );
        let total: Vec<i64> = audience.column("buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(total, vec![3, 3, 3]);
        let share: Vec<f64> = audience.column("cross share").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert!((share[2] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_order_count_buckets() {
        let buckets = df!("n" => [0i64, 1, 2, 6, 7, 12])
            .unwrap()
            .lazy()
            .select([count_bucket_expr(col("n")).alias(derived::BIN)])
            .collect()
            .unwrap();
        let labels: Vec<&str> = buckets.column(derived::BIN).unwrap().str().unwrap().into_no_null_iter().collect();
        assert_eq!(labels, vec!["1", "1", "2", "6", "7+", "7+"]);

        let df = order_count_distribution(&book()).unwrap();
        let total: Vec<i64> = df.column("total buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(total, vec![2, 1, 0, 0, 0, 0, 0]);

        let nth = nth_order_table(&book()).unwrap();
        assert_eq!(nth.height(), COUNT_BUCKETS.len() * CRM_FLAGS.len());
        let orders: Vec<i64> = nth.column("orders").unwrap().i64().unwrap().into_no_null_iter().collect();
        // ("1", CRM), ("1", non-CRM), ("2", CRM), ("2", non-CRM)
        assert_eq!(orders[..4], [1, 2, 0, 1]);
    }

    #[test]
    fn test_order_counts_follow_latest_flag() {
        let mut b = book();
        // u1 joined the CRM on their second order
        b.orders[1].is_crm = sentinel::CRM.to_string();
        let df = order_count_distribution(&b).unwrap();
        let crm: Vec<i64> = df
            .column(&format!("{} buyers", sentinel::CRM))
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(crm[..2], [1, 1]);
        let total: Vec<i64> = df.column("total buyers").unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(total.iter().sum::<i64>(), 3);
    }
}
