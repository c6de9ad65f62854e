use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use polars::prelude::*;

use crate::error::{InsightError, Result};
use crate::schema::{buyer, derived, line, order};
use crate::table::{optional_str_values, require_columns, str_values};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One purchase transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub order_time: NaiveDateTime,
    pub dt: NaiveDate,
    /// First day of the order's month.
    pub month: NaiveDate,
    /// 1 = Monday … 7 = Sunday.
    pub day_of_week: u32,
    pub order_value: f64,
    pub goods_type: i64,
    pub goods_num: i64,
    pub user_id: String,
    pub address: String,
    pub items: String,
    pub cate_num: i64,
    pub channel_num: i64,
    pub province: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
    pub tier: Option<String>,
    pub is_crm: String,
    pub promotion: String,
    pub promo_type: String,
    pub nth_order: i64,
    pub is_rebuy: bool,
}

/// One product entry within an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderLine {
    pub order_id: String,
    pub product_id: String,
    pub title_origin: String,
    pub title: String,
    pub title_refined: Option<String>,
    pub channel: String,
    pub category: String,
    pub promotion: String,
    pub promo_type: String,
}

impl OrderLine {
    /// Simplified title, falling back to the canonical one.
    pub fn display_title(&self) -> &str {
        self.title_refined.as_deref().unwrap_or(&self.title)
    }
}

/// Orders together with the lines they own.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub orders: Vec<Order>,
    pub lines: Vec<OrderLine>,
}

impl OrderBook {
    pub fn new(orders: Vec<Order>, lines: Vec<OrderLine>) -> Self {
        Self { orders, lines }
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn order_index(&self) -> HashMap<&str, &Order> {
        self.orders
            .iter()
            .map(|o| (o.order_id.as_str(), o))
            .collect()
    }

    /// Every line paired with its parent order; orphan lines are skipped.
    pub fn joined_lines(&self) -> Vec<(&Order, &OrderLine)> {
        let index = self.order_index();
        self.lines
            .iter()
            .filter_map(|l| index.get(l.order_id.as_str()).map(|o| (*o, l)))
            .collect()
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.orders.iter().map(|o| o.dt).max()
    }

    pub fn orders_frame(&self) -> Result<DataFrame> {
        orders_to_frame(&self.orders)
    }

    pub fn lines_frame(&self) -> Result<DataFrame> {
        lines_to_frame(&self.lines)
    }

    /// Orders frame plus the order date as a day number.
    pub fn dated_orders_frame(&self) -> Result<DataFrame> {
        let mut df = self.orders_frame()?;
        df.with_column(Column::new(
            derived::DAY.into(),
            self.orders.iter().map(|o| day_number(o.dt)).collect::<Vec<_>>(),
        ))?;
        Ok(df)
    }

    /// Every line with the buyer, time, date, value and province of its
    /// order. Orphan lines are dropped.
    pub fn order_lines_frame(&self) -> Result<LazyFrame> {
        let orders = self.dated_orders_frame()?.lazy().select([
            col(order::ORDER_ID),
            col(order::USER_ID),
            col(order::ORDER_TIME),
            col(order::DT),
            col(order::MONTH),
            col(order::ORDER_VALUE),
            col(order::PROVINCE),
            col(derived::DAY),
        ]);
        let lines = self.lines_frame()?.lazy().select([
            col(line::ORDER_ID),
            col(line::PRODUCT_ID),
            col(line::TITLE),
            col(line::TITLE_REFINED),
            col(line::CHANNEL),
            col(line::CATEGORY),
        ]);
        Ok(lines.join(
            orders,
            [col(line::ORDER_ID)],
            [col(order::ORDER_ID)],
            JoinArgs::new(JoinType::Inner),
        ))
    }

    /// One row per buyer, sorted by id: CRM flag, order count, order value,
    /// last order day and highest order index.
    ///
    /// A buyer's CRM flag is the one on their latest order, so a buyer who
    /// joined the CRM between batches is counted once, as a member.
    pub fn buyers_frame(&self) -> Result<DataFrame> {
        let latest = |name: &str| {
            col(name)
                .sort_by(
                    [col(order::ORDER_TIME), col(order::ORDER_ID)],
                    SortMultipleOptions::default(),
                )
                .last()
        };
        let df = self
            .dated_orders_frame()?
            .lazy()
            .group_by([col(order::USER_ID)])
            .agg([
                latest(order::IS_CRM).alias(buyer::IS_CRM),
                len().cast(DataType::Int64).alias(buyer::ORDERS),
                col(order::ORDER_VALUE).sum().alias(buyer::MONETARY),
                latest(derived::DAY).alias(buyer::LAST_DAY),
                col(order::NTH_ORDER).max().alias(buyer::MAX_NTH),
            ])
            .sort([buyer::USER_ID], SortMultipleOptions::default())
            .collect()?;
        Ok(df)
    }
}

/// Days since 0001-01-01; only differences are meaningful.
pub fn day_number(date: NaiveDate) -> i64 {
    date.num_days_from_ce() as i64
}

// ── Parse helpers ───────────────────────────────────────────────────────────

/// Parse a timestamp; accepts the common export layouts and bare dates.
pub fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 5] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
    ];
    let raw = raw.trim();
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| parse_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let head = raw.split_whitespace().next().unwrap_or(raw);
    ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"]
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(head, f).ok())
}

pub fn parse_f64(raw: &str) -> Option<f64> {
    raw.trim().replace(',', "").parse::<f64>().ok()
}

/// Integer parse that tolerates a float rendering such as "3.0".
pub fn parse_i64(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| parse_f64(raw).filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

fn required<T>(
    value: Option<String>,
    column: &str,
    row: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T> {
    let raw = value.ok_or_else(|| {
        InsightError::InvalidData(format!("Null {} at row {}", column, row))
    })?;
    parse(&raw).ok_or_else(|| {
        InsightError::InvalidData(format!("Unparseable {} '{}' at row {}", column, raw, row))
    })
}

// ── DataFrame conversion ────────────────────────────────────────────────────

pub fn orders_to_frame(orders: &[Order]) -> Result<DataFrame> {
    let fmt_date = |d: &NaiveDate| d.format(DATE_FORMAT).to_string();

    let df = DataFrame::new(vec![
        Column::new(order::ORDER_ID.into(), orders.iter().map(|o| o.order_id.clone()).collect::<Vec<_>>()),
        Column::new(
            order::ORDER_TIME.into(),
            orders
                .iter()
                .map(|o| o.order_time.format(DATETIME_FORMAT).to_string())
                .collect::<Vec<_>>(),
        ),
        Column::new(order::DT.into(), orders.iter().map(|o| fmt_date(&o.dt)).collect::<Vec<_>>()),
        Column::new(order::MONTH.into(), orders.iter().map(|o| fmt_date(&o.month)).collect::<Vec<_>>()),
        Column::new(order::DAY_OF_WEEK.into(), orders.iter().map(|o| o.day_of_week as i64).collect::<Vec<_>>()),
        Column::new(order::ORDER_VALUE.into(), orders.iter().map(|o| o.order_value).collect::<Vec<_>>()),
        Column::new(order::GOODS_TYPE.into(), orders.iter().map(|o| o.goods_type).collect::<Vec<_>>()),
        Column::new(order::GOODS_NUM.into(), orders.iter().map(|o| o.goods_num).collect::<Vec<_>>()),
        Column::new(order::USER_ID.into(), orders.iter().map(|o| o.user_id.clone()).collect::<Vec<_>>()),
        Column::new(order::ADDRESS.into(), orders.iter().map(|o| o.address.clone()).collect::<Vec<_>>()),
        Column::new(order::ITEMS.into(), orders.iter().map(|o| o.items.clone()).collect::<Vec<_>>()),
        Column::new(order::CATE_NUM.into(), orders.iter().map(|o| o.cate_num).collect::<Vec<_>>()),
        Column::new(order::CHANNEL_NUM.into(), orders.iter().map(|o| o.channel_num).collect::<Vec<_>>()),
        Column::new(order::PROVINCE.into(), orders.iter().map(|o| o.province.clone()).collect::<Vec<_>>()),
        Column::new(order::CITY.into(), orders.iter().map(|o| o.city.clone()).collect::<Vec<_>>()),
        Column::new(order::DISTRICT.into(), orders.iter().map(|o| o.district.clone()).collect::<Vec<_>>()),
        Column::new(order::TIER.into(), orders.iter().map(|o| o.tier.clone()).collect::<Vec<_>>()),
        Column::new(order::IS_CRM.into(), orders.iter().map(|o| o.is_crm.clone()).collect::<Vec<_>>()),
        Column::new(order::PROMOTION.into(), orders.iter().map(|o| o.promotion.clone()).collect::<Vec<_>>()),
        Column::new(order::PROMO_TYPE.into(), orders.iter().map(|o| o.promo_type.clone()).collect::<Vec<_>>()),
        Column::new(order::NTH_ORDER.into(), orders.iter().map(|o| o.nth_order).collect::<Vec<_>>()),
        Column::new(order::IS_REBUY.into(), orders.iter().map(|o| o.is_rebuy).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

/// Rebuild orders from a persisted (all-string) orders table.
pub fn orders_from_frame(df: &DataFrame) -> Result<Vec<Order>> {
    require_columns(
        df,
        &[order::ORDER_ID, order::ORDER_TIME, order::USER_ID, order::ORDER_VALUE, order::NTH_ORDER],
    )?;

    let mut ids = str_values(df, order::ORDER_ID)?.into_iter();
    let mut times = str_values(df, order::ORDER_TIME)?.into_iter();
    let mut values = str_values(df, order::ORDER_VALUE)?.into_iter();
    let mut goods_types = optional_str_values(df, order::GOODS_TYPE)?.into_iter();
    let mut goods_nums = optional_str_values(df, order::GOODS_NUM)?.into_iter();
    let mut users = str_values(df, order::USER_ID)?.into_iter();
    let mut addresses = optional_str_values(df, order::ADDRESS)?.into_iter();
    let mut items = optional_str_values(df, order::ITEMS)?.into_iter();
    let mut cate_nums = optional_str_values(df, order::CATE_NUM)?.into_iter();
    let mut channel_nums = optional_str_values(df, order::CHANNEL_NUM)?.into_iter();
    let mut provinces = optional_str_values(df, order::PROVINCE)?.into_iter();
    let mut cities = optional_str_values(df, order::CITY)?.into_iter();
    let mut districts = optional_str_values(df, order::DISTRICT)?.into_iter();
    let mut tiers = optional_str_values(df, order::TIER)?.into_iter();
    let mut crms = optional_str_values(df, order::IS_CRM)?.into_iter();
    let mut promotions = optional_str_values(df, order::PROMOTION)?.into_iter();
    let mut promo_types = optional_str_values(df, order::PROMO_TYPE)?.into_iter();
    let mut nths = str_values(df, order::NTH_ORDER)?.into_iter();

    let mut orders = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let order_time = required(times.next().flatten(), order::ORDER_TIME, row, parse_datetime)?;
        let nth_order = required(nths.next().flatten(), order::NTH_ORDER, row, parse_i64)?;
        let (dt, month, day_of_week) = crate::enrich::calendar(order_time);
        orders.push(Order {
            order_id: required(ids.next().flatten(), order::ORDER_ID, row, |s| Some(s.to_string()))?,
            order_time,
            dt,
            month,
            day_of_week,
            order_value: required(values.next().flatten(), order::ORDER_VALUE, row, parse_f64)?,
            goods_type: goods_types.next().flatten().as_deref().and_then(parse_i64).unwrap_or(1),
            goods_num: goods_nums.next().flatten().as_deref().and_then(parse_i64).unwrap_or(1),
            user_id: required(users.next().flatten(), order::USER_ID, row, |s| Some(s.to_string()))?,
            address: addresses.next().flatten().unwrap_or_default(),
            items: items.next().flatten().unwrap_or_default(),
            cate_num: cate_nums.next().flatten().as_deref().and_then(parse_i64).unwrap_or(1),
            channel_num: channel_nums.next().flatten().as_deref().and_then(parse_i64).unwrap_or(1),
            province: provinces.next().flatten(),
            city: cities.next().flatten(),
            district: districts.next().flatten(),
            tier: tiers.next().flatten(),
            is_crm: crms
                .next()
                .flatten()
                .unwrap_or_else(|| crate::schema::sentinel::NON_CRM.to_string()),
            promotion: promotions
                .next()
                .flatten()
                .unwrap_or_else(|| crate::schema::sentinel::NO_PROMOTION.to_string()),
            promo_type: promo_types
                .next()
                .flatten()
                .unwrap_or_else(|| crate::schema::sentinel::ORDINARY_DAY.to_string()),
            nth_order,
            is_rebuy: nth_order > 1,
        });
    }
    Ok(orders)
}

pub fn lines_to_frame(lines: &[OrderLine]) -> Result<DataFrame> {
    let df = DataFrame::new(vec![
        Column::new(line::ORDER_ID.into(), lines.iter().map(|l| l.order_id.clone()).collect::<Vec<_>>()),
        Column::new(line::PRODUCT_ID.into(), lines.iter().map(|l| l.product_id.clone()).collect::<Vec<_>>()),
        Column::new(line::TITLE_ORIGIN.into(), lines.iter().map(|l| l.title_origin.clone()).collect::<Vec<_>>()),
        Column::new(line::TITLE.into(), lines.iter().map(|l| l.title.clone()).collect::<Vec<_>>()),
        Column::new(line::TITLE_REFINED.into(), lines.iter().map(|l| l.title_refined.clone()).collect::<Vec<_>>()),
        Column::new(line::CHANNEL.into(), lines.iter().map(|l| l.channel.clone()).collect::<Vec<_>>()),
        Column::new(line::CATEGORY.into(), lines.iter().map(|l| l.category.clone()).collect::<Vec<_>>()),
        Column::new(line::PROMOTION.into(), lines.iter().map(|l| l.promotion.clone()).collect::<Vec<_>>()),
        Column::new(line::PROMO_TYPE.into(), lines.iter().map(|l| l.promo_type.clone()).collect::<Vec<_>>()),
    ])?;
    Ok(df)
}

/// Rebuild order lines from a persisted (all-string) lines table.
pub fn lines_from_frame(df: &DataFrame) -> Result<Vec<OrderLine>> {
    require_columns(df, &[line::ORDER_ID, line::PRODUCT_ID, line::CATEGORY])?;

    let ids = str_values(df, line::ORDER_ID)?;
    let products = str_values(df, line::PRODUCT_ID)?;
    let origins = optional_str_values(df, line::TITLE_ORIGIN)?;
    let titles = optional_str_values(df, line::TITLE)?;
    let refined = optional_str_values(df, line::TITLE_REFINED)?;
    let channels = optional_str_values(df, line::CHANNEL)?;
    let categories = str_values(df, line::CATEGORY)?;
    let promotions = optional_str_values(df, line::PROMOTION)?;
    let promo_types = optional_str_values(df, line::PROMO_TYPE)?;

    let mut lines = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let title = titles[i].clone().unwrap_or_default();
        lines.push(OrderLine {
            order_id: required(ids[i].clone(), line::ORDER_ID, i, |s| Some(s.to_string()))?,
            product_id: required(products[i].clone(), line::PRODUCT_ID, i, |s| Some(s.to_string()))?,
            title_origin: origins[i].clone().unwrap_or_else(|| title.clone()),
            title,
            title_refined: refined[i].clone(),
            channel: channels[i].clone().unwrap_or_default(),
            category: required(categories[i].clone(), line::CATEGORY, i, |s| Some(s.to_string()))?,
            promotion: promotions[i]
                .clone()
                .unwrap_or_else(|| crate::schema::sentinel::NO_PROMOTION.to_string()),
            promo_type: promo_types[i]
                .clone()
                .unwrap_or_else(|| crate::schema::sentinel::ORDINARY_DAY.to_string()),
        });
    }
    Ok(lines)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::table::{read_csv_as_strings, write_csv};

    #[test]
    fn test_parse_helpers() {
        assert_eq!(
            parse_datetime("2024/03/05 10:11:12"),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(10, 11, 12)
        );
        assert_eq!(
            parse_datetime("2024-03-05"),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_i64("3.0"), Some(3));
        assert_eq!(parse_i64("3.5"), None);
        assert_eq!(parse_f64(" 1,299.5 "), Some(1299.5));
    }

    #[test]
    fn test_orders_survive_csv_persistence() {
        let mut first = order("A1", "u1", "2024-01-02 08:00:00", 59.9);
        first.tier = None;
        let mut second = order("A2", "u1", "2024-02-10 21:30:00", 30.0);
        second.nth_order = 2;
        second.is_rebuy = true;
        let orders = vec![first, second];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.csv");
        write_csv(&mut orders_to_frame(&orders).unwrap(), &path).unwrap();

        let back = orders_from_frame(&read_csv_as_strings(&path).unwrap()).unwrap();
        assert_eq!(back, orders);
    }

    #[test]
    fn test_lines_join_to_orders() {
        let book = OrderBook::new(
            vec![order("A1", "u1", "2024-01-02 08:00:00", 10.0)],
            vec![line("A1", "p1", "sauce", "RT"), line("ZZ", "p2", "spice", "RT")],
        );
        let joined = book.joined_lines();
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].1.product_id, "p1");
        let lines = book.order_lines_frame().unwrap().collect().unwrap();
        assert_eq!(lines.height(), 1);
        assert_eq!(lines.column(order::USER_ID).unwrap().str().unwrap().get(0), Some("u1"));
    }

    #[test]
    fn test_buyer_flag_follows_latest_order() {
        let mut joined = order("A2", "u1", "2024-03-01 08:00:00", 30.0);
        joined.is_crm = crate::schema::sentinel::CRM.to_string();
        joined.nth_order = 2;
        let book = OrderBook::new(
            vec![
                joined,
                order("A1", "u1", "2024-01-02 08:00:00", 10.0),
                order("B1", "u2", "2024-02-01 08:00:00", 5.0),
            ],
            Vec::new(),
        );

        let df = book.buyers_frame().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(
            str_values(&df, buyer::IS_CRM).unwrap(),
            vec![
                Some(crate::schema::sentinel::CRM.to_string()),
                Some(crate::schema::sentinel::NON_CRM.to_string())
            ]
        );
        let orders: Vec<i64> = df.column(buyer::ORDERS).unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(orders, vec![2, 1]);
        let last: Vec<i64> = df.column(buyer::LAST_DAY).unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(last[0], day_number(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    }

    #[test]
    fn test_null_required_field_is_invalid_data() {
        let df = DataFrame::new(vec![
            Column::new(line::ORDER_ID.into(), &[Some("A1")]),
            Column::new(line::PRODUCT_ID.into(), &[None::<&str>]),
            Column::new(line::CATEGORY.into(), &[Some("sauce")]),
        ])
        .unwrap();
        let err = lines_from_frame(&df).unwrap_err();
        assert!(matches!(err, InsightError::InvalidData(_)));
    }
}
