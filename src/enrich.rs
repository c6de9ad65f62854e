//! Derived fields: calendar, per-order counts, geography, tier, CRM flag and
//! promotion tags.

use std::collections::{BTreeSet, HashMap};

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;
use tracing::info;

use crate::catalog::{Catalogs, PromoTag};
use crate::error::Result;
use crate::ingest::{IngestedBatch, RawOrder, ResolvedLine};
use crate::model::{Order, OrderBook, OrderLine};

/// `(dt, first day of month, day of week 1 = Monday … 7 = Sunday)`.
pub fn calendar(order_time: NaiveDateTime) -> (NaiveDate, NaiveDate, u32) {
    let dt = order_time.date();
    let month = dt.with_day(1).unwrap_or(dt);
    (dt, month, dt.weekday().number_from_monday())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Geography {
    pub province: Option<String>,
    pub city: Option<String>,
    pub district: Option<String>,
}

/// Normalises "province city district street" shipping addresses to the
/// naming used by the region-tier table.
pub struct GeoNormalizer {
    prefecture: Regex,
}

impl GeoNormalizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            prefecture: Regex::new(r"^(黔东南|黔西南|西双版纳|.{2}).*族自治州$")?,
        })
    }

    pub fn normalize(&self, address: &str) -> Geography {
        let mut parts = address.split_whitespace();
        let province = parts.next().map(clean_province);
        let city = parts.next().map(|c| self.clean_city(c));
        let district = parts.next().map(str::to_string);

        match (province, city) {
            (Some(province), Some(city)) => {
                let (city, district) = normalize_district(&province, city, district);
                Geography {
                    province: Some(province),
                    city: Some(city),
                    district,
                }
            }
            (province, city) => Geography {
                province,
                city,
                district,
            },
        }
    }

    fn clean_city(&self, city: &str) -> String {
        if let Some(stripped) = city.strip_suffix('市') {
            return stripped.to_string();
        }
        match city {
            "大理白族自治州" => return "大理".to_string(),
            "延边朝鲜族自治州" => return "延边".to_string(),
            _ => {}
        }
        self.prefecture
            .captures(city)
            .and_then(|c| c.get(1))
            .map_or_else(|| city.to_string(), |m| m.as_str().to_string())
    }
}

fn clean_province(province: &str) -> String {
    if let Some(stripped) = province.strip_suffix('省') {
        return stripped.to_string();
    }
    match province {
        "广西壮族自治区" => "广西",
        "内蒙古自治区" => "内蒙古",
        "宁夏回族自治区" => "宁夏",
        "新疆维吾尔自治区" => "新疆",
        "西藏自治区" => "西藏",
        other => other,
    }
    .to_string()
}

/// County-level special cases; returns the (possibly moved) city and district.
fn normalize_district(
    province: &str,
    city: String,
    district: Option<String>,
) -> (String, Option<String>) {
    let district = match (province, city.as_str(), district.as_deref()) {
        ("广东", "东莞" | "中山", _) => Some(format!("{city}市")),
        ("江苏", "苏州", Some("苏州工业园区" | "园区")) => Some("吴中区".to_string()),
        ("湖北", "潜江" | "仙桃" | "天门", _) => Some(format!("{city}市")),
        ("安徽", "芜湖", Some("无为县")) => Some("无为市".to_string()),
        ("海南", c, _) if c != "三亚" && c != "海口" => {
            return ("海南".to_string(), Some(city));
        }
        _ => district,
    };
    (city, district)
}

/// Turn an ingested batch into enriched orders and lines.
///
/// `nth_order` is left at 0; [`crate::sequence::assign`] fills it in.
pub fn enrich(batch: IngestedBatch, catalogs: &Catalogs) -> Result<OrderBook> {
    let geo = GeoNormalizer::new()?;

    let mut lines_by_order: HashMap<&str, Vec<&ResolvedLine>> = HashMap::new();
    for line in &batch.lines {
        lines_by_order
            .entry(line.order_id.as_str())
            .or_default()
            .push(line);
    }

    let mut orders = Vec::with_capacity(batch.orders.len());
    let mut lines = Vec::with_capacity(batch.lines.len());
    let mut tiered = 0usize;
    let mut live_tagged = 0usize;

    for raw in &batch.orders {
        let order_lines = lines_by_order
            .get(raw.order_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let (dt, _, _) = calendar(raw.order_time);

        let mut order_tag: Option<PromoTag> = None;
        for line in order_lines {
            let tag = catalogs.promotions.tag(dt, &line.product_id);
            if tag.live && order_tag.is_none() {
                order_tag = Some(tag.clone());
            }
            lines.push(OrderLine {
                order_id: line.order_id.clone(),
                product_id: line.product_id.clone(),
                title_origin: line.title_origin.clone(),
                title: line.title.clone(),
                title_refined: line.title_refined.clone(),
                channel: line.channel.clone(),
                category: line.category.clone(),
                promotion: tag.promotion,
                promo_type: tag.promo_type,
            });
        }
        if order_tag.is_some() {
            live_tagged += 1;
        }
        let tag = order_tag.unwrap_or_else(|| catalogs.promotions.date_tag(dt));

        let order = build_order(raw, order_lines, &geo, catalogs, tag);
        if order.tier.is_some() {
            tiered += 1;
        }
        orders.push(order);
    }

    let rate = if orders.is_empty() {
        0.0
    } else {
        tiered as f64 / orders.len() as f64
    };
    info!(
        orders = orders.len(),
        lines = lines.len(),
        tier_match_rate = format!("{:.1}%", rate * 100.0),
        live_tagged,
        "enrichment complete"
    );
    Ok(OrderBook::new(orders, lines))
}

fn build_order(
    raw: &RawOrder,
    lines: &[&ResolvedLine],
    geo: &GeoNormalizer,
    catalogs: &Catalogs,
    tag: PromoTag,
) -> Order {
    let (dt, month, day_of_week) = calendar(raw.order_time);
    let cate_num = lines.iter().map(|l| l.category.as_str()).collect::<BTreeSet<_>>().len();
    let channel_num = lines.iter().map(|l| l.channel.as_str()).collect::<BTreeSet<_>>().len();

    let Geography {
        province,
        city,
        district,
    } = geo.normalize(&raw.address);
    let tier = match (&province, &city, &district) {
        (Some(p), Some(c), Some(d)) => catalogs.regions.tier(p, c, d).map(str::to_string),
        _ => None,
    };

    Order {
        order_id: raw.order_id.clone(),
        order_time: raw.order_time,
        dt,
        month,
        day_of_week,
        order_value: raw.order_value,
        goods_type: raw.goods_type,
        goods_num: raw.goods_num,
        user_id: raw.user_id.clone(),
        address: raw.address.clone(),
        items: raw.items.clone(),
        cate_num: cate_num as i64,
        channel_num: channel_num as i64,
        province,
        city,
        district,
        tier,
        is_crm: catalogs.crm.flag(&raw.user_id).to_string(),
        promotion: tag.promotion,
        promo_type: tag.promo_type,
        nth_order: 0,
        is_rebuy: false,
    }
}
