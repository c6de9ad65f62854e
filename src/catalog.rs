//! Read-only reference dictionaries loaded once per run.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use polars::prelude::DataFrame;
use tracing::{info, warn};

use crate::config::InsightConfig;
use crate::error::{InsightError, Result};
use crate::model::parse_date;
use crate::schema::{catalog, crm, promo, region, sentinel};
use crate::table::{optional_str_values, read_table, require_columns, str_values};

/// Canonical product identity resolved from a listing title.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductInfo {
    pub product_id: String,
    pub title: String,
    pub channel: Option<String>,
    pub category: Option<String>,
}

/// Title → product mapping plus the simplified display titles.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    by_clean_title: HashMap<String, ProductInfo>,
    by_origin_title: HashMap<String, ProductInfo>,
    refined_titles: HashMap<String, String>,
}

impl ProductCatalog {
    /// Required columns: product_id plus title_clean and/or title_origin.
    /// The first row wins when a title appears more than once.
    pub fn from_frames(products: &DataFrame, refined: Option<&DataFrame>) -> Result<Self> {
        require_columns(products, &[catalog::PRODUCT_ID])?;
        if products.column(catalog::TITLE_CLEAN).is_err()
            && products.column(catalog::TITLE_ORIGIN).is_err()
        {
            return Err(InsightError::MissingColumn(format!(
                "{} or {}",
                catalog::TITLE_CLEAN,
                catalog::TITLE_ORIGIN
            )));
        }

        let clean = optional_str_values(products, catalog::TITLE_CLEAN)?;
        let origin = optional_str_values(products, catalog::TITLE_ORIGIN)?;
        let ids = str_values(products, catalog::PRODUCT_ID)?;
        let titles = optional_str_values(products, catalog::TITLE)?;
        let channels = optional_str_values(products, catalog::CHANNEL)?;
        let categories = optional_str_values(products, catalog::CATEGORY)?;

        let mut out = Self::default();
        for i in 0..products.height() {
            let Some(product_id) = ids[i].clone() else {
                continue;
            };
            let info = ProductInfo {
                title: titles[i]
                    .clone()
                    .or_else(|| clean[i].clone())
                    .unwrap_or_else(|| product_id.clone()),
                product_id,
                channel: channels[i].clone(),
                category: categories[i].clone(),
            };
            if let Some(t) = &clean[i] {
                out.by_clean_title.entry(t.clone()).or_insert_with(|| info.clone());
            }
            if let Some(t) = &origin[i] {
                out.by_origin_title.entry(t.clone()).or_insert(info);
            }
        }

        if let Some(refined) = refined {
            require_columns(refined, &[catalog::PRODUCT_ID, catalog::TITLE_REFINED])?;
            let ids = str_values(refined, catalog::PRODUCT_ID)?;
            let names = str_values(refined, catalog::TITLE_REFINED)?;
            for (id, name) in ids.into_iter().zip(names) {
                if let (Some(id), Some(name)) = (id, name) {
                    out.refined_titles.entry(id).or_insert(name);
                }
            }
        }
        Ok(out)
    }

    /// Two-stage lookup: cleaned title first, raw title as fallback.
    pub fn resolve(&self, clean_title: &str, origin_title: &str) -> Option<&ProductInfo> {
        self.by_clean_title
            .get(clean_title)
            .or_else(|| self.by_origin_title.get(origin_title))
    }

    pub fn refined_title(&self, product_id: &str) -> Option<&str> {
        self.refined_titles.get(product_id).map(String::as_str)
    }
}

/// CRM membership list.
#[derive(Debug, Clone, Default)]
pub struct CrmRoster {
    members: HashSet<String>,
}

impl CrmRoster {
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        require_columns(df, &[crm::USER_ID])?;
        Ok(Self {
            members: str_values(df, crm::USER_ID)?.into_iter().flatten().collect(),
        })
    }

    pub fn from_members<I: IntoIterator<Item = S>, S: Into<String>>(members: I) -> Self {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn flag(&self, user_id: &str) -> &'static str {
        if self.members.contains(user_id) {
            sentinel::CRM
        } else {
            sentinel::NON_CRM
        }
    }
}

/// One promotion calendar entry, inclusive on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub promotion: String,
    pub promo_type: String,
    pub product_id: Option<String>,
}

impl PromotionWindow {
    /// Live-stream events are product specific. Marked by `直播` or the
    /// word "live" on its own ("Live-stream", not "Delivery").
    pub fn is_live(&self) -> bool {
        self.promotion.contains("直播")
            || self
                .promotion
                .split(|c: char| !c.is_ascii_alphabetic())
                .any(|word| word.eq_ignore_ascii_case("live"))
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Promotion tag attached to an order or line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromoTag {
    pub promotion: String,
    pub promo_type: String,
    pub live: bool,
}

impl PromoTag {
    pub fn ordinary() -> Self {
        Self {
            promotion: sentinel::NO_PROMOTION.to_string(),
            promo_type: sentinel::ORDINARY_DAY.to_string(),
            live: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromotionCalendar {
    windows: Vec<PromotionWindow>,
}

impl PromotionCalendar {
    pub fn new(windows: Vec<PromotionWindow>) -> Self {
        Self { windows }
    }

    /// Required columns: start_date, end_date, promotion, promo_type.
    /// Optional: product_id (targets live-stream events).
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        require_columns(
            df,
            &[promo::START_DATE, promo::END_DATE, promo::PROMOTION, promo::PROMO_TYPE],
        )?;
        let starts = str_values(df, promo::START_DATE)?;
        let ends = str_values(df, promo::END_DATE)?;
        let names = str_values(df, promo::PROMOTION)?;
        let types = str_values(df, promo::PROMO_TYPE)?;
        let products = optional_str_values(df, promo::PRODUCT_ID)?;

        let mut windows = Vec::with_capacity(df.height());
        for i in 0..df.height() {
            let (Some(start), Some(end)) = (
                starts[i].as_deref().and_then(parse_date),
                ends[i].as_deref().and_then(parse_date),
            ) else {
                warn!(row = i, "promotion entry without a valid date range skipped");
                continue;
            };
            windows.push(PromotionWindow {
                start,
                end,
                promotion: names[i].clone().unwrap_or_default(),
                promo_type: types[i].clone().unwrap_or_default(),
                product_id: products[i].clone(),
            });
        }
        Ok(Self { windows })
    }

    pub fn windows(&self) -> &[PromotionWindow] {
        &self.windows
    }

    /// Live events on (day, product) win over generic promotions on the day;
    /// among generic promotions the first calendar entry wins.
    pub fn tag(&self, day: NaiveDate, product_id: &str) -> PromoTag {
        let live = self.windows.iter().find(|w| {
            w.is_live() && w.contains(day) && w.product_id.as_deref() == Some(product_id)
        });
        if let Some(w) = live {
            return PromoTag {
                promotion: w.promotion.clone(),
                promo_type: w.promo_type.clone(),
                live: true,
            };
        }
        self.date_tag(day)
    }

    /// Tag from the generic (non-live) promotions running on `day`.
    pub fn date_tag(&self, day: NaiveDate) -> PromoTag {
        self.windows
            .iter()
            .find(|w| !w.is_live() && w.contains(day))
            .map(|w| PromoTag {
                promotion: w.promotion.clone(),
                promo_type: w.promo_type.clone(),
                live: false,
            })
            .unwrap_or_else(PromoTag::ordinary)
    }
}

/// (province, city, district) → city tier.
#[derive(Debug, Clone, Default)]
pub struct RegionTiers {
    tiers: HashMap<(String, String, String), String>,
}

impl RegionTiers {
    pub fn from_frame(df: &DataFrame) -> Result<Self> {
        require_columns(
            df,
            &[region::PROVINCE, region::CITY, region::DISTRICT, region::TIER],
        )?;
        let provinces = str_values(df, region::PROVINCE)?;
        let cities = str_values(df, region::CITY)?;
        let districts = str_values(df, region::DISTRICT)?;
        let tiers = str_values(df, region::TIER)?;

        let mut out = Self::default();
        for i in 0..df.height() {
            if let (Some(p), Some(c), Some(d), Some(t)) = (
                provinces[i].clone(),
                cities[i].clone(),
                districts[i].clone(),
                tiers[i].clone(),
            ) {
                out.tiers.entry((p, c, d)).or_insert(t);
            }
        }
        Ok(out)
    }

    pub fn insert(&mut self, province: &str, city: &str, district: &str, tier: &str) {
        self.tiers.insert(
            (province.to_string(), city.to_string(), district.to_string()),
            tier.to_string(),
        );
    }

    pub fn tier(&self, province: &str, city: &str, district: &str) -> Option<&str> {
        self.tiers
            .get(&(province.to_string(), city.to_string(), district.to_string()))
            .map(String::as_str)
    }
}

/// All reference data a run needs.
#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    pub products: ProductCatalog,
    pub crm: CrmRoster,
    pub promotions: PromotionCalendar,
    pub regions: RegionTiers,
}

impl Catalogs {
    pub fn load(config: &InsightConfig) -> Result<Self> {
        let rename = &config.columns;
        let inputs = &config.inputs;

        let products = read_table(&inputs.catalog, rename)?;
        let refined = read_table(&inputs.refined_titles, rename)?;
        let products = ProductCatalog::from_frames(&products, Some(&refined))?;

        let crm = match &inputs.crm {
            Some(path) => CrmRoster::from_frame(&read_table(path, rename)?)?,
            None => CrmRoster::default(),
        };
        let promotions = match &inputs.promotions {
            Some(path) => PromotionCalendar::from_frame(&read_table(path, rename)?)?,
            None => PromotionCalendar::default(),
        };
        let regions = RegionTiers::from_frame(&read_table(&inputs.regions, rename)?)?;

        info!(
            crm_members = crm.members.len(),
            promotions = promotions.windows.len(),
            regions = regions.tiers.len(),
            "reference tables loaded"
        );
        Ok(Self {
            products,
            crm,
            promotions,
            regions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;

    fn day(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn window(start: &str, end: &str, name: &str, kind: &str, product: Option<&str>) -> PromotionWindow {
        PromotionWindow {
            start: day(start),
            end: day(end),
            promotion: name.to_string(),
            promo_type: kind.to_string(),
            product_id: product.map(str::to_string),
        }
    }

    #[test]
    fn test_resolve_prefers_clean_title_then_origin() {
        let df = DataFrame::new(vec![
            Column::new(catalog::TITLE_CLEAN.into(), &[Some("Sauce 200g"), None]),
            Column::new(catalog::TITLE_ORIGIN.into(), &[Some("[Sale]Sauce 200g"), Some("Old Spice Mix")]),
            Column::new(catalog::PRODUCT_ID.into(), &["1", "2"]),
            Column::new(catalog::TITLE.into(), &["Sauce", "Spice Mix"]),
            Column::new(catalog::CHANNEL.into(), &["RT", "FS"]),
            Column::new(catalog::CATEGORY.into(), &["sauce", "spice"]),
        ])
        .unwrap();
        let refined = DataFrame::new(vec![
            Column::new(catalog::PRODUCT_ID.into(), &["1"]),
            Column::new(catalog::TITLE_REFINED.into(), &["Sauce*1"]),
        ])
        .unwrap();
        let cat = ProductCatalog::from_frames(&df, Some(&refined)).unwrap();

        assert_eq!(cat.resolve("Sauce 200g", "whatever").unwrap().product_id, "1");
        assert_eq!(cat.resolve("nope", "Old Spice Mix").unwrap().product_id, "2");
        assert!(cat.resolve("nope", "nope").is_none());
        assert_eq!(cat.refined_title("1"), Some("Sauce*1"));
        assert_eq!(cat.refined_title("2"), None);
    }

    #[test]
    fn test_live_event_takes_precedence_on_collision() {
        let cal = PromotionCalendar::new(vec![
            window("2024-06-01", "2024-06-18", "618", "major", None),
            window("2024-06-10", "2024-06-10", "Live Special", "live", Some("p1")),
        ]);

        let tag = cal.tag(day("2024-06-10"), "p1");
        assert_eq!(tag.promotion, "Live Special");
        assert!(tag.live);

        // same day, other product: the generic promotion applies
        assert_eq!(cal.tag(day("2024-06-10"), "p2").promotion, "618");
        assert_eq!(cal.tag(day("2024-07-01"), "p1"), PromoTag::ordinary());
    }

    #[test]
    fn test_chinese_live_marker_detected() {
        assert!(window("2024-01-01", "2024-01-01", "3月直播专场", "直播", None).is_live());
        assert!(!window("2024-01-01", "2024-01-03", "年货节", "大促", None).is_live());
        assert_eq!(window("2024-01-01", "2024-01-03", "x", "y", None).days(), 3);
    }

    #[test]
    fn test_live_must_be_a_whole_word() {
        assert!(window("2024-01-01", "2024-01-01", "Live-stream Night", "live", None).is_live());
        assert!(!window("2024-01-08", "2024-01-08", "Delivery Festival", "small", None).is_live());
        assert!(!window("2024-01-08", "2024-01-08", "Olive Day", "small", None).is_live());

        let cal = PromotionCalendar::new(vec![window(
            "2024-01-08",
            "2024-01-08",
            "Delivery Festival",
            "small promotion",
            None,
        )]);
        let tag = cal.tag(day("2024-01-08"), "p1");
        assert_eq!(tag.promotion, "Delivery Festival");
        assert_eq!(tag.promo_type, "small promotion");
        assert!(!tag.live);
    }

    #[test]
    fn test_crm_and_tier_defaults() {
        let roster = CrmRoster::from_members(["u1"]);
        assert_eq!(roster.flag("u1"), sentinel::CRM);
        assert_eq!(roster.flag("u2"), sentinel::NON_CRM);

        let mut tiers = RegionTiers::default();
        tiers.insert("广东", "深圳", "南山区", "T1");
        assert_eq!(tiers.tier("广东", "深圳", "南山区"), Some("T1"));
        assert_eq!(tiers.tier("广东", "深圳", "福田区"), None);
    }
}
