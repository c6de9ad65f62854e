//! Run configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! `order_insight.toml`, then `ORDER_INSIGHT__*` environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightConfig {
    #[serde(default)]
    pub inputs: InputPaths,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub output: OutputConfig,

    /// Header renames applied to every loaded table (after whitespace trim).
    #[serde(default = "default_column_map")]
    pub columns: BTreeMap<String, String>,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            inputs: InputPaths::default(),
            history: HistoryConfig::default(),
            output: OutputConfig::default(),
            columns: default_column_map(),
            analysis: AnalysisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPaths {
    pub new_orders: PathBuf,
    pub catalog: PathBuf,
    pub refined_titles: PathBuf,
    pub regions: PathBuf,
    /// CRM membership list; every buyer is non-CRM when absent.
    pub crm: Option<PathBuf>,
    /// Promotion calendar; every day is an ordinary day when absent.
    pub promotions: Option<PathBuf>,
}

impl Default for InputPaths {
    fn default() -> Self {
        Self {
            new_orders: PathBuf::from("data/new_orders.xlsx"),
            catalog: PathBuf::from("data/catalog.xlsx"),
            refined_titles: PathBuf::from("data/refined_titles.xlsx"),
            regions: PathBuf::from("data/regions.xlsx"),
            crm: Some(PathBuf::from("data/crm.xlsx")),
            promotions: Some(PathBuf::from("data/promotions.xlsx")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub dir: PathBuf,
    /// Copy the previous history files aside before rewriting them.
    pub backup: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("archive"),
            backup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub report_file: String,
    pub paths_dir: String,
    pub rfm_export: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("report"),
            report_file: "report.xlsx".to_string(),
            paths_dir: "paths".to_string(),
            rfm_export: true,
        }
    }
}

impl OutputConfig {
    pub fn report_path(&self) -> PathBuf {
        self.dir.join(&self.report_file)
    }

    pub fn paths_path(&self) -> PathBuf {
        self.dir.join(&self.paths_dir)
    }
}

/// Thresholds for one association-rule table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RuleThresholds {
    pub min_support: f64,
    pub min_confidence: f64,
    pub min_lift: f64,
}

impl RuleThresholds {
    pub fn new(min_support: f64, min_confidence: f64, min_lift: f64) -> Self {
        Self {
            min_support,
            min_confidence,
            min_lift,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasketConfig {
    pub category_by_order: RuleThresholds,
    pub product_by_order: RuleThresholds,
    pub category_by_buyer: RuleThresholds,
    pub product_by_buyer: RuleThresholds,
}

impl Default for BasketConfig {
    fn default() -> Self {
        Self {
            category_by_order: RuleThresholds::new(0.02, 0.2, 1.0),
            product_by_order: RuleThresholds::new(0.01, 0.2, 1.0),
            category_by_buyer: RuleThresholds::new(0.01, 0.25, 1.0),
            product_by_buyer: RuleThresholds::new(0.01, 0.25, 1.0),
        }
    }
}

/// A product singled out in the outbreak-coefficient tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FocusProduct {
    pub product_id: String,
    pub label: String,
}

/// Explicit RFM thresholds; dataset means are used for any left unset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RfmThresholds {
    pub recency: Option<f64>,
    pub frequency: Option<f64>,
    pub monetary: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub max_level: usize,
    pub min_rate: f64,
    pub min_buyers: usize,
    pub entry_nth_order: i64,
    pub entry_min_rate: f64,
    pub entry_min_buyers: usize,
    /// Categories drawn as category purchase paths.
    pub categories: Vec<String>,
    /// Categories drawn with their products broken out.
    pub product_categories: Vec<String>,
    /// Conversion threshold for the first level of product paths.
    pub product_first_rate: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            max_level: 3,
            min_rate: 0.02,
            min_buyers: 200,
            entry_nth_order: 1,
            entry_min_rate: 0.05,
            entry_min_buyers: 500,
            categories: Vec::new(),
            product_categories: Vec::new(),
            product_first_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub basket: BasketConfig,
    /// Trailing window, in days, for promotion outbreak coefficients.
    pub outbreak_days: usize,
    #[serde(default)]
    pub focus_products: Vec<FocusProduct>,
    #[serde(default)]
    pub rfm: RfmThresholds,
    #[serde(default)]
    pub paths: PathConfig,
    /// Categories compared in the regional preference tables.
    #[serde(default)]
    pub favor_categories: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            basket: BasketConfig::default(),
            outbreak_days: 2,
            focus_products: Vec::new(),
            rfm: RfmThresholds::default(),
            paths: PathConfig::default(),
            favor_categories: Vec::new(),
        }
    }
}

fn default_column_map() -> BTreeMap<String, String> {
    [
        // marketplace order export
        ("订单编号", "order_id"),
        ("订单创建时间", "order_time"),
        ("总金额", "order_value"),
        ("宝贝标题", "items"),
        ("宝贝种类", "goods_type"),
        ("宝贝总数量", "goods_num"),
        ("买家会员名", "user_id"),
        ("收货地址", "address"),
        ("订单状态", "status"),
        // catalog
        ("sku_id", "product_id"),
        ("类别", "channel"),
        ("品类", "category"),
        // crm list
        ("客户ID", "user_id"),
        // promotion calendar
        ("起始日期", "start_date"),
        ("终止日期", "end_date"),
        ("促销活动", "promotion"),
        ("促销类型", "promo_type"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl InsightConfig {
    /// Load configuration from defaults, an optional TOML file and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        builder = match file {
            Some(path) => builder.add_source(
                config::File::from(path)
                    .required(true)
                    .format(config::FileFormat::Toml),
            ),
            None => builder.add_source(
                config::File::with_name("order_insight")
                    .required(false)
                    .format(config::FileFormat::Toml),
            ),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("ORDER_INSIGHT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_roundtrip_through_config_builder() {
        let cfg = InsightConfig::load(None).unwrap();
        assert_eq!(cfg.analysis.outbreak_days, 2);
        assert_eq!(cfg.analysis.paths.max_level, 3);
        assert_eq!(cfg.columns.get("订单编号").map(String::as_str), Some("order_id"));
        assert_eq!(
            cfg.analysis.basket.category_by_order,
            RuleThresholds::new(0.02, 0.2, 1.0)
        );
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[history]\ndir = \"elsewhere\"\nbackup = true\n\n[analysis]\noutbreak_days = 7\n"
        )
        .unwrap();

        let cfg = InsightConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.history.dir, PathBuf::from("elsewhere"));
        assert!(cfg.history.backup);
        assert_eq!(cfg.analysis.outbreak_days, 7);
        // untouched sections keep their defaults
        assert_eq!(cfg.output.report_file, "report.xlsx");
    }
}
