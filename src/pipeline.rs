//! Stage orchestration for one batch run, and the analytics object that
//! serves every report table from a merged order book.

use std::path::PathBuf;

use polars::prelude::DataFrame;
use tracing::{info, info_span};
use uuid::Uuid;

use crate::basket::{BasketAnalysis, BasketItem, BasketUnit};
use crate::catalog::{Catalogs, PromotionCalendar};
use crate::config::{AnalysisConfig, InsightConfig, RuleThresholds};
use crate::enrich::enrich;
use crate::error::{InsightError, Result};
use crate::history::{self, HistoryStore};
use crate::ingest::{ingest, IngestStats};
use crate::model::OrderBook;
use crate::path::{Diagram, PathAnalysis, PathTree};
use crate::pattern::{self, PatternTables};
use crate::rebuy::{OutbreakTables, RebuyAnalysis, RebuyField};
use crate::report::{write_report, write_rfm_export, ReportTables};
use crate::segment::{RfmResult, Segmentation};
use crate::sequence;
use crate::table::read_table;

/// What a run did, for the caller to log or inspect.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub stats: IngestStats,
    /// New orders dropped because their id was already in history.
    pub skipped: usize,
    pub appended: usize,
    pub total_orders: usize,
    pub report: PathBuf,
    pub diagrams: Vec<Diagram>,
    pub rfm_export: Option<PathBuf>,
}

/// Run every stage in order. History is only rewritten after the new batch
/// has been ingested, enriched and numbered; nothing guards against two
/// runs sharing a history directory at the same time.
pub fn run(config: &InsightConfig) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    let _guard = span.enter();
    info!(input = %config.inputs.new_orders.display(), "run started");

    let catalogs = Catalogs::load(config)?;

    let export = read_table(&config.inputs.new_orders, &config.columns)?;
    let batch = ingest(&export, &catalogs.products)?;
    let stats = batch.stats;
    let mut fresh = enrich(batch, &catalogs)?;

    let store = HistoryStore::new(&config.history);
    let mut merged = store.load()?;
    let skipped = sequence::drop_known(&mut fresh, &merged.orders);
    sequence::assign(&mut fresh.orders, &sequence::baselines(&merged.orders));
    let appended = history::append(&mut merged, fresh);
    store.save(&merged)?;

    let analytics = OrderAnalytics::new(merged, catalogs.promotions, config.analysis.clone());

    let report = config.output.report_path();
    write_report(&report, &analytics.report_tables()?)?;

    let diagrams = PathAnalysis::new(analytics.book())
        .write_all(&config.analysis.paths, &config.output.paths_path())?;

    let rfm_export = match (config.output.rfm_export, analytics.rfm()?) {
        (true, Some(rfm)) => {
            let path = config.output.dir.join(rfm.export_file_name());
            write_rfm_export(&path, &rfm)?;
            Some(path)
        }
        _ => None,
    };

    info!(
        raw_orders = stats.raw_orders,
        duplicate_orders = stats.duplicate_orders,
        valid_orders = stats.valid_orders,
        valid_lines = stats.valid_lines,
        usable_lines = stats.usable_lines,
        usable_orders = stats.usable_orders,
        skipped,
        appended,
        total_orders = analytics.book().orders.len(),
        "run finished"
    );

    Ok(RunSummary {
        run_id,
        stats,
        skipped,
        appended,
        total_orders: analytics.book().orders.len(),
        report,
        diagrams,
        rfm_export,
    })
}

/// Analytics over a merged order book.
#[cfg_attr(feature = "python", pyo3::pyclass)]
pub struct OrderAnalytics {
    book: OrderBook,
    promotions: PromotionCalendar,
    analysis: AnalysisConfig,
}

impl OrderAnalytics {
    pub fn new(book: OrderBook, promotions: PromotionCalendar, analysis: AnalysisConfig) -> Self {
        Self {
            book,
            promotions,
            analysis,
        }
    }

    /// Analytics over the persisted history alone, without ingesting a batch.
    /// Fails with `NotLoaded` when no orders have been persisted yet.
    pub fn from_history(config: &InsightConfig) -> Result<Self> {
        let store = HistoryStore::new(&config.history);
        let book = store.load()?;
        if book.is_empty() {
            return Err(InsightError::NotLoaded(format!(
                "order history at {}",
                store.orders_path().display()
            )));
        }
        let promotions = match &config.inputs.promotions {
            Some(path) => PromotionCalendar::from_frame(&read_table(path, &config.columns)?)?,
            None => PromotionCalendar::default(),
        };
        Ok(Self::new(book, promotions, config.analysis.clone()))
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    pub fn analysis(&self) -> &AnalysisConfig {
        &self.analysis
    }

    pub fn pattern(&self) -> Result<PatternTables> {
        pattern::analyze(&self.book)
    }

    pub fn rebuy_by(&self, field: RebuyField) -> Result<DataFrame> {
        RebuyAnalysis::new(&self.book).rebuy_by(field)
    }

    pub fn interval_distribution(&self) -> Result<DataFrame> {
        RebuyAnalysis::new(&self.book).interval_distribution()
    }

    pub fn outbreak(&self) -> Result<OutbreakTables> {
        RebuyAnalysis::new(&self.book).outbreak_coefficients(
            &self.promotions,
            self.analysis.outbreak_days,
            &self.analysis.focus_products,
        )
    }

    /// Configured rule thresholds for a basket unit and item kind.
    pub fn thresholds(&self, unit: BasketUnit, item: BasketItem) -> RuleThresholds {
        let basket = &self.analysis.basket;
        match (unit, item) {
            (BasketUnit::Order, BasketItem::Category) => basket.category_by_order,
            (BasketUnit::Order, BasketItem::Product) => basket.product_by_order,
            (BasketUnit::Buyer, BasketItem::Category) => basket.category_by_buyer,
            (BasketUnit::Buyer, BasketItem::Product) => basket.product_by_buyer,
        }
    }

    pub fn rules(&self, unit: BasketUnit, item: BasketItem) -> Result<DataFrame> {
        BasketAnalysis::new(&self.book).rules_frame(unit, item, &self.thresholds(unit, item))
    }

    pub fn rfm(&self) -> Result<Option<RfmResult>> {
        Segmentation::new(&self.book).rfm(&self.analysis.rfm)
    }

    pub fn crm_comparison(&self) -> Result<DataFrame> {
        Segmentation::new(&self.book).crm_comparison()
    }

    /// Store-wide category share and the per-province share matrix.
    pub fn province_favor(&self) -> Result<(DataFrame, DataFrame)> {
        Segmentation::new(&self.book).province_category_favor(&self.analysis.favor_categories)
    }

    pub fn paths(&self) -> Vec<PathTree> {
        PathAnalysis::new(&self.book).trees(&self.analysis.paths)
    }

    pub fn report_tables(&self) -> Result<ReportTables> {
        let rebuy = RebuyAnalysis::new(&self.book);
        let (category_share, province_favor) = self.province_favor()?;
        let rfm = self.rfm()?;

        Ok(ReportTables {
            pattern: self.pattern()?,
            category_rebuy: rebuy.rebuy_by(RebuyField::Category)?,
            channel_rebuy: rebuy.rebuy_by(RebuyField::Channel)?,
            intervals: rebuy.interval_distribution()?,
            product_rebuy: rebuy.rebuy_by(RebuyField::Product)?,
            outbreak: self.outbreak()?,
            outbreak_days: self.analysis.outbreak_days,
            order_category_rules: self.rules(BasketUnit::Order, BasketItem::Category)?,
            order_product_rules: self.rules(BasketUnit::Order, BasketItem::Product)?,
            buyer_category_rules: self.rules(BasketUnit::Buyer, BasketItem::Category)?,
            buyer_product_rules: self.rules(BasketUnit::Buyer, BasketItem::Product)?,
            province_rebuy: rebuy.rebuy_by(RebuyField::Province)?,
            tier_rebuy: rebuy.rebuy_by(RebuyField::Tier)?,
            category_share,
            province_favor,
            crm_comparison: self.crm_comparison()?,
            rfm_segments: rfm.as_ref().map(RfmResult::segment_table).transpose()?,
            rfm_thresholds: rfm.as_ref().map(|r| r.thresholds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{line, order};

    fn analytics() -> OrderAnalytics {
        let mut second = order("o2", "u1", "2024-01-08 10:00:00", 30.0);
        second.nth_order = 2;
        second.is_rebuy = true;
        let book = OrderBook::new(
            vec![
                order("o1", "u1", "2024-01-01 10:00:00", 20.0),
                second,
                order("o3", "u2", "2024-01-02 10:00:00", 15.0),
            ],
            vec![
                line("o1", "p1", "sauce", "RT"),
                line("o2", "p1", "sauce", "RT"),
                line("o3", "p2", "spice", "FS"),
            ],
        );
        OrderAnalytics::new(book, PromotionCalendar::default(), AnalysisConfig::default())
    }

    #[test]
    fn test_thresholds_follow_unit_and_item() {
        let a = analytics();
        let basket = &a.analysis().basket;
        assert_eq!(
            a.thresholds(BasketUnit::Buyer, BasketItem::Product),
            basket.product_by_buyer
        );
        assert_eq!(
            a.thresholds(BasketUnit::Order, BasketItem::Category),
            basket.category_by_order
        );
    }

    #[test]
    fn test_empty_history_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = InsightConfig::default();
        config.history.dir = dir.path().join("archive");
        assert!(matches!(
            OrderAnalytics::from_history(&config),
            Err(InsightError::NotLoaded(_))
        ));
    }

    #[test]
    fn test_report_tables_cover_the_book() {
        let tables = analytics().report_tables().unwrap();
        assert_eq!(tables.category_rebuy.height(), 2);
        assert_eq!(tables.rfm_segments.unwrap().height(), 8);
        assert!(tables.rfm_thresholds.is_some());
        // no promotion windows, no coefficients
        assert!(tables.outbreak.is_empty());
    }
}
