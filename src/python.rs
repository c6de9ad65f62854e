use std::path::PathBuf;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyModule;
use pyo3_polars::PyDataFrame;

use crate::basket::{BasketItem, BasketUnit};
use crate::config::InsightConfig;
use crate::path::Pruning;
use crate::pipeline::{self, OrderAnalytics};
use crate::rebuy::RebuyField;
use crate::report::write_report;
use crate::schema;

fn load_config(config_path: Option<String>) -> PyResult<InsightConfig> {
    let path = config_path.map(PathBuf::from);
    Ok(InsightConfig::load(path.as_deref())?)
}

fn rebuy_field(name: &str) -> PyResult<RebuyField> {
    match name {
        "category" => Ok(RebuyField::Category),
        "product" => Ok(RebuyField::Product),
        "channel" => Ok(RebuyField::Channel),
        "province" => Ok(RebuyField::Province),
        "tier" => Ok(RebuyField::Tier),
        other => Err(PyValueError::new_err(format!(
            "Unknown rebuy field '{other}', expected category, product, channel, province or tier"
        ))),
    }
}

fn basket_kind(unit: &str, item: &str) -> PyResult<(BasketUnit, BasketItem)> {
    let unit = match unit {
        "order" => BasketUnit::Order,
        "buyer" => BasketUnit::Buyer,
        other => return Err(PyValueError::new_err(format!("Unknown basket unit '{other}'"))),
    };
    let item = match item {
        "category" => BasketItem::Category,
        "product" => BasketItem::Product,
        other => return Err(PyValueError::new_err(format!("Unknown basket item '{other}'"))),
    };
    Ok((unit, item))
}

#[pymethods]
impl OrderAnalytics {
    /// Analytics over the persisted history named by the configuration.
    #[new]
    #[pyo3(signature = (config_path=None))]
    fn py_new(config_path: Option<String>) -> PyResult<Self> {
        Ok(OrderAnalytics::from_history(&load_config(config_path)?)?)
    }

    fn orders(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.book().orders_frame()?))
    }

    fn lines(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.book().lines_frame()?))
    }

    fn monthly_summary(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.pattern()?.monthly))
    }

    fn daily_sales(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.pattern()?.daily))
    }

    #[pyo3(name = "rebuy_by")]
    fn py_rebuy_by(&self, field: &str) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.rebuy_by(rebuy_field(field)?)?))
    }

    #[pyo3(name = "interval_distribution")]
    fn py_interval_distribution(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.interval_distribution()?))
    }

    /// Returns `(by_type, by_promotion)`.
    fn outbreak_coefficients(&self) -> PyResult<(PyDataFrame, PyDataFrame)> {
        let tables = self.outbreak()?;
        Ok((PyDataFrame(tables.by_type), PyDataFrame(tables.by_promotion)))
    }

    /// Association rules for `unit` in ("order", "buyer") and `item` in
    /// ("category", "product").
    #[pyo3(signature = (unit="order", item="category"))]
    fn association_rules(&self, unit: &str, item: &str) -> PyResult<PyDataFrame> {
        let (unit, item) = basket_kind(unit, item)?;
        Ok(PyDataFrame(self.rules(unit, item)?))
    }

    fn rfm_segments(&self) -> PyResult<Option<PyDataFrame>> {
        Ok(self.rfm()?.map(|r| r.segment_table()).transpose()?.map(PyDataFrame))
    }

    fn rfm_customers(&self) -> PyResult<Option<PyDataFrame>> {
        Ok(self.rfm()?.map(|r| r.customers_frame()).transpose()?.map(PyDataFrame))
    }

    #[pyo3(name = "crm_comparison")]
    fn py_crm_comparison(&self) -> PyResult<PyDataFrame> {
        Ok(PyDataFrame(self.crm_comparison()?))
    }

    /// DOT source of the promotion-type purchase path.
    #[pyo3(signature = (max_level=3, min_rate=0.02, min_buyers=200))]
    fn promo_path_dot(&self, max_level: usize, min_rate: f64, min_buyers: usize) -> String {
        crate::path::PathAnalysis::new(self.book())
            .promo_path(max_level, Pruning::new(min_rate, min_buyers))
            .to_dot()
    }

    /// DOT sources of every configured path diagram, keyed by name.
    fn path_dots(&self) -> Vec<(String, String)> {
        self.paths()
            .iter()
            .map(|tree| (tree.name().to_string(), tree.to_dot()))
            .collect()
    }

    /// SVG drawings of every configured path diagram, keyed by name.
    fn path_svgs(&self) -> Vec<(String, String)> {
        self.paths()
            .iter()
            .map(|tree| (tree.name().to_string(), tree.to_svg()))
            .collect()
    }

    #[pyo3(name = "write_report")]
    fn py_write_report(&self, path: &str) -> PyResult<()> {
        write_report(&PathBuf::from(path), &self.report_tables()?)?;
        Ok(())
    }
}

/// Run the full pipeline; returns the run id.
#[pyfunction]
#[pyo3(signature = (config_path=None))]
fn run(config_path: Option<String>) -> PyResult<String> {
    let summary = pipeline::run(&load_config(config_path)?)?;
    Ok(summary.run_id.to_string())
}

/// Export schema constants as Python submodules
fn add_schema_exports(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Order
    let order = PyModule::new(m.py(), "order")?;
    order.add("ORDER_ID", schema::order::ORDER_ID)?;
    order.add("ORDER_TIME", schema::order::ORDER_TIME)?;
    order.add("DT", schema::order::DT)?;
    order.add("MONTH", schema::order::MONTH)?;
    order.add("ORDER_VALUE", schema::order::ORDER_VALUE)?;
    order.add("USER_ID", schema::order::USER_ID)?;
    order.add("PROVINCE", schema::order::PROVINCE)?;
    order.add("TIER", schema::order::TIER)?;
    order.add("IS_CRM", schema::order::IS_CRM)?;
    order.add("PROMOTION", schema::order::PROMOTION)?;
    order.add("PROMO_TYPE", schema::order::PROMO_TYPE)?;
    order.add("NTH_ORDER", schema::order::NTH_ORDER)?;
    order.add("IS_REBUY", schema::order::IS_REBUY)?;
    m.add_submodule(&order)?;

    // Line
    let line = PyModule::new(m.py(), "line")?;
    line.add("ORDER_ID", schema::line::ORDER_ID)?;
    line.add("PRODUCT_ID", schema::line::PRODUCT_ID)?;
    line.add("TITLE", schema::line::TITLE)?;
    line.add("TITLE_REFINED", schema::line::TITLE_REFINED)?;
    line.add("CHANNEL", schema::line::CHANNEL)?;
    line.add("CATEGORY", schema::line::CATEGORY)?;
    m.add_submodule(&line)?;

    // Sentinel
    let sentinel = PyModule::new(m.py(), "sentinel")?;
    sentinel.add("CRM", schema::sentinel::CRM)?;
    sentinel.add("NON_CRM", schema::sentinel::NON_CRM)?;
    sentinel.add("NO_PROMOTION", schema::sentinel::NO_PROMOTION)?;
    sentinel.add("ORDINARY_DAY", schema::sentinel::ORDINARY_DAY)?;
    m.add_submodule(&sentinel)?;

    Ok(())
}

#[pymodule]
fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<OrderAnalytics>()?;
    m.add_function(wrap_pyfunction!(run, m)?)?;
    add_schema_exports(m)?;
    Ok(())
}
