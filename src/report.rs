//! Multi-sheet XLSX report assembly.
//!
//! Each analysis module hands over plain DataFrames; this module only lays
//! them out. Sheets start with a short table of contents, then sections of
//! captioned tables stacked top to bottom from column B.

use std::path::Path;

use polars::prelude::*;
use rust_xlsxwriter::{Chart, ChartType, ColNum, Format, RowNum, Workbook, Worksheet};
use tracing::info;

use crate::error::Result;
use crate::pattern::PatternTables;
use crate::rebuy::OutbreakTables;
use crate::segment::{AppliedThresholds, RfmResult};

pub const PATTERN_SHEET: &str = "1-order-pattern";
pub const DAILY_SHEET: &str = "A1-daily-sales";
pub const CATEGORY_SHEET: &str = "2-category-rebuy";
pub const PRODUCT_SHEET: &str = "3-product-rebuy";
pub const ORDER_BASKET_SHEET: &str = "4-order-basket";
pub const BUYER_BASKET_SHEET: &str = "5-buyer-basket";
pub const REGION_SHEET: &str = "6-region-rfm";

pub const SHEETS: [&str; 7] = [
    PATTERN_SHEET,
    DAILY_SHEET,
    CATEGORY_SHEET,
    PRODUCT_SHEET,
    ORDER_BASKET_SHEET,
    BUYER_BASKET_SHEET,
    REGION_SHEET,
];

const CHART_ROWS: RowNum = 16;

/// Everything the report shows.
pub struct ReportTables {
    pub pattern: PatternTables,
    pub category_rebuy: DataFrame,
    pub channel_rebuy: DataFrame,
    pub intervals: DataFrame,
    pub product_rebuy: DataFrame,
    pub outbreak: OutbreakTables,
    pub outbreak_days: usize,
    pub order_category_rules: DataFrame,
    pub order_product_rules: DataFrame,
    pub buyer_category_rules: DataFrame,
    pub buyer_product_rules: DataFrame,
    pub province_rebuy: DataFrame,
    pub tier_rebuy: DataFrame,
    pub category_share: DataFrame,
    pub province_favor: DataFrame,
    pub crm_comparison: DataFrame,
    pub rfm_segments: Option<DataFrame>,
    pub rfm_thresholds: Option<AppliedThresholds>,
}

struct Styles {
    header: Format,
    bold: Format,
    decimal: Format,
}

impl Styles {
    fn new() -> Self {
        Self {
            header: Format::new().set_bold().set_background_color("#DDEBF7"),
            bold: Format::new().set_bold(),
            decimal: Format::new().set_num_format("0.000"),
        }
    }
}

/// Write a frame with its header at `(row, col)`; returns the rows used.
fn write_frame(
    sheet: &mut Worksheet,
    row: RowNum,
    col: ColNum,
    df: &DataFrame,
    styles: &Styles,
) -> Result<RowNum> {
    for (j, column) in df.get_columns().iter().enumerate() {
        let c = col + j as ColNum;
        sheet.write_string_with_format(row, c, column.name().as_str(), &styles.header)?;
        for i in 0..df.height() {
            write_cell(sheet, row + 1 + i as RowNum, c, column.get(i)?, styles)?;
        }
    }
    Ok(df.height() as RowNum + 1)
}

fn write_cell(
    sheet: &mut Worksheet,
    row: RowNum,
    col: ColNum,
    value: AnyValue<'_>,
    styles: &Styles,
) -> Result<()> {
    match value {
        AnyValue::Null => {}
        AnyValue::String(s) => {
            sheet.write_string(row, col, s)?;
        }
        AnyValue::StringOwned(s) => {
            sheet.write_string(row, col, s.as_str())?;
        }
        AnyValue::Boolean(b) => {
            sheet.write_boolean(row, col, b)?;
        }
        AnyValue::Float64(v) => write_float(sheet, row, col, v, styles)?,
        AnyValue::Float32(v) => write_float(sheet, row, col, v as f64, styles)?,
        other => match other.extract::<f64>() {
            Some(v) => {
                sheet.write_number(row, col, v)?;
            }
            None => {
                sheet.write_string(row, col, &other.to_string())?;
            }
        },
    }
    Ok(())
}

fn write_float(sheet: &mut Worksheet, row: RowNum, col: ColNum, v: f64, styles: &Styles) -> Result<()> {
    // NaN and infinities stay blank
    if v.is_finite() {
        sheet.write_number_with_format(row, col, v, &styles.decimal)?;
    }
    Ok(())
}

/// Top-to-bottom writer for one report sheet.
struct SheetCursor<'a> {
    sheet: &'a mut Worksheet,
    styles: &'a Styles,
    row: RowNum,
}

impl<'a> SheetCursor<'a> {
    fn new(sheet: &'a mut Worksheet, styles: &'a Styles) -> Self {
        Self {
            sheet,
            styles,
            row: 1,
        }
    }

    fn contents(&mut self, entries: &[&str]) -> Result<()> {
        self.sheet.write_string(self.row, 0, "Contents")?;
        for entry in entries {
            self.sheet.write_string(self.row, 1, *entry)?;
            self.row += 1;
        }
        self.row += 2;
        Ok(())
    }

    fn section(&mut self, title: &str) -> Result<()> {
        self.sheet
            .write_string_with_format(self.row, 1, title, &self.styles.bold)?;
        self.row += 1;
        Ok(())
    }

    fn note(&mut self, term: &str, text: &str) -> Result<()> {
        if !term.is_empty() {
            self.sheet.write_string(self.row, 1, term)?;
        }
        self.sheet.write_string(self.row, 2, text)?;
        self.row += 1;
        Ok(())
    }

    fn table(&mut self, caption: &str, df: &DataFrame) -> Result<()> {
        self.sheet.write_string(self.row, 1, caption)?;
        self.row += 1;
        if df.width() == 0 || df.height() == 0 {
            self.sheet.write_string(self.row, 1, "(no data)")?;
            self.row += 3;
            return Ok(());
        }
        self.row += write_frame(self.sheet, self.row, 1, df, self.styles)?;
        self.row += 2;
        Ok(())
    }

    fn gap(&mut self) {
        self.row += 1;
    }
}

/// Render the full report to `path`.
pub fn write_report(path: &Path, tables: &ReportTables) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let styles = Styles::new();
    let mut workbook = Workbook::new();

    pattern_sheet(workbook.add_worksheet().set_name(PATTERN_SHEET)?, tables, &styles)?;
    daily_sheet(workbook.add_worksheet().set_name(DAILY_SHEET)?, &tables.pattern.daily, &styles)?;
    category_sheet(workbook.add_worksheet().set_name(CATEGORY_SHEET)?, tables, &styles)?;
    product_sheet(workbook.add_worksheet().set_name(PRODUCT_SHEET)?, tables, &styles)?;
    basket_sheet(
        workbook.add_worksheet().set_name(ORDER_BASKET_SHEET)?,
        "order",
        &tables.order_category_rules,
        &tables.order_product_rules,
        &styles,
    )?;
    basket_sheet(
        workbook.add_worksheet().set_name(BUYER_BASKET_SHEET)?,
        "buyer",
        &tables.buyer_category_rules,
        &tables.buyer_product_rules,
        &styles,
    )?;
    region_sheet(workbook.add_worksheet().set_name(REGION_SHEET)?, tables, &styles)?;

    workbook.save(path)?;
    info!(path = %path.display(), sheets = SHEETS.len(), "report written");
    Ok(())
}

fn pattern_sheet(sheet: &mut Worksheet, tables: &ReportTables, styles: &Styles) -> Result<()> {
    sheet.set_column_width(1, 22)?;
    let p = &tables.pattern;
    let mut cur = SheetCursor::new(sheet, styles);
    cur.contents(&[
        "1 order distribution",
        "2 order value distribution",
        "3 channel sales",
        "4 order counts per buyer",
    ])?;

    cur.section("1 order distribution")?;
    cur.table("Table 1 orders by month", &p.monthly)?;
    cur.table("Table 2 ordinary days by weekday", &p.weekday)?;
    cur.sheet.write_string(cur.row, 1, "Figure 1 daily GMV")?;
    cur.row += 1;
    let days = p.daily.height() as RowNum;
    if days > 0 {
        let mut chart = Chart::new(ChartType::Line);
        chart
            .add_series()
            .set_categories((DAILY_SHEET, 1, 0, days, 0))
            .set_values((DAILY_SHEET, 1, 1, days, 1));
        chart.x_axis().set_name("date");
        chart.y_axis().set_name("gmv");
        chart.legend().set_hidden();
        chart.set_width(1200).set_height(300);
        cur.sheet.insert_chart(cur.row, 1, &chart)?;
    }
    cur.row += CHART_ROWS;

    cur.section("2 order value distribution")?;
    cur.table("Table 3 order value by month", &p.value_by_month)?;
    cur.table("Table 4 order value by CRM flag", &p.value_by_crm)?;

    cur.section("3 channel sales")?;
    cur.table("Table 5 single-channel orders", &p.channel_sales)?;
    cur.table("Table 6 monthly GMV index per channel", &p.channel_index)?;
    cur.table("Table 7 cumulative buyers by channel", &p.channel_audience)?;

    cur.section("4 order counts per buyer")?;
    cur.table("Table 8 buyers by order count", &p.order_counts)?;
    cur.table("Table 9 orders by sequence number", &p.nth_orders)?;
    Ok(())
}

fn daily_sheet(sheet: &mut Worksheet, daily: &DataFrame, styles: &Styles) -> Result<()> {
    sheet.set_column_width(0, 12)?;
    write_frame(sheet, 0, 0, daily, styles)?;
    Ok(())
}

fn category_sheet(sheet: &mut Worksheet, tables: &ReportTables, styles: &Styles) -> Result<()> {
    sheet.set_column_width(1, 18)?;
    let mut cur = SheetCursor::new(sheet, styles);
    cur.contents(&["1 orders and repeat rate", "2 repeat intervals"])?;

    cur.section("1 orders and repeat rate")?;
    cur.table("Table 1 repeat purchase by category", &tables.category_rebuy)?;
    cur.table("Table 2 repeat purchase by channel", &tables.channel_rebuy)?;

    cur.section("2 repeat intervals")?;
    cur.table("Table 3 repeat interval share by category", &tables.intervals)?;
    Ok(())
}

fn product_sheet(sheet: &mut Worksheet, tables: &ReportTables, styles: &Styles) -> Result<()> {
    sheet.set_column_width(1, 16)?;
    sheet.set_column_width(2, 32)?;
    let mut cur = SheetCursor::new(sheet, styles);
    cur.contents(&["1 repeat purchase by product", "2 promotion outbreak"])?;

    cur.section("1 repeat purchase by product")?;
    cur.table("Table 1 repeat purchase by product", &tables.product_rebuy)?;

    let n = tables.outbreak_days;
    cur.section("2 promotion outbreak")?;
    cur.table(
        &format!("Table 2 outbreak by promotion type ({n} days before)"),
        &tables.outbreak.by_type,
    )?;
    cur.table(
        &format!("Table 3 outbreak by promotion ({n} days before)"),
        &tables.outbreak.by_promotion,
    )?;
    Ok(())
}

fn basket_sheet(
    sheet: &mut Worksheet,
    unit: &str,
    category_rules: &DataFrame,
    product_rules: &DataFrame,
    styles: &Styles,
) -> Result<()> {
    sheet.set_column_width(1, 24)?;
    sheet.set_column_width(2, 24)?;
    let category_title = format!("1 categories bought together by one {unit}");
    let product_title = format!("2 products bought together by one {unit}");
    let mut cur = SheetCursor::new(sheet, styles);
    cur.contents(&["0 terms", category_title.as_str(), product_title.as_str()])?;

    cur.section("0 terms")?;
    cur.note(
        "support",
        &format!("Share of {unit} baskets containing both A and B."),
    )?;
    cur.note(
        "confidence",
        &format!("Share of {unit} baskets with A that also contain B."),
    )?;
    cur.note(
        "lift",
        "Support of A and B over the product of their separate supports.",
    )?;
    cur.note("", "A lift of 1 means A and B are bought independently.")?;
    cur.gap();

    cur.section(&category_title)?;
    cur.table("Table 1 category association rules", category_rules)?;

    cur.section(&product_title)?;
    cur.table("Table 2 product association rules", product_rules)?;
    Ok(())
}

fn region_sheet(sheet: &mut Worksheet, tables: &ReportTables, styles: &Styles) -> Result<()> {
    sheet.set_column_width(1, 18)?;
    let mut cur = SheetCursor::new(sheet, styles);
    cur.contents(&["1 regions", "2 CRM buyers", "3 RFM segments"])?;

    cur.section("1 regions")?;
    cur.table("Table 1 repeat purchase by province", &tables.province_rebuy)?;
    cur.table("Table 2 repeat purchase by city tier", &tables.tier_rebuy)?;
    cur.table("Table 3 store-wide category share", &tables.category_share)?;
    cur.table("Table 4 category share by province", &tables.province_favor)?;

    cur.section("2 CRM buyers")?;
    cur.table("Table 5 CRM and non-CRM buyers", &tables.crm_comparison)?;

    cur.section("3 RFM segments")?;
    if let Some(t) = &tables.rfm_thresholds {
        cur.note(
            "thresholds",
            &format!(
                "recency {:.1} days, frequency {:.2} orders, monetary {:.2}",
                t.recency, t.frequency, t.monetary
            ),
        )?;
    }
    match &tables.rfm_segments {
        Some(df) => cur.table("Table 6 buyers per RFM segment", df)?,
        None => cur.note("", "No buyers to segment.")?,
    }
    Ok(())
}

/// Per-customer RFM export, one row per buyer.
pub fn write_rfm_export(path: &Path, rfm: &RfmResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let styles = Styles::new();
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet().set_name("rfm")?;
    write_frame(sheet, 0, 0, &rfm.customers_frame()?, &styles)?;
    workbook.save(path)?;
    info!(path = %path.display(), buyers = rfm.customers.len(), "rfm export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use calamine::{open_workbook, Data, Reader, Xlsx};
    use chrono::NaiveDate;

    use super::*;
    use crate::segment::{CustomerRfm, RfmSegment};
    use crate::table::read_xlsx_as_strings;

    fn small() -> DataFrame {
        df!(
            "dt" => ["2024-01-01", "2024-01-02"],
            "gmv" => [10.5, 20.0],
        )
        .unwrap()
    }

    fn tables() -> ReportTables {
        let f = small();
        ReportTables {
            pattern: PatternTables {
                monthly: f.clone(),
                weekday: f.clone(),
                daily: f.clone(),
                value_by_month: f.clone(),
                value_by_crm: f.clone(),
                channel_sales: f.clone(),
                channel_index: f.clone(),
                channel_audience: f.clone(),
                order_counts: f.clone(),
                nth_orders: f.clone(),
            },
            category_rebuy: f.clone(),
            channel_rebuy: f.clone(),
            intervals: f.clone(),
            product_rebuy: f.clone(),
            outbreak: OutbreakTables {
                by_type: DataFrame::empty(),
                by_promotion: DataFrame::empty(),
            },
            outbreak_days: 2,
            order_category_rules: f.clone(),
            order_product_rules: DataFrame::empty(),
            buyer_category_rules: f.clone(),
            buyer_product_rules: f.clone(),
            province_rebuy: f.clone(),
            tier_rebuy: f.clone(),
            category_share: f.clone(),
            province_favor: f.clone(),
            crm_comparison: f,
            rfm_segments: None,
            rfm_thresholds: None,
        }
    }

    #[test]
    fn test_report_has_fixed_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.xlsx");
        write_report(&path, &tables()).unwrap();

        let mut workbook: Xlsx<_> = open_workbook(&path).unwrap();
        assert_eq!(workbook.sheet_names(), SHEETS.to_vec());

        let daily = workbook.worksheet_range(DAILY_SHEET).unwrap();
        assert_eq!(daily.get_value((0, 0)), Some(&Data::String("dt".to_string())));
        assert_eq!(daily.get_value((1, 0)), Some(&Data::String("2024-01-01".to_string())));
        assert_eq!(daily.get_value((2, 1)), Some(&Data::Float(20.0)));
    }

    #[test]
    fn test_rfm_export_round_trip() {
        let rfm = RfmResult {
            customers: vec![CustomerRfm {
                user_id: "u1".to_string(),
                is_crm: "CRM".to_string(),
                recency: 3,
                frequency: 2,
                monetary: 40.0,
                segment: RfmSegment::classify(true, true, true),
            }],
            thresholds: AppliedThresholds {
                recency: 5.0,
                frequency: 1.5,
                monetary: 30.0,
            },
            cutoff: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(rfm.export_file_name());
        write_rfm_export(&path, &rfm).unwrap();

        let df = read_xlsx_as_strings(&path).unwrap();
        assert_eq!(df.height(), 1);
        let users = df.column("user_id").unwrap().str().unwrap();
        assert_eq!(users.get(0), Some("u1"));
        let frequency = df.column("frequency").unwrap().str().unwrap();
        assert_eq!(frequency.get(0), Some("2"));
    }
}
