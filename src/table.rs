//! Table I/O shared by every stage.
//!
//! All input tables are loaded with every column as String dtype; typed
//! parsing happens in the stage that owns the column.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use calamine::DataType as _;
use calamine::{open_workbook_auto, Data, Reader};
use polars::prelude::*;
use tracing::debug;

use crate::error::{InsightError, Result};

/// Load a `.csv` or `.xlsx`/`.xls` table with all columns as strings.
/// Header whitespace is trimmed and `rename` is applied (ASCII case-insensitive).
pub fn read_table(path: &Path, rename: &BTreeMap<String, String>) -> Result<DataFrame> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let mut df = match ext.as_str() {
        "csv" => read_csv_as_strings(path)?,
        "xlsx" | "xlsm" | "xls" => read_xlsx_as_strings(path)?,
        other => {
            return Err(InsightError::InvalidData(format!(
                "Unsupported table format '.{}' for {}",
                other,
                path.display()
            )))
        }
    };

    let renamed: Vec<String> = df
        .get_column_names_str()
        .iter()
        .map(|c| {
            let trimmed = c.trim();
            rename
                .iter()
                .find(|(from, _)| from.eq_ignore_ascii_case(trimmed))
                .map(|(_, to)| to.clone())
                .unwrap_or_else(|| trimmed.to_string())
        })
        .collect();
    df.set_column_names(renamed.as_slice())?;

    debug!(path = %path.display(), rows = df.height(), "loaded table");
    Ok(df)
}

/// Read a CSV file with all columns as String dtype.
pub fn read_csv_as_strings(path: &Path) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0)) // all columns as String
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

/// Read the first worksheet of a workbook with all columns as String dtype.
/// The first row is the header; empty cells become nulls.
pub fn read_xlsx_as_strings(path: &Path) -> Result<DataFrame> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook.worksheet_range_at(0).ok_or_else(|| {
        InsightError::InvalidData(format!("Workbook {} has no sheets", path.display()))
    })??;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(DataFrame::empty());
    };
    let names: Vec<String> = header.iter().map(|c| cell_text(c).unwrap_or_default()).collect();

    let mut values: Vec<Vec<Option<String>>> = vec![Vec::new(); names.len()];
    for row in rows {
        if row.iter().all(|c| matches!(c, Data::Empty)) {
            continue;
        }
        for (j, column) in values.iter_mut().enumerate() {
            column.push(row.get(j).and_then(cell_text));
        }
    }

    let columns: Vec<Column> = names
        .iter()
        .zip(values.iter())
        .map(|(name, vals)| Column::new(name.as_str().into(), vals))
        .collect();
    Ok(DataFrame::new(columns)?)
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty => None,
        Data::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Data::Int(i) => Some(i.to_string()),
        // integral floats are ids or counts, keep them free of a ".0" suffix
        Data::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            Some(format!("{}", *f as i64))
        }
        Data::Float(f) => Some(f.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(_) => cell
            .as_datetime()
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
        Data::Error(_) => None,
    }
}

/// Write a DataFrame as CSV with header, creating the parent directory.
pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

pub fn require_columns(df: &DataFrame, required: &[&str]) -> Result<()> {
    for &col_name in required {
        if df.column(col_name).is_err() {
            return Err(InsightError::MissingColumn(col_name.to_string()));
        }
    }
    Ok(())
}

/// Owned, trimmed string values of a column; blank cells become `None`.
pub fn str_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let column = df
        .column(name)
        .map_err(|_| InsightError::MissingColumn(name.to_string()))?
        .cast(&DataType::String)?;
    Ok(column
        .str()?
        .into_iter()
        .map(|v| {
            v.map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .collect())
}

/// Like [`str_values`] but yields all-`None` when the column is absent.
pub fn optional_str_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    if df.column(name).is_err() {
        return Ok(vec![None; df.height()]);
    }
    str_values(df, name)
}

/// `part / whole`, or 0 when `whole` is 0.
pub fn ratio(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part / whole
    }
}

/// Expression form of [`ratio`]: Float64 division, 0 when `whole` is 0.
pub fn ratio_expr(part: Expr, whole: Expr) -> Expr {
    let whole = whole.cast(DataType::Float64);
    when(whole.clone().eq(lit(0.0)))
        .then(lit(0.0))
        .otherwise(part.cast(DataType::Float64) / whole)
}

/// Row-order column added by [`ranked_rows`].
pub const RANK: &str = "_rank";

/// The rows a table must always list, with a [`RANK`] column that restores
/// their order after joins.
pub fn ranked_rows(mut columns: Vec<Column>) -> Result<DataFrame> {
    let n = columns.first().map_or(0, |c| c.len());
    columns.push(Column::new(RANK.into(), (0..n as i64).collect::<Vec<_>>()));
    Ok(DataFrame::new(columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_csv_headers_trimmed_and_renamed() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "订单编号 , SKU_ID,plain\n1001,42,x\n1002,,y").unwrap();

        let rename: BTreeMap<String, String> = [
            ("订单编号".to_string(), "order_id".to_string()),
            ("sku_id".to_string(), "product_id".to_string()),
        ]
        .into_iter()
        .collect();

        let df = read_table(file.path(), &rename).unwrap();
        assert_eq!(
            df.get_column_names_str(),
            vec!["order_id", "product_id", "plain"]
        );
        assert_eq!(
            str_values(&df, "product_id").unwrap(),
            vec![Some("42".to_string()), None]
        );
    }

    #[test]
    fn test_missing_column_reported() {
        let df = DataFrame::new(vec![Column::new("a".into(), &["1"])]).unwrap();
        let err = require_columns(&df, &["a", "b"]).unwrap_err();
        assert!(matches!(err, InsightError::MissingColumn(c) if c == "b"));
        assert_eq!(optional_str_values(&df, "b").unwrap(), vec![None]);
    }

    #[test]
    fn test_ratio_and_ratio_expr() {
        assert_eq!(ratio(1.0, 0.0), 0.0);
        assert_eq!(ratio(1.0, 4.0), 0.25);

        let df = ranked_rows(vec![
            Column::new("part".into(), &[0i64, 2, 1, 3]),
            Column::new("whole".into(), &[0i64, 0, 4, 4]),
        ])
        .unwrap()
        .lazy()
        .select([ratio_expr(col("part"), col("whole")).alias("share"), col(RANK)])
        .collect()
        .unwrap();
        let share: Vec<f64> = df.column("share").unwrap().f64().unwrap().into_no_null_iter().collect();
        assert_eq!(share, vec![0.0, 0.0, 0.25, 0.75]);
        let rank: Vec<i64> = df.column(RANK).unwrap().i64().unwrap().into_no_null_iter().collect();
        assert_eq!(rank, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = read_table(Path::new("orders.parquet"), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, InsightError::InvalidData(_)));
    }

    #[test]
    fn test_write_then_read_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.csv");
        let mut df = DataFrame::new(vec![
            Column::new("id".into(), &["a", "b"]),
            Column::new("n".into(), &[1i64, 2]),
        ])
        .unwrap();
        write_csv(&mut df, &path).unwrap();

        let back = read_csv_as_strings(&path).unwrap();
        assert_eq!(back.height(), 2);
        assert_eq!(
            str_values(&back, "n").unwrap(),
            vec![Some("1".to_string()), Some("2".to_string())]
        );
    }
}
