use thiserror::Error;

#[derive(Error, Debug)]
pub enum InsightError {
    #[error("Data not loaded: {0}")]
    NotLoaded(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(#[from] calamine::Error),

    #[error("Xlsx error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("InvalidData: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, InsightError>;

#[cfg(feature = "python")]
impl From<InsightError> for pyo3::PyErr {
    fn from(err: InsightError) -> pyo3::PyErr {
        pyo3::exceptions::PyRuntimeError::new_err(err.to_string())
    }
}
