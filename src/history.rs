//! Append-only order history kept as two CSV files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{info, warn};

use crate::config::HistoryConfig;
use crate::error::Result;
use crate::model::{lines_from_frame, orders_from_frame, OrderBook};
use crate::table::{read_csv_as_strings, write_csv};

pub const ORDERS_FILE: &str = "orders.csv";
pub const LINES_FILE: &str = "lines.csv";

pub struct HistoryStore {
    dir: PathBuf,
    backup: bool,
}

impl HistoryStore {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            backup: config.backup,
        }
    }

    pub fn orders_path(&self) -> PathBuf {
        self.dir.join(ORDERS_FILE)
    }

    pub fn lines_path(&self) -> PathBuf {
        self.dir.join(LINES_FILE)
    }

    /// Load the persisted history; a store without files is empty.
    pub fn load(&self) -> Result<OrderBook> {
        let orders_path = self.orders_path();
        if !orders_path.exists() {
            info!(dir = %self.dir.display(), "no history found, starting empty");
            return Ok(OrderBook::default());
        }
        let orders = orders_from_frame(&read_csv_as_strings(&orders_path)?)?;

        let lines_path = self.lines_path();
        let lines = if lines_path.exists() {
            lines_from_frame(&read_csv_as_strings(&lines_path)?)?
        } else {
            warn!(path = %lines_path.display(), "order history has no line file");
            Vec::new()
        };

        info!(orders = orders.len(), lines = lines.len(), "history loaded");
        Ok(OrderBook::new(orders, lines))
    }

    /// Rewrite both files in full, backing up the previous ones if enabled.
    pub fn save(&self, book: &OrderBook) -> Result<()> {
        if self.backup {
            self.backup_existing()?;
        }
        write_csv(&mut book.orders_frame()?, &self.orders_path())?;
        write_csv(&mut book.lines_frame()?, &self.lines_path())?;
        info!(
            orders = book.orders.len(),
            lines = book.lines.len(),
            dir = %self.dir.display(),
            "history written"
        );
        Ok(())
    }

    fn backup_existing(&self) -> Result<()> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        for path in [self.orders_path(), self.lines_path()] {
            if path.exists() {
                let target = backup_path(&path, &stamp);
                std::fs::copy(&path, &target)?;
                info!(backup = %target.display(), "history backed up");
            }
        }
        Ok(())
    }
}

fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("history");
    path.with_file_name(format!("{stem}_bak_{stamp}.csv"))
}

/// Append a batch, skipping orders whose id is already present.
/// Returns the number of orders appended.
pub fn append(history: &mut OrderBook, batch: OrderBook) -> usize {
    let known: HashSet<String> = history.orders.iter().map(|o| o.order_id.clone()).collect();
    let mut added: HashSet<String> = HashSet::new();
    let before = history.orders.len();

    history.orders.extend(
        batch
            .orders
            .into_iter()
            .filter(|o| !known.contains(&o.order_id) && added.insert(o.order_id.clone())),
    );
    history
        .lines
        .extend(batch.lines.into_iter().filter(|l| !known.contains(&l.order_id)));

    history.orders.len() - before
}
