// ABOUTME: Table selection filters applied before a table is synced
// ABOUTME: Intersects a db.table allow-list with the incremental-only/skip-incremental flags

use crate::config::{TableKey, TableSyncSpec};
use anyhow::{bail, Result};

/// Which configured tables a run should touch.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    tables: Option<Vec<String>>, // Format: "db.table"
    incremental_only: bool,
    skip_incremental: bool,
}

impl SelectionFilter {
    /// Creates a filter from CLI arguments
    pub fn new(
        tables: Option<Vec<String>>,
        incremental_only: bool,
        skip_incremental: bool,
    ) -> Result<Self> {
        if incremental_only && skip_incremental {
            bail!("Cannot use both --incremental-only and --skip-incremental");
        }

        let tables = match tables {
            Some(list) => {
                let mut cleaned = Vec::with_capacity(list.len());
                for table in list {
                    let table = table.trim().to_string();
                    match table.split_once('.') {
                        Some((db, name)) if !db.is_empty() && !name.is_empty() => {
                            cleaned.push(table)
                        }
                        _ => bail!(
                            "Table must be specified as 'database.table', got '{}'",
                            table
                        ),
                    }
                }
                Some(cleaned)
            }
            None => None,
        };

        Ok(Self {
            tables,
            incremental_only,
            skip_incremental,
        })
    }

    /// Creates an empty filter (sync everything)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_none() && !self.incremental_only && !self.skip_incremental
    }

    pub fn tables(&self) -> Option<&Vec<String>> {
        self.tables.as_ref()
    }

    /// Checks whether any table of a database could be selected
    pub fn should_sync_database(&self, db_name: &str) -> bool {
        match &self.tables {
            Some(tables) => tables
                .iter()
                .any(|t| t.split_once('.').map(|(db, _)| db) == Some(db_name)),
            None => true,
        }
    }

    /// Checks whether one table spec passes every active filter.
    pub fn should_sync(&self, key: &TableKey, spec: &TableSyncSpec) -> bool {
        if let Some(tables) = &self.tables {
            let qualified = key.qualified_name();
            if !tables.iter().any(|t| *t == qualified) {
                return false;
            }
        }
        if self.incremental_only && !spec.incremental {
            return false;
        }
        if self.skip_incremental && spec.incremental {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, incremental: bool) -> TableSyncSpec {
        let mut spec = TableSyncSpec::new(name);
        spec.incremental = incremental;
        spec.incremental_column = Some("id".to_string());
        spec
    }

    #[test]
    fn test_new_rejects_conflicting_mode_flags() {
        let result = SelectionFilter::new(None, true, true);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Cannot use both --incremental-only and --skip-incremental"));
    }

    #[test]
    fn test_new_validates_table_format() {
        for bad in ["orders", ".orders", "shop."] {
            let result = SelectionFilter::new(Some(vec![bad.to_string()]), false, false);
            assert!(result.is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_empty_filter_selects_everything() {
        let filter = SelectionFilter::empty();
        assert!(filter.is_empty());
        assert!(filter.should_sync(&TableKey::new("shop", 0, "orders"), &spec("orders", true)));
        assert!(filter.should_sync(&TableKey::new("shop", 1, "users"), &spec("users", false)));
    }

    #[test]
    fn test_allow_list_matches_database_and_table() {
        let filter =
            SelectionFilter::new(Some(vec![" shop.orders ".to_string()]), false, false).unwrap();
        assert!(filter.should_sync_database("shop"));
        assert!(!filter.should_sync_database("crm"));
        assert!(filter.should_sync(&TableKey::new("shop", 0, "orders"), &spec("orders", false)));
        assert!(!filter.should_sync(&TableKey::new("shop", 1, "users"), &spec("users", false)));
        assert!(!filter.should_sync(&TableKey::new("crm", 0, "orders"), &spec("orders", false)));
    }

    #[test]
    fn test_filters_are_intersected() {
        let filter =
            SelectionFilter::new(Some(vec!["shop.orders".to_string()]), true, false).unwrap();
        let key = TableKey::new("shop", 0, "orders");
        assert!(filter.should_sync(&key, &spec("orders", true)));
        assert!(!filter.should_sync(&key, &spec("orders", false)));

        let filter = SelectionFilter::new(None, false, true).unwrap();
        assert!(!filter.should_sync(&key, &spec("orders", true)));
        assert!(filter.should_sync(&key, &spec("orders", false)));
    }
}
