pub mod agenda;
pub mod window;

use std::sync::Arc;

use anyhow::Result;
use datebook_core::backend::Backend;
use datebook_core::preferences::FilePreferences;
use datebook_core::window::parse_month;
use datebook_core::{Store, StoreConfig};

/// Open a store over `backend`, remembering the month in the configured state file.
pub fn open_store(backend: Arc<dyn Backend>, config: StoreConfig) -> Store {
    let prefs = Arc::new(FilePreferences::open(config.state_file.clone()));
    Store::new(backend, prefs, config)
}

/// Move the store to `month` when one was given on the command line.
pub async fn apply_month(store: &Store, month: Option<&str>) -> Result<()> {
    if let Some(month) = month {
        let Some(date) = parse_month(month) else {
            anyhow::bail!("Invalid month '{}'. Expected YYYY-M, e.g. 2024-3", month);
        };
        store.set_month_start(date).await;
    }
    Ok(())
}
