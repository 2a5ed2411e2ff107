use std::sync::Arc;

use anyhow::Result;
use datebook_core::StoreConfig;
use datebook_core::backend::memory::MemoryBackend;
use datebook_core::window::{format_month, parse_weekday};

use crate::render::Render;

pub async fn run(
    config: StoreConfig,
    month: Option<&str>,
    week_start: Option<&str>,
    json: bool,
) -> Result<()> {
    let store = super::open_store(Arc::new(MemoryBackend::new()), config);

    if let Some(name) = week_start {
        let weekday = parse_weekday(name).map_err(|e| anyhow::anyhow!(e))?;
        store.set_week_starts_on(weekday).await;
    }
    super::apply_month(&store, month).await?;

    let window = store.window();

    if json {
        let value = serde_json::json!({
            "month": format_month(window.month_start),
            "week_starts_on": window.week_starts_on.to_string(),
            "month_range": [window.month_range.first, window.month_range.last],
            "data_range": [window.data_range.first, window.data_range.last],
            "num_weeks": window.num_weeks,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", window.render());
    }

    Ok(())
}
