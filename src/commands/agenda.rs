use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use datebook_core::backend::memory::MemoryBackend;
use datebook_core::{Component, Source, StoreConfig, StoreEvent};
use owo_colors::OwoColorize;

use crate::render::{Render, format_date_label, format_time};

pub async fn run(config: StoreConfig, fixture: &Path, month: Option<&str>) -> Result<()> {
    let json = std::fs::read_to_string(fixture)
        .with_context(|| format!("Could not read fixture {}", fixture.display()))?;
    let backend = MemoryBackend::from_fixture_json(&json)?;

    let store = super::open_store(Arc::new(backend), config);
    let mut events = store.subscribe();

    super::apply_month(&store, month).await?;
    store.start().await;
    store.flush().await;

    while let Ok(event) = events.try_recv() {
        if let StoreEvent::ErrorReceived(error) = event {
            eprintln!("{} {}", "warning:".yellow(), error);
        }
    }

    println!("{}", store.window().render());
    println!();

    let components = store.all_components();
    if components.is_empty() {
        println!("{}", "Nothing in this window".dimmed());
        return Ok(());
    }

    print_grouped(&components);
    Ok(())
}

/// Print components under a heading per day, untimed tasks last.
fn print_grouped(components: &[(Source, Component)]) {
    let mut current_label: Option<String> = None;

    for (source, component) in components {
        let label = match component.occurrence_time() {
            Some(time) => format_date_label(time),
            None => "No date".to_string(),
        };

        if current_label.as_ref() != Some(&label) {
            if current_label.is_some() {
                println!();
            }
            println!("{}", label.bold());
            current_label = Some(label);
        }

        let time = component
            .occurrence_time()
            .map(format_time)
            .unwrap_or_else(|| format!("{:>7}", ""));
        let tag = format!("[{}]", source.display_name);
        println!("  {} {} {}", time, component.render(), tag.dimmed());
    }
}
