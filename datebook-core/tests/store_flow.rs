use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, TimeZone, Utc};
use datebook_core::backend::Backend;
use datebook_core::backend::memory::MemoryBackend;
use datebook_core::preferences::{FilePreferences, LAST_VIEWED_MONTH, MemoryPreferences, Preferences};
use datebook_core::{
    Component, ComponentTime, ModType, Recurrence, Source, SourceKind, Status, Store, StoreConfig,
    StoreError, StoreEvent,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn at(m: u32, d: u32, h: u32) -> ComponentTime {
    ComponentTime::DateTime(Utc.with_ymd_and_hms(2024, m, d, h, 0, 0).unwrap())
}

fn work() -> Source {
    Source::new("work", "Work", SourceKind::Calendar)
}

fn standup() -> Component {
    let mut series = Component::event("standup", "Standup", at(3, 4, 9), at(3, 4, 10));
    series.recurrence = Some(Recurrence {
        rrule: "FREQ=WEEKLY".to_string(),
        exdates: vec![],
    });
    series
}

fn work_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.add_source(
        work(),
        vec![
            standup(),
            Component::event("dentist", "Dentist", at(3, 14, 15), at(3, 14, 16)),
            Component::event("trip", "Trip", at(5, 10, 8), at(5, 12, 20)),
        ],
    );
    backend
}

/// A store showing March 2024 with every enabled source loaded.
async fn started_store(backend: &MemoryBackend) -> Store {
    let prefs = MemoryPreferences::new();
    prefs.set(LAST_VIEWED_MONTH, "2024-3").unwrap();
    let store = Store::new(Arc::new(backend.clone()), Arc::new(prefs), StoreConfig::default());
    store.start().await;
    store.flush().await;
    store
}

async fn next_matching(
    events: &mut UnboundedReceiver<StoreEvent>,
    pred: impl Fn(&StoreEvent) -> bool,
) -> StoreEvent {
    let wait = async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn uids(components: &[Component]) -> Vec<&str> {
    components.iter().map(|c| c.uid.as_str()).collect()
}

#[tokio::test]
async fn test_initial_load_indexes_window() {
    let backend = work_backend();
    let store = started_store(&backend).await;

    let components = store.components("work");
    assert_eq!(
        uids(&components),
        vec!["standup", "standup", "dentist", "standup", "standup"]
    );
    assert!(
        components
            .iter()
            .filter(|c| c.uid == "standup")
            .all(|c| c.recurrence_id.is_some())
    );
    assert_eq!(backend.active_views("work"), 1);
}

#[tokio::test]
async fn test_change_month_reissues_view() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    store.change_month(1).await;

    assert!(matches!(events.try_recv(), Ok(StoreEvent::ParametersChanged)));
    match events.try_recv() {
        Ok(StoreEvent::ComponentsRemoved { components, .. }) => assert_eq!(components.len(), 5),
        other => panic!("unexpected event: {other:?}"),
    }

    assert_eq!(store.data_range().first, date(2024, 4, 1));
    assert_eq!(store.data_range().last, date(2024, 5, 5));
    assert_eq!(backend.active_views("work"), 1);
    assert_eq!(
        uids(&store.components("work")),
        vec!["standup"; 5],
        "April shows five standups and nothing else"
    );
}

#[tokio::test]
async fn test_month_round_trip() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let window = store.window();

    store.change_month(5).await;
    store.change_month(-5).await;
    store.change_year(1).await;
    store.change_year(-1).await;

    assert_eq!(store.window(), window);
    assert_eq!(store.components("work").len(), 5);
}

#[tokio::test]
async fn test_month_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.toml");
    let backend = MemoryBackend::new();

    let store = Store::new(
        Arc::new(backend.clone()),
        Arc::new(FilePreferences::open(path.clone())),
        StoreConfig::default(),
    );
    store.set_month_start(date(2031, 7, 19)).await;
    drop(store);

    let reopened = Store::new(
        Arc::new(backend),
        Arc::new(FilePreferences::open(path)),
        StoreConfig::default(),
    );
    assert_eq!(reopened.month_start(), date(2031, 7, 1));
}

#[tokio::test]
async fn test_add_is_optimistic_then_confirmed() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    let draft = Component::event("", "Review", at(3, 20, 14), at(3, 20, 15));
    store.add_component(&work(), draft.clone()).await;

    match events.try_recv() {
        Ok(StoreEvent::ComponentsAdded { components, .. }) => assert_eq!(components, vec![draft.clone()]),
        other => panic!("unexpected event: {other:?}"),
    }
    match events.try_recv() {
        Ok(StoreEvent::ComponentsRemoved { components, .. }) => assert_eq!(components, vec![draft]),
        other => panic!("unexpected event: {other:?}"),
    }
    let created = match events.try_recv() {
        Ok(StoreEvent::ComponentsAdded { mut components, .. }) => components.remove(0),
        other => panic!("unexpected event: {other:?}"),
    };
    assert!(!created.uid.is_empty());

    // The view echo lands in the index
    wait_until(|| store.components("work").iter().any(|c| c.uid == created.uid)).await;
}

#[tokio::test]
async fn test_add_to_unconnected_source_is_undone() {
    let backend = MemoryBackend::new();
    let mut errands = Source::new("errands", "Errands", SourceKind::TaskList);
    errands.enabled = false;
    backend.add_source(errands.clone(), vec![]);
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    let task = Component::task("milk", "Buy milk", None);
    store.add_component(&errands, task.clone()).await;

    assert!(matches!(events.try_recv(), Ok(StoreEvent::ComponentsAdded { .. })));
    match events.try_recv() {
        Ok(StoreEvent::ComponentsRemoved { components, .. }) => assert_eq!(components, vec![task]),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        events.try_recv(),
        Ok(StoreEvent::ErrorReceived(StoreError::NoClient(_)))
    ));
    assert!(backend.components("errands").is_empty());
}

#[tokio::test]
async fn test_failed_modify_restores_indexed_copy() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    let original = store
        .components("work")
        .into_iter()
        .find(|c| c.uid == "dentist")
        .unwrap();
    let mut edited = original.clone();
    edited.summary = "Orthodontist".to_string();

    backend.fail_next_write("work", "conflict");
    store.modify_component(&work(), edited.clone(), ModType::This).await;

    let modified: Vec<Vec<Component>> = std::iter::from_fn(|| match events.try_recv() {
        Ok(StoreEvent::ComponentsModified { components, .. }) => Some(components),
        _ => None,
    })
    .collect();
    assert_eq!(modified, vec![vec![edited], vec![original]]);
    assert_eq!(backend.components("work")[1].summary, "Dentist");
}

#[tokio::test]
async fn test_failed_remove_is_undone() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();
    let dentist = Component::event("dentist", "Dentist", at(3, 14, 15), at(3, 14, 16));

    backend.fail_next_write("work", "offline");
    store.remove_component(&work(), dentist.clone(), ModType::All).await;

    assert!(matches!(events.try_recv(), Ok(StoreEvent::ComponentsRemoved { .. })));
    match events.try_recv() {
        Ok(StoreEvent::ComponentsAdded { components, .. }) => assert_eq!(components, vec![dentist]),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(
        events.try_recv(),
        Ok(StoreEvent::ErrorReceived(StoreError::Remove(_)))
    ));
    assert_eq!(backend.components("work").len(), 3);
}

#[tokio::test]
async fn test_remove_single_occurrence() {
    let backend = work_backend();
    let store = started_store(&backend).await;

    let second = store
        .components("work")
        .into_iter()
        .filter(|c| c.uid == "standup")
        .nth(1)
        .unwrap();
    assert_eq!(second.recurrence_id, Some(at(3, 11, 9)));

    store.remove_component(&work(), second, ModType::This).await;

    wait_until(|| store.components("work").iter().filter(|c| c.uid == "standup").count() == 3).await;
    assert!(
        store
            .components("work")
            .iter()
            .all(|c| c.recurrence_id != Some(at(3, 11, 9)))
    );
}

#[tokio::test]
async fn test_completing_recurring_task_schedules_next() {
    let due = (Utc::now().date_naive() + Days::new(30))
        .and_hms_opt(9, 0, 0)
        .unwrap()
        .and_utc();
    let mut plants = Component::task("plants", "Water plants", Some(ComponentTime::DateTime(due)));
    plants.recurrence = Some(Recurrence {
        rrule: "FREQ=WEEKLY".to_string(),
        exdates: vec![],
    });

    let backend = MemoryBackend::new();
    let chores = Source::new("chores", "Chores", SourceKind::TaskList);
    backend.add_source(chores.clone(), vec![plants.clone()]);
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    let mut done = plants.clone();
    done.status = Status::Completed;
    done.percent_complete = 100;
    done.completed = Some(Utc::now());
    store.modify_component(&chores, done, ModType::ThisAndPrior).await;

    let stored = backend.components("chores");
    assert_eq!(stored.len(), 1, "exactly one live occurrence remains");
    let next = &stored[0];
    assert_eq!(next.status, Status::NeedsAction);
    assert_eq!(next.percent_complete, 0);
    assert_eq!(next.completed, None);
    assert_eq!(next.recurrence_id, None);
    assert!(next.recurrence.is_some());
    assert_eq!(
        next.due,
        Some(ComponentTime::DateTime(due + chrono::Duration::days(7)))
    );

    let modified = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, StoreEvent::ComponentsModified { .. }))
        .count();
    assert_eq!(modified, 4, "optimistic and confirmed, for the completion and the next occurrence");
}

#[tokio::test]
async fn test_trash_restore_and_delete() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    store.trash_source(&work()).await;

    match events.try_recv() {
        Ok(StoreEvent::ComponentsRemoved { components, .. }) => assert_eq!(components.len(), 5),
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(matches!(events.try_recv(), Ok(StoreEvent::SourceRemoved(_))));
    assert!(!store.is_source_enabled("work"));
    assert!(store.is_source_readonly("work"));
    assert_eq!(store.trashed_sources().len(), 1);
    assert_eq!(backend.active_views("work"), 0);

    store.restore_source().await;
    next_matching(&mut events, |e| matches!(e, StoreEvent::SourceAdded(_))).await;
    store.flush().await;
    assert!(store.is_source_enabled("work"));
    assert!(store.trashed_sources().is_empty());
    assert_eq!(store.components("work").len(), 5);

    store.trash_source(&work()).await;
    store.delete_trashed_sources().await;
    assert!(backend.source("work").is_none());
    assert!(store.trashed_sources().is_empty());
}

#[tokio::test]
async fn test_registry_changes_follow_through() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    backend.set_source_enabled("work", false).unwrap();
    next_matching(&mut events, |e| matches!(e, StoreEvent::SourceRemoved(_))).await;
    assert!(store.connected_sources().is_empty());

    backend.add_source(Source::new("home", "Home", SourceKind::Calendar), vec![]);
    match next_matching(&mut events, |e| matches!(e, StoreEvent::SourceAdded(_))).await {
        StoreEvent::SourceAdded(source) => assert_eq!(source.uid, "home"),
        _ => unreachable!(),
    }

    backend.set_source_enabled("work", true).unwrap();
    next_matching(&mut events, |e| matches!(e, StoreEvent::SourceAdded(s) if s.uid == "work")).await;
    assert_eq!(store.connected_sources().len(), 2);
}

#[tokio::test]
async fn test_readonly_source() {
    let backend = work_backend();
    backend.set_readonly("work", true);
    let store = started_store(&backend).await;

    assert!(store.is_source_readonly("work"));

    let mut events = store.subscribe();
    let draft = Component::event("new", "Nope", at(3, 5, 9), at(3, 5, 10));
    store.add_component(&work(), draft).await;
    let error = next_matching(&mut events, |e| matches!(e, StoreEvent::ErrorReceived(_))).await;
    assert!(matches!(error, StoreEvent::ErrorReceived(StoreError::Create(_))));
}

fn errands() -> Source {
    Source::new("errands", "Errands", SourceKind::TaskList)
}

fn errands_backend() -> MemoryBackend {
    let mut repot = Component::task("plants", "Repot plants", Some(at(3, 12, 9)));
    repot.recurrence_id = Some(at(3, 12, 9));
    let mut filed = Component::task("filed", "File receipts", Some(at(3, 8, 9)));
    filed.status = Status::Completed;

    let backend = MemoryBackend::new();
    backend.add_source(
        errands(),
        vec![
            Component::task("taxes", "File taxes", Some(at(3, 15, 12))),
            Component::task("plants", "Water plants", Some(at(3, 5, 9))),
            repot,
            filed,
            Component::task("someday", "Learn Welsh", None),
            Component::task("later", "Renew passport", Some(at(6, 1, 9))),
        ],
    );
    backend
}

#[tokio::test]
async fn test_task_list_indexes_open_tasks_due_in_window() {
    let backend = errands_backend();
    let store = started_store(&backend).await;

    let components = store.components("errands");
    assert_eq!(uids(&components), vec!["plants", "plants", "taxes"]);
    assert_eq!(components[0].recurrence_id, None);
    assert_eq!(components[1].recurrence_id, Some(at(3, 12, 9)));
}

#[tokio::test]
async fn test_completed_task_drops_out_of_view() {
    let backend = errands_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    let mut taxes = store
        .components("errands")
        .into_iter()
        .find(|c| c.uid == "taxes")
        .unwrap();
    taxes.status = Status::Completed;
    taxes.percent_complete = 100;
    taxes.completed = Some(Utc::now());
    store.modify_component(&errands(), taxes, ModType::This).await;

    match next_matching(&mut events, |e| matches!(e, StoreEvent::ComponentsRemoved { .. })).await {
        StoreEvent::ComponentsRemoved { source, components } => {
            assert_eq!(source.uid, "errands");
            assert_eq!(uids(&components), vec!["taxes"]);
        }
        _ => unreachable!(),
    }
    assert_eq!(uids(&store.components("errands")), vec!["plants", "plants"]);
    assert_eq!(backend.components("errands")[0].status, Status::Completed);
}

#[tokio::test]
async fn test_series_rewritten_elsewhere_updates_index() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    let mut events = store.subscribe();

    // Another client shortens the series to two occurrences and renames it
    let client = backend
        .connect(&work(), Duration::from_secs(1), CancellationToken::new())
        .await
        .unwrap();
    let mut shortened = standup();
    shortened.summary = "Sync".to_string();
    shortened.recurrence = Some(Recurrence {
        rrule: "FREQ=WEEKLY;COUNT=2".to_string(),
        exdates: vec![],
    });
    client.modify(&shortened, ModType::All).await.unwrap();

    match next_matching(&mut events, |e| matches!(e, StoreEvent::ComponentsRemoved { .. })).await {
        StoreEvent::ComponentsRemoved { components, .. } => {
            let rids: Vec<_> = components.iter().map(|c| c.recurrence_id.clone()).collect();
            assert_eq!(rids, vec![Some(at(3, 18, 9)), Some(at(3, 25, 9))]);
        }
        _ => unreachable!(),
    }
    match next_matching(&mut events, |e| matches!(e, StoreEvent::ComponentsModified { .. })).await {
        StoreEvent::ComponentsModified { components, .. } => {
            assert_eq!(components.len(), 2);
            assert!(components.iter().all(|c| c.summary == "Sync"));
        }
        _ => unreachable!(),
    }

    let standups: Vec<Component> = store
        .components("work")
        .into_iter()
        .filter(|c| c.uid == "standup")
        .collect();
    assert_eq!(standups.len(), 2);
    assert!(standups.iter().all(|c| c.summary == "Sync"));
}

#[tokio::test]
async fn test_overlapping_reloads_keep_one_view() {
    let backend = work_backend();
    let store = started_store(&backend).await;
    backend.set_view_delay(Some(Duration::from_millis(20)));

    tokio::join!(store.load_all_sources(), store.load_all_sources());

    assert_eq!(backend.active_views("work"), 1);
    assert_eq!(store.components("work").len(), 5);

    tokio::join!(store.change_month(1), store.load_all_sources());

    assert_eq!(backend.active_views("work"), 1);
    assert_eq!(uids(&store.components("work")), vec!["standup"; 5]);

    // A later change reaches the index once
    let mut events = store.subscribe();
    backend
        .insert_component("work", Component::event("review", "Review", at(4, 9, 14), at(4, 9, 15)))
        .unwrap();
    next_matching(&mut events, |e| matches!(e, StoreEvent::ComponentsAdded { .. })).await;
    store.flush().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let added = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| matches!(e, StoreEvent::ComponentsAdded { .. }))
        .count();
    assert_eq!(added, 0);
    assert_eq!(store.components("work").len(), 6);
}
