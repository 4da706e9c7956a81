use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lodestone::{
    ChangeSet, ColumnSpec, Config, Coordinator, Error, Filter, List, Query, Results, Snapshot,
    SortOrder, TableSpec, Value,
};

const OBJECT: usize = 0;
const TAG: usize = 1;
const GROUP: usize = 2;

fn schema() -> Vec<TableSpec> {
    vec![
        TableSpec::new(
            "object",
            vec![ColumnSpec::value("value"), ColumnSpec::link("tag", TAG)],
        ),
        TableSpec::new("tag", vec![ColumnSpec::value("name")]),
        TableSpec::new("group", vec![ColumnSpec::link_list("members", OBJECT)]),
    ]
}

fn open_db(dir: &tempfile::TempDir) -> Arc<Snapshot> {
    let config = Config::new(dir.path().join("test.lodestone"), schema());
    Snapshot::open(&config).unwrap()
}

/// Outcome of one callback invocation.
#[derive(Clone, Debug)]
enum Delivery {
    Changes(ChangeSet),
    Error(String),
}

fn recording_callback(tx: mpsc::Sender<Delivery>) -> impl FnMut(&ChangeSet, Option<&Error>) + Send {
    move |changes, error| {
        let delivery = match error {
            Some(err) => Delivery::Error(err.to_string()),
            None => Delivery::Changes(changes.clone()),
        };
        let _ = tx.send(delivery);
    }
}

/// Pump the snapshot's event loop until a callback fires.
fn next_delivery(snapshot: &Snapshot, rx: &mpsc::Receiver<Delivery>) -> Delivery {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        snapshot.notify().unwrap();
        if let Ok(delivery) = rx.recv_timeout(Duration::from_millis(20)) {
            return delivery;
        }
        assert!(Instant::now() < deadline, "timed out waiting for a notification");
    }
}

fn next_changes(snapshot: &Snapshot, rx: &mpsc::Receiver<Delivery>) -> ChangeSet {
    match next_delivery(snapshot, rx) {
        Delivery::Changes(changes) => changes,
        Delivery::Error(err) => panic!("expected changes, got error: {err}"),
    }
}

/// Pump for a while and require that nothing is delivered.
fn expect_quiet(snapshot: &Snapshot, rx: &mpsc::Receiver<Delivery>) {
    let deadline = Instant::now() + Duration::from_millis(400);
    while Instant::now() < deadline {
        snapshot.notify().unwrap();
        if let Ok(delivery) = rx.recv_timeout(Duration::from_millis(20)) {
            panic!("unexpected delivery: {delivery:?}");
        }
    }
}

fn insert_object(snapshot: &Snapshot, value: i64) -> usize {
    snapshot.begin_write().unwrap();
    let row = {
        let mut handle = snapshot.handle();
        let row = handle.insert_row(OBJECT).unwrap();
        handle.set_value(OBJECT, row, 0, Value::Int(value)).unwrap();
        row
    };
    snapshot.commit_write().unwrap();
    row
}

fn indexes(set: &lodestone::IndexSet) -> Vec<usize> {
    set.iter().collect()
}

#[test]
fn initial_notification_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());

    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert!(changes.is_empty());
}

#[test]
fn insertions_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());

    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    snapshot.begin_write().unwrap();
    {
        let mut handle = snapshot.handle();
        handle.insert_row(OBJECT).unwrap();
        handle.insert_row(OBJECT).unwrap();
    }
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.insertions), [0, 1]);
    assert!(changes.deletions.is_empty());
    assert!(changes.modifications.is_empty());

    // The delivered background view matches the live query
    assert_eq!(results.delivered_rows().unwrap(), results.rows().unwrap());
}

#[test]
fn modifications_are_disjoint_from_insertions() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    insert_object(&snapshot, 1);

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Modify the existing row and insert a new one in a single commit
    snapshot.begin_write().unwrap();
    {
        let mut handle = snapshot.handle();
        handle.set_value(OBJECT, 0, 0, Value::Int(5)).unwrap();
        handle.insert_row(OBJECT).unwrap();
    }
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.modifications), [0]);
    assert_eq!(indexes(&changes.insertions), [1]);
}

#[test]
fn insert_then_delete_in_one_commit_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    insert_object(&snapshot, 1);

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // A row inserted and removed again within one commit cancels out
    snapshot.begin_write().unwrap();
    {
        let mut handle = snapshot.handle();
        let row = handle.insert_row(OBJECT).unwrap();
        handle.erase_row(OBJECT, row).unwrap();
    }
    snapshot.commit_write().unwrap();
    expect_quiet(&snapshot, &rx);

    // A later real change arrives alone, proving nothing was queued
    insert_object(&snapshot, 2);
    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.insertions), [1]);
    assert!(changes.deletions.is_empty());
}

#[test]
fn move_last_over_reports_a_move() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    for v in 0..4 {
        insert_object(&snapshot, v);
    }

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // [A, B, C, D] -> move_last_over(0) -> [D, B, C]
    snapshot.begin_write().unwrap();
    snapshot.handle().move_last_over(OBJECT, 0).unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.deletions), [0, 3]);
    assert_eq!(indexes(&changes.insertions), [0]);
    assert_eq!(changes.moves.len(), 1);
    assert_eq!((changes.moves[0].from, changes.moves[0].to), (3, 0));
}

#[test]
fn filtered_query_tracks_membership() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    insert_object(&snapshot, 1);
    insert_object(&snapshot, 10);

    let results = Results::new(
        Arc::clone(&snapshot),
        Query::filtered(OBJECT, Filter::Gt { col: 0, value: Value::Int(5) }),
        SortOrder::default(),
    );
    assert_eq!(results.rows().unwrap(), [1]);

    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Row 0 rises above the threshold and enters the view
    snapshot.begin_write().unwrap();
    snapshot.handle().set_value(OBJECT, 0, 0, Value::Int(7)).unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.insertions), [0]);

    // And drops out again
    snapshot.begin_write().unwrap();
    snapshot.handle().set_value(OBJECT, 0, 0, Value::Int(0)).unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.deletions), [0]);
    assert!(changes.insertions.is_empty());
}

#[test]
fn sorted_results_report_view_positions() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    insert_object(&snapshot, 30);
    insert_object(&snapshot, 10);
    insert_object(&snapshot, 20);

    let results = Results::new(
        Arc::clone(&snapshot),
        Query::all(OBJECT),
        SortOrder::by(0, true),
    );
    // Sorted ascending by value: rows 1 (10), 2 (20), 0 (30)
    assert_eq!(results.rows().unwrap(), [1, 2, 0]);

    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Bump row 1's value to 25: it moves from view index 0 to view index 1
    snapshot.begin_write().unwrap();
    snapshot.handle().set_value(OBJECT, 1, 0, Value::Int(25)).unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.deletions), [0]);
    assert_eq!(indexes(&changes.insertions), [1]);
    assert_eq!(results.delivered_rows().unwrap(), [2, 1, 0]);
}

#[test]
fn linked_object_changes_mark_modifications() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    snapshot.begin_write().unwrap();
    {
        let mut handle = snapshot.handle();
        let tag = handle.insert_row(TAG).unwrap();
        handle.set_value(TAG, tag, 0, Value::String("red".into())).unwrap();
        let obj = handle.insert_row(OBJECT).unwrap();
        handle.set_link(OBJECT, obj, 1, Some(tag)).unwrap();
        handle.insert_row(OBJECT).unwrap();
    }
    snapshot.commit_write().unwrap();

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Touch only the tag; object 0 must be reported modified through the
    // link, object 1 must not
    snapshot.begin_write().unwrap();
    snapshot
        .handle()
        .set_value(TAG, 0, 0, Value::String("blue".into()))
        .unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.modifications), [0]);
    assert!(changes.insertions.is_empty());
    assert!(changes.deletions.is_empty());
}

#[test]
fn list_moves_and_modifications() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    snapshot.begin_write().unwrap();
    let group = {
        let mut handle = snapshot.handle();
        let a = handle.insert_row(OBJECT).unwrap();
        let b = handle.insert_row(OBJECT).unwrap();
        let c = handle.insert_row(OBJECT).unwrap();
        let group = handle.insert_row(GROUP).unwrap();
        for (i, row) in [a, b, c].into_iter().enumerate() {
            handle.list_insert(GROUP, group, 0, i, row).unwrap();
        }
        group
    };
    snapshot.commit_write().unwrap();

    let list = List::new(Arc::clone(&snapshot), GROUP, group, 0).unwrap();
    assert_eq!(list.elements().unwrap(), [0, 1, 2]);

    let (tx, rx) = mpsc::channel();
    let _token = list.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Move the first element to the back and modify the row it points at
    snapshot.begin_write().unwrap();
    {
        let mut handle = snapshot.handle();
        handle.list_move(GROUP, group, 0, 0, 2).unwrap();
        handle.set_value(OBJECT, 0, 0, Value::Int(42)).unwrap();
    }
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(changes.moves.len(), 1);
    assert_eq!((changes.moves[0].from, changes.moves[0].to), (0, 2));
    assert_eq!(indexes(&changes.deletions), [0]);
    assert_eq!(indexes(&changes.insertions), [2]);
    assert_eq!(indexes(&changes.modifications), [2]);
}

#[test]
fn deleting_the_list_origin_reports_all_rows_once() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    snapshot.begin_write().unwrap();
    let group = {
        let mut handle = snapshot.handle();
        let a = handle.insert_row(OBJECT).unwrap();
        let b = handle.insert_row(OBJECT).unwrap();
        let group = handle.insert_row(GROUP).unwrap();
        handle.list_insert(GROUP, group, 0, 0, a).unwrap();
        handle.list_insert(GROUP, group, 0, 1, b).unwrap();
        group
    };
    snapshot.commit_write().unwrap();

    let list = List::new(Arc::clone(&snapshot), GROUP, group, 0).unwrap();
    let (tx, rx) = mpsc::channel();
    let _token = list.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    snapshot.begin_write().unwrap();
    snapshot.handle().erase_row(GROUP, group).unwrap();
    snapshot.commit_write().unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.deletions), [0, 1]);

    // The notifier is quiescent afterwards
    insert_object(&snapshot, 9);
    expect_quiet(&snapshot, &rx);
}

#[test]
fn commit_on_another_thread_notifies_this_one() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    let config = Config::new(dir.path().join("test.lodestone"), schema());

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // The writer plays the part of another process sharing the database
    // file: it commits on its own snapshot and the wake-up arrives through
    // the notification channel
    std::thread::spawn(move || {
        let other = Snapshot::open(&config).unwrap();
        other.begin_write().unwrap();
        other.handle().insert_row(OBJECT).unwrap();
        other.commit_write().unwrap();
    })
    .join()
    .unwrap();

    let changes = next_changes(&snapshot, &rx);
    assert_eq!(indexes(&changes.insertions), [0]);
}

#[test]
fn external_channel_write_wakes_the_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    let (tx, rx) = mpsc::channel();
    snapshot.set_waker(move || {
        let _ = tx.send(());
    });

    // A foreign process announcing a commit just writes a byte into the
    // named pipe next to the database file
    let note_path = dir.path().join("test.lodestone.note");
    let mut pipe = std::fs::OpenOptions::new()
        .write(true)
        .open(&note_path)
        .unwrap();
    pipe.write_all(&[0]).unwrap();

    rx.recv_timeout(Duration::from_secs(10))
        .expect("the external write never woke the delivery thread");
}

#[test]
fn reentrant_callback_removal_and_addition() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    let results = Arc::new(Results::new(
        Arc::clone(&snapshot),
        Query::all(OBJECT),
        SortOrder::default(),
    ));

    let first_calls = Arc::new(Mutex::new(0usize));
    let (second_tx, second_rx) = mpsc::channel();
    let token_slot: Arc<Mutex<Option<lodestone::NotificationToken>>> = Arc::new(Mutex::new(None));

    let token = {
        let results = Arc::clone(&results);
        let first_calls = Arc::clone(&first_calls);
        let token_slot = Arc::clone(&token_slot);
        results
            .clone()
            .add_notification_callback(move |_, _| {
                *first_calls.lock().unwrap() += 1;
                // Remove ourselves and register a replacement, from inside
                // the invocation
                drop(token_slot.lock().unwrap().take());
                let tx = second_tx.clone();
                let replacement = results
                    .add_notification_callback(move |changes, _| {
                        let _ = tx.send(changes.clone());
                    })
                    .unwrap();
                // The slot keeps the replacement alive for the rest of the
                // test
                *token_slot.lock().unwrap() = Some(replacement);
            })
            .unwrap()
    };
    *token_slot.lock().unwrap() = Some(token);

    // The initial delivery triggers the self-removal; the replacement gets
    // its own initial delivery on a later cycle
    let replacement_initial = {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            snapshot.notify().unwrap();
            if let Ok(changes) = second_rx.recv_timeout(Duration::from_millis(20)) {
                break changes;
            }
            assert!(Instant::now() < deadline, "replacement callback never ran");
        }
    };
    assert!(replacement_initial.is_empty());
    assert_eq!(*first_calls.lock().unwrap(), 1);

    // Further commits only reach the replacement
    insert_object(&snapshot, 1);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        snapshot.notify().unwrap();
        if let Ok(changes) = second_rx.recv_timeout(Duration::from_millis(20)) {
            if !changes.is_empty() {
                assert_eq!(indexes(&changes.insertions), [0]);
                break;
            }
        }
        assert!(Instant::now() < deadline, "replacement callback missed the commit");
    }
    assert_eq!(*first_calls.lock().unwrap(), 1);
}

#[test]
fn dropping_the_token_stops_notifications() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());

    let (tx, rx) = mpsc::channel();
    let token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    drop(token);
    insert_object(&snapshot, 1);
    expect_quiet(&snapshot, &rx);
}

#[test]
fn background_errors_are_delivered_once_and_purge_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    // A query over a table index that does not exist fails on the worker
    let results = Results::new(Arc::clone(&snapshot), Query::all(99), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();

    match next_delivery(&snapshot, &rx) {
        Delivery::Error(message) => assert!(message.contains("no table"), "unexpected: {message}"),
        Delivery::Changes(changes) => panic!("expected an error, got {changes:?}"),
    }

    // The error is terminal: later commits deliver nothing
    insert_object(&snapshot, 1);
    expect_quiet(&snapshot, &rx);
}

#[test]
fn mismatched_configurations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.lodestone");
    let _first = Snapshot::open(&Config::new(path.clone(), schema())).unwrap();

    let err = Coordinator::for_path(&Config::new(path, schema()).schema_version(2)).unwrap_err();
    assert!(matches!(err, Error::ConfigMismatch { property, .. } if property == "schema version"));
}

#[test]
fn snapshots_are_bound_to_their_thread() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);

    let other = Arc::clone(&snapshot);
    let err = std::thread::spawn(move || other.refresh().unwrap_err())
        .join()
        .unwrap();
    assert!(matches!(err, Error::IncorrectThread));

    // But each thread can open its own snapshot of the same coordinator
    let coordinator = Arc::clone(snapshot.coordinator());
    std::thread::spawn(move || {
        let own = coordinator.open_snapshot().unwrap();
        own.refresh().unwrap();
    })
    .join()
    .unwrap();
}

#[test]
fn accumulated_changes_merge_across_undelivered_runs() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = open_db(&dir);
    insert_object(&snapshot, 1);

    let results = Results::new(Arc::clone(&snapshot), Query::all(OBJECT), SortOrder::default());
    let (tx, rx) = mpsc::channel();
    let _token = results.add_notification_callback(recording_callback(tx)).unwrap();
    assert!(next_changes(&snapshot, &rx).is_empty());

    // Two separate commits without pumping the event loop in between. The
    // worker may see them in one pass (delivering a single merged
    // changeset) or in two; either way the union must be exactly the
    // insertion and the modification, with nothing duplicated or lost.
    snapshot.begin_write().unwrap();
    snapshot.handle().insert_row(OBJECT).unwrap();
    snapshot.commit_write().unwrap();

    snapshot.begin_write().unwrap();
    snapshot.handle().set_value(OBJECT, 0, 0, Value::Int(2)).unwrap();
    snapshot.commit_write().unwrap();

    let mut insertions = Vec::new();
    let mut modifications = Vec::new();
    while modifications.is_empty() || insertions.is_empty() {
        let changes = next_changes(&snapshot, &rx);
        insertions.extend(changes.insertions.iter());
        modifications.extend(changes.modifications.iter());
        assert!(changes.deletions.is_empty());
    }
    assert_eq!(insertions, [1]);
    assert_eq!(modifications, [0]);
}
