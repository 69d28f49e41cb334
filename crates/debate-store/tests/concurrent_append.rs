use debate_core::{OutcomeCode, ResultRecord, Variant};
use debate_store::ResultStore;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn record_for(worker: usize) -> ResultRecord {
    ResultRecord {
        topic_id: format!("{}", worker % 4),
        claim_text: format!("claim number {}, with a comma", worker),
        variant: Variant::new(if worker % 2 == 0 { "vanilla" } else { "fallacy" }),
        outcome: OutcomeCode::try_from((worker % 3) as u8).expect("valid outcome"),
        rounds: worker as u32,
        run_id: format!("chat_{}", worker),
    }
}

#[test]
fn concurrent_appends_from_independent_handles_keep_every_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let table = dir.path().join("all_debates_summary.csv");
    let writers = 20;
    let barrier = Arc::new(Barrier::new(writers));

    let mut handles = Vec::with_capacity(writers);
    for worker in 0..writers {
        let table = table.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            // Separate handle per writer, like separate debate processes.
            let store = ResultStore::new(table).with_lock_timeout(Duration::from_secs(60));
            barrier.wait();
            store.append(&record_for(worker)).expect("append");
        }));
    }
    for handle in handles {
        handle.join().expect("join");
    }

    let rows = ResultStore::new(&table).read_all().expect("read table");
    assert_eq!(rows.len(), writers);

    let chats: BTreeSet<String> = rows.iter().map(|r| r.run_id.clone()).collect();
    assert_eq!(chats.len(), writers, "duplicate rows: {:?}", rows);
    for row in &rows {
        let worker: usize = row
            .run_id
            .trim_start_matches("chat_")
            .parse()
            .expect("worker id");
        assert_eq!(row, &record_for(worker), "row corrupted");
    }
}

#[test]
fn clones_share_the_same_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ResultStore::new(dir.path().join("t.csv"));
    let other = store.clone();
    store.append(&record_for(1)).expect("append");
    other.append(&record_for(2)).expect("append");
    assert_eq!(store.read_all().expect("read").len(), 2);
}
