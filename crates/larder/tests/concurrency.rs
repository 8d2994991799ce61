//! The handle is shared across threads; one mutex serializes metadata while
//! slot I/O proceeds outside it.

use std::sync::{Arc, Barrier};
use std::thread;

use larder::DiskLruCache;

#[test]
fn concurrent_writers_and_readers_settle() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let cache = DiskLruCache::open(dir.path(), 1, 2, 1 << 20).expect("cache should open");

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let cache = cache.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    let key = format!("w{worker}r{round}");
                    let mut editor = cache
                        .edit(&key)
                        .expect("edit should start")
                        .expect("key is private to this worker");
                    editor.write(0, key.as_bytes()).expect("slot 0 should write");
                    editor.write(1, b"payload").expect("slot 1 should write");
                    editor.commit().expect("commit should succeed");

                    let snapshot = cache
                        .get(&key)
                        .expect("get should succeed")
                        .expect("entry should be readable");
                    assert_eq!(
                        snapshot.read(0).expect("slot 0 should read"),
                        key.as_bytes()
                    );
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker should not panic");
    }

    assert_eq!(cache.size().expect("size should be available"), {
        // 4 workers x 50 entries, each key plus the 7-byte payload.
        let key_bytes: u64 = (0..4)
            .flat_map(|w| (0..50).map(move |r| format!("w{w}r{r}").len() as u64))
            .sum();
        key_bytes + 4 * 50 * 7
    });
    cache.close().expect("close should succeed");
}

#[test]
fn a_contested_key_grants_exactly_one_editor() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let cache = DiskLruCache::open(dir.path(), 1, 2, 1 << 20).expect("cache should open");

    let barrier = Arc::new(Barrier::new(4));
    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.edit("contested").expect("edit should not fail")
            })
        })
        .collect();

    let editors: Vec<_> = attempts
        .into_iter()
        .filter_map(|attempt| attempt.join().expect("thread should not panic"))
        .collect();
    assert_eq!(editors.len(), 1, "exactly one editor should be granted");

    for editor in editors {
        editor.abort().expect("abort should succeed");
    }
    cache.close().expect("close should succeed");
}

#[test]
fn readers_are_not_blocked_by_a_writer_mid_edit() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let cache = DiskLruCache::open(dir.path(), 1, 2, 1 << 20).expect("cache should open");

    let mut editor = cache
        .edit("shared")
        .expect("edit should start")
        .expect("editor should be granted");
    editor.write(0, b"v0").expect("slot 0 should write");
    editor.write(1, b"v0").expect("slot 1 should write");
    editor.commit().expect("commit should succeed");

    let mut editor = cache
        .edit("shared")
        .expect("edit should start")
        .expect("editor should be granted");
    editor.write(0, b"half written").expect("slot 0 should write");

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                let snapshot = cache
                    .get("shared")
                    .expect("get should succeed")
                    .expect("published content should be readable");
                assert_eq!(snapshot.read(0).expect("slot 0 should read"), b"v0");
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader should not panic");
    }

    editor.commit().expect("commit should succeed");
    cache.close().expect("close should succeed");
}
