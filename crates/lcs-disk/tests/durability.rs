//! Durability of the file-backed store across close and reopen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;

use lcs_disk::DiskStore;
use lcs_store::{copy_cell, persist, Cell, CellStore, Hash, MemoryStore, Ref, RefStatus};

fn big(label: &str) -> Cell {
    Cell::string(format!("{label}={}", "v".repeat(150)))
}

#[test]
fn root_integer_one_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("root.lcsd");
    {
        let store = DiskStore::create(&path).unwrap();
        store.set_root(&Cell::integer(1)).unwrap();
        store.close().unwrap();
    }
    let store = DiskStore::create(&path).unwrap();
    let root = store.root().unwrap().unwrap();
    assert_eq!(root, Cell::integer(1));
    assert_eq!(root.as_integer(), Some(1));
}

#[test]
fn whole_graph_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.lcsd");
    let inner = Cell::vector((0..6).map(|i| big(&format!("inner-{i}")))).unwrap();
    let root = Cell::vector([inner.clone(), big("side"), Cell::keyword("tag").unwrap()]).unwrap();
    {
        let store = DiskStore::create(&path).unwrap();
        store.set_root(&root).unwrap();
    }

    let store = DiskStore::create(&path).unwrap();
    let back = store.root().unwrap().unwrap();
    assert_eq!(back, root);
    // 6 leaves + inner + side + root
    assert_eq!(store.len(), 9);

    // Every reachable cell resolves from the reopened store alone.
    let r = persist(&store, &Ref::new(back.clone()), None).unwrap();
    assert_eq!(r.status_in(store.id()), RefStatus::Persisted);
    let reread = back.get_ref(0).unwrap().value_in(&store).unwrap();
    assert_eq!(reread, inner);
}

#[test]
fn writes_after_reopen_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("idem.lcsd");
    let cell = Cell::vector([big("one"), big("two")]).unwrap();
    {
        let store = DiskStore::create(&path).unwrap();
        persist(&store, &Ref::new(cell.clone()), None).unwrap();
    }
    let store = DiskStore::create(&path).unwrap();
    let before = store.total_bytes();
    let mut novel = 0;
    persist(&store, &Ref::new(cell), Some(&mut |_: &Ref| novel += 1)).unwrap();
    assert_eq!(novel, 0);
    assert_eq!(store.total_bytes(), before);
}

#[test]
fn memory_to_disk_copy_round_trips() {
    let memory = MemoryStore::new();
    let disk = DiskStore::create_temporary().unwrap();
    let cell = Cell::vector([big("a"), Cell::vector([big("b"), big("c")]).unwrap()]).unwrap();
    persist(&memory, &Ref::new(cell.clone()), None).unwrap();

    let written = copy_cell(&memory, &disk, &cell.hash()).unwrap();
    assert_eq!(written.len(), memory.len());
    assert_eq!(disk.read_cell(&cell.hash()).unwrap().unwrap(), cell);
}

/// Root over five non-embedded branches of five leaves each, plus an
/// embedded pair holding one more leaf. Every call builds new instances.
fn layered() -> Cell {
    let branches = (0..5).map(|i| Cell::vector((0..5).map(|j| big(&format!("{i}.{j}")))).unwrap());
    let pair = Cell::vector([Cell::integer(1), big("under-pair")]).unwrap();
    Cell::vector(branches.chain([pair])).unwrap()
}

#[test]
fn concurrent_persist_of_one_graph_fires_one_novelty_per_cell() {
    let store = DiskStore::create_temporary().unwrap();
    let fired: Mutex<HashMap<Hash, usize>> = Mutex::new(HashMap::new());
    thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                let mut on_novel = |r: &Ref| *fired.lock().unwrap().entry(r.hash()).or_insert(0) += 1;
                persist(&store, &Ref::new(layered()), Some(&mut on_novel)).unwrap();
            });
        }
    });

    let fired = fired.into_inner().unwrap();
    assert_eq!(fired.len(), 32);
    assert!(fired.values().all(|&n| n == 1));
    assert_eq!(store.len(), 32);
    assert_eq!(store.read_cell(&layered().hash()).unwrap().unwrap(), layered());
}

#[test]
fn concurrent_writers_and_readers_of_distinct_cells() {
    const THREADS: usize = 6;
    const PER_THREAD: usize = 40;
    let store = DiskStore::create_temporary().unwrap();
    let fresh = AtomicUsize::new(0);
    let all_written = Barrier::new(THREADS);
    let cell = |t: usize, i: usize| big(&format!("t{t}-{i}"));

    thread::scope(|s| {
        for t in 0..THREADS {
            let (store, fresh, all_written) = (&store, &fresh, &all_written);
            s.spawn(move || {
                for i in 0..PER_THREAD {
                    if store.write_cell(&cell(t, i)).unwrap() {
                        fresh.fetch_add(1, Ordering::Relaxed);
                    }
                }
                all_written.wait();
                // Read everybody's cells, starting with a neighbour's.
                for other in (0..THREADS).map(|k| (t + 1 + k) % THREADS) {
                    for i in 0..PER_THREAD {
                        let expected = cell(other, i);
                        assert_eq!(store.read_cell(&expected.hash()).unwrap().unwrap(), expected);
                    }
                }
            });
        }
    });

    assert_eq!(fresh.into_inner(), THREADS * PER_THREAD);
    assert_eq!(store.len(), THREADS * PER_THREAD);
}
