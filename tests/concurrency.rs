use lhdb::config::StoreConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use test_log::test;

fn key(i: u64) -> Vec<u8> {
    format!("key {i}").into_bytes()
}

fn value(i: u64) -> Vec<u8> {
    format!("value {i}").into_bytes()
}

/// Eight readers spin over a rotating key set while one writer drives ten thousand puts
/// across several level transitions.  No reader may ever observe a value that was never
/// written for its key, and after the writer syncs every key must be observable.
#[test]
fn readers_race_splitting_writer() -> Result<(), Box<dyn std::error::Error>> {
    const KEYS: u64 = 2_000;
    const PUTS: u64 = 10_000;
    const READERS: usize = 8;

    let folder = tempfile::tempdir()?;
    let store = Arc::new(
        StoreConfig::new(folder.path().join("db"))
            .create()
            .set_sub_array_len(8)
            .build()?,
    );
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for reader in 0..READERS {
        let store = store.clone();
        let done = done.clone();
        readers.push(thread::spawn(move || {
            let mut i = reader as u64;
            while !done.load(Ordering::Acquire) {
                let k = key(i % KEYS);
                match store.get(&k) {
                    Ok(Some(got)) => assert_eq!(
                        got,
                        value(i % KEYS),
                        "reader saw a value that was never put"
                    ),
                    Ok(None) => {}
                    Err(err) => panic!("reader failed: {err}"),
                }
                i += 1;
            }
        }));
    }

    let start_level = store.level();
    // A simple xorshift so the write order is scrambled but deterministic.
    let mut rng: u64 = 0x9e37_79b9_7f4a_7c15;
    for _ in 0..PUTS {
        rng ^= rng << 13;
        rng ^= rng >> 7;
        rng ^= rng << 17;
        let i = rng % KEYS;
        store.put(&key(i), Some(&value(i)[..]))?;
    }
    // Make sure every key is present regardless of what the scramble hit.
    for i in 0..KEYS {
        store.put(&key(i), Some(&value(i)[..]))?;
    }
    store.sync()?;
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    // 2000 distinct keys over unit 8 forces far more than two doublings.
    assert!(
        store.level() >= start_level + 2,
        "expected at least two level transitions, got {} -> {}",
        start_level,
        store.level()
    );
    for i in 0..KEYS {
        assert_eq!(
            store.get(&key(i))?.unwrap(),
            value(i),
            "key {i} lost after sync"
        );
    }
    Ok(())
}

/// Iterators run beside a writer without panicking and only ever yield written values.
#[test]
fn iterator_races_writer() -> Result<(), Box<dyn std::error::Error>> {
    const KEYS: u64 = 500;

    let folder = tempfile::tempdir()?;
    let store = Arc::new(
        StoreConfig::new(folder.path().join("db"))
            .create()
            .set_sub_array_len(8)
            .build()?,
    );
    for i in 0..KEYS / 2 {
        store.put(&key(i), Some(&value(i)[..]))?;
    }
    let done = Arc::new(AtomicBool::new(false));
    let scanner = {
        let store = store.clone();
        let done = done.clone();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                for (k, v) in store.iter() {
                    let text = String::from_utf8(k).unwrap();
                    let i: u64 = text.strip_prefix("key ").unwrap().parse().unwrap();
                    assert_eq!(v, value(i));
                }
            }
        })
    };
    for i in KEYS / 2..KEYS {
        store.put(&key(i), Some(&value(i)[..]))?;
    }
    done.store(true, Ordering::Release);
    scanner.join().unwrap();
    Ok(())
}
