use lhdb::config::StoreConfig;
use lhdb::hasher::HashFunction;
use lhdb::store::Store;
use std::collections::HashSet;
use std::sync::Arc;
use test_log::test;

/// The key is its own hash so the tests can reason about bucket placement.
#[derive(Debug)]
struct U64Hash;

impl HashFunction for U64Hash {
    fn hash(&self, key: &[u8]) -> u64 {
        let mut buf = [0_u8; 8];
        let len = key.len().min(8);
        buf[..len].copy_from_slice(&key[..len]);
        u64::from_le_bytes(buf)
    }
}

fn key(hash: u64) -> [u8; 8] {
    hash.to_le_bytes()
}

fn value(hash: u64) -> Vec<u8> {
    format!("value {hash}").into_bytes()
}

fn config(home: &std::path::Path) -> StoreConfig {
    StoreConfig::new(home)
        .create()
        .set_sub_array_len(8)
        .set_hash_function(Arc::new(U64Hash))
}

/// Replicate the index computation from the stores published state.
fn bucket_of(store: &Store, hash: u64) -> u32 {
    let level_capacity = store.level_capacity();
    let index = hash % level_capacity;
    if (index as u32) < store.split() {
        (hash % (level_capacity * 2)) as u32
    } else {
        index as u32
    }
}

#[test]
fn delete_half_and_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let folder = tempfile::tempdir()?;
    let home = folder.path().join("db");
    {
        let store = config(&home).build()?;
        for i in 0..100_u64 {
            store.put(&key(i), Some(&value(i)[..]))?;
        }
        for i in (0..100_u64).step_by(2) {
            assert!(store.delete(&key(i))?);
        }
        store.sync()?;
        store.close()?;
        // Close is idempotent.
        store.close()?;
    }
    let store = config(&home).build()?;
    // Every survivor is retrievable, every deleted key is gone.
    for i in 0..100_u64 {
        let got = store.get(&key(i))?;
        if i % 2 == 0 {
            assert!(got.is_none(), "key {i} should be deleted");
        } else {
            assert_eq!(got.unwrap(), value(i));
        }
    }
    // loadCount equals the number of non-empty buckets under the reopened state.
    let buckets: HashSet<u32> = (0..100_u64)
        .filter(|i| i % 2 == 1)
        .map(|i| bucket_of(&store, i))
        .collect();
    assert_eq!(store.load_count() as usize, buckets.len());
    Ok(())
}

#[test]
fn values_survive_sync_and_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let folder = tempfile::tempdir()?;
    let home = folder.path().join("db");
    {
        let store = config(&home).build()?;
        for i in 0..50_u64 {
            store.put(&key(i), Some(&value(i)[..]))?;
        }
        // Overwrites persist too, not just first writes.
        store.put(&key(7), Some(&b"rewritten"[..]))?;
        store.sync()?;
    }
    let store = config(&home).build()?;
    for i in 0..50_u64 {
        let got = store.get(&key(i))?.unwrap();
        if i == 7 {
            assert_eq!(got, b"rewritten");
        } else {
            assert_eq!(got, value(i));
        }
    }
    Ok(())
}

#[test]
fn redo_log_recovers_unclosed_store() -> Result<(), Box<dyn std::error::Error>> {
    let folder = tempfile::tempdir()?;
    let home = folder.path().join("db");
    {
        let store = config(&home).build()?;
        for i in 0..20_u64 {
            store.put(&key(i), Some(&value(i)[..]))?;
        }
        // Flush data and the redo batch but no checkpoint, then vanish without
        // closing, like a crash.
        store.persist()?;
        std::mem::forget(store);
    }
    let store = config(&home).build()?;
    for i in 0..20_u64 {
        assert_eq!(store.get(&key(i))?.unwrap(), value(i));
    }
    Ok(())
}

#[test]
fn iterators_return_live_entries() -> Result<(), Box<dyn std::error::Error>> {
    let folder = tempfile::tempdir()?;
    let store = config(&folder.path().join("db")).build()?;
    for i in 0..30_u64 {
        store.put(&key(i), Some(&value(i)[..]))?;
    }
    for i in 0..10_u64 {
        store.delete(&key(i))?;
    }
    let entries: HashSet<(Vec<u8>, Vec<u8>)> = store.iter().collect();
    assert_eq!(entries.len(), 20);
    for i in 10..30_u64 {
        assert!(entries.contains(&(key(i).to_vec(), value(i))));
    }
    let keys: HashSet<Vec<u8>> = store.keys().collect();
    assert_eq!(keys.len(), 20);
    for i in 10..30_u64 {
        assert!(keys.contains(&key(i).to_vec()));
    }
    Ok(())
}

#[test]
fn open_missing_without_create_fails() {
    let folder = tempfile::tempdir().unwrap();
    let home = folder.path().join("nope");
    let result = StoreConfig::new(&home).build();
    assert!(result.is_err());
    // Nothing was left behind.
    assert!(!home.exists());
}

#[test]
fn truncate_empties_existing_store() -> Result<(), Box<dyn std::error::Error>> {
    let folder = tempfile::tempdir()?;
    let home = folder.path().join("db");
    {
        let store = config(&home).build()?;
        for i in 0..10_u64 {
            store.put(&key(i), Some(&value(i)[..]))?;
        }
    }
    let store = config(&home).truncate().build()?;
    assert_eq!(store.load_count(), 0);
    for i in 0..10_u64 {
        assert!(store.get(&key(i))?.is_none());
    }
    Ok(())
}
