use super::*;
use crate::arena::Arena;

#[test]
fn empty_map() {
    let map = Map::new();
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.get(MapKey::U32(1)), None);
    assert_eq!(map.iter().count(), 0);
    assert_eq!(map.bucket_count(), 0);
}

#[test]
fn insert_and_get() {
    let arena = Arena::new();
    let mut map = Map::new();
    assert!(map.insert(MapKey::U32(1), MapValue::S32(10), &arena));
    assert!(map.insert(MapKey::U32(2), MapValue::S32(20), &arena));
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(MapKey::U32(1)), Some(MapValue::S32(10)));
    assert_eq!(map.get(MapKey::U32(2)), Some(MapValue::S32(20)));
    assert_eq!(map.get(MapKey::U32(3)), None);
}

#[test]
fn insert_overwrites_last_write_wins() {
    let arena = Arena::new();
    let mut map = Map::new();
    assert!(map.insert(MapKey::I64(-5), MapValue::S64(1), &arena));
    assert!(!map.insert(MapKey::I64(-5), MapValue::S64(2), &arena));
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(MapKey::I64(-5)), Some(MapValue::S64(2)));
}

#[test]
fn string_keys() {
    let arena = Arena::new();
    let mut map = Map::new();
    map.insert(MapKey::Str(b"alpha"), MapValue::Bytes(b"a"), &arena);
    map.insert(MapKey::Str(b"beta"), MapValue::Bytes(b"b"), &arena);
    assert_eq!(map.get(MapKey::Str(b"alpha")), Some(MapValue::Bytes(b"a".as_slice())));
    assert_eq!(map.get(MapKey::Str(b"gamma")), None);
    // Lookup with a shorter-lived key borrow.
    let probe = b"beta".to_vec();
    assert_eq!(map.get(MapKey::Str(&probe)), Some(MapValue::Bytes(b"b".as_slice())));
}

#[test]
fn remove_returns_value() {
    let arena = Arena::new();
    let mut map = Map::new();
    for i in 0..10u32 {
        map.insert(MapKey::U32(i), MapValue::S32(i * 2), &arena);
    }
    assert_eq!(map.remove(MapKey::U32(4), &arena), Some(MapValue::S32(8)));
    assert_eq!(map.remove(MapKey::U32(4), &arena), None);
    assert_eq!(map.len(), 9);
    assert_eq!(map.get(MapKey::U32(4)), None);
    assert_eq!(map.get(MapKey::U32(5)), Some(MapValue::S32(10)));
}

#[test]
fn grows_under_load() {
    let arena = Arena::new();
    let mut map = Map::new();
    for i in 0..1000u64 {
        map.insert(MapKey::U64(i), MapValue::S64(i), &arena);
    }
    assert_eq!(map.len(), 1000);
    assert!(map.bucket_count() >= 1024);
    for i in 0..1000u64 {
        assert_eq!(map.get(MapKey::U64(i)), Some(MapValue::S64(i)));
    }
}

#[test]
fn shrinks_after_removals() {
    let arena = Arena::new();
    let mut map = Map::new();
    for i in 0..1000u64 {
        map.insert(MapKey::U64(i), MapValue::S64(i), &arena);
    }
    let grown = map.bucket_count();
    for i in 0..995u64 {
        map.remove(MapKey::U64(i), &arena);
    }
    assert!(map.bucket_count() < grown);
    for i in 995..1000u64 {
        assert_eq!(map.get(MapKey::U64(i)), Some(MapValue::S64(i)));
    }
}

#[test]
fn clear_keeps_buckets() {
    let arena = Arena::new();
    let mut map = Map::new();
    for i in 0..100u32 {
        map.insert(MapKey::U32(i), MapValue::Bool(i % 2 == 0), &arena);
    }
    let buckets = map.bucket_count();
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.bucket_count(), buckets);
    assert_eq!(map.get(MapKey::U32(1)), None);
    map.insert(MapKey::U32(7), MapValue::Bool(true), &arena);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(MapKey::U32(7)), Some(MapValue::Bool(true)));
}

#[test]
fn overwrite_at_the_growth_threshold_does_not_resize() {
    let arena = Arena::new();
    let mut map = Map::new();
    // Six entries in eight buckets: one more fresh key crosses the 12/16
    // load bound, an overwrite must not.
    for i in 0..6u32 {
        map.insert(MapKey::U32(i), MapValue::S32(i), &arena);
    }
    assert_eq!(map.bucket_count(), 8);

    assert!(!map.insert(MapKey::U32(3), MapValue::S32(333), &arena));
    assert_eq!(map.bucket_count(), 8);
    assert_eq!(map.get(MapKey::U32(3)), Some(MapValue::S32(333)));

    assert!(map.insert(MapKey::U32(6), MapValue::S32(6), &arena));
    assert_eq!(map.bucket_count(), 16);
}

#[test]
fn iter_yields_every_entry_once() {
    let arena = Arena::new();
    let mut map = Map::new();
    for i in 0..200u32 {
        map.insert(MapKey::U32(i), MapValue::S32(i + 1), &arena);
    }
    let mut seen = vec![false; 200];
    for (k, v) in map.iter() {
        let MapKey::U32(k) = k else { panic!() };
        assert_eq!(v, MapValue::S32(k + 1));
        assert!(!seen[k as usize], "duplicate key {k}");
        seen[k as usize] = true;
    }
    assert!(seen.iter().all(|&s| s));
}

/// Keys that collide in one bucket must promote the chain to a sorted tree
/// once it passes the chain limit, and lookups must keep working.
#[test]
fn colliding_keys_promote_to_tree() {
    let arena = Arena::new();
    let mut map = Map::new();

    // 9 keys keep bucket_count at 16; pick keys whose hash
    // agrees modulo 16 (and therefore also modulo 8) so they share a bucket
    // at every size the map passes through.
    let mut colliding = Vec::new();
    let mut candidate = 0u64;
    let want_bucket = hash_key(&MapKey::U64(0)) & 15;
    while colliding.len() < 9 {
        if hash_key(&MapKey::U64(candidate)) & 15 == want_bucket {
            colliding.push(candidate);
        }
        candidate += 1;
    }

    for (i, &k) in colliding.iter().enumerate() {
        map.insert(MapKey::U64(k), MapValue::S64(i as u64), &arena);
    }
    assert_eq!(map.bucket_count(), 16);
    assert!(map.key_in_tree_bucket(MapKey::U64(colliding[0])));
    for (i, &k) in colliding.iter().enumerate() {
        assert_eq!(map.get(MapKey::U64(k)), Some(MapValue::S64(i as u64)));
    }

    // Overwrite and removal inside the tree bucket.
    map.insert(MapKey::U64(colliding[3]), MapValue::S64(333), &arena);
    assert_eq!(map.get(MapKey::U64(colliding[3])), Some(MapValue::S64(333)));
    assert_eq!(map.remove(MapKey::U64(colliding[4]), &arena), Some(MapValue::S64(4)));
    assert_eq!(map.get(MapKey::U64(colliding[4])), None);
}

#[test]
fn randomized_against_model() {
    let mut rng = oorandom::Rand32::new(0x5eed);
    let arena = Arena::new();
    let mut map = Map::new();
    let mut model = std::collections::HashMap::new();
    let iterations = if cfg!(miri) { 200 } else { 20000 };
    for _ in 0..iterations {
        let key = (rng.rand_u32() % 512) as u64;
        match rng.rand_u32() % 3 {
            0 | 1 => {
                let value = rng.rand_u32() as u64;
                let fresh = map.insert(MapKey::U64(key), MapValue::S64(value), &arena);
                let model_fresh = model.insert(key, value).is_none();
                assert_eq!(fresh, model_fresh);
            }
            _ => {
                let got = map.remove(MapKey::U64(key), &arena);
                let expected = model.remove(&key).map(MapValue::S64);
                assert_eq!(got, expected);
            }
        }
        assert_eq!(map.len(), model.len());
    }
    for (&k, &v) in &model {
        assert_eq!(map.get(MapKey::U64(k)), Some(MapValue::S64(v)));
    }
    assert_eq!(map.iter().count(), model.len());
}
