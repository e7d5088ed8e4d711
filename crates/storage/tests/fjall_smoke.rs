#![cfg(feature = "fjall")]

use cashd_storage::fjall::FjallStore;
use cashd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_batch_roundtrip_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open fjall");
        store.put(Column::Meta, b"best", b"aa").expect("put");

        let mut batch = WriteBatch::new();
        batch.put(Column::Utxo, b"coin:1", b"a");
        batch.put(Column::Utxo, b"coin:2", b"b");
        batch.put(Column::Meta, b"best", b"bb");
        store.write_batch(&batch).expect("batch commit");
        store.persist().expect("persist");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert_eq!(
        store.get(Column::Meta, b"best").expect("get"),
        Some(b"bb".to_vec())
    );
    let mut coins = Vec::new();
    store
        .for_each_prefix(Column::Utxo, b"coin:", &mut |key, value| {
            coins.push((key.to_vec(), value.to_vec()));
            Ok(())
        })
        .expect("walk");
    assert_eq!(coins.len(), 2);

    let mut batch = WriteBatch::new();
    batch.delete(Column::Utxo, b"coin:1");
    store.write_batch(&batch).expect("delete");
    assert!(store.get(Column::Utxo, b"coin:1").expect("get").is_none());
}
