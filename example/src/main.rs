use std::sync::Arc;

use bytes::Bytes;
use schema_cache::proxy::CachingProxy;
use schema_cache::schema::{CaveatDefinition, NamespaceDefinition, SchemaDefinition};
use schema_cache::store::memory::MemorySchemaStore;
use schema_cache::{Error, ProxyConfig, Revision};

#[tokio::main]
async fn main() {
    println!("Hello, schema cache!");

    run().await.unwrap();

    println!("Bye~");
}

async fn run() -> Result<(), Error> {
    let store = Arc::new(MemorySchemaStore::new());
    let config = ProxyConfig { watch_enabled: true, ..Default::default() };
    let proxy = CachingProxy::new(store, config);
    proxy.start().await?;

    // Write a small schema in one transaction.
    let mut tx = proxy.read_write_tx().await?;
    tx.write_namespace(NamespaceDefinition::new(
        "document",
        Bytes::from_static(b"relation viewer: user"),
    ))
    .await?;
    tx.write_caveat(CaveatDefinition::new(
        "only_on_tuesday",
        Bytes::from_static(b"day_of_week == 2"),
    ))
    .await?;
    let first = tx.commit().await?;
    println!("committed schema at revision {first}");

    // Rewrite the namespace at a later revision.
    let mut tx = proxy.read_write_tx().await?;
    tx.write_namespace(NamespaceDefinition::new(
        "document",
        Bytes::from_static(b"relation viewer: user | group#member"),
    ))
    .await?;
    let second = tx.commit().await?;
    println!("rewrote `document` at revision {second}");

    // Each reader sees the schema as of its own revision; repeated reads at
    // the same revision are served from cache.
    let old = proxy.snapshot_reader(first);
    let new = proxy.snapshot_reader(second);
    for _ in 0..2 {
        let then = old.read_namespace_by_name("document").await?;
        let now = new.read_namespace_by_name("document").await?;
        println!(
            "document last written at {} (old view) vs {} (new view)",
            then.last_written, now.last_written
        );
    }

    let caveat = new.read_caveat_by_name("only_on_tuesday").await?;
    println!("caveat `{}` is {} bytes", "only_on_tuesday", caveat.definition.payload().len());

    // A revision below the first write has no schema at all.
    let empty = proxy.snapshot_reader(Revision::zero());
    assert!(empty.read_namespace_by_name("document").await.unwrap_err().is_not_found());

    proxy.close().await;
    Ok(())
}
