use stale_cache::{BoxError, Cached, CachedCollection};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const TTL_SECS: u64 = 5;
const LOAD_DELAY_MS: u64 = 100;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Cached::new(
        || async {
            tokio::time::sleep(Duration::from_millis(LOAD_DELAY_MS)).await;
            Ok::<_, BoxError>("remote configuration".to_string())
        },
        Duration::from_secs(TTL_SECS),
    )?;

    println!("Loading single value...");
    println!("Got: {:?}", config.get_data().await?);
    println!("Again (served from cache): {:?}", config.get_data().await?);
    println!("Valid for another {} ms", config.valid_for());

    println!("Forcing an update...");
    println!("Got: {}", config.force_update().await?);

    let users = CachedCollection::new(
        |ids: HashSet<u32>| async move {
            tokio::time::sleep(Duration::from_millis(LOAD_DELAY_MS)).await;
            println!("  (batch fetch for {ids:?})");
            Ok::<_, BoxError>(
                ids.into_iter()
                    .map(|id| (id, format!("user-{id}")))
                    .collect::<HashMap<_, _>>(),
            )
        },
        Duration::from_secs(TTL_SECS),
    )?;

    println!("Loading users 1-3...");
    let batch = users.get_data(&HashSet::from([1, 2, 3])).await?;
    println!("Got {} users", batch.len());

    println!("Loading users 1-6 (only 4-6 hit the backend)...");
    let batch = users.get_data(&HashSet::from([1, 2, 3, 4, 5, 6])).await?;
    println!("Got {} users, cache size {}", batch.len(), users.size());

    println!("Deleted {} users", users.delete([1, 2]));
    println!("Cache size after delete: {}", users.size());

    Ok(())
}
