use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SHARD_COUNT: usize = 16;

/// Per-device async mutexes.
///
/// Every mutation of one device's state or pending command runs while
/// holding that device's guard. Guards for different devices are
/// independent; the shard map is only held long enough to look up the
/// device's mutex.
pub struct DeviceLocks {
    shards: Vec<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// Wait for exclusive access to a device
    pub async fn lock(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let device_lock = {
            let mut shard = self.shards[shard_index(device_id)].lock().await;
            Arc::clone(
                shard
                    .entry(device_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        device_lock.lock_owned().await
    }
}

impl Default for DeviceLocks {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_index(device_id: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}
