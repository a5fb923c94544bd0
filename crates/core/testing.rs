//! In-process doubles for the store, clock and transport seams.
//!
//! Enable the `testing` feature to use these from other crates' tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::error::{MbjError, Result};
use crate::store::Store;
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Manual clock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one handle and give another
/// to the client.
#[derive(Debug, Clone)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `now` (epoch seconds).
    pub fn new(now: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(now.to_bits())),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    /// Move forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Memory store
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Entry {
    List(VecDeque<String>),
    SortedSet(HashMap<String, f64>),
}

/// A Store kept in process memory with Redis command semantics.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| MbjError::Backend("memory store poisoned".to_string()))?;
        f(&mut data)
    }
}

fn wrong_type(key: &str) -> MbjError {
    MbjError::Backend(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

fn sorted_set<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<Option<&'a mut HashMap<String, f64>>> {
    match data.get_mut(key) {
        None => Ok(None),
        Some(Entry::SortedSet(set)) => Ok(Some(set)),
        Some(Entry::List(_)) => Err(wrong_type(key)),
    }
}

fn list<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Result<Option<&'a mut VecDeque<String>>> {
    match data.get_mut(key) {
        None => Ok(None),
        Some(Entry::List(items)) => Ok(Some(items)),
        Some(Entry::SortedSet(_)) => Err(wrong_type(key)),
    }
}

/// Drop keys whose structure became empty, as Redis does.
fn prune(data: &mut HashMap<String, Entry>, key: &str) {
    let empty = match data.get(key) {
        Some(Entry::List(items)) => items.is_empty(),
        Some(Entry::SortedSet(set)) => set.is_empty(),
        None => false,
    };
    if empty {
        data.remove(key);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        self.with_data(|data| {
            if sorted_set(data, key)?.is_none() {
                data.insert(key.to_string(), Entry::SortedSet(HashMap::new()));
            }
            let set = sorted_set(data, key)?.ok_or_else(|| wrong_type(key))?;
            Ok(set.insert(member.to_string(), score).is_none())
        })
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        self.with_data(|data| Ok(sorted_set(data, key)?.and_then(|set| set.get(member).copied())))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_data(|data| {
            let removed = sorted_set(data, key)?
                .map(|set| set.remove(member).is_some())
                .unwrap_or(false);
            prune(data, key);
            Ok(removed)
        })
    }

    async fn zrem_below(&self, key: &str, bound: f64) -> Result<usize> {
        self.with_data(|data| {
            let removed = match sorted_set(data, key)? {
                Some(set) => {
                    let before = set.len();
                    set.retain(|_, score| *score >= bound);
                    before - set.len()
                }
                None => 0,
            };
            prune(data, key);
            Ok(removed)
        })
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> Result<usize> {
        self.with_data(|data| {
            Ok(sorted_set(data, key)?
                .map(|set| set.values().filter(|s| **s >= min && **s <= max).count())
                .unwrap_or(0))
        })
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.with_data(|data| Ok(sorted_set(data, key)?.map(|set| set.len()).unwrap_or(0)))
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>> {
        self.with_data(|data| {
            let mut members: Vec<(String, f64)> = sorted_set(data, key)?
                .map(|set| {
                    set.iter()
                        .filter(|(_, s)| **s >= min && **s <= max)
                        .map(|(m, s)| (m.clone(), *s))
                        .collect()
                })
                .unwrap_or_default();
            members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            Ok(members.into_iter().map(|(m, _)| m).collect())
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize> {
        self.with_data(|data| {
            if list(data, key)?.is_none() {
                data.insert(key.to_string(), Entry::List(VecDeque::new()));
            }
            let items = list(data, key)?.ok_or_else(|| wrong_type(key))?;
            items.push_front(value.to_string());
            Ok(items.len())
        })
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        self.with_data(|data| Ok(list(data, key)?.map(|items| items.len()).unwrap_or(0)))
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>> {
        self.with_data(|data| {
            Ok(list(data, key)?
                .map(|items| items.iter().cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.with_data(|data| Ok(data.remove(key).is_some()))
    }
}

// ---------------------------------------------------------------------------
// Recording transport
// ---------------------------------------------------------------------------

/// A Transport that keeps every pushed job in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    jobs: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl RecordingTransport {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs pushed so far, oldest first.
    pub fn jobs(&self) -> Vec<serde_json::Value> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn push(&self, job: &serde_json::Value) -> Result<()> {
        self.jobs
            .lock()
            .map_err(|_| MbjError::Transport("recording transport poisoned".to_string()))?
            .push(job.clone());
        Ok(())
    }
}
