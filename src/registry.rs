//! Instance registry and id allocation.
//!
//! Uniqueness across concurrent invocations rests on two filesystem
//! primitives: exclusive creation of the instance folder, and (for the counter
//! strategy) a lock held only around the counter's read-increment-write.
use std::{
    collections::BTreeMap,
    fs, io,
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    config::IdStrategy,
    error::{IoResultExt, SargeError, SargeResult},
    fs_ops::{LockFile, write_atomic},
    instance::Instance,
    layout::HomeLayout,
};

pub const ID_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyz23456789";
pub const ID_LENGTH: usize = 6;
pub const MAX_ATTEMPTS: usize = 10;

/// Alias accepted wherever an instance id is expected.
pub const NEWEST: &str = "newest";

pub trait IdAllocator: Send + Sync {
    fn next_id(&self) -> SargeResult<String>;
}

#[derive(Debug, Default, Clone)]
pub struct RandomIds;

impl IdAllocator for RandomIds {
    fn next_id(&self) -> SargeResult<String> {
        let mut rng = rng();
        Ok((0..ID_LENGTH)
            .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
            .collect())
    }
}

/// Monotonic decimal ids persisted in `var/counter`.
#[derive(Debug, Clone)]
pub struct CounterIds {
    counter: PathBuf,
    lock: PathBuf,
}

impl CounterIds {
    pub fn new(layout: &HomeLayout) -> Self {
        Self {
            counter: layout.counter_file(),
            lock: layout.counter_lock(),
        }
    }
}

impl IdAllocator for CounterIds {
    fn next_id(&self) -> SargeResult<String> {
        let _guard = LockFile::acquire(&self.lock)?;
        let current = match fs::read_to_string(&self.counter) {
            Ok(text) => text.trim().parse::<u64>().map_err(|e| {
                SargeError::Config(format!("corrupt counter {}: {e}", self.counter.display()))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(SargeError::Io {
                    path: self.counter.clone(),
                    source: e,
                });
            }
        };
        let next = current + 1;
        write_atomic(&self.counter, next.to_string().as_bytes())?;
        Ok(next.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    #[serde(default)]
    meta: BTreeMap<String, String>,
    folder: PathBuf,
    created: DateTime<Utc>,
}

impl RegistryEntry {
    fn to_instance(&self, id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            meta: self.meta.clone(),
            folder: self.folder.clone(),
        }
    }
}

/// Orders ids numerically when both are numbers, lexically otherwise.
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

pub struct Registry {
    layout: HomeLayout,
    allocator: Box<dyn IdAllocator>,
}

impl Registry {
    pub fn new(layout: HomeLayout, strategy: IdStrategy) -> Self {
        let allocator: Box<dyn IdAllocator> = match strategy {
            IdStrategy::Random => Box::new(RandomIds),
            IdStrategy::Counter => Box::new(CounterIds::new(&layout)),
        };
        Self::with_allocator(layout, allocator)
    }

    pub fn with_allocator(layout: HomeLayout, allocator: Box<dyn IdAllocator>) -> Self {
        Self { layout, allocator }
    }

    fn read_entries(&self) -> SargeResult<BTreeMap<String, RegistryEntry>> {
        let path = self.layout.registry_file();
        match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(SargeError::Io { path, source: e }),
        }
    }

    fn write_entries(&self, entries: &BTreeMap<String, RegistryEntry>) -> SargeResult<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        write_atomic(&self.layout.registry_file(), &json)
    }

    /// Allocate an id, create its folder exclusively and record it.
    ///
    /// Fails with [`SargeError::IdSpaceExhausted`] after [`MAX_ATTEMPTS`]
    /// collisions.
    pub fn create(&self, meta: BTreeMap<String, String>) -> SargeResult<Instance> {
        let root = self.layout.deploy_root();
        fs::create_dir_all(&root).at(&root)?;

        for attempt in 1..=MAX_ATTEMPTS {
            let id = self.allocator.next_id()?;
            if id == NEWEST {
                debug!(attempt, "allocated id is reserved, retrying");
                continue;
            }
            if self.read_entries()?.contains_key(&id) {
                debug!(id = %id, attempt, "id already registered, retrying");
                continue;
            }
            let folder = self.layout.instance_folder(&id);
            match fs::create_dir(&folder) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(id = %id, attempt, "instance folder exists, retrying");
                    continue;
                }
                Err(e) => return Err(SargeError::Io { path: folder, source: e }),
            }

            let entry = RegistryEntry {
                meta,
                folder,
                created: Utc::now(),
            };
            let instance = entry.to_instance(&id);
            {
                let _guard = LockFile::acquire(&self.layout.registry_lock())?;
                let mut entries = self.read_entries()?;
                entries.insert(id.clone(), entry);
                self.write_entries(&entries)?;
            }
            info!(instance = %id, "instance created");
            return Ok(instance);
        }
        Err(SargeError::IdSpaceExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Look up `id`, or the greatest id when given [`NEWEST`].
    pub fn get(&self, id: &str) -> SargeResult<Instance> {
        let entries = self.read_entries()?;
        if id == NEWEST {
            return entries
                .iter()
                .max_by(|a, b| id_order(a.0, b.0))
                .map(|(id, entry)| entry.to_instance(id))
                .ok_or_else(|| SargeError::not_found("instance", NEWEST));
        }
        entries
            .get(id)
            .map(|entry| entry.to_instance(id))
            .ok_or_else(|| SargeError::not_found("instance", id))
    }

    pub fn list(&self) -> SargeResult<Vec<Instance>> {
        let entries = self.read_entries()?;
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort_by(|a, b| id_order(a, b));
        Ok(ids
            .into_iter()
            .map(|id| entries[id].to_instance(id))
            .collect())
    }

    /// Drop the entry for `id`. Returns whether it existed.
    pub fn remove(&self, id: &str) -> SargeResult<bool> {
        let _guard = LockFile::acquire(&self.layout.registry_lock())?;
        let mut entries = self.read_entries()?;
        let existed = entries.remove(id).is_some();
        if existed {
            self.write_entries(&entries)?;
        } else {
            warn!(instance = %id, "not in registry");
        }
        Ok(existed)
    }
}
