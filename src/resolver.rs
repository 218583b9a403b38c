use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fs::File;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

use crate::error::ResolveError;
use crate::settings::ResolverSettings;

const SHARDS: usize = 16;

/// Backend performing one (possibly slow) reverse lookup.
pub trait NameLookup: Send + Sync {
    fn reverse(&self, addr: IpAddr) -> Result<String, ResolveError>;
}

/// Reverse (PTR) lookups through the system's DNS configuration.
pub struct DnsLookup {
    resolver: Resolver,
}

impl DnsLookup {
    pub fn new(timeout: Duration) -> std::io::Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        // Fall back to public defaults when /etc/resolv.conf is unusable.
        let resolver = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok((config, _)) => Resolver::new(config, opts)?,
            Err(e) => {
                warn!("Could not read system DNS configuration ({}), using defaults", e);
                Resolver::new(ResolverConfig::default(), opts)?
            }
        };
        Ok(DnsLookup { resolver })
    }
}

impl NameLookup for DnsLookup {
    fn reverse(&self, addr: IpAddr) -> Result<String, ResolveError> {
        let response = self
            .resolver
            .reverse_lookup(addr)
            .map_err(|e| ResolveError(e.to_string()))?;
        response
            .iter()
            .next()
            .map(|name| name.to_string().trim_end_matches('.').to_string())
            .ok_or_else(|| ResolveError(format!("no PTR record for {}", addr)))
    }
}

/// One entry of the known-hosts file.
#[derive(Debug, Deserialize)]
pub struct KnownHost {
    pub ip: IpAddr,
    pub name: String,
}

/// Loads a YAML list of `{ip, name}` pairs.
pub fn load_known_hosts(path: &str) -> Result<HashMap<IpAddr, String>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let hosts: Vec<KnownHost> = serde_yaml::from_reader(file)?;
    info!("Loaded {} known hosts from '{}'", hosts.len(), path);
    Ok(hosts.into_iter().map(|h| (h.ip, h.name)).collect())
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub ttl: Duration,
    pub negative_ttl: Duration,
    pub threads: usize,
    /// Upper bound on cached entries, pending ones included.
    pub max_entries: usize,
    /// Lookups allowed to wait for a free resolver thread.
    pub max_pending: usize,
}

impl From<&ResolverSettings> for ResolverOptions {
    fn from(settings: &ResolverSettings) -> Self {
        ResolverOptions {
            ttl: Duration::from_secs(settings.ttl_secs),
            negative_ttl: Duration::from_secs(settings.negative_ttl_secs),
            threads: settings.threads,
            max_entries: settings.max_entries,
            max_pending: settings.max_pending,
        }
    }
}

enum Slot {
    /// `name` is `None` for a cached failure.
    Resolved {
        name: Option<String>,
        resolved_at: Instant,
        ttl: Duration,
    },
    /// A lookup is in flight; these callers want its result.
    Pending { waiters: Vec<Sender<Option<String>>> },
}

impl Slot {
    fn fresh(&self) -> Option<&Option<String>> {
        match self {
            Slot::Resolved { name, resolved_at, ttl } if resolved_at.elapsed() < *ttl => Some(name),
            _ => None,
        }
    }

    fn expired(&self) -> bool {
        matches!(self, Slot::Resolved { resolved_at, ttl, .. } if resolved_at.elapsed() >= *ttl)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    negative: AtomicU64,
    lookups: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups answered from a cached failure.
    pub negative: u64,
    /// Reverse lookups actually performed by the backend.
    pub lookups: u64,
    pub failures: u64,
    /// Addresses left unresolved because the cache or lookup backlog was full.
    pub skipped: u64,
}

struct Shared {
    shards: Vec<Mutex<HashMap<IpAddr, Slot>>>,
    known_hosts: HashMap<IpAddr, String>,
    counters: Counters,
    options: ResolverOptions,
}

impl Shared {
    fn shard(&self, addr: &IpAddr) -> MutexGuard<'_, HashMap<IpAddr, Slot>> {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        let shard = &self.shards[hasher.finish() as usize % self.shards.len()];
        // A panic while holding a shard cannot leave a slot half-written.
        shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn shard_capacity(&self) -> usize {
        (self.options.max_entries / self.shards.len()).max(1)
    }

    /// Forgets a pending lookup that will never run; its waiters get `None`.
    fn abandon(&self, addr: IpAddr) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        if let Some(Slot::Pending { waiters }) = self.shard(&addr).remove(&addr) {
            for waiter in waiters {
                let _ = waiter.send(None);
            }
        }
    }

    fn complete(&self, addr: IpAddr, result: Result<String, ResolveError>) {
        let (name, ttl) = match result {
            Ok(name) => {
                debug!("Resolved {} to {}", addr, name);
                (Some(name), self.options.ttl)
            }
            Err(e) => {
                debug!("{} ({})", e, addr);
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                (None, self.options.negative_ttl)
            }
        };
        let previous = self.shard(&addr).insert(
            addr,
            Slot::Resolved {
                name: name.clone(),
                resolved_at: Instant::now(),
                ttl,
            },
        );
        if let Some(Slot::Pending { waiters }) = previous {
            for waiter in waiters {
                // The caller may have stopped waiting.
                let _ = waiter.send(name.clone());
            }
        }
    }
}

/// What a lookup found in the cache.
enum Cached {
    Fresh(Option<String>),
    Pending,
}

/// Caches reverse lookups and runs them on background threads so callers
/// never wait on DNS. At most one lookup per address is in flight.
pub struct AddressResolver {
    shared: Arc<Shared>,
    jobs: Sender<IpAddr>,
}

impl AddressResolver {
    pub fn new(lookup: Arc<dyn NameLookup>, options: ResolverOptions) -> Self {
        Self::with_known_hosts(lookup, options, HashMap::new())
    }

    /// Names in `known_hosts` are served directly and never looked up.
    pub fn with_known_hosts(
        lookup: Arc<dyn NameLookup>,
        options: ResolverOptions,
        known_hosts: HashMap<IpAddr, String>,
    ) -> Self {
        let (jobs, job_rx) = bounded::<IpAddr>(options.max_pending.max(1));
        let threads = options.threads.max(1);
        let shared = Arc::new(Shared {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            known_hosts,
            counters: Counters::default(),
            options,
        });

        for i in 0..threads {
            let job_rx: Receiver<IpAddr> = job_rx.clone();
            let shared = Arc::clone(&shared);
            let lookup = Arc::clone(&lookup);
            // Lookup threads are detached: one stuck in a slow query must not
            // hold up pipeline shutdown. They exit once the sender is dropped.
            let spawned = thread::Builder::new()
                .name(format!("resolver-{}", i + 1))
                .spawn(move || {
                    while let Ok(addr) = job_rx.recv() {
                        shared.counters.lookups.fetch_add(1, Ordering::Relaxed);
                        // A panicking backend must not strand the address in Pending.
                        let result = panic::catch_unwind(AssertUnwindSafe(|| lookup.reverse(addr)))
                            .unwrap_or_else(|_| Err(ResolveError(format!("lookup of {} panicked", addr))));
                        shared.complete(addr, result);
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn resolver thread: {}", e);
            }
        }

        AddressResolver { shared, jobs }
    }

    /// Current name for `addr` without blocking. A miss schedules a
    /// background lookup so later records from the same address get a name.
    pub fn cached_name(&self, addr: IpAddr) -> Option<String> {
        match self.begin(addr, None) {
            Cached::Fresh(name) => name,
            Cached::Pending => None,
        }
    }

    /// Delivers the name for `addr` (or `None` if the lookup failed) on the
    /// returned channel, immediately when cached.
    pub fn resolve_async(&self, addr: IpAddr) -> Receiver<Option<String>> {
        let (tx, rx) = bounded(1);
        if let Cached::Fresh(name) = self.begin(addr, Some(tx.clone())) {
            let _ = tx.send(name);
        }
        rx
    }

    /// Number of cached entries, pending lookups included.
    pub fn len(&self) -> usize {
        self.shared
            .shards
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn begin(&self, addr: IpAddr, waiter: Option<Sender<Option<String>>>) -> Cached {
        let counters = &self.shared.counters;
        if let Some(name) = self.shared.known_hosts.get(&addr) {
            counters.hits.fetch_add(1, Ordering::Relaxed);
            return Cached::Fresh(Some(name.clone()));
        }

        let mut shard = self.shared.shard(&addr);
        if let Some(slot) = shard.get_mut(&addr) {
            if let Some(name) = slot.fresh() {
                let counter = if name.is_some() { &counters.hits } else { &counters.negative };
                counter.fetch_add(1, Ordering::Relaxed);
                return Cached::Fresh(name.clone());
            }
            if let Slot::Pending { waiters } = slot {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                waiters.extend(waiter);
                return Cached::Pending;
            }
        }

        // Missing or expired: this caller starts the lookup.
        counters.misses.fetch_add(1, Ordering::Relaxed);
        if !shard.contains_key(&addr) && shard.len() >= self.shared.shard_capacity() {
            shard.retain(|_, slot| !slot.expired());
            if shard.len() >= self.shared.shard_capacity() {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                return Cached::Fresh(None);
            }
        }
        shard.insert(
            addr,
            Slot::Pending {
                waiters: waiter.into_iter().collect(),
            },
        );
        drop(shard);
        match self.jobs.try_send(addr) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("Lookup backlog full, leaving {} unresolved", addr);
                self.shared.abandon(addr);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("No resolver threads running, {} stays unresolved", addr);
                self.shared
                    .complete(addr, Err(ResolveError("no resolver threads running".to_string())));
            }
        }
        Cached::Pending
    }

    pub fn stats(&self) -> ResolverStats {
        let c = &self.shared.counters;
        ResolverStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            negative: c.negative.load(Ordering::Relaxed),
            lookups: c.lookups.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
        }
    }
}
