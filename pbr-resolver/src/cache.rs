//! TTL-bounded cache of observed A/AAAA records and CNAME aliases.
//!
//! The cache answers two questions for the query pipeline: which addresses a
//! domain currently resolves to, and which other domains chain to a given
//! domain via CNAMEs. The latter is served from a reverse-alias index that is
//! rebuilt lazily after alias mutations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

/// One cached address with its absolute expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub ip: IpAddr,
    pub deadline: Instant,
}

#[derive(Debug)]
struct RecordEntry {
    addresses: Vec<AddressRecord>,
    /// Earliest deadline across `addresses`; the entry counts as expired once
    /// `now >= min_deadline`.
    min_deadline: Instant,
}

impl RecordEntry {
    fn recompute_min(&mut self) {
        self.min_deadline = self
            .addresses
            .iter()
            .map(|record| record.deadline)
            .min()
            .expect("record entries always hold at least one address");
    }
}

#[derive(Debug)]
struct AliasEntry {
    target: String,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    addresses: HashMap<String, RecordEntry>,
    aliases: HashMap<String, AliasEntry>,
    /// target -> sources, derived from live aliases.
    reverse: HashMap<String, Vec<String>>,
    reverse_valid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub address_count: usize,
    pub alias_count: usize,
}

pub struct RecordsCache {
    state: RwLock<State>,
    /// Recency list over the union of address and alias keys. Lock order is
    /// always `state` before `recency`; neither is held across I/O.
    recency: Mutex<LruCache<String, ()>>,
}

impl RecordsCache {
    pub fn new(max_domains: usize) -> Self {
        let cap = NonZeroUsize::new(max_domains.max(1)).expect("clamped to at least 1");

        Self {
            state: RwLock::new(State {
                reverse_valid: true,
                ..State::default()
            }),
            recency: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Records `ip` for `domain`.
    ///
    /// Returns `true` iff the call introduced work downstream: the pair is
    /// new, or its previous deadline had already passed. A live pair only has
    /// its deadline extended to `max(current, now + ttl)` and returns `false`.
    pub fn add_address(&self, domain: &str, ip: IpAddr, ttl: Duration) -> bool {
        let now = Instant::now();
        let deadline = now + ttl;

        let mut state = self.state.write();

        let entry = state
            .addresses
            .entry(domain.to_owned())
            .or_insert_with(|| RecordEntry {
                addresses: Vec::new(),
                min_deadline: deadline,
            });

        let fresh = match entry.addresses.iter_mut().find(|record| record.ip == ip) {
            Some(record) if now < record.deadline => {
                record.deadline = record.deadline.max(deadline);
                false
            }
            Some(record) => {
                record.deadline = deadline;
                true
            }
            None => {
                entry.addresses.push(AddressRecord { ip, deadline });
                true
            }
        };

        entry.recompute_min();
        self.touch_locked(&mut state, domain);

        fresh
    }

    /// Upserts the one CNAME of `domain`. A self-alias is ignored.
    pub fn add_alias(&self, domain: &str, target: &str, ttl: Duration) {
        if domain == target {
            return;
        }

        let deadline = Instant::now() + ttl;

        let mut state = self.state.write();

        let invalidate = match state.aliases.get_mut(domain) {
            Some(entry) => {
                let changed = entry.target != target;
                if changed {
                    entry.target = target.to_owned();
                }
                entry.deadline = deadline;

                changed
            }
            None => {
                state.aliases.insert(
                    domain.to_owned(),
                    AliasEntry {
                        target: target.to_owned(),
                        deadline,
                    },
                );

                true
            }
        };

        if invalidate {
            state.reverse_valid = false;
        }

        self.touch_locked(&mut state, domain);
    }

    /// Live addresses of `domain`.
    ///
    /// The hit path runs under the shared lock. An expired entry upgrades to
    /// the exclusive lock, re-checks, and drops the entry's addresses *and*
    /// its outgoing alias in one step so a stale address cannot keep leaking
    /// through the alias chain.
    pub fn get_addresses(&self, domain: &str) -> Vec<AddressRecord> {
        let now = Instant::now();

        {
            let state = self.state.read();
            match state.addresses.get(domain) {
                None => return Vec::new(),
                Some(entry) if now < entry.min_deadline => {
                    let records = entry.addresses.clone();
                    drop(state);

                    self.recency.lock().promote(domain);

                    return records;
                }
                Some(_) => {}
            }
        }

        let mut state = self.state.write();
        let now = Instant::now();

        match state.addresses.get(domain) {
            None => Vec::new(),
            Some(entry) if now < entry.min_deadline => {
                let records = entry.addresses.clone();

                self.recency.lock().promote(domain);

                records
            }
            Some(_) => {
                state.addresses.remove(domain);
                if state.aliases.remove(domain).is_some() {
                    state.reverse_valid = false;
                }
                self.recency.lock().pop(domain);

                Vec::new()
            }
        }
    }

    /// The domain itself plus every domain that (transitively) chains to it
    /// via live aliases, in BFS order from the argument.
    pub fn get_aliases(&self, domain: &str) -> Vec<String> {
        let now = Instant::now();

        let state = {
            let state = self.state.read();
            if state.reverse_valid {
                state
            } else {
                drop(state);

                let mut state = self.state.write();
                if !state.reverse_valid {
                    rebuild_reverse(&mut state, now);
                }

                RwLockWriteGuard::downgrade(state)
            }
        };

        let mut result = vec![domain.to_owned()];
        let mut seen = HashSet::from([domain.to_owned()]);
        let mut queue = VecDeque::from([domain.to_owned()]);

        while let Some(current) = queue.pop_front() {
            let Some(sources) = state.reverse.get(&current) else {
                continue;
            };

            for source in sources {
                if seen.contains(source) {
                    continue;
                }

                let live = state
                    .aliases
                    .get(source)
                    .is_some_and(|alias| now < alias.deadline && alias.target == current);
                if !live {
                    continue;
                }

                seen.insert(source.clone());
                result.push(source.clone());
                queue.push_back(source.clone());
            }
        }

        drop(state);
        self.recency.lock().promote(domain);

        result
    }

    /// Walks outgoing aliases starting at `domain`, stopping on expiry or on
    /// the first revisited name. Cached alias data can legally form cycles
    /// (eviction and re-insertion race), so the visited set is required for
    /// termination, not an optimization.
    pub fn get_target_chain(&self, domain: &str) -> Vec<String> {
        let now = Instant::now();

        let state = self.state.read();

        let mut chain = vec![domain.to_owned()];
        let mut visited = HashSet::from([domain.to_owned()]);
        let mut current = domain.to_owned();

        while let Some(alias) = state.aliases.get(&current) {
            if now >= alias.deadline {
                break;
            }
            if !visited.insert(alias.target.clone()) {
                break;
            }

            chain.push(alias.target.clone());
            current = alias.target.clone();
        }

        drop(state);
        self.recency.lock().promote(domain);

        chain
    }

    /// Removes every entry whose earliest deadline has passed and every
    /// expired alias. If any address of an entry is expired the whole entry
    /// goes: the kernel IP set ages its entries independently, and partial
    /// survival would surface as one resolver answer losing half its
    /// addresses.
    pub fn evict_expired(&self) {
        let now = Instant::now();

        let mut state = self.state.write();

        let expired_addresses: Vec<String> = state
            .addresses
            .iter()
            .filter(|(_, entry)| entry.min_deadline <= now)
            .map(|(domain, _)| domain.clone())
            .collect();
        for domain in &expired_addresses {
            state.addresses.remove(domain);
        }

        let expired_aliases: Vec<String> = state
            .aliases
            .iter()
            .filter(|(_, alias)| alias.deadline <= now)
            .map(|(domain, _)| domain.clone())
            .collect();
        for domain in &expired_aliases {
            state.aliases.remove(domain);
        }
        if !expired_aliases.is_empty() {
            state.reverse_valid = false;
        }

        let mut recency = self.recency.lock();
        for domain in expired_addresses.iter().chain(&expired_aliases) {
            if !state.addresses.contains_key(domain) && !state.aliases.contains_key(domain) {
                recency.pop(domain);
            }
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = State {
            reverse_valid: true,
            ..State::default()
        };

        self.recency.lock().clear();
    }

    /// Counts of live address entries and live aliases.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.read();

        CacheStats {
            address_count: state
                .addresses
                .values()
                .filter(|entry| now < entry.min_deadline)
                .count(),
            alias_count: state
                .aliases
                .values()
                .filter(|alias| now < alias.deadline)
                .count(),
        }
    }

    /// Touches `domain` in the recency list; on capacity overflow the victim
    /// is dropped from both maps.
    fn touch_locked(&self, state: &mut State, domain: &str) {
        let evicted = self.recency.lock().push(domain.to_owned(), ());

        if let Some((victim, ())) = evicted {
            if victim == domain {
                return;
            }

            state.addresses.remove(&victim);
            if state.aliases.remove(&victim).is_some() {
                state.reverse_valid = false;
            }
        }
    }
}

fn rebuild_reverse(state: &mut State, now: Instant) {
    let mut reverse: HashMap<String, Vec<String>> = HashMap::new();

    for (source, alias) in &state.aliases {
        if now < alias.deadline {
            reverse.entry(alias.target.clone()).or_default().push(source.clone());
        }
    }
    for sources in reverse.values_mut() {
        sources.sort_unstable();
    }

    state.reverse = reverse;
    state.reverse_valid = true;
}
