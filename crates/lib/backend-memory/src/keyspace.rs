use std::collections::{BTreeSet, HashMap, VecDeque};

use conveyor_backends_core::{BackendError, BackendResult};

#[derive(Clone, Debug)]
pub(crate) struct LockEntry {
    pub owner: String,
    pub expires_at_ms: i64,
}

/// Sorted set ordered by `(score, member)`.
#[derive(Default, Debug)]
pub(crate) struct SortedSet {
    scores: HashMap<String, f64>,
}

impl SortedSet {
    pub fn add(&mut self, member: &str, score: f64) {
        self.scores.insert(member.to_string(), score);
    }

    pub fn remove(&mut self, member: &str) -> bool {
        self.scores.remove(member).is_some()
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn ordered(&self) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .scores
            .iter()
            .map(|(member, score)| (member.clone(), *score))
            .collect();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    pub fn range_by_score(&self, min: f64, max: f64, limit: usize) -> Vec<(String, f64)> {
        self.ordered()
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .take(limit)
            .collect()
    }

    pub fn first(&self) -> Option<(String, f64)> {
        self.ordered().into_iter().next()
    }
}

/// Every data structure the shared store exposes, keyed by string.
#[derive(Default, Debug)]
pub(crate) struct Keyspace {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    zsets: HashMap<String, SortedSet>,
    lists: HashMap<String, VecDeque<String>>,
    pub locks: HashMap<String, LockEntry>,
}

impl Keyspace {
    pub fn get(&self, key: &str) -> Option<&String> {
        self.strings.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.strings.insert(key.to_string(), value.into());
    }

    pub fn get_f64(&self, key: &str) -> BackendResult<Option<f64>> {
        self.strings
            .get(key)
            .map(|value| parse_float(key, value))
            .transpose()
    }

    pub fn get_u32(&self, key: &str) -> BackendResult<Option<u32>> {
        self.strings
            .get(key)
            .map(|value| {
                value.parse::<u32>().map_err(|err| {
                    BackendError::message(format!("value at {key} is not an integer: {err}"))
                })
            })
            .transpose()
    }

    /// Removes the key whatever its type.
    pub fn del(&mut self, key: &str) -> bool {
        let removed = [
            self.strings.remove(key).is_some(),
            self.hashes.remove(key).is_some(),
            self.sets.remove(key).is_some(),
            self.zsets.remove(key).is_some(),
            self.lists.remove(key).is_some(),
            self.locks.remove(key).is_some(),
        ];
        removed.contains(&true)
    }

    pub fn hget(&self, key: &str, field: &str) -> Option<&String> {
        self.hashes.get(key).and_then(|hash| hash.get(field))
    }

    pub fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> bool {
        let Some(hash) = self.hashes.get_mut(key) else {
            return false;
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            self.hashes.remove(key);
        }
        removed
    }

    pub fn hget_f64(&self, key: &str, field: &str) -> BackendResult<f64> {
        match self.hget(key, field) {
            Some(value) => parse_float(key, value),
            None => Ok(0.0),
        }
    }

    pub fn hincr_by_float(&mut self, key: &str, field: &str, delta: f64) -> BackendResult<f64> {
        let value = self.hget_f64(key, field)? + delta;
        self.hset(key, field, value.to_string());
        Ok(value)
    }

    pub fn hget_all(&self, key: &str) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        entries.sort();
        entries
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    pub fn srem(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }
        removed
    }

    pub fn scard(&self, key: &str) -> usize {
        self.sets.get(key).map_or(0, BTreeSet::len)
    }

    pub fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.zsets
            .entry(key.to_string())
            .or_default()
            .add(member, score);
    }

    pub fn zrem(&mut self, key: &str, member: &str) -> bool {
        let Some(zset) = self.zsets.get_mut(key) else {
            return false;
        };
        let removed = zset.remove(member);
        if zset.is_empty() {
            self.zsets.remove(key);
        }
        removed
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        self.zsets.get(key).and_then(|zset| zset.score(member))
    }

    pub fn zcard(&self, key: &str) -> usize {
        self.zsets.get(key).map_or(0, SortedSet::len)
    }

    pub fn zfirst(&self, key: &str) -> Option<(String, f64)> {
        self.zsets.get(key).and_then(SortedSet::first)
    }

    pub fn zrange_by_score(&self, key: &str, min: f64, max: f64, limit: usize) -> Vec<(String, f64)> {
        self.zsets
            .get(key)
            .map(|zset| zset.range_by_score(min, max, limit))
            .unwrap_or_default()
    }

    pub fn zordered(&self, key: &str) -> Vec<(String, f64)> {
        self.zsets.get(key).map(SortedSet::ordered).unwrap_or_default()
    }

    pub fn rpush(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    pub fn lpop(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }

    pub fn llen(&self, key: &str) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }
}

fn parse_float(key: &str, value: &str) -> BackendResult<f64> {
    value
        .parse::<f64>()
        .map_err(|err| BackendError::message(format!("value at {key} is not a float: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_set_orders_by_score_then_member() {
        let mut keyspace = Keyspace::default();
        keyspace.zadd("z", "b", 2.0);
        keyspace.zadd("z", "a", 2.0);
        keyspace.zadd("z", "c", 1.0);

        let members: Vec<String> = keyspace
            .zordered("z")
            .into_iter()
            .map(|(member, _)| member)
            .collect();
        assert_eq!(members, vec!["c", "a", "b"]);
        assert_eq!(keyspace.zrange_by_score("z", 1.5, 3.0, 1).len(), 1);
    }

    #[test]
    fn empty_collections_are_dropped() {
        let mut keyspace = Keyspace::default();
        keyspace.sadd("s", "x");
        assert!(keyspace.srem("s", "x"));
        assert_eq!(keyspace.scard("s"), 0);
        assert!(!keyspace.del("s"));
    }

    #[test]
    fn hincr_starts_from_zero() {
        let mut keyspace = Keyspace::default();
        assert_eq!(keyspace.hincr_by_float("h", "t", 2.5).expect("incr"), 2.5);
        assert_eq!(keyspace.hincr_by_float("h", "t", -1.0).expect("incr"), 1.5);
    }
}
