//! Case-insensitive, multi-valued, insertion-ordered header map.
//!
//! Keys are lowercased on insert so comparisons never allocate twice; values
//! keep whatever casing the caller supplied. Iteration order is insertion
//! order, matching HTTP's "headers are a sequence" semantics rather than a
//! hash map's arbitrary order — this matters for `Vary` reconstruction and
//! for header-forwarding logs that diff what went out.

#[derive(Debug, Clone, Default)]
pub struct StringMap {
    entries: Vec<(String, String)>,
}

impl StringMap {
    pub fn new() -> Self {
        StringMap {
            entries: Vec::new(),
        }
    }

    fn lower(key: &str) -> String {
        key.to_ascii_lowercase()
    }

    /// Appends a new `(key, value)` pair without touching existing entries.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((Self::lower(key), value.into()));
    }

    /// Replaces the first matching entry with `value`, returning its
    /// previous value. If no entry existed, appends a new one and returns
    /// `None`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Option<String> {
        let key = Self::lower(key);
        for entry in self.entries.iter_mut() {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value.into()));
            }
        }
        self.entries.push((key, value.into()));
        None
    }

    /// Removes the first matching entry, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = Self::lower(key);
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Removes every matching entry.
    pub fn remove_all(&mut self, key: &str) {
        let key = Self::lower(key);
        self.entries.retain(|(k, _)| *k != key);
    }

    /// Removes every entry for `key`, then optionally inserts one fresh
    /// value. Used to strip attacker-controllable headers before optionally
    /// re-adding a proxy-derived value (e.g. `X-Forwarded-For`).
    pub fn secure_set(&mut self, key: &str, value: Option<impl Into<String>>) {
        self.remove_all(key);
        if let Some(value) = value {
            self.add(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = Self::lower(key);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Every value stored under `key`, in insertion order.
    pub fn equal_range<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        let key = Self::lower(key);
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn for_each(&self, key: &str, mut f: impl FnMut(&str)) {
        for value in self.equal_range(key) {
            f(value);
        }
    }

    /// Copies every value stored under `key` in `src` into `self`.
    pub fn copy_from(&mut self, src: &StringMap, key: &str) {
        let values: Vec<String> = src.equal_range(key).map(str::to_owned).collect();
        for value in values {
            self.add(key, value);
        }
    }

    /// Copies every entry in `src` whose key starts with `prefix`.
    pub fn prefix_copy_from(&mut self, src: &StringMap, prefix: &str) {
        let prefix = Self::lower(prefix);
        for (k, v) in src.entries.iter() {
            if k.starts_with(&prefix) {
                self.entries.push((k.clone(), v.clone()));
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, String)> for StringMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = StringMap::new();
        for (k, v) in iter {
            map.add(&k, v);
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let mut m = StringMap::new();
        m.add("Content-Type", "text/html");
        assert_eq!(m.get("content-type"), Some("text/html"));
        assert_eq!(m.get("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn add_preserves_multi_values_in_order() {
        let mut m = StringMap::new();
        m.add("Set-Cookie", "a=1");
        m.add("Set-Cookie", "b=2");
        let values: Vec<&str> = m.equal_range("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn set_replaces_first_and_returns_previous() {
        let mut m = StringMap::new();
        m.add("X-A", "1");
        m.add("X-A", "2");
        let prev = m.set("x-a", "3");
        assert_eq!(prev, Some("1".to_string()));
        let values: Vec<&str> = m.equal_range("x-a").collect();
        assert_eq!(values, vec!["3", "2"]);
    }

    #[test]
    fn secure_set_strips_before_adding() {
        let mut m = StringMap::new();
        m.add("Cookie", "stolen=1");
        m.add("Cookie", "stolen=2");
        m.secure_set("cookie", Some("fresh=1"));
        let values: Vec<&str> = m.equal_range("cookie").collect();
        assert_eq!(values, vec!["fresh=1"]);
    }

    #[test]
    fn prefix_copy_from_matches_case_insensitively() {
        let mut src = StringMap::new();
        src.add("X-CM4all-Beng-User", "bob");
        src.add("Other", "nope");
        let mut dst = StringMap::new();
        dst.prefix_copy_from(&src, "x-cm4all-");
        assert!(dst.contains("X-CM4all-Beng-User"));
        assert!(!dst.contains("Other"));
    }
}
