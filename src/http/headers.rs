/// Ordered, case-insensitive, multi-valued header map.
///
/// Insertion order is preserved so heads are rendered the way they were
/// built; lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every value of `name` with `value`, keeping the first position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut i = 0;
                self.entries.retain(|(k, _)| {
                    let keep = i <= first || !k.eq_ignore_ascii_case(&name);
                    i += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Adds another entry for `name` after any existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Extends the first value of `name` as a comma-separated list, or adds it.
    pub fn append_value(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some((_, existing)) if existing.trim().is_empty() => *existing = value.to_string(),
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    /// Removes every value of `name`, returning the first.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain_mut(|(k, v)| {
            if !k.eq_ignore_ascii_case(name) {
                return true;
            }
            if removed.is_none() {
                removed = Some(std::mem::take(v));
            }
            false
        });
        removed
    }

    /// Whether any value of `name`, read as a comma-separated list, holds `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
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

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_keeps_order() {
        let mut headers = HeaderMap::new();
        headers.append("Host", "a");
        headers.append("Accept", "*/*");
        headers.append("host", "b");

        assert_eq!(headers.get("HOST"), Some("a"));
        assert_eq!(headers.get_all("Host").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            headers.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["Host", "Accept", "host"]
        );
    }

    #[test]
    fn values_outlive_the_name_used_to_find_them() {
        let headers: HeaderMap = [("Content-Type", "text/plain"), ("Via", "a"), ("via", "b")]
            .into_iter()
            .collect();

        let content_type = headers.get(&String::from("content-type"));
        let via: Vec<&str> = headers.get_all(&"VIA".to_string()).collect();

        assert_eq!(content_type, Some("text/plain"));
        assert_eq!(via, vec!["a", "b"]);
    }

    #[test]
    fn insert_replaces_all_values_in_place() {
        let mut headers: HeaderMap = [("A", "1"), ("B", "2"), ("a", "3")].into_iter().collect();
        headers.insert("a", "9");
        assert_eq!(headers.iter().collect::<Vec<_>>(), vec![("A", "9"), ("B", "2")]);
    }

    #[test]
    fn append_value_extends_list() {
        let mut headers = HeaderMap::new();
        headers.append_value("X-Forwarded-For", "10.0.0.1");
        headers.append_value("x-forwarded-for", "10.0.0.2");
        assert_eq!(headers.get("X-Forwarded-For"), Some("10.0.0.1, 10.0.0.2"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn token_lists() {
        let headers: HeaderMap = [("Connection", "Upgrade, close")].into_iter().collect();
        assert!(headers.has_token("connection", "CLOSE"));
        assert!(!headers.has_token("connection", "keep-alive"));
    }

    #[test]
    fn remove_returns_first() {
        let mut headers: HeaderMap = [("A", "1"), ("a", "2")].into_iter().collect();
        assert_eq!(headers.remove("A"), Some("1".to_string()));
        assert!(headers.is_empty());
        assert_eq!(headers.remove("A"), None);
    }
}
