// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashSet;

/// IDs of the emails delivered for one inbox, plus the last emails-hash observed on the server.
#[derive(Clone, Debug, Default)]
pub struct SeenSet {
    ids: HashSet<String>,
    emails_hash: Option<String>,
}

impl SeenSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Marks an email as delivered. Returns false if it was delivered already.
    pub fn claim(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        self.ids.insert(id.to_string())
    }

    pub fn ids(&self) -> &HashSet<String> {
        &self.ids
    }

    /// Drops IDs of emails which disappeared from the server.
    pub fn forget<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        for id in ids {
            self.ids.remove(id);
        }
    }

    pub fn emails_hash(&self) -> Option<&str> {
        self.emails_hash.as_deref()
    }

    pub fn set_emails_hash(&mut self, hash: String) {
        self.emails_hash = Some(hash);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SeenSet;

    #[test]
    fn claim_once() {
        let mut seen = SeenSet::default();
        assert!(seen.claim("a"));
        assert!(!seen.claim("a"));
        assert!(seen.contains("a"));
        assert_eq!(seen.len(), 1);

        seen.forget(&["a".to_string()]);
        assert!(seen.is_empty());
        assert!(seen.claim("a"));
    }

    #[test]
    fn emails_hash() {
        let mut seen = SeenSet::default();
        assert_eq!(seen.emails_hash(), None);
        seen.set_emails_hash("h1".into());
        assert_eq!(seen.emails_hash(), Some("h1"));
    }
}
