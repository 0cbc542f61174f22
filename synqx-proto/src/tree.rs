//! Ordered path tree backing both the mailbox service and the in-memory
//! mailbox used in tests.
//!
//! Values live only at leaves. Writing a path replaces any value at an
//! ancestor or beneath it, so a path never holds a value and children at the
//! same time. Every mutation returns the leaf-level [`MailboxEvent`]s it
//! produced, so callers can fan them out to watchers.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::mailbox::{ChildEntry, MailboxEvent, MailboxValue, PathChange};
use crate::path::MailboxPath;

/// An ordered map from leaf path to value.
#[derive(Debug, Clone, Default)]
pub struct PathTree {
    entries: BTreeMap<MailboxPath, MailboxValue>,
}

impl PathTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaf values in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the value stored exactly at `path`.
    #[must_use]
    pub fn get(&self, path: &MailboxPath) -> Option<&MailboxValue> {
        self.entries.get(path)
    }

    /// Returns the values one level beneath `parent`, ordered by key.
    ///
    /// Deeper descendants are not included.
    #[must_use]
    pub fn children(&self, parent: &MailboxPath) -> Vec<ChildEntry> {
        self.descendants(parent)
            .filter(|(path, _)| path.parent().as_ref() == Some(parent))
            .map(|(path, value)| ChildEntry {
                key: path.last_segment().to_string(),
                value: value.clone(),
            })
            .collect()
    }

    /// Number of direct children of `parent`.
    #[must_use]
    pub fn child_count(&self, parent: &MailboxPath) -> usize {
        self.descendants(parent)
            .filter(|(path, _)| path.parent().as_ref() == Some(parent))
            .count()
    }

    /// Sets `path` to `value`, clearing any ancestor value and any subtree.
    pub fn set(&mut self, path: MailboxPath, value: MailboxValue) -> Vec<MailboxEvent> {
        let mut events = self.clear_ancestors(&path);
        events.extend(self.clear_descendants(&path));
        self.entries.insert(path.clone(), value.clone());
        events.push(MailboxEvent {
            path,
            value: Some(value),
        });
        events
    }

    /// Removes `path` and everything beneath it.
    ///
    /// Removing an absent path is a no-op that produces no events.
    pub fn remove(&mut self, path: &MailboxPath) -> Vec<MailboxEvent> {
        let mut events = Vec::new();
        if self.entries.remove(path).is_some() {
            events.push(MailboxEvent {
                path: path.clone(),
                value: None,
            });
        }
        events.extend(self.clear_descendants(path));
        events
    }

    /// Applies a batch of changes in order.
    pub fn apply(&mut self, changes: Vec<PathChange>) -> Vec<MailboxEvent> {
        let mut events = Vec::new();
        for change in changes {
            match change.value {
                Some(value) => events.extend(self.set(change.path, value)),
                None => events.extend(self.remove(&change.path)),
            }
        }
        events
    }

    /// Drops the lowest-keyed direct children of `parent` until at most
    /// `cap` remain. Keys are time-ordered, so the oldest go first.
    pub fn evict_oldest(&mut self, parent: &MailboxPath, cap: usize) -> Vec<MailboxEvent> {
        let children: Vec<MailboxPath> = self
            .descendants(parent)
            .filter(|(path, _)| path.parent().as_ref() == Some(parent))
            .map(|(path, _)| path.clone())
            .collect();
        let excess = children.len().saturating_sub(cap);
        children
            .into_iter()
            .take(excess)
            .flat_map(|path| self.remove(&path))
            .collect()
    }

    fn descendants<'a>(
        &'a self,
        parent: &MailboxPath,
    ) -> impl Iterator<Item = (&'a MailboxPath, &'a MailboxValue)> + 'a {
        let prefix = format!("{parent}/");
        self.entries
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(move |(path, _)| path.as_str().starts_with(&prefix))
    }

    fn clear_descendants(&mut self, path: &MailboxPath) -> Vec<MailboxEvent> {
        let doomed: Vec<MailboxPath> = self
            .descendants(path)
            .map(|(child, _)| child.clone())
            .collect();
        doomed
            .into_iter()
            .filter_map(|child| {
                self.entries.remove(&child).map(|_| MailboxEvent {
                    path: child,
                    value: None,
                })
            })
            .collect()
    }

    fn clear_ancestors(&mut self, path: &MailboxPath) -> Vec<MailboxEvent> {
        let mut events = Vec::new();
        let mut cursor = path.parent();
        while let Some(ancestor) = cursor {
            if self.entries.remove(&ancestor).is_some() {
                events.push(MailboxEvent {
                    path: ancestor.clone(),
                    value: None,
                });
            }
            cursor = ancestor.parent();
        }
        events
    }
}
