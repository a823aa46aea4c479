//! Turns the stored message tree into linear views for display.

use std::collections::{HashMap, HashSet};

use arbor_storage::{MessageId, MessageRecord, MessageRole};
use serde::Serialize;

/// Which fallback produced a [`ResolvedPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathTier {
    /// Every requested id exists; returned in the requested order.
    Explicit,
    /// Some requested ids are gone; survivors re-sorted by creation time.
    Filtered,
    /// No usable path; every message of the conversation by creation time.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPath {
    pub tier: PathTier,
    pub messages: Vec<MessageRecord>,
}

impl ResolvedPath {
    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|message| message.id).collect()
    }
}

/// One node of the rendered tree. The synthetic root has no `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub id: Option<MessageId>,
    pub role: Option<MessageRole>,
    pub preview: String,
    pub partial: bool,
    pub children: Vec<TreeNode>,
}

const PREVIEW_CHARS: usize = 80;

pub struct PathResolver<'a> {
    messages: &'a [MessageRecord],
    by_id: HashMap<MessageId, &'a MessageRecord>,
    children: HashMap<MessageId, Vec<MessageId>>,
}

impl<'a> PathResolver<'a> {
    pub fn new(messages: &'a [MessageRecord]) -> Self {
        let by_id = messages
            .iter()
            .map(|message| (message.id, message))
            .collect::<HashMap<_, _>>();

        // Children come from parent pointers so a stale cache cannot hide a branch.
        let mut ordered = messages.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|message| creation_key(message));
        let mut children: HashMap<MessageId, Vec<MessageId>> = HashMap::new();
        for message in ordered {
            if let Some(parent_id) = message.parent_id
                && by_id.contains_key(&parent_id)
            {
                children.entry(parent_id).or_default().push(message.id);
            }
        }

        Self {
            messages,
            by_id,
            children,
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&'a MessageRecord> {
        self.by_id.get(&message_id).copied()
    }

    pub fn resolve(&self, path: Option<&[MessageId]>) -> ResolvedPath {
        let requested = path.unwrap_or_default();

        if !requested.is_empty() {
            let mut seen = HashSet::with_capacity(requested.len());
            let unique = requested
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect::<Vec<_>>();
            let surviving = unique
                .iter()
                .filter_map(|id| self.get(*id))
                .collect::<Vec<_>>();

            if surviving.len() == unique.len() {
                return ResolvedPath {
                    tier: PathTier::Explicit,
                    messages: surviving.into_iter().cloned().collect(),
                };
            }

            if !surviving.is_empty() {
                let mut messages = surviving.into_iter().cloned().collect::<Vec<_>>();
                messages.sort_by_key(creation_key);
                return ResolvedPath {
                    tier: PathTier::Filtered,
                    messages,
                };
            }
        }

        let mut seen = HashSet::with_capacity(self.messages.len());
        let mut messages = self
            .messages
            .iter()
            .filter(|message| seen.insert(message.id))
            .cloned()
            .collect::<Vec<_>>();
        messages.sort_by_key(creation_key);
        ResolvedPath {
            tier: PathTier::Fallback,
            messages,
        }
    }

    /// Root-to-`leaf` chain. Empty when `leaf` is unknown.
    pub fn ancestry(&self, leaf: MessageId) -> Vec<&'a MessageRecord> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = self.get(leaf);

        while let Some(message) = cursor {
            if !visited.insert(message.id) {
                tracing::warn!(
                    message_id = %message.id,
                    "cycle in parent pointers, ancestry truncated"
                );
                break;
            }
            chain.push(message);
            cursor = message.parent_id.and_then(|parent_id| self.get(parent_id));
        }

        chain.reverse();
        chain
    }

    /// Follows the most recent child from `from` down to a leaf.
    pub fn deepest_leaf(&self, from: MessageId) -> Option<MessageId> {
        let mut current = self.get(from)?.id;
        let mut visited = HashSet::new();
        while visited.insert(current) {
            match self.children.get(&current).and_then(|children| children.last()) {
                Some(next) => current = *next,
                None => break,
            }
        }
        Some(current)
    }

    /// Ancestry of the deepest leaf below `from`; the default display path after a write.
    pub fn path_through(&self, from: MessageId) -> Vec<MessageId> {
        self.deepest_leaf(from)
            .map(|leaf| self.ancestry(leaf).iter().map(|message| message.id).collect())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> Vec<&'a MessageRecord> {
        let mut roots = self
            .messages
            .iter()
            .filter(|message| {
                message
                    .parent_id
                    .is_none_or(|parent_id| !self.by_id.contains_key(&parent_id))
            })
            .collect::<Vec<_>>();
        roots.sort_by_key(|message| creation_key(message));
        roots
    }

    /// Whole conversation as one tree under a synthetic root.
    pub fn overview(&self) -> TreeNode {
        let roots = self.roots();

        // Post-order walk on an explicit stack: a node is built once all of its children
        // are, whatever their timestamps say.
        let mut built: HashMap<MessageId, TreeNode> = HashMap::with_capacity(self.by_id.len());
        let mut visited = HashSet::with_capacity(self.by_id.len());
        let mut stack = roots.iter().map(|root| (root.id, false)).collect::<Vec<_>>();

        while let Some((id, expanded)) = stack.pop() {
            let child_ids = self.children.get(&id).map(Vec::as_slice).unwrap_or_default();
            if !expanded {
                if visited.insert(id) {
                    stack.push((id, true));
                    stack.extend(child_ids.iter().map(|child_id| (*child_id, false)));
                }
                continue;
            }

            let Some(message) = self.get(id) else {
                continue;
            };
            let children = child_ids
                .iter()
                .filter_map(|child_id| built.remove(child_id))
                .collect();
            built.insert(
                id,
                TreeNode {
                    id: Some(id),
                    role: Some(message.role),
                    preview: preview(&message.content),
                    partial: message.partial,
                    children,
                },
            );
        }

        TreeNode {
            id: None,
            role: None,
            preview: String::new(),
            partial: false,
            children: roots
                .into_iter()
                .filter_map(|root| built.remove(&root.id))
                .collect(),
        }
    }
}

fn creation_key(message: &MessageRecord) -> (u64, MessageId) {
    (message.created_at_unix_ms, message.id)
}

fn preview(content: &str) -> String {
    let mut chars = content.chars();
    let head = chars.by_ref().take(PREVIEW_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
