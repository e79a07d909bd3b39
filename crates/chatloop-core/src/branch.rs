//! Branch manager: ordered reference lists over the message pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::message::{BranchId, MessageId};

/// Where a branch diverged from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkPoint {
    pub branch: BranchId,
    pub message: MessageId,
}

/// One linear path through the pool. References are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    refs: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from: Option<ForkPoint>,
    pub created_at: DateTime<Utc>,
}

impl Branch {
    fn new(name: impl Into<String>, refs: Vec<MessageId>, forked_from: Option<ForkPoint>) -> Self {
        Self {
            id: BranchId::new(),
            name: name.into(),
            refs,
            forked_from,
            created_at: Utc::now(),
        }
    }

    pub fn refs(&self) -> &[MessageId] {
        &self.refs
    }

    pub fn last(&self) -> Option<MessageId> {
        self.refs.last().copied()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.refs.contains(&id)
    }
}

/// The set of branches of one conversation plus the active pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSet {
    branches: Vec<Branch>,
    active: BranchId,
}

impl Default for BranchSet {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchSet {
    /// A fresh set with a single empty `main` branch marked active.
    pub fn new() -> Self {
        let main = Branch::new("main", Vec::new(), None);
        Self {
            active: main.id,
            branches: vec![main],
        }
    }

    pub fn active_id(&self) -> BranchId {
        self.active
    }

    pub fn active(&self) -> &Branch {
        // `active` always names a branch in `branches`: it is only assigned
        // from ids validated by `set_active_branch` or created here.
        self.branches
            .iter()
            .find(|b| b.id == self.active)
            .unwrap_or(&self.branches[0])
    }

    pub fn get(&self, id: BranchId) -> Result<&Branch> {
        self.branches
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| EngineError::NotFound(format!("branch {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter()
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Append a pool reference to the active branch.
    pub fn append_to_active(&mut self, id: MessageId) {
        let active = self.active;
        if let Some(branch) = self.branches.iter_mut().find(|b| b.id == active) {
            branch.refs.push(id);
        }
    }

    /// Create a branch sharing the active branch's references up to and
    /// including `from`. The active branch itself is left untouched.
    pub fn fork(&mut self, from: MessageId) -> Result<BranchId> {
        let parent = self.active();
        let cut = parent
            .refs
            .iter()
            .position(|&id| id == from)
            .ok_or_else(|| EngineError::NotFound(format!("message {from} on active branch")))?;

        let prefix = parent.refs[..=cut].to_vec();
        let fork_point = ForkPoint {
            branch: parent.id,
            message: from,
        };
        let name = format!("branch-{}", self.branches.len());
        let branch = Branch::new(name, prefix, Some(fork_point));
        let id = branch.id;
        self.branches.push(branch);
        Ok(id)
    }

    pub fn set_active(&mut self, id: BranchId) -> Result<()> {
        self.get(id)?;
        self.active = id;
        Ok(())
    }
}
