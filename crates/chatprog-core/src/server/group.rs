//! The chat roster: members keyed by unique name, insertion-ordered.
//!
//! The group is not synchronized; only the server's control loop ever
//! touches it, which serializes all access.

use std::fmt;

use crate::crypto::PeerKey;
use crate::error::{Error, Result};
use crate::server::conn::SecureConn;

/// Per-connection state of an admitted member.
pub struct Member {
    name: String,
    color: String,
    /// Moderation privileges.
    pub is_manager: bool,
    /// Muted members cannot send messages to the group.
    pub is_muted: bool,
    public_key: PeerKey,
    pub(super) conn: SecureConn,
    /// Descriptor reserved by an attachment announcement, awaiting its blob.
    pub(super) pending_upload: Option<u32>,
}

impl Member {
    pub(super) fn new(
        name: String,
        color: String,
        is_manager: bool,
        public_key: PeerKey,
        conn: SecureConn,
    ) -> Self {
        Self {
            name,
            color,
            is_manager,
            is_muted: false,
            public_key,
            conn,
            pending_upload: None,
        }
    }

    /// The member's unique, immutable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display color (hex) assigned at admission.
    pub fn color(&self) -> &str {
        &self.color
    }

    /// The RSA public key the member presented at admission.
    pub fn public_key(&self) -> &PeerKey {
        &self.public_key
    }
}

impl fmt::Display for Member {
    /// Managers are displayed with an `@` prefix.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_manager {
            write!(f, "@{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("is_manager", &self.is_manager)
            .field("is_muted", &self.is_muted)
            .finish()
    }
}

/// The live, insertion-ordered set of admitted members.
///
/// Backed by a `Vec` with linear lookup: rosters are small and insertion
/// order drives broadcast fairness and listing order.
#[derive(Default)]
pub struct Group {
    members: Vec<Member>,
}

impl Group {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    /// Append a member.
    ///
    /// Append-only: the admitting caller must already have validated that
    /// the name is unique.
    pub fn add(&mut self, member: Member) {
        self.members.push(member);
    }

    /// Remove a member by name. Dropping the returned member closes its
    /// connection.
    pub fn remove_by_name(&mut self, name: &str) -> Result<Member> {
        match self.members.iter().position(|m| m.name == name) {
            Some(index) => Ok(self.members.remove(index)),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Whether a member with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }

    /// Look up a member by name.
    pub fn get(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Look up a member by name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| m.name == name)
    }

    /// Iterate members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    /// Iterate members mutably in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Member> {
        self.members.iter_mut()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Snapshot of member names in roster order.
    ///
    /// The control loop iterates this snapshot so that removals during
    /// dispatch never invalidate an in-progress traversal.
    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name.clone()).collect()
    }
}
