// Core domain types shared across all gitmirror crates.
//
// Every identifier that crosses a trust boundary (URL path, request body,
// git output) is validated once at construction and carried as a newtype.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum repository id length in characters.
const MAX_REPOSITORY_ID_CHARS: usize = 128;

/// Maximum branch name length in bytes.
const MAX_BRANCH_BYTES: usize = 255;

/// Prefix of every branch ref.
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("repository id is empty")]
    EmptyRepositoryId,

    #[error("repository id exceeds {MAX_REPOSITORY_ID_CHARS} characters")]
    RepositoryIdTooLong,

    #[error("repository id contains invalid character {0:?}")]
    RepositoryIdInvalidChar(char),

    #[error("branch name is empty")]
    EmptyBranch,

    #[error("branch name exceeds {MAX_BRANCH_BYTES} bytes")]
    BranchTooLong,

    #[error("invalid branch name {name:?}: {reason}")]
    InvalidBranch { name: String, reason: &'static str },

    #[error("ref {0:?} is not a branch")]
    NotABranch(String),

    #[error("invalid commit hash {0:?}")]
    InvalidCommitHash(String),
}

// ── RepositoryId ────────────────────────────────────────────────────

/// Identifier of one mirrored repository (`[A-Za-z0-9._-]`, no leading dot).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        if value.is_empty() {
            return Err(NameError::EmptyRepositoryId);
        }
        if value.chars().count() > MAX_REPOSITORY_ID_CHARS {
            return Err(NameError::RepositoryIdTooLong);
        }
        if let Some(bad) =
            value.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(NameError::RepositoryIdInvalidChar(bad));
        }
        if value.starts_with('.') {
            return Err(NameError::RepositoryIdInvalidChar('.'));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ── BranchName ──────────────────────────────────────────────────────

/// Short branch name, e.g. `main` or `feature/login`.
///
/// Follows the `git check-ref-format --branch` rules so a validated name can
/// always be passed to git as `refs/heads/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into();
        validate_branch(&value)?;
        Ok(Self(value))
    }

    /// Parse a full ref (`refs/heads/<name>`) into its branch name.
    pub fn from_ref(refname: &str) -> Result<Self, NameError> {
        match refname.strip_prefix(BRANCH_REF_PREFIX) {
            Some(short) => Self::new(short),
            None => Err(NameError::NotABranch(refname.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full ref name: `refs/heads/<name>`.
    pub fn full_ref(&self) -> String {
        format!("{BRANCH_REF_PREFIX}{}", self.0)
    }
}

fn validate_branch(name: &str) -> Result<(), NameError> {
    let invalid = |reason| NameError::InvalidBranch { name: name.to_string(), reason };

    if name.is_empty() {
        return Err(NameError::EmptyBranch);
    }
    if name.len() > MAX_BRANCH_BYTES {
        return Err(NameError::BranchTooLong);
    }
    if name == "@" {
        return Err(invalid("\"@\" is reserved"));
    }
    if name.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(invalid("empty path component"));
    }
    if name.ends_with('.') {
        return Err(invalid("must not end with '.'"));
    }
    if name.contains("..") {
        return Err(invalid("must not contain '..'"));
    }
    if name.contains("@{") {
        return Err(invalid("must not contain '@{'"));
    }
    if name.chars().any(|c| c.is_ascii_control() || " ~^:?*[\\".contains(c)) {
        return Err(invalid("contains a forbidden character"));
    }
    for component in name.split('/') {
        if component.starts_with('.') {
            return Err(invalid("component must not start with '.'"));
        }
        if component.ends_with(".lock") {
            return Err(invalid("component must not end with '.lock'"));
        }
    }
    Ok(())
}

// ── CommitHash ──────────────────────────────────────────────────────

/// Full object id of a commit: 40 (SHA-1) or 64 (SHA-256) lowercase hex.
///
/// The all-zero id is the protocol's "no ref" marker and never parses; absent
/// refs are modelled as `Option<CommitHash>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(value: impl Into<String>) -> Result<Self, NameError> {
        let value = value.into().trim().to_ascii_lowercase();
        let well_formed = matches!(value.len(), 40 | 64)
            && value.bytes().all(|b| b.is_ascii_hexdigit())
            && !is_zero_oid(&value);
        if !well_formed {
            return Err(NameError::InvalidCommitHash(value));
        }
        Ok(Self(value))
    }

    /// Parse a hash that may be the all-zero "absent" marker.
    pub fn parse_optional(value: &str) -> Result<Option<Self>, NameError> {
        if is_zero_oid(value.trim()) && matches!(value.trim().len(), 40 | 64) {
            return Ok(None);
        }
        Self::new(value).map(Some)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// The all-zero id of the same width as `self`.
    pub fn zero_like(&self) -> String {
        "0".repeat(self.0.len())
    }
}

/// True for the all-zero object id of any width.
pub fn is_zero_oid(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b == b'0')
}

// ── Shared conversions ──────────────────────────────────────────────

macro_rules! string_newtype {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $ty {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }
    };
}

string_newtype!(RepositoryId);
string_newtype!(BranchName);
string_newtype!(CommitHash);

// ── Ref snapshots ───────────────────────────────────────────────────

/// Point-in-time view of a repository's branch table.
pub type RefSnapshot = BTreeMap<BranchName, CommitHash>;

/// One branch whose value differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefChange {
    pub branch: BranchName,
    pub before: Option<CommitHash>,
    pub after: Option<CommitHash>,
}

impl RefChange {
    pub fn is_create(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}

/// Every branch where `before[b] != after[b]`, in branch order.
pub fn diff_refs(before: &RefSnapshot, after: &RefSnapshot) -> Vec<RefChange> {
    let branches: BTreeSet<&BranchName> = before.keys().chain(after.keys()).collect();
    branches
        .into_iter()
        .filter_map(|branch| {
            let old = before.get(branch);
            let new = after.get(branch);
            (old != new).then(|| RefChange {
                branch: branch.clone(),
                before: old.cloned(),
                after: new.cloned(),
            })
        })
        .collect()
}
