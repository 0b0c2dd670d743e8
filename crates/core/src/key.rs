//! Object identity.
//!
//! An [`ObjectKey`] addresses one entity by `(namespace, name)`. The namespace
//! is absent for cluster-scoped entities. Keys render and parse as
//! `namespace/name` or plain `name`. Neither part may contain `/`, so the
//! rendered form identifies exactly one key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SEPARATOR: char = '/';

/// Identity of a namespaced or cluster-scoped entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    /// Key for an entity living in `namespace`.
    ///
    /// An empty namespace yields a cluster-scoped key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the name is empty or either part
    /// contains `/`.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.contains(SEPARATOR) {
            return Err(Error::invalid_key(
                format!("{namespace}{SEPARATOR}{name}"),
                "namespace contains '/'",
            ));
        }
        let namespace = (!namespace.is_empty()).then_some(namespace);
        Self::checked(namespace, name)
    }

    /// Key for a cluster-scoped entity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the name is empty or contains `/`.
    pub fn cluster(name: impl Into<String>) -> Result<Self> {
        Self::checked(None, name.into())
    }

    fn checked(namespace: Option<String>, name: String) -> Result<Self> {
        let render = || match &namespace {
            Some(ns) => format!("{ns}{SEPARATOR}{name}"),
            None => name.clone(),
        };
        if name.is_empty() {
            return Err(Error::invalid_key(render(), "empty name"));
        }
        if name.contains(SEPARATOR) {
            return Err(Error::invalid_key(render(), "name contains '/'"));
        }
        Ok(Self { namespace, name })
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_none()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}{SEPARATOR}{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(SEPARATOR) {
            None => Self::cluster(s),
            Some(("", _)) => Err(Error::invalid_key(s, "empty namespace")),
            Some((namespace, name)) => Self::namespaced(namespace, name),
        }
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.to_string()
    }
}
