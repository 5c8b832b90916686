use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::GatewayError;

/// Keywords that may not appear as a component of an instance name, as they would make the
/// resource paths of the execution protocol ambiguous.
const RESERVED_KEYWORDS: &[&str] = &[
    "blobs",
    "uploads",
    "actions",
    "actionResults",
    "operations",
    "capabilities",
];

/// A validated instance name.
///
/// Instance names are `/`-separated lists of non-empty components, none of which may be a
/// reserved keyword. The empty string is a valid instance name without any components.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(value: &str) -> Result<Self, GatewayError> {
        if value.starts_with('/') || value.ends_with('/') || value.contains("//") {
            return Err(GatewayError::InvalidArgument(
                "Instance name contains redundant slashes".into(),
            ));
        }
        let name = Self(value.to_owned());
        if let Some(keyword) = name
            .components()
            .find(|component| RESERVED_KEYWORDS.contains(component))
        {
            return Err(GatewayError::InvalidArgument(format!(
                "Instance name contains reserved keyword {keyword:?}"
            )));
        }
        Ok(name)
    }

    /// The empty instance name.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|component| !component.is_empty())
    }

    /// Whether the components of `prefix` are a leading subsequence of the components of `self`.
    pub fn has_prefix(&self, prefix: &InstanceName) -> bool {
        let mut components = self.components();
        prefix
            .components()
            .all(|expected| components.next() == Some(expected))
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for InstanceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Self::new(&value).map_err(|err| serde::de::Error::custom(err.message()))
    }
}
