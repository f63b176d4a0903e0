//! Strongly-typed identifier wrappers to prevent accidental misuse of strings.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Generate the 6-character random suffix used in agent ids and archived
/// plan names: the first six hex digits of a v4 uuid.
pub fn rand6() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(id: impl Into<Arc<str>>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok($name::new(s))
            }
        }
    };
}

id_type! {
    /// A work-unit identifier of the form `ITEM-XXXXXXXX` (8 uppercase hex).
    ItemId
}

id_type! {
    /// An agent identifier. See [`AgentId::generate`] for the format.
    AgentId
}

id_type! {
    /// A unique event identifier (uuid v4).
    EventId
}

impl ItemId {
    /// Allocate a fresh item id: `ITEM-` plus 8 uppercase hex digits.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        Self::new(format!("ITEM-{hex}"))
    }
}

impl EventId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl AgentId {
    /// Generate an agent id.
    ///
    /// Repository-bound agents get `agent-{role}--{repo}--{rand6}`; planner
    /// and other system agents get `agent-{role}--{rand6}`. The double
    /// hyphen is the structural separator, so role labels themselves may
    /// contain single hyphens (`review-receiver`).
    pub fn generate(role: &str, repo: Option<&str>) -> Self {
        match repo {
            Some(repo) => Self::new(format!("agent-{role}--{repo}--{}", rand6())),
            None => Self::new(format!("agent-{role}--{}", rand6())),
        }
    }

    /// Recover the role from an agent id.
    ///
    /// Understands the double-hyphen format as well as legacy single-hyphen
    /// ids (`agent-{role}-{rand6}`, role without hyphens). Returns `None`
    /// when the id does not carry a recognizable role.
    pub fn parse_role(&self) -> Option<&str> {
        let rest = self.as_str().strip_prefix("agent-")?;
        if rest.contains("--") {
            let role = rest.split("--").next()?;
            return (!role.is_empty()).then_some(role);
        }
        // Legacy: agent-{role}-{rand6}
        let (role, suffix) = rest.rsplit_once('-')?;
        if role.is_empty() || suffix.is_empty() {
            return None;
        }
        Some(role)
    }

    /// Recover the repository name from a double-hyphen agent id, if bound.
    pub fn parse_repo(&self) -> Option<&str> {
        let rest = self.as_str().strip_prefix("agent-")?;
        let mut parts = rest.split("--");
        let _role = parts.next()?;
        let second = parts.next()?;
        // Two segments means role + rand6 (no repository).
        parts.next()?;
        Some(second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_shape() {
        let id = ItemId::generate();
        assert!(id.as_str().starts_with("ITEM-"));
        assert_eq!(id.as_str().len(), 13);
        assert!(id.as_str()[5..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn agent_id_with_repo() {
        let id = AgentId::generate("front", Some("frontend"));
        assert!(id.as_str().starts_with("agent-front--frontend--"));
        assert_eq!(id.parse_role(), Some("front"));
        assert_eq!(id.parse_repo(), Some("frontend"));
    }

    #[test]
    fn agent_id_without_repo() {
        let id = AgentId::generate("planner", None);
        assert!(id.as_str().starts_with("agent-planner--"));
        assert_eq!(id.parse_role(), Some("planner"));
        assert_eq!(id.parse_repo(), None);
    }

    #[test]
    fn hyphenated_role_survives_round_trip() {
        let id = AgentId::generate("review-receiver", None);
        assert_eq!(id.parse_role(), Some("review-receiver"));
        assert_eq!(id.parse_repo(), None);
    }

    #[test]
    fn legacy_single_hyphen_role() {
        let id = AgentId::new("agent-planner-a1b2c3");
        assert_eq!(id.parse_role(), Some("planner"));
    }

    #[test]
    fn unparseable_ids_yield_none() {
        assert_eq!(AgentId::new("not-an-agent").parse_role(), None);
        assert_eq!(AgentId::new("agent-").parse_role(), None);
        assert_eq!(AgentId::new("agent---abc").parse_role(), None);
    }

    #[test]
    fn rand6_is_six_hex_chars() {
        let s = rand6();
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = ItemId::new("ITEM-DEADBEEF");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"ITEM-DEADBEEF\"");
        let back: ItemId = serde_json::from_str("\"ITEM-DEADBEEF\"").unwrap();
        assert_eq!(back, id);
    }
}
