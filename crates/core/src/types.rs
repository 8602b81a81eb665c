use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! newtype_string {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string value.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Return the inner string as a str slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    PrincipalId,
    "The owning principal of one or more credentials (the account email)."
);
newtype_string!(CredentialId, "Opaque identifier of a single credential.");
newtype_string!(SubscriptionId, "Identifier of a webhook subscription.");

impl CredentialId {
    /// Generate a fresh random credential identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("cred_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl SubscriptionId {
    /// Generate a fresh random subscription identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("whsub_{}", uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_from_str() {
        let principal = PrincipalId::from("ada@example.com");
        assert_eq!(principal.as_str(), "ada@example.com");
        assert_eq!(principal.to_string(), "ada@example.com");
    }

    #[test]
    fn serializes_transparently() {
        let id = CredentialId::new("cred_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"cred_1\"");
    }

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let a = CredentialId::generate();
        let b = CredentialId::generate();
        assert!(a.as_str().starts_with("cred_"));
        assert_ne!(a, b);
        assert!(SubscriptionId::generate().as_str().starts_with("whsub_"));
    }
}
