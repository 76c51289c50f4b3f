//! Endpoint descriptors identifying one device access point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message security mode negotiated with the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// No signing or encryption
    #[default]
    None,
    /// Messages are signed
    Sign,
    /// Messages are signed and encrypted
    SignAndEncrypt,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Sign => write!(f, "Sign"),
            Self::SignAndEncrypt => write!(f, "SignAndEncrypt"),
        }
    }
}

/// Reference to a credential held by an external vault.
///
/// Only the identifier travels through the pipeline; the secret itself is
/// resolved by the device transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialRef {
    /// Anonymous access
    Anonymous,
    /// Username/password stored under `secret_id`
    UserName {
        /// User name
        user: String,
        /// Vault identifier of the password
        secret_id: String,
    },
    /// X.509 user certificate stored under `secret_id`
    Certificate {
        /// Vault identifier of the certificate and key
        secret_id: String,
    },
}

impl CredentialRef {
    fn id(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::UserName { secret_id, .. } | Self::Certificate { secret_id } => secret_id,
        }
    }
}

/// Address plus security configuration of one device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Endpoint URL (e.g., `opc.tcp://plc-7:4840`)
    pub url: String,
    /// Security mode
    #[serde(default)]
    pub security_mode: SecurityMode,
    /// Security policy URI or short name
    #[serde(default = "default_security_policy")]
    pub security_policy: String,
    /// Credential used to activate the session
    #[serde(default)]
    pub credential: Option<CredentialRef>,
    /// Application URI reported by the server, if known
    #[serde(default)]
    pub application_uri: Option<String>,
}

fn default_security_policy() -> String {
    "None".to_string()
}

impl EndpointDescriptor {
    /// Create an unsecured, anonymous endpoint descriptor.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            security_mode: SecurityMode::None,
            security_policy: default_security_policy(),
            credential: None,
            application_uri: None,
        }
    }

    /// Set the security mode and policy.
    #[must_use]
    pub fn with_security(mut self, mode: SecurityMode, policy: impl Into<String>) -> Self {
        self.security_mode = mode;
        self.security_policy = policy.into();
        self
    }

    /// Set the credential reference.
    #[must_use]
    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Key identifying the pooled session for this endpoint.
    ///
    /// Two descriptors differing only in `application_uri` share a session.
    #[must_use]
    pub fn key(&self) -> EndpointKey {
        let credential = self
            .credential
            .as_ref()
            .map_or("anonymous", CredentialRef::id);
        EndpointKey(format!(
            "{}|{}|{}|{}",
            self.url.trim_end_matches('/').to_ascii_lowercase(),
            self.security_mode,
            self.security_policy,
            credential
        ))
    }
}

/// Session pool key derived from an [`EndpointDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_url_case_and_trailing_slash() {
        let a = EndpointDescriptor::new("opc.tcp://PLC-1:4840/");
        let b = EndpointDescriptor::new("opc.tcp://plc-1:4840");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_distinguishes_security_and_credentials() {
        let plain = EndpointDescriptor::new("opc.tcp://plc-1:4840");
        let secured = plain
            .clone()
            .with_security(SecurityMode::SignAndEncrypt, "Basic256Sha256");
        let with_user = plain.clone().with_credential(CredentialRef::UserName {
            user: "operator".to_string(),
            secret_id: "vault/plc-1".to_string(),
        });

        assert_ne!(plain.key(), secured.key());
        assert_ne!(plain.key(), with_user.key());
    }
}
