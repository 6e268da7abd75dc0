// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Automation identity and the node credential-provider document

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub const ENV_APP_ID: &str = "EDGE_SP_APP_ID";
pub const ENV_TENANT_ID: &str = "EDGE_SP_TENANT_ID";
pub const ENV_SECRET: &str = "EDGE_SP_SECRET";

/// Lifetime of a freshly generated automation credential.
pub const CREDENTIAL_LIFETIME_DAYS: i64 = 90;

/// The cloud environment written into the credential-provider document.
pub const CLOUD_ENVIRONMENT: &str = "AzurePublicCloud";

/// The automation service principal and its current secret.
///
/// This only ever lives in memory. It reaches child processes through
/// per-process environment variables and is never written to disk.
#[derive(Debug)]
pub struct ServiceIdentity {
    pub app_id: String,
    pub tenant_id: String,
    pub secret: SecretString,
}

impl ServiceIdentity {
    /// Reads an identity supplied by the operator, for runs that do not
    /// include the DevOps layer.
    ///
    /// Returns `None` unless all three values are present and non-empty.
    pub fn from_lookup<F>(mut lookup: F) -> Option<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key| lookup(key).filter(|v| !v.trim().is_empty());
        let app_id = get(ENV_APP_ID)?;
        let tenant_id = get(ENV_TENANT_ID)?;
        let secret = get(ENV_SECRET)?;
        Some(Self { app_id, tenant_id, secret: SecretString::from(secret) })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// Configuration consumed by the node's cloud credential provider, which
/// the kubelet uses for secret-less registry authentication.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProviderConfig {
    pub cloud: String,
    pub tenant_id: String,
    #[serde(rename = "userAssignedIdentityID")]
    pub user_assigned_identity_id: String,
    pub use_managed_identity_extension: bool,
    pub use_instance_metadata: bool,
    pub subscription_id: String,
    pub resource_group: String,
    pub location: String,
}

impl CredentialProviderConfig {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        subscription_id: &str,
        resource_group: &str,
        location: &str,
    ) -> Self {
        Self {
            cloud: CLOUD_ENVIRONMENT.to_string(),
            tenant_id: tenant_id.to_string(),
            user_assigned_identity_id: client_id.to_string(),
            use_managed_identity_extension: true,
            use_instance_metadata: false,
            subscription_id: subscription_id.to_string(),
            resource_group: resource_group.to_string(),
            location: location.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self)
            .expect("credential provider config is always serializable")
    }

    /// Parses what is currently on the node; anything unreadable is treated
    /// as absent so that it gets overwritten.
    pub fn parse(contents: &str) -> Option<Self> {
        serde_json::from_str(contents).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn document_carries_exact_fields() {
        let config = CredentialProviderConfig::new(
            "tenant-1",
            "client-1",
            "sub-1",
            "ipc-acme-poc-dev-rg",
            "eastus",
        );
        let value: serde_json::Value =
            serde_json::from_str(&config.to_json()).unwrap();
        let expected = serde_json::json!({
            "cloud": "AzurePublicCloud",
            "tenantId": "tenant-1",
            "userAssignedIdentityID": "client-1",
            "useManagedIdentityExtension": true,
            "useInstanceMetadata": false,
            "subscriptionId": "sub-1",
            "resourceGroup": "ipc-acme-poc-dev-rg",
            "location": "eastus",
        });
        assert_eq!(value, expected);
        assert_eq!(
            CredentialProviderConfig::parse(&config.to_json()),
            Some(config)
        );
    }

    #[test]
    fn garbage_on_node_is_absent() {
        assert_eq!(CredentialProviderConfig::parse(""), None);
        assert_eq!(CredentialProviderConfig::parse("{\"cloud\": 1}"), None);
    }

    #[test]
    fn identity_requires_every_value() {
        let mut env = BTreeMap::from([
            (ENV_APP_ID, "app"),
            (ENV_TENANT_ID, "tenant"),
            (ENV_SECRET, "s3cret"),
        ]);
        fn lookup(
            env: &BTreeMap<&'static str, &'static str>,
        ) -> impl FnMut(&str) -> Option<String> {
            let env = env.clone();
            move |key: &str| env.get(key).map(|v| v.to_string())
        }

        let identity = ServiceIdentity::from_lookup(lookup(&env)).unwrap();
        assert_eq!(identity.app_id, "app");
        assert_eq!(identity.expose_secret(), "s3cret");
        assert!(!format!("{identity:?}").contains("s3cret"));

        env.insert(ENV_SECRET, " ");
        assert!(ServiceIdentity::from_lookup(lookup(&env)).is_none());
        env.remove(ENV_SECRET);
        assert!(ServiceIdentity::from_lookup(lookup(&env)).is_none());
    }
}
