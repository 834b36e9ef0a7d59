use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{NodeError, Result};
use crate::keys;

const LOGIN_PREFIX: &str = "nosana_secret_";

/// Client for the secret-proxy service. A signed login exchange yields a
/// short-lived bearer token, used to dereference secret placeholders
/// inside pipelines. Error messages name the key, never the value.
#[derive(Clone)]
pub struct SecretsClient {
    endpoint: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

impl SecretsClient {
    pub fn new(endpoint: impl Into<String>, http: Client) -> Self {
        Self { endpoint: endpoint.into(), http }
    }

    /// Sign `"nosana_secret_"` + timestamp with the node key and exchange
    /// it for a bearer token. `job` scopes the token to one job's secrets.
    pub async fn login(
        &self,
        signer: &Keypair,
        address: &Pubkey,
        job: Option<&Pubkey>,
    ) -> Result<String> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| NodeError::Config(format!("clock: {e}")))?
            .as_secs();
        let message = format!("{LOGIN_PREFIX}{timestamp}");
        let signature = keys::sign_message(signer, message.as_bytes());

        let mut form: HashMap<&str, String> = HashMap::from([
            ("address", address.to_string()),
            ("signature", signature.to_string()),
            ("timestamp", timestamp.to_string()),
        ]);
        if let Some(job) = job {
            form.insert("job", job.to_string());
        }
        debug!(%address, job = ?job, "secrets login");
        let response = self
            .http
            .post(format!("{}/login", self.endpoint))
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::HttpStatus(status));
        }
        let login: LoginResponse = response.json().await?;
        Ok(login.token)
    }

    /// All secrets visible to the given token.
    pub async fn get_all(&self, token: &str) -> Result<HashMap<String, Value>> {
        let response = self
            .http
            .get(format!("{}/secrets", self.endpoint))
            .header("Authorization", token)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::HttpStatus(status));
        }
        Ok(response.json().await?)
    }

    /// One secret by key; absence is a typed error naming the key.
    pub async fn get(&self, token: &str, key: &str) -> Result<Value> {
        self.get_all(token)
            .await?
            .remove(key)
            .ok_or_else(|| NodeError::SecretMissing(key.to_string()))
    }
}

/// Tag marking a secret placeholder inside a pipeline document:
/// `["nosana/secret", endpoint, key]`.
pub const SECRET_TAG: &str = "nosana/secret";

/// Dereferences secret placeholders in a pipeline using the node's own
/// signer, one login per distinct endpoint.
pub struct SecretResolver {
    config: Arc<crate::config::NodeConfig>,
    http: Client,
}

impl SecretResolver {
    pub fn new(config: Arc<crate::config::NodeConfig>, http: Client) -> Self {
        Self { config, http }
    }

    fn placeholder(value: &Value) -> Option<(&str, &str)> {
        let items = value.as_array()?;
        match items.as_slice() {
            [Value::String(tag), Value::String(endpoint), Value::String(key)]
                if tag == SECRET_TAG =>
            {
                Some((endpoint, key))
            }
            _ => None,
        }
    }

    /// Replace every `["nosana/secret", endpoint, key]` node in the
    /// pipeline with the secret's value. One login per distinct endpoint.
    pub async fn resolve(&self, pipeline: &mut Value, job: Option<&Pubkey>) -> Result<()> {
        let mut endpoints = std::collections::BTreeSet::new();
        collect_endpoints(pipeline, &mut endpoints);
        let mut fetched: HashMap<String, HashMap<String, Value>> = HashMap::new();
        for endpoint in endpoints {
            let client = SecretsClient::new(endpoint.clone(), self.http.clone());
            let token = client
                .login(&self.config.signer, &self.config.address, job)
                .await?;
            fetched.insert(endpoint, client.get_all(&token).await?);
        }
        substitute(pipeline, &fetched)
    }
}

fn collect_endpoints(value: &Value, out: &mut std::collections::BTreeSet<String>) {
    if let Some((endpoint, _)) = SecretResolver::placeholder(value) {
        out.insert(endpoint.to_string());
        return;
    }
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_endpoints(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_endpoints(item, out)),
        _ => {}
    }
}

fn substitute(value: &mut Value, fetched: &HashMap<String, HashMap<String, Value>>) -> Result<()> {
    if let Some((endpoint, key)) = SecretResolver::placeholder(value) {
        let secret = fetched
            .get(endpoint)
            .and_then(|secrets| secrets.get(key))
            .ok_or_else(|| NodeError::SecretMissing(key.to_string()))?;
        *value = secret.clone();
        return Ok(());
    }
    match value {
        Value::Array(items) => {
            for item in items {
                substitute(item, fetched)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, fetched)?;
            }
        }
        _ => {}
    }
    Ok(())
}
