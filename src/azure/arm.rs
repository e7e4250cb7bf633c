//! ARM REST implementation of the Azure client traits.
//!
//! Talks straight to `management.azure.com` with a client-credentials token
//! that is cached until shortly before expiry. Responses are decoded into
//! the narrow types the controllers consume; everything Azure returns that
//! the upgrade logic does not need is dropped at this boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::{Timestamp, ToSpan};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::controller::error::Error;
use crate::template::DesiredDeployment;

use super::clients::{ClientFactory, DeploymentsClient, ScaleSetsClient};
use super::types::{
    Deployment, EvictionOutcome, ProvisioningState, ResourceScope, ScaleSet, ScaleSetInstance,
};

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const DEPLOYMENTS_API_VERSION: &str = "2021-04-01";
const COMPUTE_API_VERSION: &str = "2024-07-01";

/// Service principal credentials for one subscription.
#[derive(Clone, Debug)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
}

impl AzureCredentials {
    /// Read credentials from the conventional AZURE_* environment
    /// variables.
    pub fn from_env() -> Result<Self, Error> {
        let var = |name: &str| {
            std::env::var(name).map_err(|_| Error::MissingField(name.to_string()))
        };
        Ok(Self {
            tenant_id: var("AZURE_TENANT_ID")?,
            client_id: var("AZURE_CLIENT_ID")?,
            client_secret: var("AZURE_CLIENT_SECRET")?,
            subscription_id: var("AZURE_SUBSCRIPTION_ID")?,
        })
    }
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Timestamp,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Shared token source for the ARM clients.
struct TokenSource {
    http: reqwest::Client,
    credentials: AzureCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    /// Return a bearer token, refreshing when within a minute of expiry.
    async fn token(&self) -> Result<String, Error> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Timestamp::now() + 60.seconds() {
                return Ok(token.access_token.clone());
            }
        }

        debug!(client_id = %self.credentials.client_id, "Requesting new ARM token");
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.credentials.tenant_id
        );
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("scope", "https://management.azure.com/.default"),
            ])
            .send()
            .await
            .map_err(|e| Error::azure("token", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::azure("token", format!("{status}: {body}")));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::azure("token", e))?;

        let entry = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Timestamp::now() + token.expires_in.seconds(),
        };
        *cached = Some(entry);
        Ok(token.access_token)
    }
}

/// One client handles both deployments and scale sets; the two trait
/// surfaces are just views on it.
pub struct ArmClient {
    http: reqwest::Client,
    tokens: Arc<TokenSource>,
    subscription_id: String,
}

impl ArmClient {
    async fn request(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, Error> {
        let token = self.tokens.token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        request
            .send()
            .await
            .map_err(|e| Error::azure(operation, e))
    }

    /// Issue a request and fail on any non-success status.
    async fn expect_success(
        &self,
        operation: &'static str,
        method: reqwest::Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, Error> {
        let response = self.request(operation, method, url, body).await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::azure(operation, format!("{status}: {body}")))
        }
    }

    fn deployment_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{MANAGEMENT_BASE}/subscriptions/{}/resourcegroups/{resource_group}/providers/Microsoft.Resources/deployments/{name}?api-version={DEPLOYMENTS_API_VERSION}",
            self.subscription_id
        )
    }

    fn vmss_url(&self, resource_group: &str, name: &str, path: &str) -> String {
        format!(
            "{MANAGEMENT_BASE}/subscriptions/{}/resourceGroups/{resource_group}/providers/Microsoft.Compute/virtualMachineScaleSets/{name}{path}?api-version={COMPUTE_API_VERSION}",
            self.subscription_id
        )
    }
}

// Wire shapes, reduced to the fields the controllers read.

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmDeployment {
    name: String,
    properties: ArmDeploymentProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmDeploymentProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    parameters: Option<BTreeMap<String, ArmParameter>>,
}

#[derive(Deserialize)]
struct ArmParameter {
    #[serde(default)]
    value: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmScaleSet {
    name: String,
    #[serde(default)]
    sku: Option<ArmSku>,
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    properties: ArmScaleSetProperties,
}

#[derive(Deserialize)]
struct ArmSku {
    #[serde(default)]
    capacity: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmScaleSetProperties {
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    virtual_machine_profile: Option<Value>,
}

#[derive(Deserialize)]
struct ArmList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstance {
    instance_id: String,
    properties: ArmInstanceProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmInstanceProperties {
    #[serde(default)]
    latest_model_applied: Option<bool>,
    #[serde(default)]
    provisioning_state: Option<String>,
    #[serde(default)]
    os_profile: Option<ArmOsProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmOsProfile {
    #[serde(default)]
    computer_name: Option<String>,
}

fn accelerated_networking(profile: Option<&Value>) -> Option<bool> {
    profile?
        .pointer("/networkProfile/networkInterfaceConfigurations/0/properties/enableAcceleratedNetworking")?
        .as_bool()
}

impl From<ArmScaleSet> for ScaleSet {
    fn from(raw: ArmScaleSet) -> Self {
        ScaleSet {
            name: raw.name,
            capacity: raw.sku.and_then(|s| s.capacity).unwrap_or(0),
            provisioning_state: ProvisioningState::parse(
                raw.properties.provisioning_state.as_deref().unwrap_or(""),
            ),
            tags: raw.tags.unwrap_or_default(),
            accelerated_networking: accelerated_networking(
                raw.properties.virtual_machine_profile.as_ref(),
            ),
        }
    }
}

impl From<ArmInstance> for ScaleSetInstance {
    fn from(raw: ArmInstance) -> Self {
        ScaleSetInstance {
            instance_id: raw.instance_id,
            name: raw
                .properties
                .os_profile
                .and_then(|p| p.computer_name)
                .unwrap_or_default(),
            latest_model_applied: raw.properties.latest_model_applied.unwrap_or(true),
            provisioning_state: ProvisioningState::parse(
                raw.properties.provisioning_state.as_deref().unwrap_or(""),
            ),
        }
    }
}

#[async_trait]
impl DeploymentsClient for ArmClient {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<Deployment>, Error> {
        let url = self.deployment_url(resource_group, name);
        let response = self
            .request("deployments.get", reqwest::Method::GET, &url, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::azure("deployments.get", format!("{status}: {body}")));
        }
        let raw: ArmDeployment = response
            .json()
            .await
            .map_err(|e| Error::azure("deployments.get", e))?;
        Ok(Some(Deployment {
            name: raw.name,
            provisioning_state: ProvisioningState::parse(
                raw.properties.provisioning_state.as_deref().unwrap_or(""),
            ),
            parameters: raw
                .properties
                .parameters
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(k, p)| p.value.map(|v| (k, v)))
                .collect(),
        }))
    }

    async fn create_or_update(
        &self,
        resource_group: &str,
        name: &str,
        desired: &DesiredDeployment,
    ) -> Result<(), Error> {
        let parameters: BTreeMap<&String, Value> = desired
            .parameters
            .iter()
            .map(|(k, v)| (k, json!({ "value": v })))
            .collect();
        let body = json!({
            "properties": {
                "mode": "Incremental",
                "template": desired.template,
                "parameters": parameters,
            }
        });
        let url = self.deployment_url(resource_group, name);
        self.expect_success(
            "deployments.createOrUpdate",
            reqwest::Method::PUT,
            &url,
            Some(&body),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScaleSetsClient for ArmClient {
    async fn get(&self, resource_group: &str, name: &str) -> Result<Option<ScaleSet>, Error> {
        let url = self.vmss_url(resource_group, name, "");
        let response = self
            .request("scaleSets.get", reqwest::Method::GET, &url, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::azure("scaleSets.get", format!("{status}: {body}")));
        }
        let raw: ArmScaleSet = response
            .json()
            .await
            .map_err(|e| Error::azure("scaleSets.get", e))?;
        Ok(Some(raw.into()))
    }

    async fn list_instances(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Vec<ScaleSetInstance>, Error> {
        let url = self.vmss_url(resource_group, name, "/virtualMachines");
        let response = self
            .expect_success("scaleSets.listInstances", reqwest::Method::GET, &url, None)
            .await?;
        let raw: ArmList<ArmInstance> = response
            .json()
            .await
            .map_err(|e| Error::azure("scaleSets.listInstances", e))?;
        Ok(raw.value.into_iter().map(Into::into).collect())
    }

    async fn update_instances(
        &self,
        resource_group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<(), Error> {
        let url = self.vmss_url(resource_group, name, "/manualupgrade");
        let body = json!({ "instanceIds": instance_ids });
        self.expect_success(
            "scaleSets.updateInstances",
            reqwest::Method::POST,
            &url,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn reimage_instance(
        &self,
        resource_group: &str,
        name: &str,
        instance_id: &str,
    ) -> Result<(), Error> {
        let url = self.vmss_url(
            resource_group,
            name,
            &format!("/virtualMachines/{instance_id}/reimage"),
        );
        self.expect_success("scaleSets.reimage", reqwest::Method::POST, &url, None)
            .await?;
        Ok(())
    }

    async fn delete_instances(
        &self,
        resource_group: &str,
        name: &str,
        instance_ids: &[String],
    ) -> Result<(), Error> {
        let url = self.vmss_url(resource_group, name, "/delete");
        let body = json!({ "instanceIds": instance_ids });
        self.expect_success(
            "scaleSets.deleteInstances",
            reqwest::Method::POST,
            &url,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn simulate_eviction(
        &self,
        resource_group: &str,
        name: &str,
        instance_id: &str,
    ) -> Result<EvictionOutcome, Error> {
        let url = self.vmss_url(
            resource_group,
            name,
            &format!("/virtualMachines/{instance_id}/simulateEviction"),
        );
        let response = self
            .request("scaleSets.simulateEviction", reqwest::Method::POST, &url, None)
            .await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Ok(EvictionOutcome::Conflict);
        }
        if status.is_success() {
            return Ok(EvictionOutcome::Accepted);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::azure(
            "scaleSets.simulateEviction",
            format!("{status}: {body}"),
        ))
    }

    async fn set_capacity(
        &self,
        resource_group: &str,
        name: &str,
        capacity: i64,
    ) -> Result<(), Error> {
        let url = self.vmss_url(resource_group, name, "");
        let body = json!({ "sku": { "capacity": capacity } });
        self.expect_success(
            "scaleSets.setCapacity",
            reqwest::Method::PATCH,
            &url,
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn set_tag(
        &self,
        resource_group: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        // ARM PATCH replaces the whole tags map, so merge with the current
        // set first.
        let current = ScaleSetsClient::get(self, resource_group, name)
            .await?
            .map(|v| v.tags)
            .unwrap_or_default();
        let mut tags = current;
        tags.insert(key.to_string(), value.to_string());

        let url = self.vmss_url(resource_group, name, "");
        let body = json!({ "tags": tags });
        self.expect_success("scaleSets.setTag", reqwest::Method::PATCH, &url, Some(&body))
            .await?;
        Ok(())
    }
}

/// Factory producing ARM clients from operator-level credentials. All
/// clusters share the token cache; the per-scope clients are cheap clones.
pub struct ArmClientFactory {
    http: reqwest::Client,
    tokens: Arc<TokenSource>,
    subscription_id: String,
}

impl ArmClientFactory {
    pub fn new(credentials: AzureCredentials) -> Self {
        let http = reqwest::Client::new();
        let subscription_id = credentials.subscription_id.clone();
        let tokens = Arc::new(TokenSource {
            http: http.clone(),
            credentials,
            cached: Mutex::new(None),
        });
        Self {
            http,
            tokens,
            subscription_id,
        }
    }

    fn client(&self) -> Arc<ArmClient> {
        Arc::new(ArmClient {
            http: self.http.clone(),
            tokens: self.tokens.clone(),
            subscription_id: self.subscription_id.clone(),
        })
    }
}

#[async_trait]
impl ClientFactory for ArmClientFactory {
    async fn deployments(
        &self,
        _scope: &ResourceScope,
    ) -> Result<Arc<dyn DeploymentsClient>, Error> {
        Ok(self.client())
    }

    async fn scale_sets(&self, _scope: &ResourceScope) -> Result<Arc<dyn ScaleSetsClient>, Error> {
        Ok(self.client())
    }
}
