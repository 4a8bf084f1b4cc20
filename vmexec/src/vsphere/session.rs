//! Management API session.

use super::{API_TIMEOUT, VmRef, VsphereError, describe_error_body};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, info, warn};

/// Header carrying the session token.
pub const SESSION_HEADER: &str = "vmware-api-session-id";

#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct VmSummary {
    vm: String,
    name: String,
    #[serde(default)]
    power_state: Option<String>,
}

/// An authenticated management API session.
///
/// Not shared between runs. Call [`Session::logout`] when done; dropping the
/// session leaves it to expire on the server.
#[derive(Clone)]
pub struct Session {
    client: Client,
    endpoint: Url,
    token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"***")
            .finish()
    }
}

impl Session {
    /// Log in with basic auth. `insecure` disables TLS certificate checks.
    pub async fn login(
        endpoint: &Url,
        user: &str,
        password: &str,
        insecure: bool,
    ) -> Result<Self, VsphereError> {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(VsphereError::Client)?;
        Self::login_with_client(client, endpoint, user, password).await
    }

    /// Log in using an existing HTTP client.
    pub async fn login_with_client(
        client: Client,
        endpoint: &Url,
        user: &str,
        password: &str,
    ) -> Result<Self, VsphereError> {
        let url = api_url(endpoint, &["api", "session"])?;
        debug!(endpoint = %endpoint, user, "logging in");

        let response = client
            .post(url)
            .basic_auth(user, Some(password))
            .send()
            .await
            .map_err(|source| VsphereError::Unreachable {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, _) = describe_error_body(&body);
            return Err(VsphereError::Login {
                status: status.as_u16(),
                message,
            });
        }

        let token: String = response
            .json()
            .await
            .map_err(|e| VsphereError::Decode {
                operation: "login",
                reason: e.to_string(),
            })?;

        info!(endpoint = %endpoint, user, "management session established");
        Ok(Self {
            client,
            endpoint: endpoint.clone(),
            token,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// End the session on the server.
    pub async fn logout(self) -> Result<(), VsphereError> {
        let url = api_url(&self.endpoint, &["api", "session"])?;
        let response = self
            .client
            .delete(url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|source| VsphereError::Unreachable {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        check_status("logout", response).await?;
        debug!("management session closed");
        Ok(())
    }

    /// Find a VM by name, optionally restricted to one datacenter.
    pub async fn find_vm(&self, name: &str, datacenter: Option<&str>) -> Result<VmRef, VsphereError> {
        let mut url = api_url(&self.endpoint, &["api", "vcenter", "vm"])?;
        url.query_pairs_mut().append_pair("names", name);

        if let Some(dc_name) = datacenter {
            let mut dc_url = api_url(&self.endpoint, &["api", "vcenter", "datacenter"])?;
            dc_url.query_pairs_mut().append_pair("names", dc_name);
            let datacenters: Vec<DatacenterSummary> = self.get_json("list datacenters", dc_url).await?;
            let dc = datacenters
                .into_iter()
                .find(|dc| dc.name == dc_name)
                .ok_or_else(|| VsphereError::DatacenterNotFound(dc_name.to_string()))?;
            url.query_pairs_mut().append_pair("datacenters", &dc.datacenter);
        }

        let vms: Vec<VmSummary> = self.get_json("list VMs", url).await?;
        let mut matches = vms.into_iter().filter(|vm| vm.name == name);
        let vm = matches
            .next()
            .ok_or_else(|| VsphereError::VmNotFound(name.to_string()))?;
        if matches.next().is_some() {
            warn!(name, chosen = %vm.vm, "several VMs share this name, using the first");
        }
        if let Some(state) = vm.power_state.as_deref()
            && state != "POWERED_ON"
        {
            warn!(name, power_state = state, "VM is not powered on");
        }

        debug!(name, id = %vm.vm, "VM located");
        Ok(VmRef {
            id: vm.vm,
            name: vm.name,
        })
    }

    async fn get_json<R: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: Url,
    ) -> Result<R, VsphereError> {
        let response = self
            .client
            .get(url)
            .header(SESSION_HEADER, &self.token)
            .send()
            .await
            .map_err(|source| VsphereError::Unreachable {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        let response = check_status(operation, response).await?;
        response.json().await.map_err(|e| VsphereError::Decode {
            operation,
            reason: e.to_string(),
        })
    }
}

async fn check_status(operation: &'static str, response: Response) -> Result<Response, VsphereError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let (message, _) = describe_error_body(&body);
    Err(VsphereError::Api {
        operation,
        status: status.as_u16(),
        message,
    })
}

/// `endpoint` with its path replaced by `segments`, each percent-encoded.
pub(super) fn api_url(endpoint: &Url, segments: &[&str]) -> Result<Url, VsphereError> {
    let mut url = endpoint.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| VsphereError::InvalidEndpoint(endpoint.to_string()))?
        .clear()
        .extend(segments);
    Ok(url)
}
