/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::accounts::{Group, User};
use crate::config::GcuaConfig;
use crate::constants::{DEFAULT_CONN_TIMEOUT, METADATA_BASE};
use crate::source::{AccountSource, KeysView, Roster, SourceError};

const METADATA_FLAVOR: &str = "Metadata-Flavor";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    expires_at: SystemTime,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LinuxUserView {
    username: String,
    uid: u32,
    gid: u32,
    gecos: String,
    home_directory: String,
    shell: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LinuxGroupView {
    group_name: String,
    gid: u32,
    members: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct LinuxAccountViews {
    user_views: Vec<LinuxUserView>,
    group_views: Vec<LinuxGroupView>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountViewsResponse {
    resource: Option<LinuxAccountViews>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthorizedKeysView {
    keys: Vec<String>,
    sudoer: bool,
}

#[derive(Debug, Default, Deserialize)]
struct KeysViewResponse {
    resource: Option<AuthorizedKeysView>,
}

/// [`AccountSource`] backed by the compute user-accounts REST API. Instance
/// identity and OAuth tokens come from the VM metadata server.
pub struct ComputeAccountsSource {
    http: reqwest::Client,
    api_base: String,
    instance_base: String,
    token: Mutex<Option<CachedToken>>,
}

impl ComputeAccountsSource {
    pub fn new(config: &GcuaConfig) -> Result<ComputeAccountsSource, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CONN_TIMEOUT))
            .user_agent(concat!("gcuad/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport)?;
        Ok(ComputeAccountsSource {
            http,
            api_base: config.get_api_base().trim_end_matches('/').to_string(),
            instance_base: config.get_instance_base().trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    async fn metadata(&self, path: &str) -> Result<String, SourceError> {
        let url = format!("{METADATA_BASE}{path}");
        let response = self
            .http
            .get(&url)
            .header(METADATA_FLAVOR, "Google")
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(SourceError::BadResponse(format!(
                "metadata {path}: status {}",
                response.status()
            )));
        }
        response.text().await.map_err(transport)
    }

    async fn access_token(&self) -> Result<String, SourceError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if SystemTime::now() < token.expires_at {
                return Ok(token.token.clone());
            }
        }
        let url = format!("{METADATA_BASE}instance/service-accounts/default/token");
        let response = self
            .http
            .get(&url)
            .header(METADATA_FLAVOR, "Google")
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(SourceError::BadResponse(format!(
                "token: status {}",
                response.status()
            )));
        }
        let token: TokenResponse = response.json().await.map_err(transport)?;
        // Renew a minute early so in-flight requests do not race expiry.
        let expires_at =
            SystemTime::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn instance_info(&self) -> Result<(String, String, String), SourceError> {
        let project = self.metadata("project/project-id").await?;
        // The zone arrives as projects/<number>/zones/<zone>.
        let zone_path = self.metadata("instance/zone").await?;
        let zone = zone_path
            .rsplit('/')
            .next()
            .unwrap_or(zone_path.as_str())
            .to_string();
        let name = self.metadata("instance/name").await?;
        let instance = format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.instance_base, project, zone, name
        );
        Ok((project, zone, instance))
    }
}

#[async_trait]
impl AccountSource for ComputeAccountsSource {
    async fn fetch_roster(&self) -> Result<Roster, SourceError> {
        info!("fetching users and groups");
        let (project, zone, instance) = self.instance_info().await?;
        let token = self.access_token().await?;
        let url = format!(
            "{}/projects/{}/zones/{}/linuxAccountViews",
            self.api_base, project, zone
        );
        let response = self
            .http
            .get(&url)
            .query(&[("instance", instance.as_str())])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport)?;
        if !response.status().is_success() {
            return Err(SourceError::BadResponse(format!(
                "linuxAccountViews: status {}",
                response.status()
            )));
        }
        let views: AccountViewsResponse = response.json().await.map_err(transport)?;
        // An absent resource means the instance simply has no accounts.
        Ok(views.resource.map(roster_from_views).unwrap_or_default())
    }

    async fn fetch_keys(&self, name: &str) -> Result<KeysView, SourceError> {
        debug!(user = %name, "fetching authorized keys");
        let (project, zone, instance) = self.instance_info().await?;
        let token = self.access_token().await?;
        let url = format!(
            "{}/projects/{}/zones/{}/authorizedKeysView/{}",
            self.api_base, project, zone, name
        );
        let response = self
            .http
            .post(&url)
            .query(&[("instance", instance.as_str())])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            // Unknown upstream is not an error; roster users without keys
            // must stay cacheable.
            info!(user = %name, "user has no authorized keys upstream");
            return Ok(KeysView::default());
        }
        if !response.status().is_success() {
            return Err(SourceError::BadResponse(format!(
                "authorizedKeysView: status {}",
                response.status()
            )));
        }
        let view: KeysViewResponse = response.json().await.map_err(transport)?;
        Ok(view.resource.map(keys_from_view).unwrap_or_default())
    }
}

fn transport(err: reqwest::Error) -> SourceError {
    SourceError::Transport(err.to_string())
}

fn roster_from_views(views: LinuxAccountViews) -> Roster {
    Roster {
        users: views
            .user_views
            .into_iter()
            .map(|view| User {
                name: view.username,
                uid: view.uid,
                gid: view.gid,
                gecos: view.gecos,
                home_directory: view.home_directory,
                shell: view.shell,
            })
            .collect(),
        groups: views
            .group_views
            .into_iter()
            .map(|view| Group {
                name: view.group_name,
                gid: view.gid,
                members: view.members,
            })
            .collect(),
    }
}

fn keys_from_view(view: AuthorizedKeysView) -> KeysView {
    KeysView {
        keys: view.keys,
        sudoer: view.sudoer,
    }
}
