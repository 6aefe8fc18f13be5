/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::accounts::{AccountError, AccountProvider, Group, User};
use crate::constants::{CLIENT_EXTENDED_TIMEOUT, CLIENT_TIMEOUT};
use crate::proto::{self, ProtoRequest};

/// Socket client for the accounts daemon, implementing the same
/// [`AccountProvider`] surface the daemon serves. One connection per
/// request: write the command, read until the daemon closes.
pub struct Client {
    socket_path: String,
    read_timeout: Duration,
    extended_read_timeout: Duration,
}

impl Client {
    pub fn new(socket_path: &str) -> Client {
        Client {
            socket_path: socket_path.to_string(),
            read_timeout: CLIENT_TIMEOUT,
            extended_read_timeout: CLIENT_EXTENDED_TIMEOUT,
        }
    }

    async fn send(&self, request: &ProtoRequest) -> Result<Vec<String>, AccountError> {
        // Lookups that can block on an on-demand refresh in the daemon get
        // the longer read deadline.
        let read_timeout = match request {
            ProtoRequest::UserByName(_) | ProtoRequest::Keys(_) => self.extended_read_timeout,
            _ => self.read_timeout,
        };
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|err| AccountError::Transport(err.to_string()))?;
        debug!(%request, "sending request");
        timeout(CLIENT_TIMEOUT, stream.write_all(request.to_string().as_bytes()))
            .await
            .map_err(|_| AccountError::Transport("write timed out".to_string()))?
            .map_err(|err| AccountError::Transport(err.to_string()))?;

        let mut data = Vec::new();
        timeout(read_timeout, stream.read_to_end(&mut data))
            .await
            .map_err(|_| AccountError::Transport("read timed out".to_string()))?
            .map_err(|err| AccountError::Transport(err.to_string()))?;
        let text = String::from_utf8(data)
            .map_err(|_| AccountError::InvalidResponse("not utf-8".to_string()))?;

        let mut lines = text.split('\n');
        match lines.next() {
            Some(proto::STATUS_SUCCESS) => Ok(lines.map(str::to_string).collect()),
            Some(proto::STATUS_NOT_FOUND) => Err(AccountError::NotFound),
            _ => Err(AccountError::RequestFailed),
        }
    }

    async fn user(&self, request: ProtoRequest) -> Result<User, AccountError> {
        let lines = self.send(&request).await?;
        match lines.first() {
            Some(line) => {
                proto::unmarshal_user(line).map_err(|err| AccountError::InvalidResponse(err.to_string()))
            }
            None => Err(AccountError::InvalidResponse("no user in response".to_string())),
        }
    }

    async fn group(&self, request: ProtoRequest) -> Result<Group, AccountError> {
        let lines = self.send(&request).await?;
        match lines.first() {
            Some(line) => proto::unmarshal_group(line)
                .map_err(|err| AccountError::InvalidResponse(err.to_string())),
            None => Err(AccountError::InvalidResponse("no group in response".to_string())),
        }
    }
}

#[async_trait]
impl AccountProvider for Client {
    async fn user_by_name(&self, name: &str) -> Result<User, AccountError> {
        self.user(ProtoRequest::UserByName(name.to_string())).await
    }

    async fn user_by_uid(&self, uid: u32) -> Result<User, AccountError> {
        self.user(ProtoRequest::UserByUid(uid)).await
    }

    async fn users(&self) -> Result<Vec<User>, AccountError> {
        self.send(&ProtoRequest::Users)
            .await?
            .iter()
            .map(|line| {
                proto::unmarshal_user(line)
                    .map_err(|err| AccountError::InvalidResponse(err.to_string()))
            })
            .collect()
    }

    async fn group_by_name(&self, name: &str) -> Result<Group, AccountError> {
        self.group(ProtoRequest::GroupByName(name.to_string())).await
    }

    async fn group_by_gid(&self, gid: u32) -> Result<Group, AccountError> {
        self.group(ProtoRequest::GroupByGid(gid)).await
    }

    async fn groups(&self) -> Result<Vec<Group>, AccountError> {
        self.send(&ProtoRequest::Groups)
            .await?
            .iter()
            .map(|line| {
                proto::unmarshal_group(line)
                    .map_err(|err| AccountError::InvalidResponse(err.to_string()))
            })
            .collect()
    }

    async fn names(&self) -> Result<Vec<String>, AccountError> {
        self.send(&ProtoRequest::Names).await
    }

    async fn is_name(&self, name: &str) -> Result<bool, AccountError> {
        match self.send(&ProtoRequest::IsName(name.to_string())).await {
            Ok(_) => Ok(true),
            Err(AccountError::NotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn authorized_keys(&self, username: &str) -> Result<Vec<String>, AccountError> {
        self.send(&ProtoRequest::Keys(username.to_string())).await
    }
}
