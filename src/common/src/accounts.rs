/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use async_trait::async_trait;

/// A Linux user account as presented to NSS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home_directory: String,
    pub shell: String,
}

/// A Linux group. Members may name users this host does not currently know;
/// they are carried as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub gid: u32,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("unable to find user with name {0:?}")]
    UserNameNotFound(String),
    #[error("unable to find user with UID {0}")]
    UidNotFound(u32),
    #[error("unable to find group with name {0:?}")]
    GroupNameNotFound(String),
    #[error("unable to find group with GID {0}")]
    GidNotFound(u32),
    /// A not-found reported over the wire, where the identifier is gone.
    #[error("unable to find user or group")]
    NotFound,
    /// The daemon rejected or failed the request.
    #[error("request failed")]
    RequestFailed,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl AccountError {
    /// True for the not-found taxonomy, which maps to 404 on the wire. All
    /// other failures map to 500.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            AccountError::UserNameNotFound(_)
                | AccountError::UidNotFound(_)
                | AccountError::GroupNameNotFound(_)
                | AccountError::GidNotFound(_)
                | AccountError::NotFound
        )
    }
}

/// The query surface for account information. Implemented by the caching
/// resolver inside the daemon and by the socket client outside it.
#[async_trait]
pub trait AccountProvider: Send + Sync {
    /// Fetch a user by login name.
    async fn user_by_name(&self, name: &str) -> Result<User, AccountError>;
    /// Fetch a user by UID.
    async fn user_by_uid(&self, uid: u32) -> Result<User, AccountError>;
    /// Fetch all known users. Order is unspecified.
    async fn users(&self) -> Result<Vec<User>, AccountError>;
    /// Fetch a group by name.
    async fn group_by_name(&self, name: &str) -> Result<Group, AccountError>;
    /// Fetch a group by GID.
    async fn group_by_gid(&self, gid: u32) -> Result<Group, AccountError>;
    /// Fetch all known groups, including the synthetic sudoers group.
    async fn groups(&self) -> Result<Vec<Group>, AccountError>;
    /// Fetch every known user and group name.
    async fn names(&self) -> Result<Vec<String>, AccountError>;
    /// Whether the name belongs to a known user or group.
    async fn is_name(&self, name: &str) -> Result<bool, AccountError>;
    /// The authorized SSH keys for the given user.
    async fn authorized_keys(&self, username: &str) -> Result<Vec<String>, AccountError>;
}
