/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use async_trait::async_trait;

use crate::accounts::{Group, User};

/// The complete authoritative set of users and groups for this VM at a point
/// in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub users: Vec<User>,
    pub groups: Vec<Group>,
}

/// Per-user key material delivered alongside the sudoer flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeysView {
    pub keys: Vec<String>,
    pub sudoer: bool,
}

/// Errors the upstream source may return. These never reach query callers;
/// the resolver logs them and serves stale data or retries on cadence.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("upstream rejected the request: {0}")]
    BadResponse(String),
}

/// Upstream port for the authoritative accounts API.
///
/// Both operations are idempotent reads. By convention a user unknown
/// upstream is reported as an empty `KeysView`, not an error, so that a user
/// present in the roster but without keys is cacheable.
#[async_trait]
pub trait AccountSource: Send + Sync + 'static {
    async fn fetch_roster(&self) -> Result<Roster, SourceError>;
    async fn fetch_keys(&self, name: &str) -> Result<KeysView, SourceError>;
}
