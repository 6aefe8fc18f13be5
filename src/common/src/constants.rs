/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/gcua/gcua.conf";
pub const DEFAULT_SOCK_PATH: &str = "/var/run/gcuad/socket";

/// The special group containing users allowed to sudo on this VM. It is
/// synthesized from per-user flags and never comes from upstream.
pub const SUDOERS_GROUP_NAME: &str = "gce-sudoers";
pub const SUDOERS_GROUP_GID: u32 = 4001;

pub const DEFAULT_ACCOUNT_REFRESH_FREQUENCY: Duration = Duration::from_secs(240);
pub const DEFAULT_ACCOUNT_REFRESH_COOLDOWN: Duration = Duration::from_secs(5);
pub const DEFAULT_KEY_REFRESH_FREQUENCY: Duration = Duration::from_secs(1800);
pub const DEFAULT_KEY_REFRESH_COOLDOWN: Duration = Duration::from_millis(500);

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/computeaccounts/alpha/";
pub const DEFAULT_INSTANCE_BASE: &str = "https://www.googleapis.com/compute/v1/";
pub const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1/";
pub const DEFAULT_CONN_TIMEOUT: u64 = 30;

/// Requests larger than this are rejected before parsing.
pub const MAX_REQUEST_SIZE: usize = 128;
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(1);
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(1);
/// Lookups that may block on an on-demand refresh get a longer deadline.
pub const CLIENT_EXTENDED_TIMEOUT: Duration = Duration::from_secs(5);
