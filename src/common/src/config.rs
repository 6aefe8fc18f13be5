/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::fmt;
use std::path::Path;
use std::time::Duration;

use configparser::ini::Ini;

use crate::constants::{
    DEFAULT_ACCOUNT_REFRESH_COOLDOWN, DEFAULT_ACCOUNT_REFRESH_FREQUENCY, DEFAULT_API_BASE,
    DEFAULT_CONFIG_PATH, DEFAULT_INSTANCE_BASE, DEFAULT_KEY_REFRESH_COOLDOWN,
    DEFAULT_KEY_REFRESH_FREQUENCY, DEFAULT_SOCK_PATH,
};
use crate::resolver::ResolverConfig;

/// Daemon configuration, read from an ini file. A missing file yields the
/// built-in defaults so a stock install needs no config at all.
pub struct GcuaConfig {
    config: Ini,
}

impl GcuaConfig {
    pub fn new(config_path: Option<&str>) -> Result<GcuaConfig, String> {
        let mut config = Ini::new();
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        if Path::new(path).exists() {
            config.load(path)?;
        }
        Ok(GcuaConfig { config })
    }

    fn get_seconds(&self, option: &str, default: Duration) -> Duration {
        self.config
            .getuint("global", option)
            .ok()
            .flatten()
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn get_socket_path(&self) -> String {
        self.config
            .get("global", "socket_path")
            .unwrap_or_else(|| DEFAULT_SOCK_PATH.to_string())
    }

    pub fn get_account_refresh_frequency(&self) -> Duration {
        self.get_seconds(
            "account_refresh_frequency",
            DEFAULT_ACCOUNT_REFRESH_FREQUENCY,
        )
    }

    pub fn get_account_refresh_cooldown(&self) -> Duration {
        self.get_seconds("account_refresh_cooldown", DEFAULT_ACCOUNT_REFRESH_COOLDOWN)
    }

    pub fn get_key_refresh_frequency(&self) -> Duration {
        self.get_seconds("key_refresh_frequency", DEFAULT_KEY_REFRESH_FREQUENCY)
    }

    pub fn get_key_refresh_cooldown(&self) -> Duration {
        self.config
            .getuint("global", "key_refresh_cooldown_ms")
            .ok()
            .flatten()
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_KEY_REFRESH_COOLDOWN)
    }

    pub fn get_api_base(&self) -> String {
        self.config
            .get("global", "api_base")
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
    }

    pub fn get_instance_base(&self) -> String {
        self.config
            .get("global", "instance_base")
            .unwrap_or_else(|| DEFAULT_INSTANCE_BASE.to_string())
    }

    pub fn get_debug(&self) -> bool {
        self.config
            .getbool("global", "debug")
            .ok()
            .flatten()
            .unwrap_or(false)
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            account_refresh_frequency: self.get_account_refresh_frequency(),
            account_refresh_cooldown: self.get_account_refresh_cooldown(),
            key_refresh_frequency: self.get_key_refresh_frequency(),
            key_refresh_cooldown: self.get_key_refresh_cooldown(),
        }
    }
}

impl fmt::Debug for GcuaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcuaConfig")
            .field("socket_path", &self.get_socket_path())
            .field(
                "account_refresh_frequency",
                &self.get_account_refresh_frequency(),
            )
            .field(
                "account_refresh_cooldown",
                &self.get_account_refresh_cooldown(),
            )
            .field("key_refresh_frequency", &self.get_key_refresh_frequency())
            .field("key_refresh_cooldown", &self.get_key_refresh_cooldown())
            .field("api_base", &self.get_api_base())
            .field("instance_base", &self.get_instance_base())
            .field("debug", &self.get_debug())
            .finish()
    }
}
