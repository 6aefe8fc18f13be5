/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]

#[macro_use]
extern crate tracing;

use std::process::ExitCode;

use clap::Parser;

use gcua_unix_common::accounts::AccountProvider;
use gcua_unix_common::client::Client;
use gcua_unix_common::config::GcuaConfig;
use gcua_unix_common::constants::DEFAULT_CONFIG_PATH;

/// sshd AuthorizedKeysCommand helper: asks the accounts daemon for a user's
/// authorized keys and prints one per line.
#[derive(Debug, Parser)]
#[clap(name = "gcua_authorized_keys")]
struct AuthorizedKeysOpt {
    #[clap(short, long)]
    debug: bool,
    /// Login name to fetch keys for.
    username: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opt = AuthorizedKeysOpt::parse();
    if opt.debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    let cfg = match GcuaConfig::new(Some(DEFAULT_CONFIG_PATH)) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to parse {DEFAULT_CONFIG_PATH}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let client = Client::new(&cfg.get_socket_path());
    match client.authorized_keys(&opt.username).await {
        Ok(keys) => {
            for key in keys {
                println!("{key}");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("authorized keys command failed: {err}");
            ExitCode::FAILURE
        }
    }
}
