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
#![deny(clippy::await_holding_lock)]

#[macro_use]
extern crate tracing;

mod server;

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use gcua_unix_common::apiclient::ComputeAccountsSource;
use gcua_unix_common::clock::SystemClock;
use gcua_unix_common::config::GcuaConfig;
use gcua_unix_common::constants::DEFAULT_CONFIG_PATH;
use gcua_unix_common::resolver::Resolver;

use server::AccountServer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let clap_args = Command::new("gcuad")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Compute user accounts daemon")
        .arg(
            Arg::new("debug")
                .help("Show extra debug information")
                .short('d')
                .long("debug")
                .env("GCUA_DEBUG")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("configtest")
                .help("Display the configuration and exit")
                .short('t')
                .long("configtest")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .help("Set the config file path")
                .short('c')
                .long("config")
                .default_value(DEFAULT_CONFIG_PATH)
                .env("GCUA_CONFIG")
                .action(ArgAction::Set),
        )
        .get_matches();

    let Some(cfg_path) = clap_args.get_one::<String>("config") else {
        eprintln!("Failed to pull the config path");
        return ExitCode::FAILURE;
    };
    let cfg = match GcuaConfig::new(Some(cfg_path)) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("Failed to parse {cfg_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    if clap_args.get_flag("debug") || cfg.get_debug() {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if clap_args.get_flag("configtest") {
        eprintln!("Config (from {cfg_path}):");
        eprintln!("{cfg:?}");
        return ExitCode::SUCCESS;
    }

    info!("starting daemon");

    let source = match ComputeAccountsSource::new(&cfg) {
        Ok(source) => Arc::new(source),
        Err(err) => {
            error!("failed to construct the accounts API client: {err}");
            return ExitCode::FAILURE;
        }
    };

    // The bootstrapping refresh runs before the socket comes up, so NSS
    // never observes a daemon with an unpopulated cache after a failure-free
    // start.
    let resolver = Resolver::new(source, Arc::new(SystemClock), cfg.resolver_config()).await;
    let accounts_server = AccountServer::new(resolver, &cfg.get_socket_path());

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(err) => {
            error!("failed to install SIGINT handler: {err}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = accounts_server.serve() => {
            match result {
                Ok(()) => error!("server stopped unexpectedly"),
                Err(err) => error!("server failed: {err}"),
            }
            ExitCode::FAILURE
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            ExitCode::SUCCESS
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            ExitCode::SUCCESS
        }
    }
}
