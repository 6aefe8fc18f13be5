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

pub mod accounts;
pub mod apiclient;
pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod proto;
pub mod resolver;
pub mod source;
