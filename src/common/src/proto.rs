/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The line protocol spoken over the accounts socket.
//!
//! A request is a single ASCII command with an optional space-separated
//! argument, at most [`MAX_REQUEST_SIZE`] bytes, no trailing newline
//! required. A response starts with a 3-digit status line; on success the
//! records follow, one per `\n`-separated line.

use std::fmt;

use crate::accounts::{Group, User};
use crate::constants::MAX_REQUEST_SIZE;

pub const STATUS_SUCCESS: &str = "200";
pub const STATUS_MALFORMED: &str = "400";
pub const STATUS_NOT_FOUND: &str = "404";
pub const STATUS_ERROR: &str = "500";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoRequest {
    UserByName(String),
    UserByUid(u32),
    Users,
    GroupByName(String),
    GroupByGid(u32),
    Groups,
    Names,
    IsName(String),
    Keys(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    #[error("request too large")]
    TooLarge,
    #[error("malformed request: {0:?}")]
    MalformedRequest(String),
    #[error("invalid record in response: {0:?}")]
    MalformedRecord(String),
}

impl ProtoRequest {
    pub fn parse(data: &[u8]) -> Result<ProtoRequest, ProtoError> {
        if data.len() > MAX_REQUEST_SIZE {
            return Err(ProtoError::TooLarge);
        }
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtoError::MalformedRequest(String::from_utf8_lossy(data).to_string()))?;
        let mut parts = text.split(' ');
        let command = parts.next().unwrap_or("");
        // Only the first argument counts; any further tokens are discarded.
        let argument = parts.next();
        match command {
            "user_by_name" => Ok(ProtoRequest::UserByName(parse_name(text, argument)?)),
            "user_by_uid" => Ok(ProtoRequest::UserByUid(parse_id(text, argument)?)),
            "users" => Ok(ProtoRequest::Users),
            "group_by_name" => Ok(ProtoRequest::GroupByName(parse_name(text, argument)?)),
            "group_by_gid" => Ok(ProtoRequest::GroupByGid(parse_id(text, argument)?)),
            "groups" => Ok(ProtoRequest::Groups),
            "names" => Ok(ProtoRequest::Names),
            "is_name" => Ok(ProtoRequest::IsName(parse_name(text, argument)?)),
            "keys" => Ok(ProtoRequest::Keys(parse_name(text, argument)?)),
            _ => Err(ProtoError::MalformedRequest(text.to_string())),
        }
    }
}

impl fmt::Display for ProtoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoRequest::UserByName(name) => write!(f, "user_by_name {name}"),
            ProtoRequest::UserByUid(uid) => write!(f, "user_by_uid {uid}"),
            ProtoRequest::Users => write!(f, "users"),
            ProtoRequest::GroupByName(name) => write!(f, "group_by_name {name}"),
            ProtoRequest::GroupByGid(gid) => write!(f, "group_by_gid {gid}"),
            ProtoRequest::Groups => write!(f, "groups"),
            ProtoRequest::Names => write!(f, "names"),
            ProtoRequest::IsName(name) => write!(f, "is_name {name}"),
            ProtoRequest::Keys(name) => write!(f, "keys {name}"),
        }
    }
}

fn parse_name(request: &str, argument: Option<&str>) -> Result<String, ProtoError> {
    // An empty argument is accepted; the lookup simply misses.
    argument
        .map(str::to_string)
        .ok_or_else(|| ProtoError::MalformedRequest(request.to_string()))
}

fn parse_id(request: &str, argument: Option<&str>) -> Result<u32, ProtoError> {
    argument
        .and_then(|arg| arg.parse::<u32>().ok())
        .ok_or_else(|| ProtoError::MalformedRequest(request.to_string()))
}

/// `name:uid:gid:gecos:home:shell`
pub fn marshal_user(user: &User) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        user.name, user.uid, user.gid, user.gecos, user.home_directory, user.shell
    )
}

/// `name:gid:member1,member2,...` with an empty member field for no members.
pub fn marshal_group(group: &Group) -> String {
    format!("{}:{}:{}", group.name, group.gid, group.members.join(","))
}

pub fn unmarshal_user(line: &str) -> Result<User, ProtoError> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() != 6 {
        return Err(ProtoError::MalformedRecord(line.to_string()));
    }
    let uid = parts[1]
        .parse::<u32>()
        .map_err(|_| ProtoError::MalformedRecord(line.to_string()))?;
    let gid = parts[2]
        .parse::<u32>()
        .map_err(|_| ProtoError::MalformedRecord(line.to_string()))?;
    Ok(User {
        name: parts[0].to_string(),
        uid,
        gid,
        gecos: parts[3].to_string(),
        home_directory: parts[4].to_string(),
        shell: parts[5].to_string(),
    })
}

pub fn unmarshal_group(line: &str) -> Result<Group, ProtoError> {
    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() != 3 {
        return Err(ProtoError::MalformedRecord(line.to_string()));
    }
    let gid = parts[1]
        .parse::<u32>()
        .map_err(|_| ProtoError::MalformedRecord(line.to_string()))?;
    let members = if parts[2].is_empty() {
        Vec::new()
    } else {
        parts[2].split(',').map(str::to_string).collect()
    };
    Ok(Group {
        name: parts[0].to_string(),
        gid,
        members,
    })
}
