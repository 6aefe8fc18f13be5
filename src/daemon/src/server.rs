/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

use gcua_unix_common::accounts::{AccountError, AccountProvider};
use gcua_unix_common::constants::{MAX_REQUEST_SIZE, SERVER_TIMEOUT};
use gcua_unix_common::proto::{self, ProtoRequest};

/// Serves account information over a Unix socket: one request per
/// connection, answered and closed.
pub struct AccountServer<P: AccountProvider> {
    provider: Arc<P>,
    socket_path: String,
}

impl<P: AccountProvider + 'static> AccountServer<P> {
    pub fn new(provider: Arc<P>, socket_path: &str) -> AccountServer<P> {
        AccountServer {
            provider,
            socket_path: socket_path.to_string(),
        }
    }

    /// Accept and serve connections forever. Only binding errors are fatal;
    /// per-connection failures are logged and the loop continues.
    pub async fn serve(&self) -> io::Result<()> {
        if Path::new(&self.socket_path).exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        // NSS callers run as arbitrary users.
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o777))?;
        info!(path = %self.socket_path, "listening for connections");
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("accepted connection");
                    let provider = self.provider.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, provider).await;
                    });
                }
                Err(err) => error!("failed to accept connection: {err}"),
            }
        }
    }
}

async fn handle_connection<P: AccountProvider>(mut stream: UnixStream, provider: Arc<P>) {
    let mut data = vec![0u8; MAX_REQUEST_SIZE];
    let len = match timeout(SERVER_TIMEOUT, stream.read(&mut data)).await {
        Ok(Ok(len)) => len,
        Ok(Err(err)) => {
            error!("failed to read request: {err}");
            return;
        }
        Err(_) => {
            error!("timed out reading request");
            return;
        }
    };
    let response = respond(provider.as_ref(), &data[..len]).await;
    match timeout(SERVER_TIMEOUT, stream.write_all(response.as_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("failed to write response: {err}"),
        Err(_) => error!("timed out writing response"),
    }
}

async fn respond<P: AccountProvider>(provider: &P, raw: &[u8]) -> String {
    let request = match ProtoRequest::parse(raw) {
        Ok(request) => request,
        Err(err) => {
            error!("invalid request: {err}");
            return proto::STATUS_MALFORMED.to_string();
        }
    };
    debug!(%request, "handling request");
    match dispatch(provider, request).await {
        Ok(response) => {
            debug!("request succeeded");
            response
        }
        Err(err) if err.is_not_found() => {
            info!("request failed: {err}");
            proto::STATUS_NOT_FOUND.to_string()
        }
        Err(err) => {
            warn!("request failed: {err}");
            proto::STATUS_ERROR.to_string()
        }
    }
}

async fn dispatch<P: AccountProvider>(
    provider: &P,
    request: ProtoRequest,
) -> Result<String, AccountError> {
    match request {
        ProtoRequest::UserByName(name) => {
            let user = provider.user_by_name(&name).await?;
            Ok(success_lines([proto::marshal_user(&user)]))
        }
        ProtoRequest::UserByUid(uid) => {
            let user = provider.user_by_uid(uid).await?;
            Ok(success_lines([proto::marshal_user(&user)]))
        }
        ProtoRequest::Users => {
            let users = provider.users().await?;
            Ok(success_lines(
                users.iter().map(proto::marshal_user),
            ))
        }
        ProtoRequest::GroupByName(name) => {
            let group = provider.group_by_name(&name).await?;
            Ok(success_lines([proto::marshal_group(&group)]))
        }
        ProtoRequest::GroupByGid(gid) => {
            let group = provider.group_by_gid(gid).await?;
            Ok(success_lines([proto::marshal_group(&group)]))
        }
        ProtoRequest::Groups => {
            let groups = provider.groups().await?;
            Ok(success_lines(
                groups.iter().map(proto::marshal_group),
            ))
        }
        ProtoRequest::Names => {
            let names = provider.names().await?;
            Ok(success_lines(names))
        }
        ProtoRequest::IsName(name) => {
            if provider.is_name(&name).await? {
                Ok(proto::STATUS_SUCCESS.to_string())
            } else {
                Ok(proto::STATUS_NOT_FOUND.to_string())
            }
        }
        ProtoRequest::Keys(name) => {
            let keys = provider.authorized_keys(&name).await?;
            Ok(success_lines(keys))
        }
    }
}

fn success_lines<I>(lines: I) -> String
where
    I: IntoIterator<Item = String>,
{
    let mut response = String::from(proto::STATUS_SUCCESS);
    for line in lines {
        response.push('\n');
        response.push_str(&line);
    }
    response
}
