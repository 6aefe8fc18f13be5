/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::accounts::{AccountError, AccountProvider, Group, User};
use crate::clock::{outside_timespan, Clock};
use crate::constants::{SUDOERS_GROUP_GID, SUDOERS_GROUP_NAME};
use crate::source::{AccountSource, KeysView};

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Cadence of scheduled roster refreshes; also the coordinator's idle
    /// wake period.
    pub account_refresh_frequency: Duration,
    /// Minimum interval between roster refreshes. On-demand requests that
    /// arrive sooner are answered by the previous refresh.
    pub account_refresh_cooldown: Duration,
    /// Key vectors older than this become candidates for the background
    /// fan-out pass.
    pub key_refresh_frequency: Duration,
    /// On the hot path, cached keys younger than this are served without
    /// contacting upstream.
    pub key_refresh_cooldown: Duration,
}

/// A user record plus the key material most recently fetched for it.
/// `key_refresh_time` of `UNIX_EPOCH` means the keys were never fetched.
#[derive(Debug, Clone)]
struct CachedUser {
    user: User,
    keys: Vec<String>,
    sudoer: bool,
    key_refresh_time: SystemTime,
}

impl CachedUser {
    fn new(user: User) -> Self {
        CachedUser {
            user,
            keys: Vec::new(),
            sudoer: false,
            key_refresh_time: SystemTime::UNIX_EPOCH,
        }
    }
}

/// The four account mappings. Users are stored once, by name; the uid and
/// gid tables map back to names so both lookups resolve the same record.
/// Swapped in wholesale so readers never observe mixed generations.
#[derive(Default)]
struct Index {
    users_by_name: HashMap<String, CachedUser>,
    uids: HashMap<u32, String>,
    groups_by_name: HashMap<String, Group>,
    gids: HashMap<u32, String>,
}

fn sudoers_group(index: &Index) -> Group {
    let members = index
        .users_by_name
        .values()
        .filter(|cached| cached.sudoer)
        .map(|cached| cached.user.name.clone())
        .collect();
    Group {
        name: SUDOERS_GROUP_NAME.to_string(),
        gid: SUDOERS_GROUP_GID,
        members,
    }
}

/// An on-demand refresh request. Blocking callers attach a completion
/// channel which is signalled once a refresh attempt has finished, whether
/// or not it succeeded; fire-and-forget callers post `None`.
type RefreshWaiter = Option<oneshot::Sender<()>>;

/// In-memory caching store of account data, refreshed from an
/// [`AccountSource`] on a dual cadence: the roster of users and groups on
/// one timer, per-user authorized keys on another.
pub struct Resolver<S: AccountSource> {
    source: Arc<S>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
    refresh_tx: mpsc::Sender<RefreshWaiter>,
    index: Arc<RwLock<Index>>,
}

impl<S: AccountSource> Resolver<S> {
    /// Create the resolver and perform the bootstrapping refresh. The index
    /// is populated (or the initial fetch has failed and been logged) by the
    /// time this returns.
    pub async fn new(
        source: Arc<S>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Arc<Resolver<S>> {
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let resolver = Arc::new(Resolver {
            source,
            clock,
            config,
            refresh_tx,
            index: Arc::new(RwLock::new(Index::default())),
        });
        tokio::spawn(refresh_task(resolver.clone(), refresh_rx));
        resolver.request_refresh().await;
        resolver
    }

    /// Post a refresh request and wait for the coordinator to finish an
    /// attempt. The attempt that answers may have been triggered by another
    /// waiter; the cooldown decides whether upstream is contacted at all.
    async fn request_refresh(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.refresh_tx.send(Some(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Post a refresh request without waiting on it. Used on paths that must
    /// not block, like NSS group enumeration.
    fn request_refresh_detached(&self) {
        let refresh_tx = self.refresh_tx.clone();
        tokio::spawn(async move {
            let _ = refresh_tx.send(None).await;
        });
    }

    /// Fetch the roster and swap it into the index. On transport failure the
    /// index is left untouched.
    async fn refresh_accounts(&self) {
        let roster = match self.source.fetch_roster().await {
            Ok(roster) => roster,
            Err(err) => {
                error!("failed refresh: {err}");
                return;
            }
        };
        let mut index = self.index.write().await;
        let mut old_users = std::mem::take(&mut index.users_by_name);
        index.uids.clear();
        index.groups_by_name.clear();
        index.gids.clear();
        for user in roster.users {
            let mut cached = CachedUser::new(user);
            // Users that survived the refresh keep their key state until the
            // next key refresh touches them.
            if let Some(old) = old_users.remove(&cached.user.name) {
                cached.keys = old.keys;
                cached.sudoer = old.sudoer;
                cached.key_refresh_time = old.key_refresh_time;
            }
            index.uids.insert(cached.user.uid, cached.user.name.clone());
            index.users_by_name.insert(cached.user.name.clone(), cached);
        }
        for group in roster.groups {
            if group.name == SUDOERS_GROUP_NAME || group.gid == SUDOERS_GROUP_GID {
                warn!(
                    name = %group.name,
                    gid = group.gid,
                    "dropping upstream group colliding with the reserved sudoers group"
                );
                continue;
            }
            index.gids.insert(group.gid, group.name.clone());
            index.groups_by_name.insert(group.name.clone(), group);
        }
        info!("refreshing users and groups succeeded");
    }

    /// One key fan-out pass: fetch keys concurrently for every user whose
    /// key vector has gone stale, then merge all successful results into the
    /// index under a single write lock.
    async fn refresh_keys(&self) {
        let candidates = self.keys_requiring_refresh().await;
        if candidates.is_empty() {
            return;
        }
        let (results_tx, mut results_rx) = mpsc::channel(candidates.len());
        for name in candidates {
            let source = self.source.clone();
            let clock = self.clock.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                let result = source.fetch_keys(&name).await;
                let _ = results_tx.send((name, result, clock.now())).await;
            });
        }
        drop(results_tx);

        let mut refreshed = Vec::new();
        while let Some((name, result, fetched_at)) = results_rx.recv().await {
            match result {
                Ok(view) => {
                    debug!(user = %name, "refreshed keys");
                    refreshed.push((name, view, fetched_at));
                }
                Err(err) => error!(user = %name, "failed key refresh: {err}"),
            }
        }

        let mut index = self.index.write().await;
        for (name, view, fetched_at) in refreshed {
            // The user may have been evicted while the fetch was in flight.
            if let Some(cached) = index.users_by_name.get_mut(&name) {
                cached.keys = view.keys;
                cached.sudoer = view.sudoer;
                cached.key_refresh_time = fetched_at;
            }
        }
    }

    async fn keys_requiring_refresh(&self) -> Vec<String> {
        let now = self.clock.now();
        let index = self.index.read().await;
        index
            .users_by_name
            .values()
            .filter(|cached| {
                outside_timespan(now, cached.key_refresh_time, self.config.key_refresh_frequency)
            })
            .map(|cached| cached.user.name.clone())
            .collect()
    }

    async fn lookup_user(&self, name: &str) -> Option<CachedUser> {
        let index = self.index.read().await;
        index.users_by_name.get(name).cloned()
    }

    /// Write fresh key material back into the index without making the hot
    /// path wait on the lock. Callers already hold the data they were served.
    fn store_keys_detached(&self, username: String, view: KeysView, fetched_at: SystemTime) {
        let index = self.index.clone();
        tokio::spawn(async move {
            let mut index = index.write().await;
            if let Some(cached) = index.users_by_name.get_mut(&username) {
                cached.keys = view.keys;
                cached.sudoer = view.sudoer;
                cached.key_refresh_time = fetched_at;
            }
        });
    }
}

#[cfg(test)]
impl<S: AccountSource> Resolver<S> {
    async fn cached_key_state(&self, name: &str) -> Option<(Vec<String>, bool, SystemTime)> {
        let index = self.index.read().await;
        index
            .users_by_name
            .get(name)
            .map(|cached| (cached.keys.clone(), cached.sudoer, cached.key_refresh_time))
    }
}

/// The refresh coordinator. Exactly one of these runs per resolver, for the
/// life of the process; it serializes roster refreshes and schedules the key
/// fan-out after each wake.
async fn refresh_task<S: AccountSource>(
    resolver: Arc<Resolver<S>>,
    mut requests: mpsc::Receiver<RefreshWaiter>,
) {
    let mut last_refresh = SystemTime::UNIX_EPOCH;
    loop {
        let waiter = tokio::select! {
            request = requests.recv() => match request {
                Some(waiter) => waiter,
                None => return,
            },
            _ = resolver.clock.after(resolver.config.account_refresh_frequency) => None,
        };
        if outside_timespan(
            resolver.clock.now(),
            last_refresh,
            resolver.config.account_refresh_cooldown,
        ) {
            info!("refreshing users and groups");
            resolver.refresh_accounts().await;
            // Updated even when the fetch failed: the next retry happens at
            // the periodic cadence, not on the next cache miss.
            last_refresh = resolver.clock.now();
        }
        let fan_out = resolver.clone();
        tokio::spawn(async move { fan_out.refresh_keys().await });
        if let Some(done) = waiter {
            let _ = done.send(());
        }
    }
}

#[async_trait]
impl<S: AccountSource> AccountProvider for Resolver<S> {
    async fn user_by_name(&self, name: &str) -> Result<User, AccountError> {
        if let Some(cached) = self.lookup_user(name).await {
            return Ok(cached.user);
        }
        info!(user = %name, "triggering refresh for missing user");
        self.request_refresh().await;
        match self.lookup_user(name).await {
            Some(cached) => Ok(cached.user),
            None => Err(AccountError::UserNameNotFound(name.to_string())),
        }
    }

    async fn user_by_uid(&self, uid: u32) -> Result<User, AccountError> {
        // UID lookups are a scan pattern; a miss never goes upstream.
        let index = self.index.read().await;
        index
            .uids
            .get(&uid)
            .and_then(|name| index.users_by_name.get(name))
            .map(|cached| cached.user.clone())
            .ok_or(AccountError::UidNotFound(uid))
    }

    async fn users(&self) -> Result<Vec<User>, AccountError> {
        let index = self.index.read().await;
        Ok(index
            .users_by_name
            .values()
            .map(|cached| cached.user.clone())
            .collect())
    }

    async fn group_by_name(&self, name: &str) -> Result<Group, AccountError> {
        {
            let index = self.index.read().await;
            if name == SUDOERS_GROUP_NAME {
                return Ok(sudoers_group(&index));
            }
            if let Some(group) = index.groups_by_name.get(name) {
                return Ok(group.clone());
            }
        }
        // Group misses are dominated by spurious NSS enumeration; blocking
        // here would stall shell startup.
        info!(group = %name, "triggering refresh for missing group");
        self.request_refresh_detached();
        Err(AccountError::GroupNameNotFound(name.to_string()))
    }

    async fn group_by_gid(&self, gid: u32) -> Result<Group, AccountError> {
        let index = self.index.read().await;
        if gid == SUDOERS_GROUP_GID {
            return Ok(sudoers_group(&index));
        }
        index
            .gids
            .get(&gid)
            .and_then(|name| index.groups_by_name.get(name))
            .cloned()
            .ok_or(AccountError::GidNotFound(gid))
    }

    async fn groups(&self) -> Result<Vec<Group>, AccountError> {
        let index = self.index.read().await;
        let mut groups: Vec<Group> = index.groups_by_name.values().cloned().collect();
        groups.push(sudoers_group(&index));
        Ok(groups)
    }

    async fn names(&self) -> Result<Vec<String>, AccountError> {
        let index = self.index.read().await;
        let mut names =
            Vec::with_capacity(index.users_by_name.len() + index.groups_by_name.len() + 1);
        names.extend(index.users_by_name.keys().cloned());
        names.extend(index.groups_by_name.keys().cloned());
        names.push(SUDOERS_GROUP_NAME.to_string());
        Ok(names)
    }

    async fn is_name(&self, name: &str) -> Result<bool, AccountError> {
        if name == SUDOERS_GROUP_NAME {
            return Ok(true);
        }
        let index = self.index.read().await;
        Ok(index.users_by_name.contains_key(name) || index.groups_by_name.contains_key(name))
    }

    async fn authorized_keys(&self, username: &str) -> Result<Vec<String>, AccountError> {
        // Resolve through user_by_name first so a missing user triggers an
        // on-demand roster refresh before we give up.
        self.user_by_name(username).await?;
        let cached = match self.lookup_user(username).await {
            Some(cached) => cached,
            None => return Err(AccountError::UserNameNotFound(username.to_string())),
        };
        if !outside_timespan(
            self.clock.now(),
            cached.key_refresh_time,
            self.config.key_refresh_cooldown,
        ) {
            debug!(user = %username, "returning cached keys due to cooldown");
            return Ok(cached.keys);
        }
        match self.source.fetch_keys(username).await {
            Ok(view) => {
                let keys = view.keys.clone();
                self.store_keys_detached(username.to_string(), view, self.clock.now());
                Ok(keys)
            }
            Err(err) => {
                // Stale-while-error: sshd gets whatever we had rather than a
                // failure it cannot act on.
                warn!(user = %username, "serving cached keys, key fetch failed: {err}");
                Ok(cached.keys)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::source::{Roster, SourceError};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct MockSource {
        roster: Mutex<Roster>,
        roster_error: AtomicBool,
        keys: Mutex<HashMap<String, KeysView>>,
        keys_error: AtomicBool,
        roster_calls: AtomicU32,
        keys_calls: AtomicU32,
    }

    impl MockSource {
        fn new(roster: Roster, keys: HashMap<String, KeysView>) -> Arc<MockSource> {
            Arc::new(MockSource {
                roster: Mutex::new(roster),
                roster_error: AtomicBool::new(false),
                keys: Mutex::new(keys),
                keys_error: AtomicBool::new(false),
                roster_calls: AtomicU32::new(0),
                keys_calls: AtomicU32::new(0),
            })
        }

        fn set_roster(&self, roster: Roster) {
            *self.roster.lock().unwrap() = roster;
        }

        fn set_roster_error(&self, fail: bool) {
            self.roster_error.store(fail, Ordering::SeqCst);
        }

        fn set_keys_error(&self, fail: bool) {
            self.keys_error.store(fail, Ordering::SeqCst);
        }

        fn roster_calls(&self) -> u32 {
            self.roster_calls.load(Ordering::SeqCst)
        }

        fn keys_calls(&self) -> u32 {
            self.keys_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AccountSource for MockSource {
        async fn fetch_roster(&self) -> Result<Roster, SourceError> {
            self.roster_calls.fetch_add(1, Ordering::SeqCst);
            if self.roster_error.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("mock roster failure".to_string()));
            }
            Ok(self.roster.lock().unwrap().clone())
        }

        async fn fetch_keys(&self, name: &str) -> Result<KeysView, SourceError> {
            self.keys_calls.fetch_add(1, Ordering::SeqCst);
            if self.keys_error.load(Ordering::SeqCst) {
                return Err(SourceError::Transport("mock keys failure".to_string()));
            }
            Ok(self
                .keys
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .unwrap_or_default())
        }
    }

    struct MockClock {
        now: Mutex<SystemTime>,
        timers: Mutex<Vec<oneshot::Sender<()>>>,
    }

    impl MockClock {
        fn new() -> Arc<MockClock> {
            Arc::new(MockClock {
                now: Mutex::new(SystemTime::now()),
                timers: Mutex::new(Vec::new()),
            })
        }

        fn advance(&self, delta: Duration) {
            *self.now.lock().unwrap() += delta;
        }

        fn fire_timers(&self) {
            for timer in self.timers.lock().unwrap().drain(..) {
                let _ = timer.send(());
            }
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> SystemTime {
            *self.now.lock().unwrap()
        }

        fn after(&self, _delay: Duration) -> futures::future::BoxFuture<'static, ()> {
            let (timer_tx, timer_rx) = oneshot::channel();
            self.timers.lock().unwrap().push(timer_tx);
            async move {
                // Pending forever unless the test fires the timer; a dropped
                // sender must not wake the coordinator.
                if timer_rx.await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
            .boxed()
        }
    }

    fn sample_users() -> Vec<User> {
        vec![
            User {
                name: "user1".to_string(),
                uid: 1001,
                gid: 1000,
                gecos: "John Doe".to_string(),
                home_directory: "/home/user1".to_string(),
                shell: "/bin/bash".to_string(),
            },
            User {
                name: "user2".to_string(),
                uid: 1002,
                gid: 1000,
                gecos: "Jane Doe".to_string(),
                home_directory: "/home/user2".to_string(),
                shell: "/bin/zsh".to_string(),
            },
        ]
    }

    fn sample_groups() -> Vec<Group> {
        vec![
            Group {
                name: "group1".to_string(),
                gid: 1000,
                members: Vec::new(),
            },
            Group {
                name: "group2".to_string(),
                gid: 1001,
                members: vec!["user2".to_string(), "user1".to_string()],
            },
        ]
    }

    fn sample_keys() -> HashMap<String, KeysView> {
        let mut keys = HashMap::new();
        keys.insert(
            "user1".to_string(),
            KeysView {
                keys: vec![
                    "ssh-rsa AAAAB3NzaC1yc2E machine1".to_string(),
                    "ssh-rsa AAAAB3NzaC2yc2E machine2".to_string(),
                ],
                sudoer: true,
            },
        );
        keys
    }

    fn sample_roster() -> Roster {
        Roster {
            users: sample_users(),
            groups: sample_groups(),
        }
    }

    fn hour_config() -> ResolverConfig {
        ResolverConfig {
            account_refresh_frequency: Duration::from_secs(3600),
            account_refresh_cooldown: Duration::from_secs(3600),
            key_refresh_frequency: Duration::from_secs(3600),
            key_refresh_cooldown: Duration::ZERO,
        }
    }

    /// Poll until the condition holds; panics after two seconds.
    async fn wait_for<F, Fut>(what: &str, condition: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..2000 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_bootstrap_populates_index() {
        let source = MockSource::new(sample_roster(), sample_keys());
        let resolver = Resolver::new(source.clone(), MockClock::new(), hour_config()).await;

        assert_eq!(source.roster_calls(), 1);
        assert_eq!(
            resolver.user_by_name("user1").await.unwrap(),
            sample_users()[0]
        );
        assert_eq!(
            resolver.user_by_uid(1002).await.unwrap(),
            sample_users()[1]
        );
        assert_eq!(
            resolver.group_by_name("group1").await.unwrap(),
            sample_groups()[0]
        );
        assert_eq!(
            resolver.group_by_gid(1001).await.unwrap(),
            sample_groups()[1]
        );

        let mut users = resolver.users().await.unwrap();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(users, sample_users());

        let mut names = resolver.names().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["gce-sudoers", "group1", "group2", "user1", "user2"]);

        assert!(resolver.is_name("user1").await.unwrap());
        assert!(resolver.is_name("group1").await.unwrap());
        assert!(resolver.is_name("gce-sudoers").await.unwrap());
        assert!(!resolver.is_name("nil").await.unwrap());

        // The bootstrap fan-out delivers the sudoer flag for user1.
        wait_for("key fan-out", || async { source.keys_calls() >= 2 }).await;
        wait_for("sudoer flag", || async {
            resolver.group_by_gid(SUDOERS_GROUP_GID).await.unwrap().members == vec!["user1"]
        })
        .await;

        let sudoers = resolver.group_by_name(SUDOERS_GROUP_NAME).await.unwrap();
        assert_eq!(sudoers.gid, SUDOERS_GROUP_GID);
        assert_eq!(sudoers.members, vec!["user1"]);

        let mut groups = resolver.groups().await.unwrap();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].name, "gce-sudoers");

        // Misses within the cooldown never go upstream again.
        assert_eq!(
            resolver.user_by_name("nil").await,
            Err(AccountError::UserNameNotFound("nil".to_string()))
        );
        assert_eq!(
            resolver.user_by_uid(2).await,
            Err(AccountError::UidNotFound(2))
        );
        assert_eq!(
            resolver.group_by_name("nil").await,
            Err(AccountError::GroupNameNotFound("nil".to_string()))
        );
        assert_eq!(
            resolver.group_by_gid(1).await,
            Err(AccountError::GidNotFound(1))
        );
        assert_eq!(source.roster_calls(), 1);
    }

    #[tokio::test]
    async fn test_user_miss_triggers_on_demand_refresh() {
        let source = MockSource::new(sample_roster(), HashMap::new());
        source.set_roster_error(true);
        let config = ResolverConfig {
            account_refresh_cooldown: Duration::ZERO,
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;

        // Bootstrap failed, the cache is empty, and the miss-triggered
        // refresh fails too.
        assert_eq!(
            resolver.user_by_name("user1").await,
            Err(AccountError::UserNameNotFound("user1".to_string()))
        );
        assert_eq!(source.roster_calls(), 2);

        source.set_roster_error(false);
        assert_eq!(
            resolver.user_by_name("user1").await.unwrap(),
            sample_users()[0]
        );
        assert_eq!(source.roster_calls(), 3);
    }

    #[tokio::test]
    async fn test_group_miss_refreshes_in_background() {
        let source = MockSource::new(sample_roster(), HashMap::new());
        source.set_roster_error(true);
        let config = ResolverConfig {
            account_refresh_cooldown: Duration::ZERO,
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;
        source.set_roster_error(false);

        // The miss itself returns immediately; the refresh it kicked off
        // lands in the background. The probe uses a gid lookup, which never
        // posts refresh requests of its own.
        assert_eq!(
            resolver.group_by_name("group1").await,
            Err(AccountError::GroupNameNotFound("group1".to_string()))
        );
        wait_for("background refresh", || async {
            resolver.group_by_gid(1000).await.is_ok()
        })
        .await;
        assert_eq!(
            resolver.group_by_name("group1").await.unwrap(),
            sample_groups()[0]
        );
        assert_eq!(source.roster_calls(), 2);
    }

    #[tokio::test]
    async fn test_key_cooldown_limits_fetches() {
        let roster = Roster {
            users: vec![sample_users()[0].clone()],
            groups: Vec::new(),
        };
        let clock = MockClock::new();
        let source = MockSource::new(roster, sample_keys());
        let config = ResolverConfig {
            // Fan-out disabled so the hot path owns every fetch.
            key_refresh_frequency: Duration::MAX,
            key_refresh_cooldown: Duration::from_secs(1),
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), clock.clone(), config).await;

        let expected = sample_keys()["user1"].keys.clone();
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        assert_eq!(source.keys_calls(), 1);
        wait_for("key write-back", || async {
            resolver
                .cached_key_state("user1")
                .await
                .is_some_and(|(_, _, at)| at != SystemTime::UNIX_EPOCH)
        })
        .await;

        // Within the cooldown the cache answers.
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        assert_eq!(source.keys_calls(), 1);

        clock.advance(Duration::from_millis(1001));
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        assert_eq!(source.keys_calls(), 2);
    }

    #[tokio::test]
    async fn test_removed_user_drops_key_state() {
        let roster = Roster {
            users: vec![sample_users()[0].clone()],
            groups: Vec::new(),
        };
        let source = MockSource::new(roster, sample_keys());
        let config = ResolverConfig {
            account_refresh_cooldown: Duration::ZERO,
            key_refresh_frequency: Duration::MAX,
            key_refresh_cooldown: Duration::ZERO,
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;

        let expected = sample_keys()["user1"].keys.clone();
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);

        // The next roster no longer lists user1; a miss-triggered refresh
        // evicts the record along with its keys.
        source.set_roster(Roster::default());
        let _ = resolver.user_by_name("gone").await;
        assert_eq!(
            resolver.authorized_keys("user1").await,
            Err(AccountError::UserNameNotFound("user1".to_string()))
        );
        assert_eq!(resolver.cached_key_state("user1").await, None);
    }

    #[tokio::test]
    async fn test_stale_keys_served_on_fetch_error() {
        let roster = Roster {
            users: vec![sample_users()[0].clone()],
            groups: Vec::new(),
        };
        let source = MockSource::new(roster, sample_keys());
        let config = ResolverConfig {
            key_refresh_frequency: Duration::MAX,
            key_refresh_cooldown: Duration::ZERO,
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;

        let expected = sample_keys()["user1"].keys.clone();
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        wait_for("key write-back", || async {
            resolver
                .cached_key_state("user1")
                .await
                .is_some_and(|(keys, _, _)| !keys.is_empty())
        })
        .await;

        source.set_keys_error(true);
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_key_state_carries_over_roster_refresh() {
        let source = MockSource::new(sample_roster(), sample_keys());
        let config = ResolverConfig {
            account_refresh_cooldown: Duration::ZERO,
            key_refresh_frequency: Duration::MAX,
            key_refresh_cooldown: Duration::from_secs(3600),
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;

        let expected = sample_keys()["user1"].keys.clone();
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        wait_for("key write-back", || async {
            resolver
                .cached_key_state("user1")
                .await
                .is_some_and(|(keys, _, _)| !keys.is_empty())
        })
        .await;
        let before = resolver.cached_key_state("user1").await.unwrap();
        let keys_fetched = source.keys_calls();

        // A roster refresh that retains user1 must not disturb its keys,
        // sudoer flag, or refresh timestamp.
        let _ = resolver.user_by_name("gone").await;
        assert_eq!(resolver.cached_key_state("user1").await.unwrap(), before);

        // Within the hot-path cooldown the carried keys answer directly.
        assert_eq!(resolver.authorized_keys("user1").await.unwrap(), expected);
        assert_eq!(source.keys_calls(), keys_fetched);
    }

    #[tokio::test]
    async fn test_miss_burst_coalesces_into_one_fetch() {
        let source = MockSource::new(sample_roster(), HashMap::new());
        let resolver = Resolver::new(source.clone(), MockClock::new(), hour_config()).await;
        assert_eq!(source.roster_calls(), 1);

        let mut lookups = Vec::new();
        for _ in 0..20 {
            let resolver = resolver.clone();
            lookups.push(tokio::spawn(async move {
                resolver.user_by_name("ghost").await
            }));
        }
        for lookup in lookups {
            assert_eq!(
                lookup.await.unwrap(),
                Err(AccountError::UserNameNotFound("ghost".to_string()))
            );
        }
        // Every miss was answered by the bootstrap refresh; the cooldown
        // kept the burst off the wire.
        assert_eq!(source.roster_calls(), 1);
    }

    #[tokio::test]
    async fn test_reserved_group_collision_dropped() {
        let mut roster = sample_roster();
        roster.groups.push(Group {
            name: SUDOERS_GROUP_NAME.to_string(),
            gid: 9999,
            members: vec!["intruder".to_string()],
        });
        roster.groups.push(Group {
            name: "evil".to_string(),
            gid: SUDOERS_GROUP_GID,
            members: Vec::new(),
        });
        let source = MockSource::new(roster, sample_keys());
        let resolver = Resolver::new(source.clone(), MockClock::new(), hour_config()).await;

        wait_for("sudoer flag", || async {
            resolver.group_by_gid(SUDOERS_GROUP_GID).await.unwrap().members == vec!["user1"]
        })
        .await;

        // The synthetic view wins on both lookup paths.
        let by_name = resolver.group_by_name(SUDOERS_GROUP_NAME).await.unwrap();
        assert_eq!(by_name.gid, SUDOERS_GROUP_GID);
        assert_eq!(by_name.members, vec!["user1"]);
        assert_eq!(
            resolver.group_by_gid(9999).await,
            Err(AccountError::GidNotFound(9999))
        );
        assert!(!resolver.is_name("evil").await.unwrap());

        let names = resolver.names().await.unwrap();
        assert_eq!(
            names.iter().filter(|n| *n == SUDOERS_GROUP_NAME).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_periodic_timer_refreshes_roster() {
        let clock = MockClock::new();
        let source = MockSource::new(sample_roster(), HashMap::new());
        let config = ResolverConfig {
            account_refresh_cooldown: Duration::from_secs(1),
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), clock.clone(), config).await;
        assert_eq!(source.roster_calls(), 1);

        source.set_roster(Roster {
            users: sample_users(),
            groups: vec![Group {
                name: "group3".to_string(),
                gid: 1003,
                members: Vec::new(),
            }],
        });
        clock.advance(Duration::from_secs(2));
        clock.fire_timers();
        wait_for("periodic refresh", || async {
            resolver.group_by_gid(1003).await.is_ok()
        })
        .await;
        assert_eq!(source.roster_calls(), 2);
        // The old groups are gone with the swapped generation.
        assert_eq!(
            resolver.group_by_gid(1000).await,
            Err(AccountError::GidNotFound(1000))
        );
    }

    #[tokio::test]
    async fn test_index_consistency_across_lookups() {
        let source = MockSource::new(sample_roster(), HashMap::new());
        let resolver = Resolver::new(source, MockClock::new(), hour_config()).await;

        let by_name = resolver.user_by_name("user1").await.unwrap();
        let by_uid = resolver.user_by_uid(by_name.uid).await.unwrap();
        assert_eq!(by_name, by_uid);
    }

    #[tokio::test]
    async fn test_empty_roster() {
        let source = MockSource::new(Roster::default(), HashMap::new());
        let resolver = Resolver::new(source.clone(), MockClock::new(), hour_config()).await;

        assert_eq!(resolver.names().await.unwrap(), vec!["gce-sudoers"]);
        assert_eq!(resolver.users().await.unwrap(), Vec::new());
        let groups = resolver.groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, SUDOERS_GROUP_NAME);
        assert!(groups[0].members.is_empty());
        assert_eq!(source.keys_calls(), 0);
    }

    #[tokio::test]
    async fn test_user_without_keys_cacheable() {
        // user2 is unknown to the keys endpoint; the empty view must cache.
        let source = MockSource::new(sample_roster(), sample_keys());
        let config = ResolverConfig {
            key_refresh_frequency: Duration::MAX,
            key_refresh_cooldown: Duration::from_secs(3600),
            ..hour_config()
        };
        let resolver = Resolver::new(source.clone(), Arc::new(SystemClock), config).await;

        assert_eq!(
            resolver.authorized_keys("user2").await.unwrap(),
            Vec::<String>::new()
        );
        wait_for("key write-back", || async {
            resolver
                .cached_key_state("user2")
                .await
                .is_some_and(|(_, _, at)| at != SystemTime::UNIX_EPOCH)
        })
        .await;
        let calls = source.keys_calls();
        assert_eq!(
            resolver.authorized_keys("user2").await.unwrap(),
            Vec::<String>::new()
        );
        assert_eq!(source.keys_calls(), calls);
    }
}
