use log::{debug, info};
use rusqlite::params;
use std::collections::{BTreeSet, HashMap};

use crate::app::{AppNamespace, ChannelError, Listener, SidedMessage};
use crate::database::Database;
use crate::message::Welcome;

/// How long a channel may sit idle before the pruner reaps it.
pub const CHANNEL_EXPIRATION_TIME: u64 = 11 * 60;
/// How often the pruner runs.
pub const EXPIRATION_CHECK_PERIOD: u64 = 5 * 60;

/// Server-level settings, mostly fed from the command line.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub allow_list: bool,
    pub advertise_version: Option<String>,
    pub signal_error: Option<String>,
    pub blur_usage: Option<u64>,
    pub welcome_motd: Option<String>,
    pub permission_required: Option<serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            allow_list: true,
            advertise_version: None,
            signal_error: None,
            blur_usage: None,
            welcome_motd: None,
            permission_required: None,
        }
    }
}

/// The rendezvous server: a lazy registry of [`AppNamespace`]s sharing one
/// channel store and one optional usage store. Connection handlers drive it
/// through the per-connection entry points, all behind one mutex.
#[derive(Debug)]
pub struct MailboxServer {
    db: Database,
    usage_db: Option<Database>,
    welcome: Welcome,
    blur_usage: Option<u64>,
    allow_list: bool,
    apps: HashMap<String, AppNamespace>,
}

impl MailboxServer {
    pub fn new(db: Database, usage_db: Option<Database>, config: ServerConfig) -> Self {
        if let Some(blur) = config.blur_usage {
            info!("blurring access times to {} seconds", blur);
        } else {
            info!("not blurring access times");
        }
        if !config.allow_list {
            info!("listing of allocated nameplates disallowed");
        }
        let welcome = Welcome {
            motd: config.welcome_motd,
            current_cli_version: config.advertise_version,
            error: config.signal_error,
            permission_required: config.permission_required,
        };
        MailboxServer {
            db,
            usage_db,
            welcome,
            blur_usage: config.blur_usage,
            allow_list: config.allow_list,
            apps: HashMap::new(),
        }
    }

    pub fn get_welcome(&self) -> &Welcome {
        &self.welcome
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn usage_db(&self) -> Option<&Database> {
        self.usage_db.as_ref()
    }

    fn with_app<R>(
        &mut self,
        app_id: &str,
        f: impl FnOnce(&Database, Option<&Database>, &mut AppNamespace) -> R,
    ) -> R {
        let blur_usage = self.blur_usage;
        let allow_list = self.allow_list;
        let Self {
            db, usage_db, apps, ..
        } = self;
        let app = apps.entry(app_id.to_owned()).or_insert_with(|| {
            debug!("spawning app_id {}", app_id);
            AppNamespace::new(app_id, blur_usage, allow_list)
        });
        f(db, usage_db.as_ref(), app)
    }

    /// Every app_id with any durable state, plus any app with a live
    /// namespace; pruning must visit apps nobody is connected to.
    pub fn get_all_apps(&self) -> rusqlite::Result<BTreeSet<String>> {
        let mut apps = BTreeSet::new();
        for table in ["nameplates", "mailboxes", "messages"] {
            let mut stmt = self
                .db
                .conn()
                .prepare(&format!("SELECT DISTINCT `app_id` FROM `{}`", table))?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            apps.extend(ids);
        }
        apps.extend(self.apps.keys().cloned());
        Ok(apps)
    }

    /// Prune every app, dropping namespace objects that come back idle.
    pub fn prune_all_apps(&mut self, now: u64, old: u64) -> rusqlite::Result<()> {
        debug!("beginning app prune");
        let app_ids = self.get_all_apps()?;
        let blur_usage = self.blur_usage;
        let allow_list = self.allow_list;
        let Self {
            db, usage_db, apps, ..
        } = self;
        for app_id in app_ids {
            debug!("app prune checking {}", app_id);
            let app = apps
                .entry(app_id.clone())
                .or_insert_with(|| AppNamespace::new(app_id.clone(), blur_usage, allow_list));
            let in_use = app.prune(db, usage_db.as_ref(), now, old)?;
            if !in_use {
                apps.remove(&app_id);
            }
        }
        debug!("app prune ends, {} apps", apps.len());
        Ok(())
    }

    /// Replace the single-row `current` table with a fresh snapshot.
    pub fn dump_stats(&self, now: u64, rebooted: u64) -> rusqlite::Result<()> {
        let Some(usage_db) = &self.usage_db else {
            return Ok(());
        };
        let connections: u64 = self
            .apps
            .values()
            .map(|app| app.count_listeners() as u64)
            .sum();
        let conn = usage_db.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM `current`", [])?;
        tx.execute(
            "INSERT INTO `current`
             (`rebooted`, `updated`, `blur_time`, `connections_websocket`)
             VALUES (?1, ?2, ?3, ?4)",
            params![rebooted, now, self.blur_usage, connections],
        )?;
        tx.commit()
    }

    /// Boot every connected client; used at process shutdown.
    pub fn shutdown(&mut self) {
        for app in self.apps.values_mut() {
            app.shutdown();
        }
    }

    // Per-connection entry points. Each takes the app_id the connection is
    // bound to and runs one namespace operation against the shared stores.

    pub fn log_client_version(
        &mut self,
        app_id: &str,
        server_rx: u64,
        side: &str,
        client_version: &(String, String),
    ) -> rusqlite::Result<()> {
        self.with_app(app_id, |_db, usage_db, app| {
            app.log_client_version(usage_db, server_rx, side, client_version)
        })
    }

    pub fn get_nameplate_ids(&mut self, app_id: &str) -> rusqlite::Result<BTreeSet<String>> {
        self.with_app(app_id, |db, _usage_db, app| app.get_nameplate_ids(db))
    }

    pub fn allocate_nameplate(
        &mut self,
        app_id: &str,
        side: &str,
        when: u64,
    ) -> Result<String, ChannelError> {
        self.with_app(app_id, |db, _usage_db, app| {
            app.allocate_nameplate(db, side, when)
        })
    }

    pub fn claim_nameplate(
        &mut self,
        app_id: &str,
        name: &str,
        side: &str,
        when: u64,
    ) -> Result<String, ChannelError> {
        self.with_app(app_id, |db, _usage_db, app| {
            app.claim_nameplate(db, name, side, when)
        })
    }

    pub fn release_nameplate(
        &mut self,
        app_id: &str,
        name: &str,
        side: &str,
        when: u64,
    ) -> Result<(), ChannelError> {
        self.with_app(app_id, |db, usage_db, app| {
            app.release_nameplate(db, usage_db, name, side, when)
        })
    }

    pub fn open_mailbox(
        &mut self,
        app_id: &str,
        mailbox_id: &str,
        side: &str,
        when: u64,
    ) -> Result<(), ChannelError> {
        self.with_app(app_id, |db, _usage_db, app| {
            app.open_mailbox(db, mailbox_id, side, when).map(|_| ())
        })
    }

    /// Register a listener on an open mailbox and return the history to
    /// replay. The caller holds the server lock across open/subscribe, so
    /// replay and registration are one step.
    pub fn add_listener(
        &mut self,
        app_id: &str,
        mailbox_id: &str,
        handle: u64,
        listener: Listener,
    ) -> rusqlite::Result<Vec<SidedMessage>> {
        self.with_app(app_id, |db, _usage_db, app| {
            match app.get_mailbox(mailbox_id) {
                Some(mailbox) => mailbox.add_listener(db, handle, listener),
                None => Ok(Vec::new()),
            }
        })
    }

    /// Drop a listener; the mailbox object goes away with its last
    /// subscriber (its row stays for reconnects, until pruned).
    pub fn remove_listener(&mut self, app_id: &str, mailbox_id: &str, handle: u64) {
        self.with_app(app_id, |_db, _usage_db, app| {
            if let Some(mailbox) = app.get_mailbox(mailbox_id) {
                mailbox.remove_listener(handle);
                if !mailbox.has_listeners() {
                    app.free_mailbox(mailbox_id);
                }
            }
        });
    }

    pub fn add_message(
        &mut self,
        app_id: &str,
        mailbox_id: &str,
        sm: &SidedMessage,
    ) -> Result<(), ChannelError> {
        self.with_app(app_id, |db, _usage_db, app| {
            if let Some(mailbox) = app.get_mailbox(mailbox_id) {
                mailbox.add_message(db, sm)?;
            }
            Ok(())
        })
    }

    pub fn close_mailbox(
        &mut self,
        app_id: &str,
        mailbox_id: &str,
        side: &str,
        mood: Option<&str>,
        when: u64,
    ) -> Result<(), ChannelError> {
        self.with_app(app_id, |db, usage_db, app| {
            app.close_mailbox(db, usage_db, mailbox_id, side, mood, when)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MailboxServer, ServerConfig};
    use crate::app::{Listener, SidedMessage};
    use crate::database::Database;

    fn server() -> MailboxServer {
        MailboxServer::new(
            Database::memory_channel().unwrap(),
            Some(Database::memory_usage().unwrap()),
            ServerConfig::default(),
        )
    }

    fn noop_listener() -> Listener {
        Listener::new(|_sm: &SidedMessage| {}, || {})
    }

    #[test]
    fn welcome_merge() {
        let server = MailboxServer::new(
            Database::memory_channel().unwrap(),
            None,
            ServerConfig {
                advertise_version: Some("0.1.0".into()),
                signal_error: Some("down for repairs".into()),
                welcome_motd: Some("hello".into()),
                ..ServerConfig::default()
            },
        );
        let welcome = serde_json::to_value(server.get_welcome()).unwrap();
        assert_eq!(
            welcome,
            serde_json::json!({
                "motd": "hello",
                "current_cli_version": "0.1.0",
                "error": "down for repairs",
            })
        );
    }

    #[test]
    fn apps_are_scoped() {
        let mut server = server();
        server.claim_nameplate("app1", "4", "side1", 0).unwrap();
        server.claim_nameplate("app2", "4", "side1", 0).unwrap();
        let ids1 = server.get_nameplate_ids("app1").unwrap();
        assert_eq!(ids1.into_iter().collect::<Vec<_>>(), vec!["4"]);
        assert_eq!(server.get_all_apps().unwrap().len(), 2);

        // claims under different apps produce different mailboxes
        let m1 = server.claim_nameplate("app1", "4", "side2", 1).unwrap();
        let m2 = server.claim_nameplate("app2", "4", "side2", 1).unwrap();
        assert_ne!(m1, m2);
    }

    #[test]
    fn prune_all_apps_drops_idle_namespaces() {
        let mut server = server();
        server.open_mailbox("app1", "mid", "side1", 1).unwrap();
        server.prune_all_apps(700, 660).unwrap();

        // the channel is gone and the namespace object was dropped
        assert!(server.get_all_apps().unwrap().is_empty());
        let count: u32 = server
            .db()
            .conn()
            .query_row("SELECT COUNT(*) FROM `mailboxes`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn prune_covers_unloaded_apps() {
        // durable rows with no live namespace still get pruned
        let mut server = server();
        server.open_mailbox("app1", "mid", "side1", 1).unwrap();
        server.remove_listener("app1", "mid", 1);

        // simulate a restart: fresh registry over the same stores
        let mut fresh = MailboxServer {
            apps: Default::default(),
            ..server
        };
        fresh.prune_all_apps(700, 660).unwrap();
        let count: u32 = fresh
            .db()
            .conn()
            .query_row("SELECT COUNT(*) FROM `mailboxes`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn dump_stats() {
        let mut server = server();
        server.open_mailbox("app1", "mid", "side1", 1).unwrap();
        let history = server
            .add_listener("app1", "mid", 7, noop_listener())
            .unwrap();
        assert!(history.is_empty());

        server.dump_stats(100, 90).unwrap();
        let row: (u64, u64, Option<u64>, u64) = server
            .usage_db()
            .unwrap()
            .conn()
            .query_row(
                "SELECT `rebooted`, `updated`, `blur_time`, `connections_websocket` FROM `current`",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(row, (90, 100, None, 1));

        // a second snapshot replaces the first
        server.remove_listener("app1", "mid", 7);
        server.dump_stats(200, 90).unwrap();
        let count: u32 = server
            .usage_db()
            .unwrap()
            .conn()
            .query_row("SELECT COUNT(*) FROM `current`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let connections: u64 = server
            .usage_db()
            .unwrap()
            .conn()
            .query_row("SELECT `connections_websocket` FROM `current`", [], |r| r.get(0))
            .unwrap();
        assert_eq!(connections, 0);
    }

    #[test]
    fn message_history_replay() {
        let mut server = server();
        server.open_mailbox("app1", "mid", "side1", 1).unwrap();
        server.add_listener("app1", "mid", 1, noop_listener()).unwrap();
        let sm = SidedMessage {
            side: "side1".into(),
            phase: "pake".into(),
            body: "b1".into(),
            server_rx: 2,
            msg_id: "m1".into(),
        };
        server.add_message("app1", "mid", &sm).unwrap();

        server.open_mailbox("app1", "mid", "side2", 3).unwrap();
        let history = server
            .add_listener("app1", "mid", 2, noop_listener())
            .unwrap();
        assert_eq!(history, vec![sm]);
    }
}
