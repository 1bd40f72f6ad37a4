use data_encoding::BASE32;
use log::debug;
use rand::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

use crate::database::Database;

/// Errors raised by channel lifecycle operations. `Crowded` and `Reclaimed`
/// are reported to the offending client verbatim; the extra side rows they
/// leave behind are kept so a later release can record a "crowded" summary.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("crowded")]
    Crowded,
    #[error("reclaimed")]
    Reclaimed,
    #[error("no nameplates available")]
    NameplatesExhausted,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

/// One relayed message, as stored and as replayed to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidedMessage {
    pub side: String,
    pub phase: String,
    pub body: String,
    pub server_rx: u64,
    pub msg_id: String,
}

/// A usage summary, recorded when a nameplate or mailbox is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    pub started: u64,
    pub waiting_time: Option<u64>,
    pub total_time: u64,
    pub result: &'static str,
}

/// A subscription to one mailbox: `deliver` is invoked for every appended
/// message, `stop` once when the mailbox is torn down underneath the
/// subscriber. Deliver must not fail and must not block.
pub struct Listener {
    deliver: Box<dyn Fn(&SidedMessage) + Send>,
    stop: Box<dyn FnOnce() + Send>,
}

impl Listener {
    pub fn new(
        deliver: impl Fn(&SidedMessage) + Send + 'static,
        stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Listener {
            deliver: Box::new(deliver),
            stop: Box::new(stop),
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Listener")
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MailboxSideRow {
    pub(crate) side: String,
    pub(crate) opened: bool,
    pub(crate) added: u64,
    pub(crate) mood: Option<String>,
}

#[derive(Debug, Clone)]
struct NameplateSideRow {
    side: String,
    claimed: bool,
    added: u64,
}

#[derive(Debug)]
pub(crate) enum CloseOutcome {
    /// The mailbox or side row was missing; nothing happened.
    Ignored,
    /// At least one other side still holds the mailbox open.
    StillOpen,
    /// The last open side closed: all rows are gone, listeners stopped.
    Deleted {
        for_nameplate: bool,
        side_rows: Vec<MailboxSideRow>,
    },
}

/// Generate 13 characters of random, base32, lowercase ASCII.
pub(crate) fn generate_mailbox_id() -> String {
    let mut rng = rand::thread_rng();
    let mut buffer = [0u8; 8];
    rng.fill_bytes(&mut buffer);
    BASE32
        .encode(&buffer)
        .to_ascii_lowercase()
        .strip_suffix("===")
        .expect("8 bytes of base32 end in ===")
        .to_owned()
}

/// The in-memory face of one mailbox row: holds the live listener set and
/// performs the row updates for open/append/close. A `Mailbox` object exists
/// only while some connection is interested in the channel; the row itself
/// can outlive it (and is then reaped by pruning).
#[derive(Debug)]
pub struct Mailbox {
    app_id: String,
    mailbox_id: String,
    listeners: HashMap<u64, Listener>,
}

impl Mailbox {
    fn new(app_id: String, mailbox_id: String) -> Self {
        Mailbox {
            app_id,
            mailbox_id,
            listeners: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.mailbox_id
    }

    fn touch(&self, conn: &Connection, when: u64) -> rusqlite::Result<()> {
        conn.execute(
            "UPDATE `mailboxes` SET `updated`=?1 WHERE `id`=?2",
            params![when, self.mailbox_id],
        )?;
        Ok(())
    }

    /// Record that `side` holds this mailbox open. Re-opening a mailbox a
    /// side previously closed is allowed, and keeps the original `added`
    /// time: intermittently-connected clients re-send `close` until they see
    /// the `closed` ack, which requires the side row to come back to life.
    pub fn open(&self, db: &Database, side: &str, when: u64) -> rusqlite::Result<()> {
        let conn = db.conn();
        let tx = conn.unchecked_transaction()?;
        let already: Option<bool> = tx
            .query_row(
                "SELECT `opened` FROM `mailbox_sides`
                 WHERE `mailbox_id`=?1 AND `side`=?2",
                params![self.mailbox_id, side],
                |row| row.get(0),
            )
            .optional()?;
        match already {
            None => {
                tx.execute(
                    "INSERT INTO `mailbox_sides` (`mailbox_id`, `opened`, `side`, `added`)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![self.mailbox_id, true, side, when],
                )?;
            }
            Some(false) => {
                tx.execute(
                    "UPDATE `mailbox_sides` SET `opened`=?1
                     WHERE `mailbox_id`=?2 AND `side`=?3",
                    params![true, self.mailbox_id, side],
                )?;
            }
            Some(true) => {}
        }
        self.touch(&tx, when)?;
        tx.commit()
    }

    /// All messages for this mailbox, in receipt order.
    pub fn get_messages(&self, db: &Database) -> rusqlite::Result<Vec<SidedMessage>> {
        let mut stmt = db.conn().prepare(
            "SELECT `side`, `phase`, `body`, `server_rx`, `msg_id` FROM `messages`
             WHERE `app_id`=?1 AND `mailbox_id`=?2 ORDER BY `server_rx` ASC",
        )?;
        let messages = stmt
            .query_map(params![self.app_id, self.mailbox_id], |row| {
                Ok(SidedMessage {
                    side: row.get(0)?,
                    phase: row.get(1)?,
                    body: row.get(2)?,
                    server_rx: row.get(3)?,
                    msg_id: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Register a listener and return the full history so far. Registration
    /// and replay form one step: a message appended after this call is
    /// delivered, never lost or duplicated.
    pub fn add_listener(
        &mut self,
        db: &Database,
        handle: u64,
        listener: Listener,
    ) -> rusqlite::Result<Vec<SidedMessage>> {
        self.listeners.insert(handle, listener);
        self.get_messages(db)
    }

    /// Unknown handles are ignored.
    pub fn remove_listener(&mut self, handle: u64) {
        self.listeners.remove(&handle);
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn count_listeners(&self) -> usize {
        self.listeners.len()
    }

    /// Persist a message and deliver it to every listener. Not idempotent:
    /// clients suppress duplicates by `msg_id`.
    pub fn add_message(&self, db: &Database, sm: &SidedMessage) -> rusqlite::Result<()> {
        let conn = db.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO `messages`
             (`app_id`, `mailbox_id`, `side`, `phase`, `body`, `server_rx`, `msg_id`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                self.app_id,
                self.mailbox_id,
                sm.side,
                sm.phase,
                sm.body,
                sm.server_rx,
                sm.msg_id
            ],
        )?;
        self.touch(&tx, sm.server_rx)?;
        tx.commit()?;
        for listener in self.listeners.values() {
            (listener.deliver)(sm);
        }
        Ok(())
    }

    /// Mark `side` closed. When the last open side closes, delete the
    /// mailbox and everything hanging off it (in foreign-key order) and stop
    /// all listeners. The caller records the usage summary from the returned
    /// side rows.
    pub(crate) fn close(
        &mut self,
        db: &Database,
        side: &str,
        mood: Option<&str>,
        when: u64,
    ) -> rusqlite::Result<CloseOutcome> {
        let conn = db.conn();
        let for_nameplate: Option<bool> = conn
            .query_row(
                "SELECT `for_nameplate` FROM `mailboxes` WHERE `app_id`=?1 AND `id`=?2",
                params![self.app_id, self.mailbox_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(for_nameplate) = for_nameplate else {
            return Ok(CloseOutcome::Ignored);
        };
        let side_exists: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM `mailbox_sides` WHERE `mailbox_id`=?1 AND `side`=?2",
                params![self.mailbox_id, side],
                |row| row.get(0),
            )
            .optional()?;
        if side_exists.is_none() {
            return Ok(CloseOutcome::Ignored);
        }
        conn.execute(
            "UPDATE `mailbox_sides` SET `opened`=?1, `mood`=?2
             WHERE `mailbox_id`=?3 AND `side`=?4",
            params![false, mood, self.mailbox_id, side],
        )?;
        self.touch(conn, when)?;

        let side_rows = mailbox_side_rows(conn, &self.mailbox_id)?;
        if side_rows.iter().any(|row| row.opened) {
            return Ok(CloseOutcome::StillOpen);
        }

        // Nobody left. Delete and let the caller summarize. A nameplate
        // still pointing at this mailbox would fail the foreign-key check,
        // so its rows go first. Note the nameplate_sides delete is by side
        // across the whole app, matching the original server.
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM `nameplate_sides` WHERE `side`=?1", params![side])?;
        tx.execute(
            "DELETE FROM `nameplates` WHERE `mailbox_id`=?1",
            params![self.mailbox_id],
        )?;
        tx.execute(
            "DELETE FROM `messages` WHERE `mailbox_id`=?1",
            params![self.mailbox_id],
        )?;
        tx.execute(
            "DELETE FROM `mailbox_sides` WHERE `mailbox_id`=?1",
            params![self.mailbox_id],
        )?;
        tx.execute(
            "DELETE FROM `mailboxes` WHERE `id`=?1",
            params![self.mailbox_id],
        )?;
        tx.commit()?;

        // Shut down any listeners still lingering around.
        self.shutdown();
        Ok(CloseOutcome::Deleted {
            for_nameplate,
            side_rows,
        })
    }

    /// Stop every listener and clear the set.
    pub(crate) fn shutdown(&mut self) {
        for (_, listener) in self.listeners.drain() {
            (listener.stop)();
        }
    }
}

fn mailbox_side_rows(conn: &Connection, mailbox_id: &str) -> rusqlite::Result<Vec<MailboxSideRow>> {
    let mut stmt = conn.prepare(
        "SELECT `side`, `opened`, `added`, `mood` FROM `mailbox_sides` WHERE `mailbox_id`=?1",
    )?;
    let rows = stmt
        .query_map(params![mailbox_id], |row| {
            Ok(MailboxSideRow {
                side: row.get(0)?,
                opened: row.get(1)?,
                added: row.get(2)?,
                mood: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn nameplate_side_rows(conn: &Connection, npid: i64) -> rusqlite::Result<Vec<NameplateSideRow>> {
    let mut stmt = conn.prepare(
        "SELECT `side`, `claimed`, `added` FROM `nameplate_sides` WHERE `nameplates_id`=?1",
    )?;
    let rows = stmt
        .query_map(params![npid], |row| {
            Ok(NameplateSideRow {
                side: row.get(0)?,
                claimed: row.get(1)?,
                added: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All channel state scoped to one `app_id`: nameplate allocation and
/// claims, mailbox lifecycle, usage summaries, and pruning. Durable state
/// lives in the store handles passed into each call; only the live
/// `Mailbox` objects are held here.
#[derive(Debug)]
pub struct AppNamespace {
    app_id: String,
    blur_usage: Option<u64>,
    allow_list: bool,
    mailboxes: HashMap<String, Mailbox>,
}

impl AppNamespace {
    pub fn new(app_id: impl Into<String>, blur_usage: Option<u64>, allow_list: bool) -> Self {
        AppNamespace {
            app_id: app_id.into(),
            blur_usage,
            allow_list,
            mailboxes: HashMap::new(),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn blur(&self, time: u64) -> u64 {
        match self.blur_usage {
            Some(blur) if blur > 0 => blur * (time / blur),
            _ => time,
        }
    }

    /// Record the client implementation/version pair from a bind, if a
    /// usage store is configured.
    pub fn log_client_version(
        &self,
        usage_db: Option<&Database>,
        server_rx: u64,
        side: &str,
        client_version: &(String, String),
    ) -> rusqlite::Result<()> {
        let Some(usage_db) = usage_db else {
            return Ok(());
        };
        let connect_time = self.blur(server_rx);
        usage_db.conn().execute(
            "INSERT INTO `client_versions`
             (`app_id`, `side`, `connect_time`, `implementation`, `version`)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.app_id,
                side,
                connect_time,
                client_version.0,
                client_version.1
            ],
        )?;
        Ok(())
    }

    /// Nameplates currently allocated in this app, or nothing when listing
    /// is disallowed.
    pub fn get_nameplate_ids(&self, db: &Database) -> rusqlite::Result<BTreeSet<String>> {
        if !self.allow_list {
            return Ok(BTreeSet::new());
        }
        Ok(self.all_nameplate_names(db)?.into_iter().collect())
    }

    fn all_nameplate_names(&self, db: &Database) -> rusqlite::Result<HashSet<String>> {
        let mut stmt = db
            .conn()
            .prepare("SELECT DISTINCT `name` FROM `nameplates` WHERE `app_id`=?1")?;
        let names = stmt
            .query_map(params![self.app_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }

    /// Pick a free short-decimal name: scan the 1-, 2-, then 3-digit ranges
    /// and choose uniformly within the first range with room; once all 999
    /// are taken, try random 4-to-6-digit names for a while.
    fn choose_free_nameplate(
        claimed: &HashSet<String>,
        rng: &mut impl Rng,
    ) -> Result<String, ChannelError> {
        for digits in 1..4u32 {
            let range = 10u64.pow(digits - 1)..10u64.pow(digits);
            let available: Vec<String> = range
                .map(|n| n.to_string())
                .filter(|name| !claimed.contains(name))
                .collect();
            if !available.is_empty() {
                return Ok(available.choose(rng).expect("non-empty").clone());
            }
        }
        for _ in 0..1000 {
            let name = rng.gen_range(1_000..1_000_000u64).to_string();
            if !claimed.contains(&name) {
                return Ok(name);
            }
        }
        Err(ChannelError::NameplatesExhausted)
    }

    /// Allocate a free nameplate and claim it for `side`. The mailbox id is
    /// not returned; the client learns it from a subsequent `claim`.
    pub fn allocate_nameplate(
        &mut self,
        db: &Database,
        side: &str,
        when: u64,
    ) -> Result<String, ChannelError> {
        let claimed = self.all_nameplate_names(db)?;
        let name = Self::choose_free_nameplate(&claimed, &mut rand::thread_rng())?;
        self.claim_nameplate(db, &name, side, when)?;
        Ok(name)
    }

    /// Claim `name` for `side`, creating the nameplate and its mailbox on
    /// first claim. Claims are idempotent while held; re-claiming a released
    /// nameplate is refused, since the first claim is what creates the
    /// mailbox. Returns the mailbox id.
    pub fn claim_nameplate(
        &mut self,
        db: &Database,
        name: &str,
        side: &str,
        when: u64,
    ) -> Result<String, ChannelError> {
        let conn = db.conn();
        let tx = conn.unchecked_transaction()?;
        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT `id`, `mailbox_id` FROM `nameplates` WHERE `app_id`=?1 AND `name`=?2",
                params![self.app_id, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (npid, mailbox_id) = match existing {
            Some(pair) => pair,
            None => {
                debug!("creating nameplate#{} for app_id {}", name, self.app_id);
                let mailbox_id = generate_mailbox_id();
                add_mailbox_row(&tx, &self.app_id, &mailbox_id, true, when)?;
                tx.execute(
                    "INSERT INTO `nameplates` (`app_id`, `name`, `mailbox_id`) VALUES (?1, ?2, ?3)",
                    params![self.app_id, name, mailbox_id],
                )?;
                (tx.last_insert_rowid(), mailbox_id)
            }
        };
        let side_claimed: Option<bool> = tx
            .query_row(
                "SELECT `claimed` FROM `nameplate_sides`
                 WHERE `nameplates_id`=?1 AND `side`=?2",
                params![npid, side],
                |row| row.get(0),
            )
            .optional()?;
        match side_claimed {
            None => {
                tx.execute(
                    "INSERT INTO `nameplate_sides` (`nameplates_id`, `claimed`, `side`, `added`)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![npid, true, side, when],
                )?;
            }
            Some(true) => {}
            Some(false) => return Err(ChannelError::Reclaimed),
        }
        tx.commit()?;

        self.open_mailbox(db, &mailbox_id, side, when)?;

        // Any crowding is normally noticed on mailbox_sides first, inside
        // open_mailbox; this covers claims that never opened.
        let claims: u32 = db.conn().query_row(
            "SELECT COUNT(*) FROM `nameplate_sides` WHERE `nameplates_id`=?1",
            params![npid],
            |row| row.get(0),
        )?;
        if claims > 2 {
            return Err(ChannelError::Crowded);
        }
        Ok(mailbox_id)
    }

    /// Drop `side`'s claim on `name`. Idempotent; unknown nameplates and
    /// sides are ignored. When the last claim goes away the nameplate rows
    /// are deleted and a usage record appended.
    pub fn release_nameplate(
        &mut self,
        db: &Database,
        usage_db: Option<&Database>,
        name: &str,
        side: &str,
        when: u64,
    ) -> Result<(), ChannelError> {
        let conn = db.conn();
        let npid: Option<i64> = conn
            .query_row(
                "SELECT `id` FROM `nameplates` WHERE `app_id`=?1 AND `name`=?2",
                params![self.app_id, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(npid) = npid else {
            return Ok(());
        };
        let side_exists: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM `nameplate_sides` WHERE `nameplates_id`=?1 AND `side`=?2",
                params![npid, side],
                |row| row.get(0),
            )
            .optional()?;
        if side_exists.is_none() {
            return Ok(());
        }
        conn.execute(
            "UPDATE `nameplate_sides` SET `claimed`=?1 WHERE `nameplates_id`=?2 AND `side`=?3",
            params![false, npid, side],
        )?;

        let side_rows = nameplate_side_rows(conn, npid)?;
        if side_rows.iter().any(|row| row.claimed) {
            return Ok(());
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM `nameplate_sides` WHERE `nameplates_id`=?1",
            params![npid],
        )?;
        tx.execute("DELETE FROM `nameplates` WHERE `id`=?1", params![npid])?;
        tx.commit()?;
        if let Some(usage_db) = usage_db {
            self.summarize_nameplate_and_store(usage_db, &side_rows, when, false)?;
        }
        Ok(())
    }

    /// Ensure the mailbox row and in-memory object exist and record `side`
    /// as an open participant. A third side raises `Crowded`, but its row
    /// is left in place.
    pub fn open_mailbox(
        &mut self,
        db: &Database,
        mailbox_id: &str,
        side: &str,
        when: u64,
    ) -> Result<&mut Mailbox, ChannelError> {
        add_mailbox_row(db.conn(), &self.app_id, mailbox_id, false, when)?;
        if !self.mailboxes.contains_key(mailbox_id) {
            debug!("spawning #{} for app_id {}", mailbox_id, self.app_id);
            self.mailboxes.insert(
                mailbox_id.to_owned(),
                Mailbox::new(self.app_id.clone(), mailbox_id.to_owned()),
            );
        }
        let mailbox = self
            .mailboxes
            .get_mut(mailbox_id)
            .expect("just inserted above");
        mailbox.open(db, side, when)?;
        let sides: u32 = db.conn().query_row(
            "SELECT COUNT(*) FROM `mailbox_sides` WHERE `mailbox_id`=?1",
            params![mailbox_id],
            |row| row.get(0),
        )?;
        if sides > 2 {
            return Err(ChannelError::Crowded);
        }
        Ok(mailbox)
    }

    pub fn get_mailbox(&mut self, mailbox_id: &str) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(mailbox_id)
    }

    /// Close `side`'s interest in the mailbox. The last close deletes the
    /// channel and records a usage summary.
    pub fn close_mailbox(
        &mut self,
        db: &Database,
        usage_db: Option<&Database>,
        mailbox_id: &str,
        side: &str,
        mood: Option<&str>,
        when: u64,
    ) -> Result<(), ChannelError> {
        let outcome = match self.mailboxes.get_mut(mailbox_id) {
            Some(mailbox) => mailbox.close(db, side, mood, when)?,
            // No live object: closes from reconnected clients still operate
            // on the rows.
            None => Mailbox::new(self.app_id.clone(), mailbox_id.to_owned())
                .close(db, side, mood, when)?,
        };
        if let CloseOutcome::Deleted {
            for_nameplate,
            side_rows,
        } = outcome
        {
            if let Some(usage_db) = usage_db {
                self.summarize_mailbox_and_store(usage_db, for_nameplate, &side_rows, when, false)?;
            }
            self.free_mailbox(mailbox_id);
        }
        Ok(())
    }

    /// Drop the in-memory object; row lifecycle is managed by close/prune.
    pub fn free_mailbox(&mut self, mailbox_id: &str) {
        self.mailboxes.remove(mailbox_id);
    }

    fn summarize_nameplate_and_store(
        &self,
        usage_db: &Database,
        side_rows: &[NameplateSideRow],
        delete_time: u64,
        pruned: bool,
    ) -> rusqlite::Result<()> {
        let usage = self.summarize_nameplate_usage(side_rows, delete_time, pruned);
        usage_db.conn().execute(
            "INSERT INTO `nameplates`
             (`app_id`, `started`, `total_time`, `waiting_time`, `result`)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.app_id,
                usage.started,
                usage.total_time,
                usage.waiting_time,
                usage.result
            ],
        )?;
        Ok(())
    }

    fn summarize_nameplate_usage(
        &self,
        side_rows: &[NameplateSideRow],
        delete_time: u64,
        pruned: bool,
    ) -> Usage {
        let mut times: Vec<u64> = side_rows.iter().map(|row| row.added).collect();
        times.sort_unstable();
        let waiting_time = (times.len() > 1).then(|| times[1] - times[0]);
        let mut result = match times.len() {
            0 | 1 => "lonely",
            2 => "happy",
            _ => "crowded",
        };
        if pruned {
            result = "pruney";
        }
        Usage {
            started: self.blur(times[0]),
            waiting_time,
            total_time: delete_time.saturating_sub(times[0]),
            result,
        }
    }

    fn summarize_mailbox_and_store(
        &self,
        usage_db: &Database,
        for_nameplate: bool,
        side_rows: &[MailboxSideRow],
        delete_time: u64,
        pruned: bool,
    ) -> rusqlite::Result<()> {
        let usage = self.summarize_mailbox(side_rows, delete_time, pruned);
        usage_db.conn().execute(
            "INSERT INTO `mailboxes`
             (`app_id`, `for_nameplate`, `started`, `total_time`, `waiting_time`, `result`)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                self.app_id,
                for_nameplate,
                usage.started,
                usage.total_time,
                usage.waiting_time,
                usage.result
            ],
        )?;
        Ok(())
    }

    fn summarize_mailbox(
        &self,
        side_rows: &[MailboxSideRow],
        delete_time: u64,
        pruned: bool,
    ) -> Usage {
        let mut times: Vec<u64> = side_rows.iter().map(|row| row.added).collect();
        times.sort_unstable();
        let started = times.first().copied().unwrap_or(delete_time);
        let waiting_time = (times.len() > 1).then(|| times[1] - times[0]);

        let mut result = match times.len() {
            0 => "quiet",
            1 => "lonely",
            _ => "happy",
        };
        // moods are only recorded at close(); later overrides win
        let moods: Vec<&str> = side_rows
            .iter()
            .filter_map(|row| row.mood.as_deref())
            .collect();
        if moods.contains(&"lonely") {
            result = "lonely";
        }
        if moods.contains(&"errory") {
            result = "errory";
        }
        if moods.contains(&"scary") {
            result = "scary";
        }
        if pruned {
            result = "pruney";
        }
        if times.len() > 2 {
            result = "crowded";
        }
        Usage {
            started: self.blur(started),
            waiting_time,
            total_time: delete_time.saturating_sub(started),
            result,
        }
    }

    /// Garbage-collect idle channels. A live subscription keeps a channel
    /// fresh: every mailbox with listeners is touched to `now` first, then
    /// every mailbox whose `updated` is at or before `old` is deleted along
    /// with the nameplates pointing at it, each with a `pruney` usage
    /// record. Returns whether any in-memory mailboxes remain.
    pub fn prune(
        &mut self,
        db: &Database,
        usage_db: Option<&Database>,
        now: u64,
        old: u64,
    ) -> rusqlite::Result<bool> {
        debug!("prune begins ({})", self.app_id);
        let conn = db.conn();

        let tx = conn.unchecked_transaction()?;
        for mailbox in self.mailboxes.values() {
            if mailbox.has_listeners() {
                debug!("touch {} because listeners", mailbox.id());
                mailbox.touch(&tx, now)?;
            }
        }
        tx.commit()?;

        let mut old_mailboxes: Vec<String> = Vec::new();
        {
            let mut stmt =
                conn.prepare("SELECT `id`, `updated` FROM `mailboxes` WHERE `app_id`=?1")?;
            let rows = stmt
                .query_map(params![self.app_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (mailbox_id, updated) in rows {
                if updated <= old {
                    old_mailboxes.push(mailbox_id);
                }
            }
        }

        let mut old_nameplates: Vec<i64> = Vec::new();
        {
            let mut stmt =
                conn.prepare("SELECT `id`, `mailbox_id` FROM `nameplates` WHERE `app_id`=?1")?;
            let rows = stmt
                .query_map(params![self.app_id], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (npid, mailbox_id) in rows {
                if old_mailboxes.contains(&mailbox_id) {
                    old_nameplates.push(npid);
                }
            }
        }

        let tx = conn.unchecked_transaction()?;
        for npid in old_nameplates {
            debug!("pruning nameplate with dbid {}", npid);
            let side_rows = nameplate_side_rows(&tx, npid)?;
            tx.execute(
                "DELETE FROM `nameplate_sides` WHERE `nameplates_id`=?1",
                params![npid],
            )?;
            tx.execute("DELETE FROM `nameplates` WHERE `id`=?1", params![npid])?;
            if let Some(usage_db) = usage_db {
                self.summarize_nameplate_and_store(usage_db, &side_rows, now, true)?;
            }
        }
        for mailbox_id in old_mailboxes {
            debug!("pruning mailbox {}", mailbox_id);
            let for_nameplate: bool = tx.query_row(
                "SELECT `for_nameplate` FROM `mailboxes` WHERE `id`=?1",
                params![mailbox_id],
                |row| row.get(0),
            )?;
            let side_rows = mailbox_side_rows(&tx, &mailbox_id)?;
            tx.execute(
                "DELETE FROM `messages` WHERE `mailbox_id`=?1",
                params![mailbox_id],
            )?;
            tx.execute(
                "DELETE FROM `mailbox_sides` WHERE `mailbox_id`=?1",
                params![mailbox_id],
            )?;
            tx.execute("DELETE FROM `mailboxes` WHERE `id`=?1", params![mailbox_id])?;
            if let Some(usage_db) = usage_db {
                self.summarize_mailbox_and_store(usage_db, for_nameplate, &side_rows, now, true)?;
            }
        }
        tx.commit()?;

        let in_use = !self.mailboxes.is_empty();
        debug!("prune complete ({}), in_use={}", self.app_id, in_use);
        Ok(in_use)
    }

    pub fn count_listeners(&self) -> usize {
        self.mailboxes
            .values()
            .map(Mailbox::count_listeners)
            .sum()
    }

    /// Stop every listener on every live mailbox; used at server shutdown
    /// to boot lingering clients.
    pub fn shutdown(&mut self) {
        for mailbox in self.mailboxes.values_mut() {
            mailbox.shutdown();
        }
    }
}

fn add_mailbox_row(
    conn: &Connection,
    app_id: &str,
    mailbox_id: &str,
    for_nameplate: bool,
    when: u64,
) -> rusqlite::Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT rowid FROM `mailboxes` WHERE `app_id`=?1 AND `id`=?2",
            params![app_id, mailbox_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        conn.execute(
            "INSERT INTO `mailboxes` (`app_id`, `id`, `for_nameplate`, `updated`)
             VALUES (?1, ?2, ?3, ?4)",
            params![app_id, mailbox_id, for_nameplate, when],
        )?;
    }
    Ok(())
}
