use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Error;
use chrono::{DateTime, Utc};
use tracing::warn;

use prattle_core::xml::namespaces;
use prattle_core::xmpp::stanza::{Stanza, StanzaKind};

use crate::settings::MessageLoggingSettings;

/// Append-only log of forwarded `<message/>` bodies with size- and
/// age-based rotation. Rotated files get a numeric suffix on the base name.
pub struct MessageLog {
    path: PathBuf,
    file: File,
    written: u64,
    opened_at: DateTime<Utc>,
    roll_bytes: u64,
    roll_days: u64,
    filter_from: Vec<String>,
    log_group_chat: bool,
    next_seq: u64,
}

impl MessageLog {
    pub fn open(settings: &MessageLoggingSettings) -> Result<Self, Error> {
        let path = PathBuf::from(&settings.file);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        let next_seq = next_rotation_seq(&path);
        Ok(Self {
            path,
            file,
            written,
            opened_at: Utc::now(),
            roll_bytes: settings.roll_megs * 1024 * 1024,
            roll_days: settings.roll_days,
            filter_from: settings.filter_muc_messages_from.clone(),
            log_group_chat: settings.log_group_chat,
            next_seq,
        })
    }

    /// Appends the stanza if it is a loggable message. Failures are logged
    /// and swallowed; message logging never takes the router down.
    pub fn log(&mut self, stanza: &Stanza) {
        if !self.wants(stanza) {
            return;
        }
        let from = stanza
            .from()
            .map(|j| j.to_string())
            .unwrap_or_else(|| "-".to_string());
        let to = stanza
            .to()
            .map(|j| j.to_string())
            .unwrap_or_else(|| "-".to_string());
        let body = match body_of(stanza) {
            Some(body) => body,
            None => return,
        };

        if let Err(error) = self.append(&from, &to, &body) {
            warn!(%error, "could not append to message log");
        }
    }

    fn wants(&self, stanza: &Stanza) -> bool {
        if stanza.kind() != StanzaKind::Message {
            return false;
        }
        let message_type = stanza.stanza_type();
        if message_type.as_deref() == Some("groupchat") && !self.log_group_chat {
            return false;
        }
        if let Some(from) = stanza.from() {
            if self.filter_from.iter().any(|d| from.domain() == d) {
                return false;
            }
        }
        true
    }

    fn append(&mut self, from: &str, to: &str, body: &str) -> Result<(), Error> {
        self.rotate_if_needed()?;
        let line = format!(
            "{} {} {} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            from,
            to,
            body.replace('\n', " "),
        );
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.written += line.len() as u64;
        Ok(())
    }

    /// Immediate rotation, wired to SIGHUP.
    pub fn force_rotate(&mut self) {
        if self.written == 0 {
            return;
        }
        if let Err(error) = self.rotate() {
            warn!(%error, "could not rotate message log");
        }
    }

    fn rotate_if_needed(&mut self) -> Result<(), Error> {
        let too_big = self.roll_bytes > 0 && self.written >= self.roll_bytes;
        let too_old = self.roll_days > 0
            && (Utc::now() - self.opened_at).num_days() >= self.roll_days as i64;
        if !(too_big || too_old) || self.written == 0 {
            return Ok(());
        }
        self.rotate()
    }

    fn rotate(&mut self) -> Result<(), Error> {
        let rotated = self.path.with_file_name(format!(
            "{}.{}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            self.next_seq
        ));
        fs::rename(&self.path, &rotated)?;
        self.next_seq += 1;
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        self.opened_at = Utc::now();
        Ok(())
    }
}

/// Scans for existing `<base>.<seq>` siblings so rotation continues where a
/// previous run stopped.
fn next_rotation_seq(path: &PathBuf) -> u64 {
    let Some(parent) = path.parent() else { return 1 };
    let Some(base) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return 1;
    };
    let mut max_seq = 0;
    if let Ok(entries) = fs::read_dir(parent) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(suffix) = name.strip_prefix(&format!("{}.", base)) {
                if let Ok(seq) = suffix.trim_end_matches(".gz").parse::<u64>() {
                    max_seq = max_seq.max(seq);
                }
            }
        }
    }
    max_seq + 1
}

fn body_of(stanza: &Stanza) -> Option<String> {
    let root = stanza.nad.root()?;
    let ns = stanza.nad.ns_uri(root);
    let body = stanza
        .nad
        .find_child(root, "body", ns)
        .or_else(|| stanza.nad.find_child(root, "body", Some(namespaces::XMPP_CLIENT)))?;
    Some(stanza.nad.text(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prattle_core::xml::Nad;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn scratch_file() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "prattle-msglog-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir.push("message.log");
        dir
    }

    fn chat(from: &str, to: &str, body: &str, message_type: Option<&str>) -> Stanza {
        let mut nad = Nad::with_root("message", Some(namespaces::XMPP_CLIENT));
        let root = nad.root().unwrap();
        nad.append_attr(root, "from", from);
        nad.append_attr(root, "to", to);
        if let Some(t) = message_type {
            nad.append_attr(root, "type", t);
        }
        let body_elem = nad.append_elem(Some(root), "body", Some(namespaces::XMPP_CLIENT));
        nad.append_text(body_elem, body);
        Stanza::new(nad)
    }

    fn log_settings(file: &PathBuf) -> MessageLoggingSettings {
        MessageLoggingSettings {
            enable: true,
            file: file.to_string_lossy().into_owned(),
            roll_megs: 1,
            roll_days: 1,
            filter_muc_messages_from: vec!["muc.example.net".to_string()],
            log_group_chat: false,
        }
    }

    #[test]
    fn messages_are_appended() {
        let path = scratch_file();
        let mut log = MessageLog::open(&log_settings(&path)).unwrap();
        log.log(&chat("a@x.example", "b@y.example", "hello there", None));
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("a@x.example b@y.example hello there"));
    }

    #[test]
    fn filtered_domains_are_skipped() {
        let path = scratch_file();
        let mut log = MessageLog::open(&log_settings(&path)).unwrap();
        log.log(&chat("room@muc.example.net", "b@y.example", "noise", None));
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.is_empty());
    }

    #[test]
    fn groupchat_needs_its_own_flag() {
        let path = scratch_file();
        let mut log = MessageLog::open(&log_settings(&path)).unwrap();
        log.log(&chat("a@x.example", "room@muc.other", "psst", Some("groupchat")));
        assert!(fs::read_to_string(&path).unwrap().is_empty());

        let mut settings = log_settings(&path);
        settings.log_group_chat = true;
        let mut log = MessageLog::open(&settings).unwrap();
        log.log(&chat("a@x.example", "room@muc.other", "psst", Some("groupchat")));
        assert!(fs::read_to_string(&path).unwrap().contains("psst"));
    }

    #[test]
    fn rotation_moves_the_base_file() {
        let path = scratch_file();
        let mut settings = log_settings(&path);
        settings.roll_megs = 0; // unlimited size
        let mut log = MessageLog::open(&settings).unwrap();
        log.log(&chat("a@x.example", "b@y.example", "first", None));
        // force the age check to fire
        log.opened_at = Utc::now() - chrono::Duration::days(2);
        log.log(&chat("a@x.example", "b@y.example", "second", None));

        let rotated = path.with_file_name("message.log.1");
        assert!(rotated.exists());
        assert!(fs::read_to_string(&rotated).unwrap().contains("first"));
        assert!(fs::read_to_string(&path).unwrap().contains("second"));
    }
}
