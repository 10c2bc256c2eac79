//! JSONL-backed event store.
//!
//! Each event is one JSON object followed by a newline. Appends are
//! serialized through a mutex and written with a single `write_all` so lines
//! never interleave. Reads re-scan the whole file and skip lines that do not
//! parse, which tolerates a torn final line after a crash. The next append
//! after such a tear starts on a fresh line. I/O errors always reach the
//! caller.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use xskynet_core::event::store::EventStore;
use xskynet_types::config::RuntimeConfig;
use xskynet_types::error::StoreError;
use xskynet_types::event::{DomainEvent, ListOptions};

pub struct FileEventStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventStore {
    /// The file and its parent directory are created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `{base}/{state_dir}/{events_file}`.
    pub fn from_config(config: &RuntimeConfig, base: &Path) -> Self {
        Self::new(config.events_path(base))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<Vec<DomainEvent>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        // Split on raw bytes so a torn multi-byte tail is a parse failure,
        // not a read error.
        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<DomainEvent>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        line = idx + 1,
                        error = %err,
                        "skipping malformed event line"
                    );
                }
            }
        }
        Ok(events)
    }
}

/// Whether a non-empty file lacks its trailing newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl EventStore for FileEventStore {
    fn append(&self, event: &DomainEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().map_err(|_| StoreError::Lock)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if ends_mid_line(&mut file)? {
            tracing::warn!(
                path = %self.path.display(),
                "event log ends with a torn line, starting a new one"
            );
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn list(&self, options: &ListOptions) -> Result<Vec<DomainEvent>, StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Lock)?;
        Ok(options.apply(self.read_all()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use xskynet_types::event::{EventFilter, METADATA_SOURCE};

    fn store_in(tmp: &TempDir) -> FileEventStore {
        FileEventStore::new(tmp.path().join("state").join("events.jsonl"))
    }

    #[test]
    fn missing_file_lists_empty() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        assert!(store.list(&ListOptions::all()).unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn append_creates_directory_and_writes_one_line_per_event() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let first = DomainEvent::new("plan.started").with_aggregate("p1");
        let second = DomainEvent::new("plan.succeeded")
            .with_aggregate("p1")
            .with_payload(json!({"taskCount": 2}));
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.ends_with('\n'));

        let listed = store.list(&ListOptions::all()).unwrap();
        assert_eq!(listed, vec![first, second]);
    }

    #[test]
    fn list_applies_filter_bounds_and_limit() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let events: Vec<DomainEvent> = (0..4)
            .map(|i| {
                DomainEvent::new(if i % 2 == 0 { "task.started" } else { "task.succeeded" })
                    .with_metadata(METADATA_SOURCE, json!("executor"))
            })
            .collect();
        for event in &events {
            store.append(event).unwrap();
        }

        let started = store
            .list(&ListOptions::filtered("task.started"))
            .unwrap();
        assert_eq!(started.len(), 2);

        let bounded = store
            .list(&ListOptions::all().since(events[1].occurred_at).limit(2))
            .unwrap();
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded[0].id, events[1].id);

        let by_source = store
            .list(&ListOptions::filtered(EventFilter::any().with_source("cli")))
            .unwrap();
        assert!(by_source.is_empty());
    }

    #[test]
    fn malformed_and_blank_lines_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let good = DomainEvent::new("step.started");
        store.append(&good).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"\nnot json at all\n{\"id\":\"torn\",\"type\":\"st").unwrap();

        let listed = store.list(&ListOptions::all()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
    }

    #[test]
    fn append_after_torn_tail_starts_a_new_line() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let first = DomainEvent::new("plan.started");
        store.append(&first).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(b"{\"id\":\"torn\",\"ty").unwrap();
        drop(file);

        let next = DomainEvent::new("plan.succeeded");
        store.append(&next).unwrap();

        let listed = store.list(&ListOptions::all()).unwrap();
        assert_eq!(listed, vec![first, next]);
        assert!(fs::read_to_string(store.path()).unwrap().ends_with('\n'));
    }

    #[test]
    fn torn_non_utf8_tail_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = store_in(&tmp);
        let good = DomainEvent::new("task.started");
        store.append(&good).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.path()).unwrap();
        file.write_all(&[b'{', 0xE2, 0x82]).unwrap();

        let listed = store.list(&ListOptions::all()).unwrap();
        assert_eq!(listed, vec![good]);
    }

    #[test]
    fn read_errors_reach_the_caller() {
        let tmp = TempDir::new().unwrap();
        // A directory opens but cannot be read as a file.
        let store = FileEventStore::new(tmp.path());

        assert!(matches!(
            store.list(&ListOptions::all()),
            Err(StoreError::Io(_))
        ));
        assert!(store.append(&DomainEvent::new("plan.started")).is_err());
    }

    #[test]
    fn reopened_store_sees_previous_events() {
        let tmp = TempDir::new().unwrap();
        store_in(&tmp).append(&DomainEvent::new("plan.started")).unwrap();
        let reopened = store_in(&tmp);
        assert_eq!(reopened.list(&ListOptions::all()).unwrap().len(), 1);
    }

    #[test]
    fn from_config_resolves_path() {
        let config = RuntimeConfig::default();
        let store = FileEventStore::from_config(&config, Path::new("/work"));
        assert_eq!(store.path(), Path::new("/work/.xskynet/events.jsonl"));
    }
}
