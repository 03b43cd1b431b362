//! # Event Bus - Lifecycle Event Log
//!
//! Append-only log of lifecycle transitions. Every state change the managers
//! commit is followed by exactly one [`EventBus::record`] call.
//!
//! ## Reading
//!
//! ```text
//!   record() ──flock──▶ events.log (JSON lines) ──▶ LogReader ──▶ EventStream::next()
//!       │                   │ rotates at max_bytes                       │
//!       └─▶ version watch   └─▶ events.log.1                             └─ sleeps until an
//!                                                                           append or the deadline
//! ```
//!
//! Nothing is loaded at open. Readers parse the file by byte offset and
//! follow it across one rotation, so at most two generations are retained.
//!
//! A stream with an `until` in the future (or `stream = true`) waits for new
//! events instead of returning early. Appends made through this process wake
//! it at once; appends by other processes are picked up within
//! `EVENTS_POLL_INTERVAL`.
//!
//! ## Filters
//!
//! | Key              | Matches                                            |
//! |------------------|----------------------------------------------------|
//! | `event`/`status` | event status (`start`, `died`, ...)                |
//! | `type`           | subject type (`container`, `pod`, `image`, ...)    |
//! | `container`      | container events by ID, ID prefix or name          |
//! | `pod`            | pod events, and container events of that pod       |
//! | `image`          | image events, and container events of that image   |
//! | `volume`         | volume events                                      |
//! | `label`          | `key` or `key=value` in the event attributes       |
//!
//! Values of one key OR together, different keys AND together. A filter with
//! an unknown key matches nothing.

use crate::constants::{EVENTS_LOG_FILE, EVENTS_POLL_INTERVAL, EVENTS_ROTATED_FILE};
use crate::container::state::Container;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::pod::state::Pod;
use crate::store::{Filter, label_matches, parse_filters};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

// =============================================================================
// Event Types
// =============================================================================

/// Subject type of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Container,
    Pod,
    Image,
    Volume,
    Network,
    System,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Pod => "pod",
            Self::Image => "image",
            Self::Volume => "volume",
            Self::Network => "network",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Create,
    Init,
    Start,
    Stop,
    Kill,
    Pause,
    Unpause,
    Restart,
    Remove,
    Checkpoint,
    Restore,
    Clone,
    Died,
    Mount,
    Unmount,
    Commit,
    Attach,
    Cleanup,
    Import,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Init => "init",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Kill => "kill",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Restart => "restart",
            Self::Remove => "remove",
            Self::Checkpoint => "checkpoint",
            Self::Restore => "restore",
            Self::Clone => "clone",
            Self::Died => "died",
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Commit => "commit",
            Self::Attach => "attach",
            Self::Cleanup => "cleanup",
            Self::Import => "import",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub status: EventStatus,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    fn new(kind: EventType, status: EventStatus, id: &str, name: &str) -> Self {
        Self {
            time: Utc::now(),
            kind,
            status,
            id: id.to_string(),
            name: name.to_string(),
            image: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Container event carrying the container's labels and pod.
    pub fn container(status: EventStatus, container: &Container) -> Self {
        let mut event = Self::new(EventType::Container, status, &container.id, &container.name);
        event.image = Some(container.image_name.clone());
        event.attributes = container.spec.labels.clone();
        if let Some(pod_id) = &container.pod_id {
            event.attributes.insert("podId".to_string(), pod_id.clone());
        }
        event
    }

    /// Pod event.
    pub fn pod(status: EventStatus, pod: &Pod) -> Self {
        let mut event = Self::new(EventType::Pod, status, &pod.id, &pod.name);
        event.attributes = pod.spec.labels.clone();
        event
    }

    /// Image event.
    pub fn image(status: EventStatus, image: &Image) -> Self {
        let mut event = Self::new(EventType::Image, status, &image.id, &image.display_name());
        event.image = Some(image.display_name());
        event
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.insert(key.into(), value.to_string());
        self
    }

    /// One-line human rendering:
    /// `<time> <type> <status> <id> (image=..., name=..., k=v)`.
    pub fn render(&self) -> String {
        let mut attrs = Vec::with_capacity(self.attributes.len() + 2);
        if let Some(image) = &self.image {
            attrs.push(format!("image={image}"));
        }
        attrs.push(format!("name={}", self.name));
        attrs.extend(self.attributes.iter().map(|(k, v)| format!("{k}={v}")));
        format!(
            "{} {} {} {} ({})",
            self.time.format("%Y-%m-%d %H:%M:%S%.9f %z"),
            self.kind,
            self.status,
            self.id,
            attrs.join(", ")
        )
    }
}

// =============================================================================
// Filters
// =============================================================================

/// Compiled event filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    groups: BTreeMap<String, Vec<String>>,
    never: bool,
}

const EVENT_FILTER_KEYS: [&str; 8] = [
    "event",
    "status",
    "type",
    "container",
    "pod",
    "image",
    "volume",
    "label",
];

impl EventFilter {
    /// Compiles `key=value` filters.
    pub fn new(filters: &[Filter]) -> Self {
        let mut compiled = Self::default();
        for filter in filters {
            if !EVENT_FILTER_KEYS.contains(&filter.key.as_str()) {
                debug!(key = %filter.key, "unknown event filter key matches nothing");
                compiled.never = true;
                continue;
            }
            let key = if filter.key == "status" {
                "event".to_string()
            } else {
                filter.key.clone()
            };
            compiled
                .groups
                .entry(key)
                .or_default()
                .push(filter.value.clone());
        }
        compiled
    }

    /// True if `event` passes every filter group.
    pub fn matches(&self, event: &Event) -> bool {
        if self.never {
            return false;
        }
        self.groups.iter().all(|(key, values)| {
            values.iter().any(|value| match key.as_str() {
                "event" => event.status.as_str().eq_ignore_ascii_case(value),
                "type" => event.kind.as_str().eq_ignore_ascii_case(value),
                "container" => {
                    event.kind == EventType::Container && subject_matches(event, value)
                }
                "pod" => match event.kind {
                    EventType::Pod => subject_matches(event, value),
                    EventType::Container => event
                        .attributes
                        .get("podId")
                        .is_some_and(|pod_id| pod_id.starts_with(value.as_str())),
                    _ => false,
                },
                "image" => match event.kind {
                    EventType::Image => subject_matches(event, value),
                    EventType::Container => event.image.as_deref() == Some(value.as_str()),
                    _ => false,
                },
                "volume" => event.kind == EventType::Volume && subject_matches(event, value),
                "label" => label_matches(&event.attributes, value),
                _ => false,
            })
        })
    }
}

fn subject_matches(event: &Event, value: &str) -> bool {
    !value.is_empty() && (event.id.starts_with(value) || event.name == value)
}

// =============================================================================
// Time Parsing
// =============================================================================

/// Direction a relative duration is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAnchor {
    /// `--since 5m`: five minutes ago.
    Past,
    /// `--until 5s`: five seconds from now.
    Future,
}

/// Parses `--since`/`--until` values.
///
/// Accepts RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS` (UTC), Unix
/// seconds with optional fraction, and durations such as `30s` or `1h5m`.
pub fn parse_time(input: &str, now: DateTime<Utc>, anchor: TimeAnchor) -> Result<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        && let Some(t) = d.and_hms_opt(0, 0, 0)
    {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(secs) = s.parse::<f64>()
        && secs.is_finite()
        && secs >= 0.0
    {
        let whole = secs.trunc() as i64;
        let nanos = ((secs - secs.trunc()) * 1e9) as u32;
        if let Some(t) = DateTime::from_timestamp(whole, nanos) {
            return Ok(t);
        }
    }
    let duration = parse_duration(s)
        .ok_or_else(|| Error::InvalidSpec(format!("invalid time value '{input}'")))?;
    let delta = chrono::Duration::from_std(duration)
        .map_err(|_| Error::InvalidSpec(format!("time value '{input}' out of range")))?;
    let t = match anchor {
        TimeAnchor::Past => now.checked_sub_signed(delta),
        TimeAnchor::Future => now.checked_add_signed(delta),
    };
    t.ok_or_else(|| Error::InvalidSpec(format!("time value '{input}' out of range")))
}

/// Parses Go-style durations: `300ms`, `1.5h`, `2h45m`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(split);
        let value: f64 = number.parse().ok()?;
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total += value * scale;
        rest = tail;
    }
    Duration::try_from_secs_f64(total).ok()
}

// =============================================================================
// Output Formats
// =============================================================================

/// Rendering of events on the command line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventFormat {
    /// [`Event::render`].
    #[default]
    Human,
    /// One JSON document per line.
    Json,
    /// Go-style template over `{{.Time}}`, `{{.Type}}`, `{{.Status}}`,
    /// `{{.ID}}`, `{{.Name}}` and `{{.Image}}`.
    Template(Vec<Segment>),
}

/// Piece of a compiled format template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Field(EventField),
}

/// Event field a template can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventField {
    Time,
    Type,
    Status,
    Id,
    Name,
    Image,
}

impl EventField {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "Time" => Self::Time,
            "Type" => Self::Type,
            "Status" => Self::Status,
            "ID" => Self::Id,
            "Name" => Self::Name,
            "Image" => Self::Image,
            _ => return None,
        })
    }
}

impl EventFormat {
    /// Parses `--format`: `human`, `json`, or a template.
    pub fn parse(format: Option<&str>) -> Result<Self> {
        let template = match format {
            None | Some("human") => return Ok(Self::Human),
            Some("json") => return Ok(Self::Json),
            Some(template) => template,
        };
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find("}}")
                .ok_or_else(|| Error::InvalidSpec(format!("unterminated field in format '{template}'")))?;
            let name = rest[open + 2..open + close].trim();
            let field = name
                .strip_prefix('.')
                .and_then(EventField::parse)
                .ok_or_else(|| Error::InvalidSpec(format!("unknown event field '{name}'")))?;
            segments.push(Segment::Field(field));
            rest = &rest[open + close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Self::Template(segments))
    }

    /// Renders one event as a line.
    pub fn render(&self, event: &Event) -> Result<String> {
        match self {
            Self::Human => Ok(event.render()),
            Self::Json => Ok(serde_json::to_string(event)?),
            Self::Template(segments) => {
                let mut line = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => line.push_str(text),
                        Segment::Field(EventField::Time) => line.push_str(&event.time.to_rfc3339()),
                        Segment::Field(EventField::Type) => line.push_str(event.kind.as_str()),
                        Segment::Field(EventField::Status) => line.push_str(event.status.as_str()),
                        Segment::Field(EventField::Id) => line.push_str(&event.id),
                        Segment::Field(EventField::Name) => line.push_str(&event.name),
                        Segment::Field(EventField::Image) => {
                            line.push_str(event.image.as_deref().unwrap_or_default())
                        }
                    }
                }
                Ok(line)
            }
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

enum Backing {
    Memory(RwLock<Vec<Event>>),
    File(LogFiles),
}

struct Log {
    backing: Backing,
    version: watch::Sender<u64>,
}

/// Shared, cheaply clonable handle to the event log.
#[derive(Clone)]
pub struct EventBus {
    log: Arc<Log>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl EventBus {
    /// Bus without persistence.
    pub fn in_memory() -> Self {
        Self::with_backing(Backing::Memory(RwLock::new(Vec::new())))
    }

    /// Bus persisted as JSON lines in `<dir>/events.log`.
    ///
    /// Nothing is read at open; readers parse the file as they go. The live
    /// file rotates to `events.log.1` once it reaches `max_bytes`.
    pub fn open(dir: &Path, max_bytes: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self::with_backing(Backing::File(LogFiles {
            current: dir.join(EVENTS_LOG_FILE),
            rotated: dir.join(EVENTS_ROTATED_FILE),
            max_bytes,
        })))
    }

    fn with_backing(backing: Backing) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            log: Arc::new(Log { backing, version }),
        }
    }

    /// Appends an event. Timestamps never go backwards.
    pub fn record(&self, mut event: Event) {
        match &self.log.backing {
            Backing::Memory(events) => {
                let Ok(mut events) = events.write() else {
                    warn!("event log lock poisoned, dropping event");
                    return;
                };
                if let Some(last) = events.last()
                    && event.time < last.time
                {
                    event.time = last.time;
                }
                debug!(event = %event.status, subject = %event.id, "recorded event");
                events.push(event);
            }
            Backing::File(files) => {
                if let Err(e) = files.append(&mut event) {
                    warn!(path = %files.current.display(), error = %e, "failed to persist event");
                    return;
                }
                debug!(event = %event.status, subject = %event.id, "recorded event");
            }
        }
        self.log.version.send_modify(|v| *v += 1);
    }

    /// Snapshot of every retained event, oldest first.
    pub fn all(&self) -> Vec<Event> {
        match &self.log.backing {
            Backing::Memory(events) => events.read().map(|e| e.clone()).unwrap_or_default(),
            Backing::File(files) => LogReader::new(files.clone())
                .read_new()
                .unwrap_or_else(|e| {
                    warn!(path = %files.current.display(), error = %e, "failed to read event log");
                    Vec::new()
                }),
        }
    }

    /// Receiver that changes on every append made through this process.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.log.version.subscribe()
    }

    /// Opens a stream over the log.
    pub fn stream(&self, query: EventQuery) -> EventStream {
        let follow = query.stream || query.until.is_some_and(|u| u > Utc::now());
        let source = match &self.log.backing {
            Backing::Memory(_) => Source::Memory { cursor: 0 },
            Backing::File(files) => Source::File {
                reader: LogReader::new(files.clone()),
                pending: VecDeque::new(),
            },
        };
        EventStream {
            log: Arc::clone(&self.log),
            rx: self.log.version.subscribe(),
            source,
            filter: EventFilter::new(&query.filters),
            since: query.since,
            until: query.until,
            follow,
        }
    }

    /// Collects a finite query.
    ///
    /// Blocks until `until` when it lies in the future. A stream without
    /// `until` never ends, so it is rejected here.
    pub async fn query(&self, query: EventQuery) -> Result<Vec<Event>> {
        if query.stream && query.until.is_none() {
            return Err(Error::InvalidSpec(
                "an unbounded event stream cannot be collected".to_string(),
            ));
        }
        let mut stream = self.stream(query);
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            out.push(event);
        }
        Ok(out)
    }
}

// =============================================================================
// Log Files
// =============================================================================

/// Bytes read from the end of the log to find the previous timestamp.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Live and rotated log paths.
#[derive(Debug, Clone)]
struct LogFiles {
    current: PathBuf,
    rotated: PathBuf,
    max_bytes: u64,
}

impl LogFiles {
    /// Appends one line under an exclusive `flock`, so writers in other
    /// processes interleave whole lines in timestamp order.
    fn append(&self, event: &mut Event) -> Result<()> {
        let mut file = self.open_locked()?;
        let last = match last_event_time(&mut file)? {
            Some(time) => Some(time),
            None => match File::open(&self.rotated) {
                Ok(mut rotated) => last_event_time(&mut rotated)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            },
        };
        if let Some(last) = last
            && event.time < last
        {
            event.time = last;
        }

        if self.max_bytes > 0 && file.metadata()?.len() >= self.max_bytes {
            std::fs::rename(&self.current, &self.rotated)?;
            debug!(path = %self.rotated.display(), "rotated event log");
            file = self.open_locked()?;
        }

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Opens the live file and locks it. A writer that waited on a file
    /// which was rotated away in the meantime reopens the new one.
    fn open_locked(&self) -> Result<File> {
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&self.current)?;
            lock_exclusive(&file)?;
            match std::fs::metadata(&self.current) {
                Ok(meta) if file_id(&meta) == file_id(&file.metadata()?) => return Ok(file),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Timestamp of the last complete event in `file`.
fn last_event_time(file: &mut File) -> Result<Option<DateTime<Utc>>> {
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(TAIL_WINDOW)))?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail)?;
    Ok(tail
        .split(|b| *b == b'\n')
        .rev()
        .find_map(|line| serde_json::from_slice::<Event>(line).ok())
        .map(|event| event.time))
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_id(meta: &std::fs::Metadata) -> (u64, u64) {
    (meta.len(), 0)
}

/// Incremental reader that follows the live file across rotations.
struct LogReader {
    files: LogFiles,
    /// File identity and byte offset of the next unread line.
    position: Option<((u64, u64), u64)>,
}

impl LogReader {
    fn new(files: LogFiles) -> Self {
        Self {
            files,
            position: None,
        }
    }

    /// Events appended since the previous call. The first call also
    /// returns the rotated generation.
    fn read_new(&mut self) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let mut file = match File::open(&self.files.current) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e.into()),
        };
        let id = file_id(&file.metadata()?);
        let offset = match self.position {
            Some((seen, offset)) if seen == id => offset,
            Some((seen, offset)) => {
                // Rotated since the last read: drain the old generation.
                if let Ok(mut old) = File::open(&self.files.rotated)
                    && file_id(&old.metadata()?) == seen
                {
                    read_lines(&mut old, offset, &mut events)?;
                }
                0
            }
            None => {
                if let Ok(mut old) = File::open(&self.files.rotated) {
                    read_lines(&mut old, 0, &mut events)?;
                }
                0
            }
        };
        let consumed = read_lines(&mut file, offset, &mut events)?;
        self.position = Some((id, offset + consumed));
        Ok(events)
    }
}

/// Parses the complete lines after `offset`. Returns the bytes consumed;
/// a trailing partial line is left for the next read.
fn read_lines(file: &mut File, offset: u64, out: &mut Vec<Event>) -> Result<u64> {
    file.seek(SeekFrom::Start(offset))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    let Some(end) = data.iter().rposition(|b| *b == b'\n') else {
        return Ok(0);
    };
    for line in data[..end].split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Event>(line) {
            Ok(event) => out.push(event),
            Err(e) => warn!(error = %e, "skipping malformed event"),
        }
    }
    Ok(end as u64 + 1)
}

// =============================================================================
// Queries
// =============================================================================

/// Parameters of an events query.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub filters: Vec<Filter>,
    /// Keep waiting for new events.
    pub stream: bool,
}

impl EventQuery {
    /// Builds a query from command-line values.
    pub fn parse(
        since: Option<&str>,
        until: Option<&str>,
        filters: &[String],
        stream: bool,
    ) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            since: since
                .map(|s| parse_time(s, now, TimeAnchor::Past))
                .transpose()?,
            until: until
                .map(|s| parse_time(s, now, TimeAnchor::Future))
                .transpose()?,
            filters: parse_filters(filters)?,
            stream,
        })
    }
}

enum Source {
    Memory { cursor: usize },
    File {
        reader: LogReader,
        pending: VecDeque<Event>,
    },
}

/// Lazy, time-ordered reader over the event log.
pub struct EventStream {
    log: Arc<Log>,
    rx: watch::Receiver<u64>,
    source: Source,
    filter: EventFilter,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    follow: bool,
}

impl EventStream {
    /// Next matching event, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            // Mark the current version seen before reading, so an append
            // racing with the read still wakes the wait below.
            let _ = self.rx.borrow_and_update();
            if let Some(event) = self.scan() {
                return event;
            }
            if !self.follow {
                return None;
            }

            // Appends from other processes only show up in the file.
            let polls = matches!(self.source, Source::File { .. });
            let rx = &mut self.rx;
            let wake = async move {
                if polls {
                    tokio::select! {
                        changed = rx.changed() => changed.is_ok(),
                        () = tokio::time::sleep(EVENTS_POLL_INTERVAL) => true,
                    }
                } else {
                    rx.changed().await.is_ok()
                }
            };
            let woke = match self.until {
                Some(until) => match (until - Utc::now()).to_std() {
                    Ok(remaining) => tokio::time::timeout(remaining, wake)
                        .await
                        .unwrap_or(false),
                    Err(_) => false,
                },
                None => wake.await,
            };
            if !woke {
                // One last scan picks up anything appended before the deadline.
                self.follow = false;
            }
        }
    }

    /// Returns `Some(result)` when the scan decided, `None` when it reached
    /// the end of the log.
    fn scan(&mut self) -> Option<Option<Event>> {
        while let Some(event) = self.next_raw() {
            if self.since.is_some_and(|since| event.time < since) {
                continue;
            }
            if self.until.is_some_and(|until| event.time > until) {
                return Some(None);
            }
            if self.filter.matches(&event) {
                return Some(Some(event));
            }
        }
        None
    }

    fn next_raw(&mut self) -> Option<Event> {
        match &mut self.source {
            Source::Memory { cursor } => {
                let Backing::Memory(events) = &self.log.backing else {
                    return None;
                };
                let event = events.read().ok()?.get(*cursor).cloned()?;
                *cursor += 1;
                Some(event)
            }
            Source::File { reader, pending } => {
                if pending.is_empty() {
                    match reader.read_new() {
                        Ok(events) => pending.extend(events),
                        Err(e) => warn!(error = %e, "failed to read event log"),
                    }
                }
                pending.pop_front()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_EVENTS_LOG_MAX_BYTES;
    use tempfile::TempDir;

    fn event(kind: EventType, status: EventStatus, id: &str, name: &str) -> Event {
        Event::new(kind, status, id, name)
    }

    #[test]
    fn test_filter_same_key_or_different_key_and() {
        let start = event(EventType::Container, EventStatus::Start, "abc123", "web");
        let stop = event(EventType::Container, EventStatus::Stop, "abc123", "web");
        let pod_start = event(EventType::Pod, EventStatus::Start, "def456", "p1");

        let f = EventFilter::new(&parse_filters(&["event=start", "event=stop"]).unwrap());
        assert!(f.matches(&start) && f.matches(&stop) && f.matches(&pod_start));

        let f = EventFilter::new(&parse_filters(&["event=start", "type=container"]).unwrap());
        assert!(f.matches(&start));
        assert!(!f.matches(&stop));
        assert!(!f.matches(&pod_start));

        let f = EventFilter::new(&parse_filters(&["container=abc"]).unwrap());
        assert!(f.matches(&start));
        let f = EventFilter::new(&parse_filters(&["container=web"]).unwrap());
        assert!(f.matches(&stop));
    }

    #[test]
    fn test_unknown_filter_key_matches_nothing() {
        let f = EventFilter::new(&parse_filters(&["colour=red"]).unwrap());
        assert!(!f.matches(&event(EventType::Container, EventStatus::Start, "a", "b")));
    }

    #[test]
    fn test_parse_time_forms() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(
            parse_time("2024-05-01T10:00:00Z", now, TimeAnchor::Past).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("2024-04-30", now, TimeAnchor::Past).unwrap(),
            Utc.with_ymd_and_hms(2024, 4, 30, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time("1714564800", now, TimeAnchor::Past).unwrap(),
            now
        );
        assert_eq!(
            parse_time("1h5m", now, TimeAnchor::Past).unwrap(),
            now - chrono::Duration::minutes(65)
        );
        assert_eq!(
            parse_time("5s", now, TimeAnchor::Future).unwrap(),
            now + chrono::Duration::seconds(5)
        );
        assert!(parse_time("yesterday", now, TimeAnchor::Past).is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("2h45m"), Some(Duration::from_secs(9900)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("5x"), None);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let bus = EventBus::in_memory();
        let mut late = event(EventType::Container, EventStatus::Start, "a", "a");
        late.time = Utc::now() + chrono::Duration::seconds(60);
        bus.record(late.clone());
        bus.record(event(EventType::Container, EventStatus::Stop, "a", "a"));
        let all = bus.all();
        assert_eq!(all[1].time, late.time);
    }

    #[tokio::test]
    async fn test_query_past_window() {
        let bus = EventBus::in_memory();
        bus.record(event(EventType::Container, EventStatus::Start, "a", "a"));
        bus.record(event(EventType::Pod, EventStatus::Create, "b", "b"));
        let events = bus
            .query(EventQuery {
                filters: parse_filters(&["type=pod"]).unwrap(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "b");
    }

    #[tokio::test]
    async fn test_until_in_future_waits_for_new_events() {
        let bus = EventBus::in_memory();
        let writer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.record(event(EventType::Container, EventStatus::Died, "x", "x"));
        });

        let started = std::time::Instant::now();
        let events = bus
            .query(EventQuery {
                until: Some(Utc::now() + chrono::Duration::milliseconds(400)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, EventStatus::Died);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn test_persisted_log_reloads() {
        let temp = TempDir::new().unwrap();
        {
            let bus = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
            bus.record(event(EventType::Pod, EventStatus::Create, "p", "p"));
        }
        let bus = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
        assert_eq!(bus.all().len(), 1);
    }

    #[test]
    fn test_rotation_caps_retained_events() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::open(temp.path(), 200).unwrap();
        for i in 0..10 {
            let id = format!("e{i}");
            bus.record(event(EventType::Container, EventStatus::Start, &id, &id));
        }

        assert!(temp.path().join(EVENTS_ROTATED_FILE).exists());
        let live = std::fs::metadata(temp.path().join(EVENTS_LOG_FILE)).unwrap();
        assert!(live.len() < 400);

        let all = bus.all();
        assert!(!all.is_empty() && all.len() < 10);
        assert_eq!(all.last().unwrap().id, "e9");
        assert!(all.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn test_timestamps_never_decrease_across_writers() {
        let temp = TempDir::new().unwrap();
        let first = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
        let second = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
        let mut late = event(EventType::Container, EventStatus::Start, "a", "a");
        late.time = Utc::now() + chrono::Duration::seconds(60);
        first.record(late.clone());
        second.record(event(EventType::Container, EventStatus::Stop, "a", "a"));

        let all = first.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].time, late.time);
    }

    #[tokio::test]
    async fn test_until_in_future_sees_other_writers() {
        let temp = TempDir::new().unwrap();
        let reader = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
        let writer = EventBus::open(temp.path(), DEFAULT_EVENTS_LOG_MAX_BYTES).unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.record(event(EventType::Container, EventStatus::Died, "x", "x"));
        });

        let events = reader
            .query(EventQuery {
                until: Some(Utc::now() + chrono::Duration::milliseconds(600)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "x");
    }

    #[tokio::test]
    async fn test_stream_follows_rotation() {
        let temp = TempDir::new().unwrap();
        let bus = EventBus::open(temp.path(), 150).unwrap();
        let writer = bus.clone();
        tokio::spawn(async move {
            for i in 0..6 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let id = format!("e{i}");
                writer.record(event(EventType::Container, EventStatus::Start, &id, &id));
            }
        });

        let mut stream = bus.stream(EventQuery {
            stream: true,
            ..Default::default()
        });
        let mut seen = Vec::new();
        while seen.len() < 6 {
            let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(next.id);
        }
        assert_eq!(seen, ["e0", "e1", "e2", "e3", "e4", "e5"]);
    }

    #[test]
    fn test_format_template() {
        let e = event(EventType::Pod, EventStatus::Start, "abc", "p1");
        let format = EventFormat::parse(Some("{{.Status}} {{ .Type }}:{{.Name}}")).unwrap();
        assert_eq!(format.render(&e).unwrap(), "start pod:p1");
        assert_eq!(EventFormat::parse(Some("json")).unwrap(), EventFormat::Json);
        assert_eq!(EventFormat::parse(None).unwrap(), EventFormat::Human);
        assert!(EventFormat::parse(Some("{{.Colour}}")).is_err());
        assert!(EventFormat::parse(Some("{{.ID")).is_err());
    }

    #[test]
    fn test_render() {
        let e = event(EventType::Container, EventStatus::Start, "abc", "web")
            .with_attribute("podId", "p1");
        let line = e.render();
        assert!(line.contains(" container start abc (name=web, podId=p1)"));
    }
}
