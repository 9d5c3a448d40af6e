//! Append-only recovery snapshot.
//!
//! When configured with a path, a background task tees the event stream
//! to disk: one text line per membership change and per event/query
//! clock advance, plus periodic clock and coordinate records. On
//! restart the file is replayed to recover the three Lamport clocks,
//! the last known alive peers (so the embedder can rejoin), and cached
//! coordinates.
//!
//! # File format
//!
//! UTF-8 text, one record per line:
//!
//! ```text
//! alive: <name> <addr>
//! not-alive: <name>
//! clock: <n>
//! event-clock: <n>
//! query-clock: <n>
//! coordinate: <name> <base64 postcard>
//! leave
//! ```
//!
//! The file is a recovery hint, not authoritative state: a mangled or
//! unknown line is logged and skipped. When the file outgrows the size
//! limit, the live state is rewritten to `<path>.compact` and renamed
//! over the original.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use murmur_coordinate::Coordinate;
use murmur_types::LamportTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::Config;
use crate::core::MurmurInner;
use crate::event::{Event, MemberEventType};
use crate::error::Result;

/// A peer recovered from the snapshot, for post-restart rejoin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousNode {
    pub name: String,
    pub addr: SocketAddr,
}

/// Everything recovered from replaying a snapshot file.
#[derive(Debug, Default)]
pub(crate) struct SnapshotReplay {
    pub(crate) alive_nodes: Vec<PreviousNode>,
    pub(crate) last_clock: LamportTime,
    pub(crate) last_event_clock: LamportTime,
    pub(crate) last_query_clock: LamportTime,
    pub(crate) coordinates: Vec<(String, Coordinate)>,
}

/// Control messages from the core into the snapshot task.
pub(crate) enum Control {
    /// Periodic clock reading.
    Clocks {
        member: LamportTime,
        event: LamportTime,
        query: LamportTime,
    },

    /// Periodic coordinate readings (own + cached peers).
    Coordinates(Vec<(String, Coordinate)>),

    /// Graceful leave: append the marker, sync, clear state, then ack.
    Leave(oneshot::Sender<()>),
}

/// Handle owned by the core.
pub(crate) struct SnapshotHandle {
    pub(crate) control_tx: mpsc::Sender<Control>,
    previous: Vec<PreviousNode>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SnapshotHandle {
    /// Peers that were alive when the snapshot was last written.
    pub(crate) fn previous_nodes(&self) -> Vec<PreviousNode> {
        self.previous.clone()
    }

    /// Records the graceful leave and waits for it to hit disk.
    pub(crate) async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.control_tx.send(Control::Leave(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Waits for the snapshot task to drain and close the file.
    pub(crate) async fn wait(&self) {
        let task = self.task.lock().expect("snapshot task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ============================================================================
// Replay
// ============================================================================

/// Replays a snapshot file. A missing file is an empty replay, not an
/// error; only I/O failures on an existing file propagate.
pub(crate) fn replay(path: &Path) -> Result<SnapshotReplay> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(SnapshotReplay::default());
        }
        Err(e) => return Err(e.into()),
    };

    let mut alive: HashMap<String, SocketAddr> = HashMap::new();
    let mut coordinates: HashMap<String, Coordinate> = HashMap::new();
    let mut out = SnapshotReplay::default();

    for line in content.lines() {
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("alive: ") {
            match rest.split_once(' ') {
                Some((name, addr)) => match addr.parse() {
                    Ok(addr) => {
                        alive.insert(name.to_string(), addr);
                    }
                    Err(_) => warn!(line, "skipping alive record with bad address"),
                },
                None => warn!(line, "skipping malformed alive record"),
            }
        } else if let Some(name) = line.strip_prefix("not-alive: ") {
            alive.remove(name);
        } else if let Some(n) = line.strip_prefix("clock: ") {
            match n.parse::<u64>() {
                Ok(n) => out.last_clock = LamportTime::new(n),
                Err(_) => warn!(line, "skipping malformed clock record"),
            }
        } else if let Some(n) = line.strip_prefix("event-clock: ") {
            match n.parse::<u64>() {
                Ok(n) => out.last_event_clock = LamportTime::new(n),
                Err(_) => warn!(line, "skipping malformed event-clock record"),
            }
        } else if let Some(n) = line.strip_prefix("query-clock: ") {
            match n.parse::<u64>() {
                Ok(n) => out.last_query_clock = LamportTime::new(n),
                Err(_) => warn!(line, "skipping malformed query-clock record"),
            }
        } else if let Some(rest) = line.strip_prefix("coordinate: ") {
            match decode_coordinate_record(rest) {
                Some((name, coordinate)) => {
                    coordinates.insert(name, coordinate);
                }
                None => warn!(line, "skipping malformed coordinate record"),
            }
        } else if line == "leave" {
            alive.clear();
            out.last_clock = LamportTime::ZERO;
            out.last_event_clock = LamportTime::ZERO;
            out.last_query_clock = LamportTime::ZERO;
        } else {
            warn!(line, "skipping unrecognized snapshot record");
        }
    }

    out.alive_nodes = alive
        .into_iter()
        .map(|(name, addr)| PreviousNode { name, addr })
        .collect();
    out.coordinates = coordinates.into_iter().collect();
    Ok(out)
}

fn decode_coordinate_record(rest: &str) -> Option<(String, Coordinate)> {
    let (name, encoded) = rest.split_once(' ')?;
    let raw = BASE64.decode(encoded).ok()?;
    let coordinate: Coordinate = postcard::from_bytes(&raw).ok()?;
    coordinate
        .is_valid()
        .then(|| (name.to_string(), coordinate))
}

// ============================================================================
// Writer Task
// ============================================================================

struct Snapshotter {
    path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    size_limit: u64,
    dirty: bool,

    alive: HashMap<String, SocketAddr>,
    last_clock: LamportTime,
    last_event_clock: LamportTime,
    last_query_clock: LamportTime,
    coordinates: HashMap<String, Coordinate>,
}

impl Snapshotter {
    fn open(path: PathBuf, size_limit: u64, replay: &SnapshotReplay) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            offset,
            size_limit,
            dirty: false,
            alive: replay
                .alive_nodes
                .iter()
                .map(|n| (n.name.clone(), n.addr))
                .collect(),
            last_clock: replay.last_clock,
            last_event_clock: replay.last_event_clock,
            last_query_clock: replay.last_query_clock,
            coordinates: replay.coordinates.iter().cloned().collect(),
            path,
        })
    }

    fn append(&mut self, line: &str) {
        if let Err(e) = writeln!(self.writer, "{line}") {
            warn!(error = %e, "snapshot append failed");
            return;
        }
        self.offset += line.len() as u64 + 1;
        self.dirty = true;

        if self.offset > self.size_limit {
            if let Err(e) = self.compact() {
                warn!(error = %e, "snapshot compaction failed");
            }
        }
    }

    fn record_event(&mut self, event: &Event) {
        match event {
            Event::Member(ev) => {
                for member in &ev.members {
                    match ev.ty {
                        MemberEventType::Join | MemberEventType::Update => {
                            self.alive.insert(member.name.clone(), member.addr);
                            self.append(&format!("alive: {} {}", member.name, member.addr));
                        }
                        MemberEventType::Leave
                        | MemberEventType::Failed
                        | MemberEventType::Reap => {
                            self.alive.remove(&member.name);
                            self.append(&format!("not-alive: {}", member.name));
                        }
                    }
                }
            }
            Event::User(user) => {
                if user.ltime > self.last_event_clock {
                    self.last_event_clock = user.ltime;
                    self.append(&format!("event-clock: {}", user.ltime));
                }
            }
            Event::Query(query) => {
                if query.ltime > self.last_query_clock {
                    self.last_query_clock = query.ltime;
                    self.append(&format!("query-clock: {}", query.ltime));
                }
            }
        }
    }

    fn record_clocks(&mut self, member: LamportTime, event: LamportTime, query: LamportTime) {
        if member > self.last_clock {
            self.last_clock = member;
            self.append(&format!("clock: {member}"));
        }
        if event > self.last_event_clock {
            self.last_event_clock = event;
            self.append(&format!("event-clock: {event}"));
        }
        if query > self.last_query_clock {
            self.last_query_clock = query;
            self.append(&format!("query-clock: {query}"));
        }
    }

    fn record_coordinates(&mut self, coordinates: Vec<(String, Coordinate)>) {
        for (name, coordinate) in coordinates {
            if self.coordinates.get(&name) == Some(&coordinate) {
                continue;
            }
            match postcard::to_allocvec(&coordinate) {
                Ok(raw) => {
                    self.append(&format!("coordinate: {} {}", name, BASE64.encode(raw)));
                    self.coordinates.insert(name, coordinate);
                }
                Err(e) => warn!(error = %e, "failed to encode coordinate record"),
            }
        }
    }

    fn record_leave(&mut self) {
        self.append("leave");
        self.sync();
        self.alive.clear();
        self.last_clock = LamportTime::ZERO;
        self.last_event_clock = LamportTime::ZERO;
        self.last_query_clock = LamportTime::ZERO;
    }

    fn sync(&mut self) {
        if !self.dirty {
            return;
        }
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "snapshot flush failed");
            return;
        }
        if let Err(e) = self.writer.get_ref().sync_data() {
            warn!(error = %e, "snapshot fsync failed");
            return;
        }
        self.dirty = false;
    }

    /// Rewrites the live state to `<path>.compact` and renames it over
    /// the log, bounding file growth.
    fn compact(&mut self) -> std::io::Result<()> {
        debug!(size = self.offset, "compacting snapshot");

        let compact_path = self.path.with_extension("compact");
        let mut offset = 0u64;
        {
            let file = File::create(&compact_path)?;
            let mut writer = BufWriter::new(file);

            let mut write_line = |line: String| -> std::io::Result<u64> {
                let len = line.len() as u64 + 1;
                writeln!(writer, "{line}")?;
                Ok(len)
            };

            for (name, addr) in &self.alive {
                offset += write_line(format!("alive: {name} {addr}"))?;
            }
            offset += write_line(format!("clock: {}", self.last_clock))?;
            offset += write_line(format!("event-clock: {}", self.last_event_clock))?;
            offset += write_line(format!("query-clock: {}", self.last_query_clock))?;
            for (name, coordinate) in &self.coordinates {
                if let Ok(raw) = postcard::to_allocvec(coordinate) {
                    offset +=
                        write_line(format!("coordinate: {} {}", name, BASE64.encode(raw)))?;
                }
            }

            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        std::fs::rename(&compact_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.offset = offset;
        self.dirty = false;
        Ok(())
    }
}

/// Opens the snapshot and spawns its writer task. Events flow from `rx`
/// to `out` with the side effect of being recorded.
pub(crate) fn start(
    path: PathBuf,
    config: &Config,
    replay: &SnapshotReplay,
    mut rx: mpsc::Receiver<Event>,
    out: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SnapshotHandle> {
    let mut snapshotter = Snapshotter::open(path, config.snapshot_size_limit, replay)?;
    let (control_tx, mut control_rx) = mpsc::channel(64);
    let fsync_interval = config.snapshot_fsync_interval;

    let task = tokio::spawn(async move {
        let mut fsync = tokio::time::interval(fsync_interval);
        fsync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(event) => {
                        snapshotter.record_event(&event);
                        if out.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(Control::Clocks { member, event, query }) => {
                        snapshotter.record_clocks(member, event, query);
                    }
                    Some(Control::Coordinates(coords)) => {
                        snapshotter.record_coordinates(coords);
                    }
                    Some(Control::Leave(ack)) => {
                        snapshotter.record_leave();
                        let _ = ack.send(());
                    }
                    None => break,
                },
                _ = fsync.tick() => snapshotter.sync(),
                _ = shutdown.changed() => break,
            }
        }

        snapshotter.sync();
    });

    Ok(SnapshotHandle {
        control_tx,
        previous: replay.alive_nodes.clone(),
        task: std::sync::Mutex::new(Some(task)),
    })
}

/// Periodically feeds clock readings and the coordinate cache into the
/// snapshot task.
pub(crate) fn spawn_clock_ticker(inner: Arc<MurmurInner>) {
    let Some(handle) = &inner.snapshot else { return };
    let control_tx = handle.control_tx.clone();
    let mut shutdown = inner.shutdown_rx();
    let interval = inner.config.snapshot_clock_interval;

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let clocks = Control::Clocks {
                        member: inner.clock.time(),
                        event: inner.event_clock.time(),
                        query: inner.query_clock.time(),
                    };
                    if control_tx.send(clocks).await.is_err() {
                        return;
                    }

                    if let Some(coord) = &inner.coord {
                        let mut coords: Vec<(String, Coordinate)> = {
                            let cache = coord
                                .cache
                                .read()
                                .expect("coordinate cache poisoned");
                            cache
                                .iter()
                                .map(|(name, c)| (name.clone(), c.clone()))
                                .collect()
                        };
                        let own = coord
                            .client
                            .lock()
                            .expect("coordinate lock poisoned")
                            .get_coordinate();
                        coords.push((inner.config.node_name.clone(), own));

                        if control_tx.send(Control::Coordinates(coords)).await.is_err() {
                            return;
                        }
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use murmur_coordinate::CoordinateConfig;

    fn write_lines(path: &Path, lines: &[&str]) {
        std::fs::write(path, lines.join("\n") + "\n").unwrap();
    }

    #[test]
    fn missing_file_is_empty_replay() {
        let dir = tempfile::tempdir().unwrap();
        let replay = replay(&dir.path().join("none.snapshot")).unwrap();
        assert!(replay.alive_nodes.is_empty());
        assert_eq!(replay.last_clock, LamportTime::ZERO);
    }

    #[test]
    fn replay_recovers_clocks_and_peers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.snapshot");
        write_lines(
            &path,
            &[
                "alive: b 127.0.0.1:7001",
                "alive: c 127.0.0.1:7002",
                "not-alive: c",
                "clock: 12",
                "event-clock: 42",
                "query-clock: 3",
            ],
        );

        let replay = replay(&path).unwrap();
        assert_eq!(replay.alive_nodes.len(), 1);
        assert_eq!(replay.alive_nodes[0].name, "b");
        assert_eq!(replay.last_clock, LamportTime::new(12));
        assert_eq!(replay.last_event_clock, LamportTime::new(42));
        assert_eq!(replay.last_query_clock, LamportTime::new(3));
    }

    #[test]
    fn leave_line_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.snapshot");
        write_lines(
            &path,
            &["alive: b 127.0.0.1:7001", "clock: 12", "leave"],
        );

        let replay = replay(&path).unwrap();
        assert!(replay.alive_nodes.is_empty());
        assert_eq!(replay.last_clock, LamportTime::ZERO);
    }

    #[test]
    fn mangled_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.snapshot");
        write_lines(
            &path,
            &[
                "alive: b 127.0.0.1:7001",
                "alive: broken",
                "clock: twelve",
                "???",
                "coordinate: x not-base64",
                "clock: 7",
            ],
        );

        let replay = replay(&path).unwrap();
        assert_eq!(replay.alive_nodes.len(), 1);
        assert_eq!(replay.last_clock, LamportTime::new(7));
        assert!(replay.coordinates.is_empty());
    }

    #[test]
    fn coordinate_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.snapshot");

        let coordinate = Coordinate::new(&CoordinateConfig::default());
        let encoded = BASE64.encode(postcard::to_allocvec(&coordinate).unwrap());
        write_lines(&path, &[&format!("coordinate: b {encoded}")]);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.coordinates.len(), 1);
        assert_eq!(replay.coordinates[0].0, "b");
        assert_eq!(replay.coordinates[0].1, coordinate);
    }

    #[test]
    fn compaction_preserves_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.snapshot");

        let mut snap = Snapshotter::open(path.clone(), 256, &SnapshotReplay::default()).unwrap();
        snap.record_clocks(
            LamportTime::new(5),
            LamportTime::new(9),
            LamportTime::ZERO,
        );
        snap.alive.insert("b".into(), "127.0.0.1:7001".parse().unwrap());

        // Blow past the size limit so every append compacts.
        for i in 0..100 {
            snap.record_clocks(
                LamportTime::new(10 + i),
                LamportTime::new(20 + i),
                LamportTime::ZERO,
            );
        }
        snap.sync();
        assert!(
            std::fs::metadata(&path).unwrap().len() <= 512,
            "file should have been compacted"
        );

        let replay = replay(&path).unwrap();
        assert_eq!(replay.last_clock, LamportTime::new(109));
        assert_eq!(replay.last_event_clock, LamportTime::new(119));
        assert_eq!(replay.alive_nodes.len(), 1);
    }
}
