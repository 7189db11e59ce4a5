//! DuckDB-backed trial logging for GridSim runs.
//!
//! [`Storage`] buffers tick summaries and per-robot snapshot rows in memory
//! and flushes them to DuckDB in batched transactions. Wire it to a world
//! either directly (it implements `WorldPersistence`) or behind
//! [`SharedStorage`] when the caller also needs query access during a run.

#[cfg(target_os = "windows")]
#[link(name = "rstrtmgr")]
extern "system" {}

use duckdb::{Connection, Transaction, params};
use gridsim_core::{PersistenceBatch, WorldPersistence};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

const DEFAULT_TICK_BUFFER: usize = 32;
const DEFAULT_ROBOT_BUFFER: usize = 1024;

/// Storage error wrapper.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Summary row written to the `ticks` table.
#[derive(Debug, Clone)]
struct TickRow {
    tick: i64,
    robot_count: i64,
    messages_delivered: i64,
    moves_committed: i64,
    moves_rejected: i64,
    tagged_cells: i64,
}

/// Robot snapshot row written to the `robots` table.
#[derive(Debug, Clone)]
struct RobotRow {
    tick: i64,
    robot_id: i64,
    x: i64,
    y: i64,
    type_tag: String,
}

/// Summary reading fetched back for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryReading {
    pub tick: i64,
    pub robot_count: i64,
    pub messages_delivered: i64,
    pub moves_committed: i64,
    pub moves_rejected: i64,
    pub tagged_cells: i64,
}

/// One recorded waypoint of a robot's trajectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrajectoryPoint {
    pub tick: i64,
    pub x: i64,
    pub y: i64,
}

#[derive(Default)]
struct StorageBuffer {
    ticks: Vec<TickRow>,
    robots: Vec<RobotRow>,
}

impl StorageBuffer {
    fn is_empty(&self) -> bool {
        self.ticks.is_empty() && self.robots.is_empty()
    }

    fn clear(&mut self) {
        self.ticks.clear();
        self.robots.clear();
    }
}

/// DuckDB-backed persistence sink with buffered writes.
pub struct Storage {
    conn: Connection,
    buffer: StorageBuffer,
    tick_flush_threshold: usize,
    robot_flush_threshold: usize,
}

impl Storage {
    /// Open or create a DuckDB database at the provided path with default
    /// buffering thresholds.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::with_thresholds(path, DEFAULT_TICK_BUFFER, DEFAULT_ROBOT_BUFFER)
    }

    /// Override flush thresholds for ticks and robot rows respectively.
    pub fn with_thresholds(path: &str, tick: usize, robot: usize) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let mut storage = Self {
            conn,
            buffer: StorageBuffer::default(),
            tick_flush_threshold: tick,
            robot_flush_threshold: robot,
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&mut self) -> Result<(), StorageError> {
        self.conn.execute(
            "create table if not exists ticks (
                tick bigint primary key,
                robot_count integer,
                messages_delivered integer,
                moves_committed integer,
                moves_rejected integer,
                tagged_cells integer
            )",
            [],
        )?;
        self.conn.execute(
            "create table if not exists robots (
                tick bigint,
                robot_id bigint,
                x integer,
                y integer,
                type_tag text,
                primary key (tick, robot_id)
            )",
            [],
        )?;
        Ok(())
    }

    /// Persist a simulation payload, buffering until thresholds are met.
    pub fn persist(&mut self, payload: &PersistenceBatch) -> Result<(), StorageError> {
        let summary = &payload.summary;
        let tick = summary.tick.0 as i64;

        self.buffer.ticks.push(TickRow {
            tick,
            robot_count: summary.robot_count as i64,
            messages_delivered: summary.messages_delivered as i64,
            moves_committed: summary.moves_committed as i64,
            moves_rejected: summary.moves_rejected as i64,
            tagged_cells: summary.tagged_cells as i64,
        });

        for robot in &payload.robots {
            self.buffer.robots.push(RobotRow {
                tick,
                robot_id: i64::from(robot.id.0),
                x: i64::from(robot.position.x),
                y: i64::from(robot.position.y),
                type_tag: robot.type_tag.as_str().to_string(),
            });
        }

        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.ticks.len() >= self.tick_flush_threshold
            || self.buffer.robots.len() >= self.robot_flush_threshold
        {
            self.flush()?;
        }
        Ok(())
    }

    fn insert_ticks(tx: &Transaction<'_>, rows: &[TickRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into ticks (
                tick, robot_count, messages_delivered,
                moves_committed, moves_rejected, tagged_cells
            ) values (?, ?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.tick,
                row.robot_count,
                row.messages_delivered,
                row.moves_committed,
                row.moves_rejected,
                row.tagged_cells,
            ])?;
        }
        Ok(())
    }

    fn insert_robots(tx: &Transaction<'_>, rows: &[RobotRow]) -> Result<(), duckdb::Error> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut stmt = tx.prepare(
            "insert or replace into robots (tick, robot_id, x, y, type_tag)
             values (?, ?, ?, ?, ?)",
        )?;
        for row in rows {
            stmt.execute(params![row.tick, row.robot_id, row.x, row.y, &row.type_tag])?;
        }
        Ok(())
    }

    /// Force flush buffered records to disk.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        Self::insert_ticks(&tx, &self.buffer.ticks)?;
        Self::insert_robots(&tx, &self.buffer.robots)?;
        tx.commit()?;
        self.buffer.clear();
        Ok(())
    }

    /// Fetch the most recent tick summaries, newest first, up to `limit`.
    pub fn latest_summaries(&mut self, limit: usize) -> Result<Vec<SummaryReading>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select tick, robot_count, messages_delivered,
                    moves_committed, moves_rejected, tagged_cells
             from ticks
             order by tick desc
             limit ?",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut readings = Vec::new();
        while let Some(row) = rows.next()? {
            readings.push(SummaryReading {
                tick: row.get(0)?,
                robot_count: row.get(1)?,
                messages_delivered: row.get(2)?,
                moves_committed: row.get(3)?,
                moves_rejected: row.get(4)?,
                tagged_cells: row.get(5)?,
            });
        }
        Ok(readings)
    }

    /// Fetch a robot's recorded positions in tick order.
    pub fn robot_trajectory(&mut self, robot_id: u32) -> Result<Vec<TrajectoryPoint>, StorageError> {
        self.flush()?;
        let mut stmt = self.conn.prepare(
            "select tick, x, y
             from robots
             where robot_id = ?
             order by tick asc",
        )?;
        let mut rows = stmt.query(params![i64::from(robot_id)])?;
        let mut points = Vec::new();
        while let Some(row) = rows.next()? {
            points.push(TrajectoryPoint {
                tick: row.get(0)?,
                x: row.get(1)?,
                y: row.get(2)?,
            });
        }
        Ok(points)
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!("failed to flush persistence buffer on drop: {err}");
        }
    }
}

impl WorldPersistence for Storage {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        if let Err(err) = self.persist(payload) {
            warn!(
                tick = payload.summary.tick.0,
                "failed to enqueue persistence data: {err}"
            );
        }
    }
}

/// Storage shared between a world's persistence hook and a querying caller.
#[derive(Clone)]
pub struct SharedStorage(Arc<Mutex<Storage>>);

impl SharedStorage {
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        Self(Arc::new(Mutex::new(storage)))
    }

    /// Run a closure against the underlying storage.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut Storage) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl WorldPersistence for SharedStorage {
    fn on_tick(&mut self, payload: &PersistenceBatch) {
        let mut guard = match self.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.on_tick(payload);
    }
}
