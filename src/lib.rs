//! Rider Watch
//!
//! Real-time detection-correlation pipeline for motorcycle traffic: turns
//! object detections on a live video stream into adjudicated violation events
//! (rider without a helmet, overloaded motorcycle) tied to a license plate.
//!
//! # Architecture
//!
//! - A producer thread pulls frames from a `FrameSource` into a bounded,
//!   drop-oldest `FrameChannel`, so inference always sees the freshest frame.
//! - An inference thread runs every configured detector backend and writes the
//!   frame plus its detection sets into the `SharedResultCell` as one snapshot.
//! - The correlator and the renderer read the cell independently at their own
//!   cadence. The correlator associates riders to plates/vehicles, applies the
//!   global cooldown and dispatches at most one `ViolationEvent` per tick.
//! - Each event is finalized on its own detached thread: plate recognition,
//!   persistence, notification. Failures abandon the event.
//!
//! # Module Structure
//!
//! - `frame`: `Frame`, JPEG encoding, the bounded frame channel
//! - `ingest`: frame sources (synthetic, image directory, RTSP) and the adapter
//! - `detect`: detector backends, label mapping, the detector façade
//! - `pipeline`: result cell, correlator, finalizer, renderer, controller
//! - `lpr`, `storage`, `transport`: plate recognition, violation store, notification bus
//! - `config`: file/env configuration and runtime-mutable settings

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod lpr;
pub mod pipeline;
pub mod storage;
pub mod transport;
pub mod violation;

pub use config::{PipelineConfig, RuntimeSettings, SharedSettings};
pub use detect::{
    BoundingBox, Detection, DetectionSet, DetectorBackend, DetectorFacade, LabelMap, ObjectClass,
    RawDetection, ScriptedBackend,
};
pub use frame::{encode_jpeg, Frame, FrameChannel};
pub use ingest::{open_source, FrameSource, SourceAdapter};
pub use lpr::{HttpPlateRecognizer, PlateRecognizer, StaticPlateRecognizer};
pub use pipeline::{
    Collaborators, Correlator, EventDispatcher, Finalizer, LatestFrameSink, Pipeline,
    PipelineStatus, SharedResultCell, StopReport, TickOutcome,
};
pub use storage::{InMemoryViolationStore, SqliteViolationStore, ViolationStore};
pub use transport::{BroadcastBus, MqttNotificationBus, NotificationBus, NullBus};
pub use violation::{
    EventOrigin, FineSchedule, OwnerRecord, PersistedRecord, ViolationCandidate, ViolationEvent,
    ViolationType,
};

/// URI for a private shared-cache in-memory SQLite database.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:rider_watch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}
