//! Core tick engine for the GridSim robot simulator.
//!
//! A [`World`] owns a discrete 2D grid, a collection of polymorphic robots,
//! an optional background [`Environment`] the robots can sample, a dense
//! [`TagGrid`] overlay for analysis, and a single seeded random generator.
//! Calling [`World::step`] advances the simulation by exactly one tick,
//! running the fixed pipeline: lazy init, robot control, message delivery,
//! movement resolution, commit. Two worlds built with the same seed,
//! dimensions, and registration sequence evolve bit-for-bit identically.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// High level simulation clock (ticks completed since construction).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Identity of a registered robot.
///
/// Ids are assigned sequentially by the [`World`] at registration and never
/// reused, so ascending-id order is registration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct RobotId(pub u32);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "robot#{}", self.0)
    }
}

/// A grid cell coordinate.
///
/// Coordinates are signed so that candidate moves and sample positions may
/// fall outside the grid; the world rejects those rather than wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    /// Construct a new cell coordinate.
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Cell shifted by the given deltas.
    #[must_use]
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    /// Squared Euclidean distance to another cell.
    ///
    /// Communication predicates compare against a squared radius, so the
    /// square root is never taken.
    #[must_use]
    pub fn dist_sqr(self, other: Self) -> u64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        (dx * dx + dy * dy) as u64
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An RGB color, used by the environment field and the tag overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    /// Construct a color from 8-bit channels.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Receiver-type tag used for message filtering.
///
/// A robot reports its tag via [`Robot::type_tag`]; a message carrying an
/// `rx_type` filter is only delivered to listeners whose tag matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag(Cow<'static, str>);

impl TypeTag {
    /// Tag backed by a static string (usable in associated constants).
    #[must_use]
    pub const fn from_static(tag: &'static str) -> Self {
        Self(Cow::Borrowed(tag))
    }

    /// Tag backed by an owned string.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    /// The tag text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TypeTag {
    fn default() -> Self {
        Self::from_static("robot")
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed variant type for message contents.
///
/// Contents stay within this set so that any external logging consumer can
/// serialize a message without open-ended `Any`-style payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Numeric view of the value, if it is a number.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// Text view of the value, if it is text.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    /// Boolean view of the value, if it is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Self::Map(value)
    }
}

/// Errors raised by message content mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The null message represents "nothing broadcast" and stays empty.
    #[error("cannot set contents on a null message")]
    NullMessage,
}

/// A broadcast sent by a robot during one tick.
///
/// Messages are created fresh by [`Robot::control`] each tick and discarded
/// after the communication phase of that same tick. The null message (no
/// sender, empty contents) signals "nothing broadcast" and is false in the
/// [`Message::is_null`] sense.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    sender: Option<RobotId>,
    rx_type: Option<TypeTag>,
    contents: BTreeMap<String, Value>,
}

impl Message {
    /// The null message: no sender, no filter, empty contents.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    /// An empty broadcast from `sender`, deliverable to any robot type.
    #[must_use]
    pub fn new(sender: RobotId) -> Self {
        Self {
            sender: Some(sender),
            rx_type: None,
            contents: BTreeMap::new(),
        }
    }

    /// A broadcast from `sender` carrying the given contents.
    pub fn with_contents<K, V>(sender: RobotId, contents: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            sender: Some(sender),
            rx_type: None,
            contents: contents
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Restrict delivery to listeners whose [`Robot::type_tag`] equals `rx_type`.
    #[must_use]
    pub fn with_rx_type(mut self, rx_type: TypeTag) -> Self {
        self.rx_type = Some(rx_type);
        self
    }

    /// Whether this is the null message ("nothing broadcast").
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.sender.is_none() && self.contents.is_empty()
    }

    /// Id of the sending robot, absent for the null message.
    #[must_use]
    pub fn sender(&self) -> Option<RobotId> {
        self.sender
    }

    /// Receiver-type filter, if any.
    #[must_use]
    pub fn rx_type(&self) -> Option<&TypeTag> {
        self.rx_type.as_ref()
    }

    /// Whether a listener with the given tag passes this message's filter.
    #[must_use]
    pub fn accepts(&self, listener: &TypeTag) -> bool {
        self.rx_type.as_ref().is_none_or(|wanted| wanted == listener)
    }

    /// Look up a content entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.contents.get(key)
    }

    /// Look up a content entry, falling back to `default` when absent.
    #[must_use]
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.contents.get(key).unwrap_or(default)
    }

    /// All content entries, in key order.
    #[must_use]
    pub fn contents(&self) -> &BTreeMap<String, Value> {
        &self.contents
    }

    /// Set one content entry, overwriting any existing value for the key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), MessageError> {
        if self.sender.is_none() {
            return Err(MessageError::NullMessage);
        }
        self.contents.insert(key.into(), value.into());
        Ok(())
    }

    /// Merge a batch of content entries, overwriting existing keys.
    pub fn set_all<K, V>(
        &mut self,
        entries: impl IntoIterator<Item = (K, V)>,
    ) -> Result<(), MessageError>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        if self.sender.is_none() {
            return Err(MessageError::NullMessage);
        }
        for (key, value) in entries {
            self.contents.insert(key.into(), value.into());
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("null message");
        }
        match (&self.sender, &self.rx_type) {
            (Some(sender), Some(rx_type)) => {
                write!(f, "{sender} -> {rx_type}: {:?}", self.contents)
            }
            (Some(sender), None) => write!(f, "{sender} -> *: {:?}", self.contents),
            (None, _) => write!(f, "? -> *: {:?}", self.contents),
        }
    }
}

/// Errors raised while constructing a world or its environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Grid dimensions must both be at least one cell.
    #[error("grid dimensions must be positive (got {width}x{height})")]
    NonPositiveDimensions { width: u32, height: u32 },
    /// Sampling error probability lies outside the unit interval.
    #[error("sampling error probability must lie in [0, 1] (got {0})")]
    ErrorProbability(f64),
    /// The pixel buffer does not match the declared field dimensions.
    #[error("environment pixel buffer holds {actual} colors but {width}x{height} needs {expected}")]
    PixelBufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    /// The environment bitmap could not be loaded.
    #[error("failed to load environment image {path}")]
    EnvironmentImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Errors raised when registering a robot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// Initial positions must lie inside the grid.
    #[error("initial position {position} is outside the {width}x{height} grid")]
    OutOfBounds {
        position: Cell,
        width: u32,
        height: u32,
    },
}

/// Immutable 2D color field backing a non-empty environment.
///
/// The field keeps its native resolution; sampling rescales world grid
/// coordinates into it with nearest-cell mapping, never the other way
/// around.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageField {
    width: u32,
    height: u32,
    pixels: Vec<Color>,
}

impl ImageField {
    /// Wrap a row-major pixel buffer as an environment field.
    pub fn new(width: u32, height: u32, pixels: Vec<Color>) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::NonPositiveDimensions { width, height });
        }
        let expected = (width as usize) * (height as usize);
        if pixels.len() != expected {
            return Err(ConfigError::PixelBufferSize {
                width,
                height,
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Load an RGB bitmap from disk; any alpha channel is dropped.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let bitmap = image::open(path)
            .map_err(|source| ConfigError::EnvironmentImage {
                path: path.to_path_buf(),
                source,
            })?
            .into_rgb8();
        let (width, height) = bitmap.dimensions();
        let pixels = bitmap
            .pixels()
            .map(|px| Color::new(px.0[0], px.0[1], px.0[2]))
            .collect();
        Self::new(width, height, pixels)
    }

    /// Native width of the field in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Native height of the field in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major native pixels.
    #[must_use]
    pub fn pixels(&self) -> &[Color] {
        &self.pixels
    }

    /// Native pixel lookup without rescaling.
    #[must_use]
    pub fn native_pixel(&self, x: u32, y: u32) -> Option<Color> {
        if x < self.width && y < self.height {
            Some(self.pixels[(y as usize) * (self.width as usize) + (x as usize)])
        } else {
            None
        }
    }

    /// Nearest-cell mapping of a world cell center into the native resolution.
    fn rescale(value: i32, world_extent: u32, native_extent: u32) -> u32 {
        let numerator = (2 * value as u64 + 1) * u64::from(native_extent);
        (numerator / (2 * u64::from(world_extent))) as u32
    }

    fn sample_scaled(&self, cell: Cell, world_width: u32, world_height: u32) -> Option<Color> {
        if cell.x < 0
            || cell.y < 0
            || (cell.x as u32) >= world_width
            || (cell.y as u32) >= world_height
        {
            return None;
        }
        let native_x = Self::rescale(cell.x, world_width, self.width);
        let native_y = Self::rescale(cell.y, world_height, self.height);
        self.native_pixel(native_x, native_y)
    }
}

/// Background field a world samples against.
///
/// Represented as a closed two-variant type rather than a nullable field so
/// that "is there an environment" never leaks into sampling call sites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Environment {
    /// No field; every sample returns no value.
    #[default]
    Empty,
    /// An immutable color field with its own native resolution.
    Image(ImageField),
}

impl Environment {
    /// Load an environment field from a bitmap on disk.
    pub fn from_image_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ImageField::from_path(path.as_ref()).map(Self::Image)
    }

    /// Whether this is the empty variant.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Color at a world grid cell, rescaled from the native resolution.
    ///
    /// Returns `None` for the empty environment and for any out-of-bounds
    /// cell, including negative coordinates. Never wraps.
    #[must_use]
    pub fn color_at(&self, cell: Cell, world_width: u32, world_height: u32) -> Option<Color> {
        match self {
            Self::Empty => None,
            Self::Image(field) => field.sample_scaled(cell, world_width, world_height),
        }
    }
}

/// Dense per-cell color annotation overlay.
///
/// Tags are a debugging and analysis aid; they never affect movement or
/// sampling. The representation is a dense array so an external renderer can
/// redraw the whole overlay in one pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagGrid {
    width: u32,
    height: u32,
    cells: Vec<Option<Color>>,
    tagged: usize,
}

impl TagGrid {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; (width as usize) * (height as usize)],
            tagged: 0,
        }
    }

    /// Overlay width in cells (always equal to the world width).
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Overlay height in cells (always equal to the world height).
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row-major view of every cell, for bulk redraw.
    #[must_use]
    pub fn cells(&self) -> &[Option<Color>] {
        &self.cells
    }

    /// Number of cells currently holding a color.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.tagged
    }

    /// Tag color at a cell; `None` when untagged or out of bounds.
    #[must_use]
    pub fn get(&self, cell: Cell) -> Option<Color> {
        self.index(cell).and_then(|idx| self.cells[idx])
    }

    fn index(&self, cell: Cell) -> Option<usize> {
        if cell.x >= 0
            && cell.y >= 0
            && (cell.x as u32) < self.width
            && (cell.y as u32) < self.height
        {
            Some((cell.y as usize) * (self.width as usize) + (cell.x as usize))
        } else {
            None
        }
    }

    /// Out-of-bounds writes are silently dropped; the overlay never wraps.
    fn set(&mut self, cell: Cell, color: Option<Color>) {
        let Some(idx) = self.index(cell) else {
            return;
        };
        match (self.cells[idx].is_some(), color.is_some()) {
            (false, true) => self.tagged += 1,
            (true, false) => self.tagged -= 1,
            _ => {}
        }
        self.cells[idx] = color;
    }
}

/// Probabilistic observation settings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SamplingSettings {
    /// Probability that a successful sample is replaced by a uniformly
    /// random color. Zero disables corruption entirely (and draws nothing
    /// from the RNG stream).
    pub error_probability: f64,
}

/// Static configuration for a GridSim world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Width of the grid in cells.
    pub width: u32,
    /// Height of the grid in cells.
    pub height: u32,
    /// Optional RNG seed for reproducible runs; entropy when absent.
    pub rng_seed: Option<u64>,
    /// Optional bitmap loaded as the environment field at construction.
    pub environment_path: Option<PathBuf>,
    /// Probabilistic observation settings.
    pub sampling: SamplingSettings,
    /// Ticks between persistence-hook invocations; 0 disables the hook.
    pub log_interval: u32,
    /// Maximum number of recent tick summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 50,
            height: 50,
            rng_seed: None,
            environment_path: None,
            sampling: SamplingSettings::default(),
            log_interval: 0,
            history_capacity: 256,
        }
    }
}

impl GridConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::NonPositiveDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let p = self.sampling.error_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::ErrorProbability(p));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Capability set implemented by user robot code.
///
/// The tick engine drives these operations in a fixed order; see
/// [`World::step`]. Implementations hold whatever internal state they need
/// (movement intent, communication radius, counters). Panics inside any of
/// these operations propagate to the caller of `step`; the engine performs
/// no recovery.
pub trait Robot: Send {
    /// Tag used for receiver-type filtering of messages.
    fn type_tag(&self) -> TypeTag {
        TypeTag::default()
    }

    /// One-time setup, invoked lazily by the engine on the first tick in
    /// which the robot participates (so world dimensions are observable).
    fn init(&mut self, ctx: &mut RobotCtx<'_>);

    /// Per-tick behavior: update internal intent, return the outgoing
    /// broadcast ([`Message::null`] for "nothing this tick").
    ///
    /// The context restricts world access to read-only queries, the shared
    /// RNG, environment sampling, and the tag overlay.
    fn control(&mut self, ctx: &mut RobotCtx<'_>) -> Message;

    /// Candidate target cell for this tick, given the current position.
    ///
    /// Platforms define the movement repertoire here (e.g. cardinal
    /// single-cell steps). Candidates may fall outside the grid or collide;
    /// the engine silently rejects those and keeps the robot in place.
    fn propose_move(&mut self, from: Cell) -> Cell;

    /// Whether this robot can hear a speaker at the given squared distance.
    fn comm_criteria(&self, dist_sqr: u64) -> bool;

    /// Handle a delivered message.
    fn receive_msg(&mut self, msg: &Message);

    /// Delivery report for the robot's own broadcast this tick: `true` when
    /// at least one listener received it. Default is a no-op.
    fn msg_received(&mut self, _delivered: bool) {}
}

/// Per-robot view of the world handed to [`Robot::init`] and
/// [`Robot::control`].
pub struct RobotCtx<'a> {
    id: RobotId,
    position: Cell,
    core: &'a mut WorldCore,
}

impl RobotCtx<'_> {
    /// The robot's own id.
    #[must_use]
    pub fn id(&self) -> RobotId {
        self.id
    }

    /// The robot's current grid position.
    #[must_use]
    pub fn position(&self) -> Cell {
        self.position
    }

    /// Current simulation time.
    #[must_use]
    pub fn time(&self) -> Tick {
        self.core.time
    }

    /// Grid dimensions as `(width, height)`.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.core.config.width, self.core.config.height)
    }

    /// The world's seeded generator; the only sanctioned randomness source.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.core.rng
    }

    /// Sample the environment at a cell; see [`World::sample`].
    pub fn sample(&mut self, cell: Cell) -> Option<Color> {
        self.core.sample(cell)
    }

    /// Sample and, when a color comes back, tag the cell with it.
    pub fn sample_and_tag(&mut self, cell: Cell) -> Option<Color> {
        self.core.sample_and_tag(cell)
    }

    /// Tag or clear a cell in the overlay; out-of-bounds is a no-op.
    pub fn tag(&mut self, cell: Cell, color: Option<Color>) {
        self.core.tags.set(cell, color);
    }
}

/// Read-only per-robot snapshot row exposed to external collaborators.
#[derive(Debug, Clone, Copy)]
pub struct RobotView<'a> {
    pub id: RobotId,
    pub position: Cell,
    pub type_tag: &'a TypeTag,
}

/// Owned robot snapshot forwarded to persistence sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobotSample {
    pub id: RobotId,
    pub position: Cell,
    pub type_tag: TypeTag,
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Tick counter after the commit phase.
    pub tick: Tick,
    /// Listener deliveries that succeeded this tick.
    pub messages_delivered: usize,
    /// Moves that claimed a new cell.
    pub moves_committed: usize,
    /// Moves rejected for bounds or claim conflicts.
    pub moves_rejected: usize,
    /// Whether the persistence hook fired this tick.
    pub logged: bool,
}

/// Aggregated tick statistics retained in history and handed to sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub robot_count: usize,
    pub messages_delivered: usize,
    pub moves_committed: usize,
    pub moves_rejected: usize,
    pub tagged_cells: usize,
}

/// Aggregate payload forwarded to persistence sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceBatch {
    pub summary: TickSummary,
    pub robots: Vec<RobotSample>,
}

/// Persistence sink invoked after each logged tick.
///
/// Sinks observe only committed state, by construction: the hook runs after
/// the commit phase and receives owned snapshot rows.
pub trait WorldPersistence: Send {
    fn on_tick(&mut self, batch: &PersistenceBatch);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl WorldPersistence for NullPersistence {
    fn on_tick(&mut self, _batch: &PersistenceBatch) {}
}

/// State shared between the world and robot contexts.
struct WorldCore {
    config: GridConfig,
    time: Tick,
    environment: Environment,
    tags: TagGrid,
    rng: SmallRng,
}

impl WorldCore {
    fn in_bounds(&self, cell: Cell) -> bool {
        cell.x >= 0
            && cell.y >= 0
            && (cell.x as u32) < self.config.width
            && (cell.y as u32) < self.config.height
    }

    fn sample(&mut self, cell: Cell) -> Option<Color> {
        let color = self
            .environment
            .color_at(cell, self.config.width, self.config.height)?;
        let p = self.config.sampling.error_probability;
        if p > 0.0 && self.rng.random::<f64>() < p {
            return Some(Color::new(
                self.rng.random(),
                self.rng.random(),
                self.rng.random(),
            ));
        }
        Some(color)
    }

    fn sample_and_tag(&mut self, cell: Cell) -> Option<Color> {
        let color = self.sample(cell)?;
        self.tags.set(cell, Some(color));
        Some(color)
    }
}

struct RobotSlot {
    id: RobotId,
    behavior: Box<dyn Robot>,
    record: RobotRecord,
}

/// Engine-owned per-robot bookkeeping; behaviors never see these fields.
struct RobotRecord {
    position: Cell,
    type_tag: TypeTag,
    initialized: bool,
    pending_message: Message,
}

#[derive(Debug, Default, Clone, Copy)]
struct MovementOutcome {
    committed: usize,
    rejected: usize,
}

/// The simulated grid world and its tick pipeline.
pub struct World {
    core: WorldCore,
    robots: Vec<RobotSlot>,
    persistence: Box<dyn WorldPersistence>,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.core.config)
            .field("time", &self.core.time)
            .field("robot_count", &self.robots.len())
            .field("tagged_cells", &self.core.tags.count())
            .finish()
    }
}

impl World {
    /// Instantiate a world from configuration, loading the environment from
    /// `config.environment_path` when one is set.
    pub fn new(config: GridConfig) -> Result<Self, ConfigError> {
        let environment = Self::environment_from(&config)?;
        Self::build(config, environment, Box::new(NullPersistence))
    }

    /// Instantiate a world with an explicit environment field, ignoring any
    /// `environment_path` in the configuration.
    pub fn with_environment(
        config: GridConfig,
        environment: Environment,
    ) -> Result<Self, ConfigError> {
        Self::build(config, environment, Box::new(NullPersistence))
    }

    /// Instantiate a world wired to a persistence sink.
    pub fn with_persistence(
        config: GridConfig,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, ConfigError> {
        let environment = Self::environment_from(&config)?;
        Self::build(config, environment, persistence)
    }

    fn environment_from(config: &GridConfig) -> Result<Environment, ConfigError> {
        match &config.environment_path {
            Some(path) => Environment::from_image_path(path),
            None => Ok(Environment::Empty),
        }
    }

    fn build(
        config: GridConfig,
        environment: Environment,
        persistence: Box<dyn WorldPersistence>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let tags = TagGrid::new(config.width, config.height);
        let history_capacity = config.history_capacity;
        Ok(Self {
            core: WorldCore {
                config,
                time: Tick::zero(),
                environment,
                tags,
                rng,
            },
            robots: Vec::new(),
            persistence,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Register a robot at an initial position, assigning the next id.
    ///
    /// The robot's `init` runs lazily at the start of the next tick, not
    /// here, so that late registrations behave identically to early ones.
    pub fn add_robot(
        &mut self,
        robot: Box<dyn Robot>,
        position: Cell,
    ) -> Result<RobotId, PlacementError> {
        if !self.core.in_bounds(position) {
            return Err(PlacementError::OutOfBounds {
                position,
                width: self.core.config.width,
                height: self.core.config.height,
            });
        }
        let id = RobotId(self.robots.len() as u32);
        let type_tag = robot.type_tag();
        self.robots.push(RobotSlot {
            id,
            behavior: robot,
            record: RobotRecord {
                position,
                type_tag,
                initialized: false,
                pending_message: Message::null(),
            },
        });
        Ok(id)
    }

    /// Execute one simulation tick.
    ///
    /// Phases run in fixed order — lazy init, control, communication,
    /// movement, commit — with robots processed in ascending-id order inside
    /// each phase. With zero robots registered this only advances the clock.
    pub fn step(&mut self) -> TickReport {
        self.stage_lazy_init();
        self.stage_control();
        let messages_delivered = self.stage_communication();
        let movement = self.stage_movement();
        self.core.time = self.core.time.next();
        let logged = self.stage_persistence(messages_delivered, movement);
        TickReport {
            tick: self.core.time,
            messages_delivered,
            moves_committed: movement.committed,
            moves_rejected: movement.rejected,
            logged,
        }
    }

    fn stage_lazy_init(&mut self) {
        for slot in &mut self.robots {
            if slot.record.initialized {
                continue;
            }
            let mut ctx = RobotCtx {
                id: slot.id,
                position: slot.record.position,
                core: &mut self.core,
            };
            slot.behavior.init(&mut ctx);
            slot.record.initialized = true;
        }
    }

    fn stage_control(&mut self) {
        for slot in &mut self.robots {
            let mut ctx = RobotCtx {
                id: slot.id,
                position: slot.record.position,
                core: &mut self.core,
            };
            slot.record.pending_message = slot.behavior.control(&mut ctx);
        }
    }

    /// Directional delivery sweep.
    ///
    /// A listener L hears speaker S iff L's `comm_criteria` holds for their
    /// squared distance, S broadcast a non-null message, and the message's
    /// receiver filter (if any) matches L's type tag. Only the listener's
    /// predicate is consulted, so communication is asymmetric by design of
    /// the contract: receipt in one direction implies nothing about the
    /// other.
    fn stage_communication(&mut self) -> usize {
        let speakers: Vec<(Cell, Message)> = self
            .robots
            .iter()
            .map(|slot| (slot.record.position, slot.record.pending_message.clone()))
            .collect();
        let mut delivered_any = vec![false; speakers.len()];
        let mut total = 0usize;

        for (listener_idx, slot) in self.robots.iter_mut().enumerate() {
            let listener_pos = slot.record.position;
            let listener_tag = slot.record.type_tag.clone();
            for (speaker_idx, (speaker_pos, message)) in speakers.iter().enumerate() {
                if speaker_idx == listener_idx
                    || message.is_null()
                    || !message.accepts(&listener_tag)
                {
                    continue;
                }
                if slot.behavior.comm_criteria(listener_pos.dist_sqr(*speaker_pos)) {
                    slot.behavior.receive_msg(message);
                    delivered_any[speaker_idx] = true;
                    total += 1;
                }
            }
        }

        // Report delivery outcomes to broadcasters, then discard pending
        // messages; they never survive past the communication phase.
        for (slot, delivered) in self.robots.iter_mut().zip(delivered_any) {
            let broadcast = !slot.record.pending_message.is_null();
            slot.record.pending_message = Message::null();
            if broadcast {
                slot.behavior.msg_received(delivered);
            }
        }
        total
    }

    /// Claim-based collision resolution.
    ///
    /// Each in-bounds candidate claims its target cell in ascending-id
    /// order; the first claimant wins, later claimants of the same cell stay
    /// put. A vacated cell is immediately claimable by a later robot; there
    /// is no occupancy check beyond claim uniqueness, so swaps resolve by
    /// the claim rule alone.
    fn stage_movement(&mut self) -> MovementOutcome {
        let mut claimed: HashSet<Cell> = HashSet::with_capacity(self.robots.len());
        let mut outcome = MovementOutcome::default();
        for slot in &mut self.robots {
            let current = slot.record.position;
            let target = slot.behavior.propose_move(current);
            if !self.core.in_bounds(target) {
                outcome.rejected += 1;
                continue;
            }
            if claimed.insert(target) {
                if target != current {
                    outcome.committed += 1;
                }
                slot.record.position = target;
            } else if target != current {
                outcome.rejected += 1;
            }
        }
        outcome
    }

    fn stage_persistence(&mut self, messages_delivered: usize, movement: MovementOutcome) -> bool {
        let interval = self.core.config.log_interval;
        if interval == 0 || !self.core.time.0.is_multiple_of(u64::from(interval)) {
            return false;
        }
        let summary = TickSummary {
            tick: self.core.time,
            robot_count: self.robots.len(),
            messages_delivered,
            moves_committed: movement.committed,
            moves_rejected: movement.rejected,
            tagged_cells: self.core.tags.count(),
        };
        let robots = self
            .robots
            .iter()
            .map(|slot| RobotSample {
                id: slot.id,
                position: slot.record.position,
                type_tag: slot.record.type_tag.clone(),
            })
            .collect();
        let batch = PersistenceBatch {
            summary: summary.clone(),
            robots,
        };
        self.persistence.on_tick(&batch);
        if self.core.config.history_capacity > 0 {
            if self.history.len() >= self.core.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(summary);
        }
        true
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &GridConfig {
        &self.core.config
    }

    /// Current simulation time (completed ticks).
    #[must_use]
    pub fn time(&self) -> Tick {
        self.core.time
    }

    /// Grid dimensions as `(width, height)`.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.core.config.width, self.core.config.height)
    }

    /// Number of registered robots.
    #[must_use]
    pub fn robot_count(&self) -> usize {
        self.robots.len()
    }

    /// Read-only, registration-ordered view of the robots.
    ///
    /// This is the only robot surface exposed outside the world; the
    /// internal collection is never reachable, mutably or otherwise.
    pub fn robots(&self) -> impl Iterator<Item = RobotView<'_>> + '_ {
        self.robots.iter().map(|slot| RobotView {
            id: slot.id,
            position: slot.record.position,
            type_tag: &slot.record.type_tag,
        })
    }

    /// Snapshot view of a single robot.
    #[must_use]
    pub fn robot(&self, id: RobotId) -> Option<RobotView<'_>> {
        self.robots.get(id.0 as usize).map(|slot| RobotView {
            id: slot.id,
            position: slot.record.position,
            type_tag: &slot.record.type_tag,
        })
    }

    /// The environment field.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.core.environment
    }

    /// Read-only view of the tag overlay.
    #[must_use]
    pub fn tags(&self) -> &TagGrid {
        &self.core.tags
    }

    /// Number of currently tagged cells.
    #[must_use]
    pub fn count_tags(&self) -> usize {
        self.core.tags.count()
    }

    /// Tag or clear a cell in the overlay; out-of-bounds is a no-op.
    pub fn tag(&mut self, cell: Cell, color: Option<Color>) {
        self.core.tags.set(cell, color);
    }

    /// Sample the environment at a cell.
    ///
    /// Returns `None` when the environment is empty or the cell is out of
    /// bounds in either axis. With probabilistic sampling configured, each
    /// successful lookup independently flips to a uniformly random color
    /// with the configured probability, drawn from the world RNG stream.
    pub fn sample(&mut self, cell: Cell) -> Option<Color> {
        self.core.sample(cell)
    }

    /// Sample and, when a color comes back, tag the cell with it.
    pub fn sample_and_tag(&mut self, cell: Cell) -> Option<Color> {
        self.core.sample_and_tag(cell)
    }

    /// Borrow the world RNG mutably, e.g. for deterministic placement.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.core.rng
    }

    /// Iterate over retained tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn WorldPersistence>) {
        self.persistence = persistence;
    }
}
