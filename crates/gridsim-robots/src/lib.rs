//! Ready-made robot behaviors for the GridSim engine.
//!
//! [`CardinalDrive`] is the shared movement and hearing platform: a single
//! cardinal step per tick plus a Euclidean listening radius. The concrete
//! behaviors ([`RandomWalker`], [`Hub`], [`Surveyor`]) compose it and add
//! their own control logic.

use gridsim_core::{Cell, Message, Robot, RobotCtx, RobotId, TypeTag};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// One cardinal step, or standing still.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Stay,
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// All five choices, in a fixed order usable for uniform draws.
    pub const ALL: [Self; 5] = [Self::Stay, Self::Up, Self::Down, Self::Left, Self::Right];

    /// The grid offset this step applies. Up decreases `y`.
    #[must_use]
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Self::Stay => (0, 0),
            Self::Up => (0, -1),
            Self::Down => (0, 1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
        }
    }

    /// Apply the step to a cell.
    #[must_use]
    pub const fn apply(self, from: Cell) -> Cell {
        let (dx, dy) = self.delta();
        from.offset(dx, dy)
    }
}

/// Movement and hearing platform shared by the concrete behaviors.
///
/// Holds the per-tick movement intent and the listening radius. The radius
/// is stored in cells and squared once, so the hearing predicate never takes
/// a square root.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardinalDrive {
    direction: Direction,
    comm_range_sqr: f64,
}

impl CardinalDrive {
    /// Platform with a listening radius in cells.
    #[must_use]
    pub fn new(comm_range: f64) -> Self {
        Self {
            direction: Direction::Stay,
            comm_range_sqr: comm_range * comm_range,
        }
    }

    /// Deaf platform.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(0.0)
    }

    /// Current movement intent.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Set the movement intent for the coming movement phase.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Candidate cell for the current intent.
    #[must_use]
    pub fn propose(&self, from: Cell) -> Cell {
        self.direction.apply(from)
    }

    /// Whether a speaker at the given squared distance is audible.
    #[must_use]
    pub fn in_range(&self, dist_sqr: u64) -> bool {
        dist_sqr as f64 <= self.comm_range_sqr
    }
}

/// Wanders with uniformly random cardinal steps and broadcasts a greeting.
///
/// Re-rolls its heading every `reroll_interval` ticks, so a walker drifts in
/// straight segments rather than jittering every tick.
#[derive(Debug)]
pub struct RandomWalker {
    drive: CardinalDrive,
    reroll_interval: u64,
    ticks_on_heading: u64,
    id: Option<RobotId>,
    greetings_heard: usize,
    broadcasts_delivered: usize,
}

impl RandomWalker {
    /// Walker with the given listening radius, re-rolling every tick.
    #[must_use]
    pub fn new(comm_range: f64) -> Self {
        Self::with_reroll(comm_range, 1)
    }

    /// Walker that keeps each heading for `reroll_interval` ticks.
    #[must_use]
    pub fn with_reroll(comm_range: f64, reroll_interval: u64) -> Self {
        Self {
            drive: CardinalDrive::new(comm_range),
            reroll_interval: reroll_interval.max(1),
            ticks_on_heading: 0,
            id: None,
            greetings_heard: 0,
            broadcasts_delivered: 0,
        }
    }

    /// Greetings received so far.
    #[must_use]
    pub fn greetings_heard(&self) -> usize {
        self.greetings_heard
    }

    /// Own broadcasts that reached at least one listener.
    #[must_use]
    pub fn broadcasts_delivered(&self) -> usize {
        self.broadcasts_delivered
    }
}

impl Robot for RandomWalker {
    fn type_tag(&self) -> TypeTag {
        TypeTag::from_static("walker")
    }

    fn init(&mut self, ctx: &mut RobotCtx<'_>) {
        self.id = Some(ctx.id());
        debug!(id = %ctx.id(), position = %ctx.position(), "walker initialized");
    }

    fn control(&mut self, ctx: &mut RobotCtx<'_>) -> Message {
        if self.ticks_on_heading == 0 {
            let pick = ctx.rng().random_range(0..Direction::ALL.len());
            self.drive.set_direction(Direction::ALL[pick]);
        }
        self.ticks_on_heading = (self.ticks_on_heading + 1) % self.reroll_interval;

        let id = self.id.unwrap_or_else(|| ctx.id());
        Message::with_contents(id, [("greeting", "hello")])
    }

    fn propose_move(&mut self, from: Cell) -> Cell {
        self.drive.propose(from)
    }

    fn comm_criteria(&self, dist_sqr: u64) -> bool {
        self.drive.in_range(dist_sqr)
    }

    fn receive_msg(&mut self, msg: &Message) {
        if msg.get("greeting").is_some() {
            self.greetings_heard += 1;
        }
        trace!(heard = self.greetings_heard, "walker received {msg}");
    }

    fn msg_received(&mut self, delivered: bool) {
        if delivered {
            self.broadcasts_delivered += 1;
        }
    }
}

/// Stationary wide-radius listener that tallies traffic addressed to hubs.
#[derive(Debug)]
pub struct Hub {
    drive: CardinalDrive,
    received: Vec<Message>,
}

impl Hub {
    pub const TYPE_TAG: TypeTag = TypeTag::from_static("hub");

    /// Hub listening out to the given radius.
    #[must_use]
    pub fn new(comm_range: f64) -> Self {
        Self {
            drive: CardinalDrive::new(comm_range),
            received: Vec::new(),
        }
    }

    /// Every message received so far, in arrival order.
    #[must_use]
    pub fn received(&self) -> &[Message] {
        &self.received
    }
}

impl Robot for Hub {
    fn type_tag(&self) -> TypeTag {
        Self::TYPE_TAG
    }

    fn init(&mut self, ctx: &mut RobotCtx<'_>) {
        debug!(id = %ctx.id(), position = %ctx.position(), "hub initialized");
    }

    fn control(&mut self, _ctx: &mut RobotCtx<'_>) -> Message {
        Message::null()
    }

    fn propose_move(&mut self, from: Cell) -> Cell {
        from
    }

    fn comm_criteria(&self, dist_sqr: u64) -> bool {
        self.drive.in_range(dist_sqr)
    }

    fn receive_msg(&mut self, msg: &Message) {
        trace!(total = self.received.len() + 1, "hub received {msg}");
        self.received.push(msg.clone());
    }
}

/// Sweeps the grid in a serpentine raster, tagging each sampled cell.
///
/// Moves right along even rows and left along odd rows, stepping down at the
/// ends; once the bottom row finishes, the sweep restarts from its origin.
#[derive(Debug)]
pub struct Surveyor {
    drive: CardinalDrive,
    origin: Cell,
    width: i32,
    height: i32,
}

impl Surveyor {
    /// Silent surveyor; dimensions are learned at init.
    #[must_use]
    pub fn new() -> Self {
        Self {
            drive: CardinalDrive::silent(),
            origin: Cell::default(),
            width: 0,
            height: 0,
        }
    }

    fn next_direction(&self, at: Cell) -> Direction {
        let row = at.y - self.origin.y;
        let rightward = row % 2 == 0;
        let at_edge = if rightward {
            at.x >= self.width - 1
        } else {
            at.x <= 0
        };
        if at_edge {
            if at.y >= self.height - 1 {
                // Sweep complete: fold back toward the origin column.
                if at.x > self.origin.x {
                    Direction::Left
                } else if at.x < self.origin.x {
                    Direction::Right
                } else {
                    Direction::Stay
                }
            } else {
                Direction::Down
            }
        } else if rightward {
            Direction::Right
        } else {
            Direction::Left
        }
    }
}

impl Default for Surveyor {
    fn default() -> Self {
        Self::new()
    }
}

impl Robot for Surveyor {
    fn type_tag(&self) -> TypeTag {
        TypeTag::from_static("surveyor")
    }

    fn init(&mut self, ctx: &mut RobotCtx<'_>) {
        let (width, height) = ctx.dimensions();
        self.width = width as i32;
        self.height = height as i32;
        self.origin = ctx.position();
        debug!(id = %ctx.id(), origin = %self.origin, "surveyor initialized");
    }

    fn control(&mut self, ctx: &mut RobotCtx<'_>) -> Message {
        let here = ctx.position();
        ctx.sample_and_tag(here);
        self.drive.set_direction(self.next_direction(here));
        Message::null()
    }

    fn propose_move(&mut self, from: Cell) -> Cell {
        self.drive.propose(from)
    }

    fn comm_criteria(&self, _dist_sqr: u64) -> bool {
        false
    }

    fn receive_msg(&mut self, _msg: &Message) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridsim_core::{Color, Environment, GridConfig, ImageField, World};

    fn flat_world(width: u32, height: u32, seed: u64) -> World {
        let pixels = vec![Color::new(80, 80, 80); (width * height) as usize];
        let field = ImageField::new(width, height, pixels).expect("field");
        World::with_environment(
            GridConfig {
                width,
                height,
                rng_seed: Some(seed),
                ..GridConfig::default()
            },
            Environment::Image(field),
        )
        .expect("world")
    }

    #[test]
    fn direction_deltas_cover_the_four_neighbors() {
        assert_eq!(Direction::Up.apply(Cell::new(3, 3)), Cell::new(3, 2));
        assert_eq!(Direction::Down.apply(Cell::new(3, 3)), Cell::new(3, 4));
        assert_eq!(Direction::Left.apply(Cell::new(3, 3)), Cell::new(2, 3));
        assert_eq!(Direction::Right.apply(Cell::new(3, 3)), Cell::new(4, 3));
        assert_eq!(Direction::Stay.apply(Cell::new(3, 3)), Cell::new(3, 3));
    }

    #[test]
    fn drive_compares_squared_distance_against_squared_range() {
        let drive = CardinalDrive::new(5.0);
        assert!(drive.in_range(25));
        assert!(!drive.in_range(26));
        assert!(CardinalDrive::new(5.5).in_range(30));
        assert!(!CardinalDrive::silent().in_range(1));
        assert!(CardinalDrive::silent().in_range(0));
    }

    #[test]
    fn walkers_exchange_greetings_when_adjacent() {
        let mut world = flat_world(6, 6, 11);
        world
            .add_robot(Box::new(RandomWalker::new(10.0)), Cell::new(2, 2))
            .expect("a");
        world
            .add_robot(Box::new(RandomWalker::new(10.0)), Cell::new(3, 2))
            .expect("b");
        let report = world.step();
        assert_eq!(report.messages_delivered, 2);
    }

    #[test]
    fn hub_collects_only_hub_addressed_traffic() {
        struct Reporter;
        impl Robot for Reporter {
            fn init(&mut self, _ctx: &mut RobotCtx<'_>) {}
            fn control(&mut self, ctx: &mut RobotCtx<'_>) -> Message {
                Message::with_contents(ctx.id(), [("status", "nominal")])
                    .with_rx_type(Hub::TYPE_TAG)
            }
            fn propose_move(&mut self, from: Cell) -> Cell {
                from
            }
            fn comm_criteria(&self, _dist_sqr: u64) -> bool {
                false
            }
            fn receive_msg(&mut self, _msg: &Message) {}
        }

        let mut world = flat_world(8, 8, 3);
        world
            .add_robot(Box::new(Reporter), Cell::new(1, 1))
            .expect("reporter");
        world
            .add_robot(Box::new(Hub::new(20.0)), Cell::new(4, 4))
            .expect("hub");
        world
            .add_robot(Box::new(RandomWalker::new(20.0)), Cell::new(2, 1))
            .expect("walker");

        let report = world.step();
        // Two deliveries, both to the hub: the reporter's addressed status
        // and the walker's open greeting. The walker never hears the
        // reporter because the hub filter excludes its tag.
        assert_eq!(report.messages_delivered, 2);
    }

    #[test]
    fn surveyor_serpentine_covers_a_small_grid() {
        let mut world = flat_world(3, 3, 1);
        world
            .add_robot(Box::new(Surveyor::new()), Cell::new(0, 0))
            .expect("surveyor");
        // 9 cells, one sampled per tick while traversing the serpentine.
        for _ in 0..9 {
            world.step();
        }
        assert_eq!(world.count_tags(), 9, "full coverage after one sweep");
    }

    #[test]
    fn surveyor_turns_at_row_ends() {
        let mut surveyor = Surveyor::new();
        surveyor.width = 3;
        surveyor.height = 3;
        surveyor.origin = Cell::new(0, 0);
        assert_eq!(surveyor.next_direction(Cell::new(0, 0)), Direction::Right);
        assert_eq!(surveyor.next_direction(Cell::new(2, 0)), Direction::Down);
        assert_eq!(surveyor.next_direction(Cell::new(2, 1)), Direction::Left);
        assert_eq!(surveyor.next_direction(Cell::new(0, 1)), Direction::Down);
        assert_eq!(surveyor.next_direction(Cell::new(0, 2)), Direction::Right);
    }

    #[test]
    fn walker_with_reroll_is_deterministic_per_seed() {
        let mut world = flat_world(20, 20, 17);
        world
            .add_robot(Box::new(RandomWalker::with_reroll(0.0, 5)), Cell::new(10, 10))
            .expect("walker");
        // With a 5-tick reroll the walker moves in straight segments; just
        // check determinism of the trajectory under a fixed seed.
        let mut trajectory = Vec::new();
        for _ in 0..20 {
            world.step();
            trajectory.push(world.robots().next().map(|view| view.position));
        }

        let mut replay = flat_world(20, 20, 17);
        replay
            .add_robot(Box::new(RandomWalker::with_reroll(0.0, 5)), Cell::new(10, 10))
            .expect("walker");
        let mut trajectory_b = Vec::new();
        for _ in 0..20 {
            replay.step();
            trajectory_b.push(replay.robots().next().map(|view| view.position));
        }
        assert_eq!(trajectory, trajectory_b);
    }
}
