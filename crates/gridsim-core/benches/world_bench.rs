use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use gridsim_core::{Cell, GridConfig, Message, Robot, RobotCtx, World};
use rand::Rng;
use std::time::Duration;

struct BenchBot {
    heading: (i32, i32),
    range_sqr: u64,
}

impl Robot for BenchBot {
    fn init(&mut self, _ctx: &mut RobotCtx<'_>) {}

    fn control(&mut self, ctx: &mut RobotCtx<'_>) -> Message {
        const HEADINGS: [(i32, i32); 5] = [(0, 0), (0, -1), (0, 1), (-1, 0), (1, 0)];
        self.heading = HEADINGS[ctx.rng().random_range(0..HEADINGS.len())];
        Message::with_contents(ctx.id(), [("tick", ctx.time().0 as f64)])
    }

    fn propose_move(&mut self, from: Cell) -> Cell {
        from.offset(self.heading.0, self.heading.1)
    }

    fn comm_criteria(&self, dist_sqr: u64) -> bool {
        dist_sqr <= self.range_sqr
    }

    fn receive_msg(&mut self, _msg: &Message) {}
}

fn populated_world(side: u32, robots: u32) -> World {
    let mut world = World::new(GridConfig {
        width: side,
        height: side,
        rng_seed: Some(0xBEEF),
        history_capacity: 0,
        ..GridConfig::default()
    })
    .expect("bench world");
    for i in 0..robots {
        let position = Cell::new((i % side) as i32, ((i * 7) % side) as i32);
        // Skip the rare duplicate start cell; density is what matters here.
        let occupied = world.robots().any(|view| view.position == position);
        if occupied {
            continue;
        }
        world
            .add_robot(
                Box::new(BenchBot {
                    heading: (0, 0),
                    range_sqr: 36,
                }),
                position,
            )
            .expect("placement");
    }
    world
}

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(8));
    let steps = 64usize;
    for &robots in &[16u32, 64, 256] {
        group.bench_function(format!("steps{steps}_robots{robots}"), |b| {
            b.iter_batched(
                || populated_world(128, robots),
                |mut world| {
                    for _ in 0..steps {
                        world.step();
                    }
                    world.time()
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
