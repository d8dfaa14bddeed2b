use chunkserv::chunk::StatusTable;
use chunkserv::executor::WorkerPool;
use chunkserv::generator::{SimpleGenerator, SkyLight};
use chunkserv::manager::{ChunkManager, Collaborators, ProgressLogger};
use chunkserv::storage::RegionStore;
use chunkserv::ticket::TicketRegistry;
use chunkserv::{ChunkPos, ServerConfig, World};
use std::sync::Arc;
use std::time::*;

/// Walks in a straight line, standing in for a client until there's a network layer.
struct Bot {
    pid: usize,
    position: (f64, f64),
    velocity: (f64, f64),
}
impl Bot {
    fn step(&mut self, world: &mut World) {
        if self.velocity == (0.0, 0.0) {
            return;
        }
        self.position.0 += self.velocity.0;
        self.position.1 += self.velocity.1;
        world.request_move(self.pid, self.position.0, self.position.1);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let config = match std::env::args_os().nth(1) {
        Some(path) => ServerConfig::load(std::path::Path::new(&path))?,
        None => ServerConfig::default(),
    };

    let pool = WorkerPool::new(config.worker_threads)?;
    log::info!("Starting chunk engine on {} worker threads", pool.threads());
    let table = Arc::new(StatusTable::vanilla());
    let spawn = ChunkPos::new(0, 0);
    let collaborators = Collaborators {
        store: Arc::new(RegionStore::open(config.region_dir())?),
        generator: Arc::new(SimpleGenerator::new(config.seed)),
        light: Arc::new(SkyLight),
        listener: Arc::new(ProgressLogger::new(spawn, config.spawn_chunk_radius, table.full())),
        executor: Arc::new(pool),
    };
    let manager = ChunkManager::new(table, Arc::new(TicketRegistry::vanilla()), &config, collaborators);
    let mut world = World::new(manager, &config);
    world.prepare_spawn(spawn, config.spawn_chunk_radius);

    let mut bots: Vec<Bot> = config
        .bots
        .iter()
        .map(|bot| {
            let (x, z) = (bot.start[0], bot.start[1]);
            Bot {
                pid: world.login(bot.name.clone(), x, z, bot.view_distance),
                position: (x, z),
                velocity: (bot.velocity[0], bot.velocity[1]),
            }
        })
        .collect();

    let starttime = Instant::now();
    loop {
        if config.run_ticks.map_or(false, |limit| world.next_tick() > limit) {
            break;
        }
        for bot in &mut bots {
            bot.step(&mut world);
        }

        let next_tick_due = starttime + Duration::from_millis(50 * world.next_tick());
        if let Some(wait) = next_tick_due.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        let mut time_passed_in_ticks = ((Instant::now() - starttime).as_millis() / 50) as u64;
        if let Some(limit) = config.run_ticks {
            time_passed_in_ticks = time_passed_in_ticks.min(limit);
        }
        world.tick_until(time_passed_in_ticks);
    }

    log::info!(
        "Stopping after {} ticks with {} chunks loaded",
        world.next_tick() - 1,
        world.manager().loaded_chunk_count()
    );
    world.close();
    Ok(())
}
