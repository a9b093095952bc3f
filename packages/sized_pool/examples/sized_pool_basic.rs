//! Walks through the behavior of the `sized_pool` memory manager.
//!
//! Shows lazy pool creation, power-of-two rounding, pool exhaustion, mixed sizes and the
//! typed helpers, printing the manager statistics along the way.
//!
//! Set `RUST_LOG=sized_pool=debug` (or `trace`) to see the events emitted by the manager.
//!
//! Run with: `cargo run --example sized_pool_basic`

#![allow(
    clippy::undocumented_unsafe_blocks,
    reason = "example code keeps the focus on the API being demonstrated"
)]

use std::num::NonZero;

use sized_pool::{FixedCountStrategy, ManagedBox, PoolManager, SizeClass, size_category};
use tracing_subscriber::EnvFilter;

#[allow(dead_code, reason = "fields are only shown via Debug")]
#[derive(Debug, Default)]
struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Size-Segregated Pool Example ===\n");

    println!("1. Size categories:");
    for size in [1, 5, 10, 64, 100, 1000, 2000] {
        println!("   {size} bytes -> {} byte blocks", size_category(size));
    }
    println!();

    let manager = PoolManager::builder()
        .strategy(FixedCountStrategy::new(
            NonZero::new(8).expect("8 is not zero"),
        ))
        .build();

    println!("2. Lazy pool creation:");
    println!("   pools before first request: {}", manager.pool_count());
    let first = manager.allocate_bytes(10).expect("allocation should succeed");
    println!("   pools after a 10-byte request: {}", manager.pool_count());
    println!();

    println!("3. Exhausting the 16-byte pool (8 blocks):");
    let mut held = vec![first];
    for _ in 1..10 {
        held.push(manager.allocate_bytes(16).expect("allocation should succeed"));
    }
    let pool = manager
        .pool_stats(SizeClass::for_size(16))
        .expect("pool was created above");
    println!("   {pool}");
    println!("   fallback allocations: {}", manager.fallback_allocations());
    println!();

    println!("4. Mixed sizes:");
    for size in [24, 200, 3000, 2 * 1024 * 1024] {
        held.push(manager.allocate_bytes(size).expect("allocation should succeed"));
    }
    println!("   pools: {}", manager.pool_count());
    println!("   fallback allocations: {}", manager.fallback_allocations());
    println!();

    for ptr in held {
        let released = unsafe { manager.deallocate(ptr) };
        assert!(released);
    }

    println!("5. Typed helpers:");
    let particle = ManagedBox::new_in(
        Particle {
            position: [1.0, 2.0, 3.0],
            velocity: [0.5, 0.0, -0.5],
        },
        &manager,
    )
    .expect("allocation should succeed");
    println!("   {particle:?}");

    let particles = manager
        .construct_array::<Particle>(4)
        .expect("allocation should succeed");
    println!("   constructed an array of {} particles", particles.len());
    unsafe {
        manager.destroy_array(particles);
    }
    drop(particle);
    println!();

    println!("6. Statistics:");
    println!("{}", manager.stats());
}
