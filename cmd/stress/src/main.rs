//! Command queue stress example
//!
//! Floods a single worker with asynchronous recv commands from several
//! client threads, demonstrating queue back-pressure (producers block on
//! a full ring) and the collective wait primitives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use udipe::{
    initialize, wait_all, ConnectOptions, Context, RecvOptions, UdipeConfig, DURATION_INFINITE,
};

const CLIENTS: usize = 4;
const COMMANDS_PER_CLIENT: usize = 64;

fn main() {
    println!("=== udipe queue stress ===\n");
    println!(
        "queue capacity is {} commands; {} clients submit {} each",
        Context::queue_capacity(),
        CLIENTS,
        COMMANDS_PER_CLIENT
    );

    // One worker, so every client fights over the same queue
    let context = initialize(UdipeConfig::from_env().num_workers(1));
    let rx = context.connect(ConnectOptions::default()).expect("connect");

    let submitted = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    std::thread::scope(|scope| {
        let mut clients = Vec::new();
        for client in 0..CLIENTS {
            let context = &context;
            let connection = rx.connection;
            let submitted = Arc::clone(&submitted);
            clients.push(scope.spawn(move || {
                let mut futures = Vec::with_capacity(COMMANDS_PER_CLIENT);
                for _ in 0..COMMANDS_PER_CLIENT {
                    // Each recv parks the worker for a millisecond, so
                    // the ring fills and start_recv blocks us
                    futures.push(context.start_recv(RecvOptions {
                        connection,
                        max_len: 0,
                        timeout_ns: 1_000_000,
                    }));
                    submitted.fetch_add(1, Ordering::Relaxed);
                }
                let outcome = wait_all(futures, DURATION_INFINITE);
                assert!(outcome.complete);
                println!(
                    "client {} done after {:?} ({} results)",
                    client,
                    start.elapsed(),
                    outcome.results.len()
                );
            }));
        }
        for client in clients {
            client.join().expect("client thread panicked");
        }
    });

    println!(
        "\n{} commands through one worker in {:?}",
        submitted.load(Ordering::Relaxed),
        start.elapsed()
    );
    context.finalize();
}
