//! Loopback round-trip latency benchmark
//!
//! Measures the full command path: client thread -> command queue ->
//! worker -> socket -> loopback -> worker -> future -> client thread.
//!
//! # Environment Variables
//!
//! - `UDIPE_BENCH_PRIORITY` - nice value applied to the measuring thread
//!   (negative values need privilege)
//! - `UDIPE_BENCH_ROUNDS` - number of measured round trips (default 2000)

use std::time::Instant;

use udipe::{
    initialize, ConnectOptions, Direction, RecvOptions, ReplyStreamOptions, SendOptions,
    UdipeConfig, DURATION_INFINITE,
};

fn apply_bench_priority() {
    let Some(nice) = bench_priority_from_env() else {
        return;
    };
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if ret != 0 {
        eprintln!(
            "warning: failed to apply UDIPE_BENCH_PRIORITY={}: {}",
            nice,
            std::io::Error::last_os_error()
        );
    }
}

fn bench_priority_from_env() -> Option<i32> {
    std::env::var("UDIPE_BENCH_PRIORITY").ok()?.parse().ok()
}

fn main() {
    println!("=== udipe round-trip benchmark ===\n");
    apply_bench_priority();

    let rounds: usize = std::env::var("UDIPE_BENCH_ROUNDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2000);

    // The echo stream occupies one worker for its whole lifetime, so a
    // second one must be free for the client-side commands
    let config = UdipeConfig::from_env();
    let workers = config.num_workers.max(2);
    let context = initialize(config.num_workers(workers));

    // Echo service plus a client pair, all on loopback
    let service = context.connect(ConnectOptions::default()).expect("connect");
    let client_rx = context.connect(ConnectOptions::default()).expect("connect");
    let service_tx = context
        .connect(ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(([127, 0, 0, 1], client_rx.local_port).into()),
            ..Default::default()
        })
        .expect("connect");
    let client_tx = context
        .connect(ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(([127, 0, 0, 1], service.local_port).into()),
            ..Default::default()
        })
        .expect("connect");

    let echo = context.start_reply_stream(ReplyStreamOptions {
        in_connection: service.connection,
        out_connection: service_tx.connection,
        replier: Box::new(|request, reply| {
            if request.is_empty() {
                return None;
            }
            reply[..request.len()].copy_from_slice(request);
            Some(request.len())
        }),
    });

    let payload = vec![0x55u8; 64];
    let mut samples_ns: Vec<u64> = Vec::with_capacity(rounds);

    // Warmup gets page faults and branch predictors out of the way
    for _ in 0..100 {
        round_trip(&context, client_tx.connection, client_rx.connection, &payload);
    }
    for _ in 0..rounds {
        let start = Instant::now();
        round_trip(&context, client_tx.connection, client_rx.connection, &payload);
        samples_ns.push(start.elapsed().as_nanos() as u64);
    }

    samples_ns.sort_unstable();
    let total: u64 = samples_ns.iter().sum();
    let at = |q: f64| samples_ns[((samples_ns.len() - 1) as f64 * q) as usize];
    println!("{} round trips of {} bytes:", rounds, payload.len());
    println!("  min    {:>9} ns", samples_ns[0]);
    println!("  p50    {:>9} ns", at(0.50));
    println!("  p90    {:>9} ns", at(0.90));
    println!("  p99    {:>9} ns", at(0.99));
    println!("  max    {:>9} ns", samples_ns[samples_ns.len() - 1]);
    println!("  mean   {:>9} ns", total / samples_ns.len() as u64);

    // Empty datagram stops the echo stream
    context
        .send(SendOptions {
            connection: client_tx.connection,
            data: Vec::new(),
            timeout_ns: 0,
        })
        .expect("send stop datagram");
    let _ = echo.wait(DURATION_INFINITE);

    context.finalize();
}

fn round_trip(
    context: &udipe::Context,
    tx: udipe::ConnectionId,
    rx: udipe::ConnectionId,
    payload: &[u8],
) {
    context
        .send(SendOptions {
            connection: tx,
            data: payload.to_vec(),
            timeout_ns: 0,
        })
        .expect("send");
    let reply = context
        .recv(RecvOptions {
            connection: rx,
            max_len: 0,
            timeout_ns: 0,
        })
        .expect("recv");
    assert_eq!(reply.data.len(), payload.len());
}
