//! Loopback echo example
//!
//! Sets up a reply-stream echo service and a client on loopback, sends a
//! few datagrams through and prints what comes back.

use udipe::{
    initialize, ConnectOptions, Direction, RecvOptions, ReplyStreamOptions, SendOptions,
    UdipeConfig, DURATION_INFINITE,
};

fn main() {
    println!("=== udipe loopback echo ===\n");

    // The echo stream occupies one worker for its whole lifetime, so a
    // second one must be free for the client-side commands
    let config = UdipeConfig::from_env();
    let workers = config.num_workers.max(2);
    let context = initialize(config.num_workers(workers));
    println!("context ready with {} worker(s)", context.num_workers());

    // Service side: requests come in here, replies go out to the client
    let service = context.connect(ConnectOptions::default()).expect("service connect");
    let client_rx = context.connect(ConnectOptions::default()).expect("client connect");
    let service_tx = context
        .connect(ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(([127, 0, 0, 1], client_rx.local_port).into()),
            ..Default::default()
        })
        .expect("service uplink connect");
    let client_tx = context
        .connect(ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(([127, 0, 0, 1], service.local_port).into()),
            ..Default::default()
        })
        .expect("client uplink connect");
    println!(
        "service on port {}, client on port {}",
        service.local_port, client_rx.local_port
    );

    // The echo loop runs on a worker thread; an empty datagram stops it
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

    for message in ["hello", "udipe", "over loopback"] {
        context
            .send(SendOptions {
                connection: client_tx.connection,
                data: message.as_bytes().to_vec(),
                timeout_ns: 0,
            })
            .expect("send");
        let reply = context
            .recv(RecvOptions {
                connection: client_rx.connection,
                max_len: 0,
                timeout_ns: 0,
            })
            .expect("recv");
        println!(
            "echoed {:>2} byte(s): {}",
            reply.data.len(),
            String::from_utf8_lossy(&reply.data)
        );
    }

    // Stop the echo stream and collect its statistics
    context
        .send(SendOptions {
            connection: client_tx.connection,
            data: Vec::new(),
            timeout_ns: 0,
        })
        .expect("send stop datagram");
    match echo.wait(DURATION_INFINITE) {
        Ok(udipe::CommandResult::ReplyStream(Ok(outcome))) => {
            println!(
                "\necho stream handled {} datagram(s), {} byte(s)",
                outcome.datagrams, outcome.bytes
            );
        }
        other => println!("echo stream ended unexpectedly: {:?}", other.is_ok()),
    }

    context.finalize();
    println!("done");
}
