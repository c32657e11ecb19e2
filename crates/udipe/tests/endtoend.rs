//! End-to-end scenarios over real loopback sockets

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use udipe::{
    initialize, wait_all, wait_any, BufferConfig, CommandResult, ConnectOptions, ConnectOutcome,
    Context, Direction, DisconnectOptions, RecvOptions, RecvStreamOptions, ReplyStreamOptions,
    SendOptions, SendStreamOptions, StreamControl, UdipeConfig, UdipeError, DURATION_INFINITE,
};

fn test_context(workers: usize) -> Context {
    initialize(UdipeConfig::new().num_workers(workers).pin_workers(false))
}

fn receiver(context: &Context) -> ConnectOutcome {
    context
        .connect(ConnectOptions::default())
        .expect("receive-only connect should succeed")
}

fn sender_to(context: &Context, port: u16) -> ConnectOutcome {
    context
        .connect(ConnectOptions {
            direction: Direction::Out,
            remote_address: Some(([127, 0, 0, 1], port).into()),
            ..Default::default()
        })
        .expect("send-only connect should succeed")
}

#[test]
fn loopback_echo() {
    let context = test_context(2);
    let rx = receiver(&context);
    assert_ne!(rx.local_port, 0);
    let tx = sender_to(&context, rx.local_port);

    let sent = context
        .send(SendOptions {
            connection: tx.connection,
            data: vec![0x01, 0x02, 0x03],
            timeout_ns: 0,
        })
        .unwrap();
    assert_eq!(sent.bytes_sent, 3);

    let received = context
        .recv(RecvOptions {
            connection: rx.connection,
            max_len: 0,
            timeout_ns: 0,
        })
        .unwrap();
    assert_eq!(received.data, vec![0x01, 0x02, 0x03]);

    context.finalize();
}

#[test]
fn fifo_per_producer() {
    let context = test_context(1);
    let rx = receiver(&context);
    let tx = sender_to(&context, rx.local_port);

    for i in 0..20u8 {
        context
            .send(SendOptions {
                connection: tx.connection,
                data: vec![i],
                timeout_ns: 0,
            })
            .unwrap();
    }
    for i in 0..20u8 {
        let received = context
            .recv(RecvOptions {
                connection: rx.connection,
                max_len: 0,
                timeout_ns: 0,
            })
            .unwrap();
        assert_eq!(received.data, vec![i], "datagrams reordered on loopback");
    }

    context.finalize();
}

#[test]
fn recv_timeout_bounds() {
    let context = test_context(1);
    let rx = receiver(&context);

    let start = Instant::now();
    let result = context.recv(RecvOptions {
        connection: rx.connection,
        max_len: 0,
        timeout_ns: 50_000_000,
    });
    let elapsed = start.elapsed();

    assert_eq!(result, Err(UdipeError::Timeout));
    // Slack below the nominal 50ms absorbs kernel jiffy rounding
    assert!(elapsed >= Duration::from_millis(45), "timeout fired early");
    assert!(elapsed < Duration::from_secs(1), "timeout took far too long");

    context.finalize();
}

#[test]
fn queue_backpressure_blocks_then_releases() {
    let context = test_context(1);
    let rx = receiver(&context);
    let capacity = Context::queue_capacity();

    // The worker is busy with the first recv while the ring fills up
    let mut futures = Vec::new();
    for _ in 0..=capacity {
        futures.push(context.start_recv(RecvOptions {
            connection: rx.connection,
            max_len: 0,
            timeout_ns: 20_000_000,
        }));
    }

    // The ring now holds `capacity` commands: one more producer blocks
    let (done_tx, done_rx) = mpsc::channel();
    thread::scope(|scope| {
        let producer = scope.spawn(|| {
            let future = context.start_recv(RecvOptions {
                connection: rx.connection,
                max_len: 0,
                timeout_ns: 20_000_000,
            });
            done_tx.send(()).unwrap();
            future
        });
        // Producer must still be blocked while the ring is full
        assert!(
            done_rx.recv_timeout(Duration::from_millis(5)).is_err(),
            "producer did not block on a full ring"
        );
        // One dequeue (the worker finishing its current recv) releases it
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("producer stayed blocked after space freed up");
        futures.push(producer.join().unwrap());
    });

    // Everything resolves to a timeout eventually
    let outcome = wait_all(futures, DURATION_INFINITE);
    assert!(outcome.complete);
    for result in &outcome.results {
        match result {
            CommandResult::Recv(Err(UdipeError::Timeout)) => {}
            other => panic!("expected a recv timeout, got {:?}", other.command_id()),
        }
    }

    context.finalize();
}

#[test]
fn wait_all_timeout_leaves_futures_usable() {
    let context = test_context(3);
    let mut futures = Vec::new();
    let mut connections = Vec::new();
    for _ in 0..3 {
        let rx = receiver(&context);
        futures.push(context.start_recv(RecvOptions {
            connection: rx.connection,
            max_len: 0,
            timeout_ns: 200_000_000,
        }));
        connections.push(rx.connection);
    }

    // Far shorter than the recv timeouts: nothing can have completed
    let outcome = wait_all(futures, 30_000_000);
    assert!(!outcome.complete);
    for result in &outcome.results {
        assert!(result.is_pending());
    }

    // Every future is still usable and eventually resolves
    let leftover: Vec<_> = outcome.pending.into_iter().flatten().collect();
    assert_eq!(leftover.len(), 3);
    let final_outcome = wait_all(leftover, DURATION_INFINITE);
    assert!(final_outcome.complete);
    for result in &final_outcome.results {
        match result {
            CommandResult::Recv(Err(UdipeError::Timeout)) => {}
            other => panic!("expected a recv timeout, got {:?}", other.command_id()),
        }
    }

    context.finalize();
}

#[test]
fn wait_any_returns_first_completion() {
    let context = test_context(2);
    let quiet = receiver(&context);
    let busy = receiver(&context);
    let tx = sender_to(&context, busy.local_port);

    // The datagram waits in the socket buffer before either recv starts
    context
        .send(SendOptions {
            connection: tx.connection,
            data: vec![42],
            timeout_ns: 0,
        })
        .unwrap();
    let futures = vec![
        context.start_recv(RecvOptions {
            connection: quiet.connection,
            max_len: 0,
            timeout_ns: 2_000_000_000,
        }),
        context.start_recv(RecvOptions {
            connection: busy.connection,
            max_len: 0,
            timeout_ns: 2_000_000_000,
        }),
    ];

    let outcome = wait_any(futures, DURATION_INFINITE);
    assert_eq!(outcome.positions, vec![1]);
    match &outcome.results[1] {
        CommandResult::Recv(Ok(received)) => assert_eq!(received.data, vec![42]),
        other => panic!("expected received data, got {:?}", other.command_id()),
    }

    // Drain the quiet recv before teardown
    let leftover: Vec<_> = outcome.pending.into_iter().flatten().collect();
    let drained = wait_all(leftover, DURATION_INFINITE);
    assert!(drained.complete);

    context.finalize();
}

#[test]
fn collective_connect_rollback() {
    let context = test_context(4);
    let result = context.connect(ConnectOptions {
        local_interface: Some("udipe-no-such-if0".into()),
        allow_multithreading: true,
        ..Default::default()
    });
    match result {
        Err(UdipeError::SocketError(code)) => {
            assert!(code == libc::ENODEV || code == libc::EPERM);
        }
        other => panic!("expected a socket error, got {:?}", other),
    }
    // Every slot returned to the pool, nothing left referenced
    assert_eq!(context.available_option_slots(), 32);

    context.finalize();
}

#[test]
fn configured_buffer_size_bounds_datagrams() {
    let configurator: udipe::BufferConfigurator = std::sync::Arc::new(|_worker| BufferConfig {
        buffer_size: 9216,
        buffer_count: 4,
    });
    let context = initialize(
        UdipeConfig::new()
            .num_workers(1)
            .pin_workers(false)
            .buffer_config(configurator),
    );
    let rx = receiver(&context);
    let tx = sender_to(&context, rx.local_port);

    // 9216 rounds up to 12288 with 4K pages: that much fits, more fails
    let fits = vec![0xabu8; 12288];
    let sent = context
        .send(SendOptions {
            connection: tx.connection,
            data: fits,
            timeout_ns: 0,
        })
        .unwrap();
    assert_eq!(sent.bytes_sent, 12288);

    let too_big = vec![0xcdu8; 12289];
    let result = context.send(SendOptions {
        connection: tx.connection,
        data: too_big,
        timeout_ns: 0,
    });
    assert_eq!(result.map(|_| ()), Err(UdipeError::BufferTooSmall));

    context.finalize();
}

#[test]
fn disconnect_then_commands_fail() {
    let context = test_context(1);
    let rx = receiver(&context);
    context
        .disconnect(DisconnectOptions {
            connection: rx.connection,
        })
        .unwrap();

    let result = context.recv(RecvOptions {
        connection: rx.connection,
        max_len: 0,
        timeout_ns: 0,
    });
    assert!(matches!(result, Err(UdipeError::SocketError(_))));

    // Double disconnect reports the same error class
    let result = context.disconnect(DisconnectOptions {
        connection: rx.connection,
    });
    assert!(matches!(result, Err(UdipeError::SocketError(_))));

    context.finalize();
}

#[test]
fn recv_stream_consumes_until_stop() {
    let context = test_context(2);
    let rx = receiver(&context);
    let tx = sender_to(&context, rx.local_port);

    for i in 0..5u8 {
        context
            .send(SendOptions {
                connection: tx.connection,
                data: vec![i; 8],
                timeout_ns: 0,
            })
            .unwrap();
    }

    let (seen_tx, seen_rx) = mpsc::channel();
    let mut remaining = 5u32;
    let outcome = context
        .recv_stream(RecvStreamOptions {
            connection: rx.connection,
            consumer: Box::new(move |datagram| {
                seen_tx.send(datagram.to_vec()).unwrap();
                remaining -= 1;
                if remaining == 0 {
                    StreamControl::Stop
                } else {
                    StreamControl::Continue
                }
            }),
        })
        .unwrap();

    assert_eq!(outcome.datagrams, 5);
    assert_eq!(outcome.bytes, 40);
    for i in 0..5u8 {
        assert_eq!(seen_rx.recv().unwrap(), vec![i; 8]);
    }

    context.finalize();
}

#[test]
fn send_stream_produces_datagrams() {
    let context = test_context(2);
    let rx = receiver(&context);
    let tx = sender_to(&context, rx.local_port);

    let mut left = 3u8;
    let outcome = context
        .send_stream(SendStreamOptions {
            connection: tx.connection,
            producer: Box::new(move |buffer| {
                if left == 0 {
                    return None;
                }
                left -= 1;
                buffer[..4].fill(left);
                Some(4)
            }),
        })
        .unwrap();
    assert_eq!(outcome.datagrams, 3);
    assert_eq!(outcome.bytes, 12);

    for _ in 0..3 {
        let received = context
            .recv(RecvOptions {
                connection: rx.connection,
                max_len: 0,
                timeout_ns: 0,
            })
            .unwrap();
        assert_eq!(received.data.len(), 4);
    }

    context.finalize();
}

#[test]
fn reply_stream_echoes() {
    let context = test_context(2);

    // The echo side receives requests and sends replies back
    let service = receiver(&context);
    // The client side receives replies on its own port
    let client_rx = receiver(&context);
    let service_out = sender_to(&context, client_rx.local_port);
    let client_tx = sender_to(&context, service.local_port);

    let stream = context.start_reply_stream(ReplyStreamOptions {
        in_connection: service.connection,
        out_connection: service_out.connection,
        replier: Box::new(|request, reply| {
            if request == [0xff] {
                return None;
            }
            let n = request.len();
            reply[..n].copy_from_slice(request);
            reply[..n].reverse();
            Some(n)
        }),
    });

    context
        .send(SendOptions {
            connection: client_tx.connection,
            data: vec![1, 2, 3],
            timeout_ns: 0,
        })
        .unwrap();
    let reply = context
        .recv(RecvOptions {
            connection: client_rx.connection,
            max_len: 0,
            timeout_ns: 0,
        })
        .unwrap();
    assert_eq!(reply.data, vec![3, 2, 1]);

    // Poison pill ends the stream
    context
        .send(SendOptions {
            connection: client_tx.connection,
            data: vec![0xff],
            timeout_ns: 0,
        })
        .unwrap();
    let outcome = match stream.wait(DURATION_INFINITE) {
        Ok(CommandResult::ReplyStream(Ok(outcome))) => outcome,
        other => panic!("expected a finished reply stream, got {:?}", other.is_ok()),
    };
    assert_eq!(outcome.datagrams, 1);

    context.finalize();
}
