//! Request multiplexer behavior over the in-memory server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use callmux::{
    service_fn, CallError, EngineError, FaultDecision, MemoryServer, Multiplexer,
    MultiplexerConfig, RandomFaults, RandomFaultsConfig, ScriptedFaults, SeededRandomProvider,
    Service,
};

use common::{init_tracing, spawn_mux, wait_until};

fn doubler() -> impl Service<Request = u32, Response = u32> {
    service_fn(|x: &u32| Ok::<_, CallError>(x * 2))
}

#[tokio::test]
async fn test_hundred_concurrent_calls() {
    init_tracing();
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()));

    // every caller is outstanding at once; each one connects when the server
    // advertises an acceptor
    let callers: Vec<_> = (0..100u32)
        .map(|i| {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                wait_until(|| server.registered_acceptors() == 1).await;
                server.submit(i).await
            })
        })
        .collect();
    for (i, caller) in callers.into_iter().enumerate() {
        let reply = caller.await.expect("join").expect("reply");
        assert_eq!(reply, Ok(i as u32 * 2));
    }

    assert_eq!(server.stats().arrivals_without_acceptor, 0);
    assert_eq!(server.stats().calls_rejected, 0);
    assert_eq!(server.stats().calls_dispatched, 100);

    let stats = running.stop().await;
    assert_eq!(stats.calls_accepted, 100);
    assert_eq!(stats.replies_sent, 100);
    assert_eq!(stats.min_accepting, Some(1));
    assert_eq!(stats.max_accepting, 1);
}

#[tokio::test]
async fn test_burst_ahead_of_the_workers_waits_in_backlog() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()));

    let replies: Vec<_> = (0..100u32).map(|i| server.submit(i)).collect();
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.await.expect("reply"), Ok(i as u32 * 2));
    }

    // nothing was registered yet when the burst landed
    assert_eq!(server.stats().arrivals_without_acceptor, 100);
    assert_eq!(server.stats().calls_rejected, 0);

    let stats = running.stop().await;
    assert_eq!(stats.calls_accepted, 100);
    assert_eq!(stats.min_accepting, Some(1));
    assert_eq!(stats.max_accepting, 1);
}

#[tokio::test(start_paused = true)]
async fn test_call_during_processing_finds_acceptor() {
    let server = Arc::new(MemoryServer::new());
    let slow =
        ScriptedFaults::new(|_: &u32| FaultDecision::none().with_delay(Duration::from_millis(50)));
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()).with_faults(slow));

    wait_until(|| server.registered_acceptors() == 1).await;
    let first = server.submit(1);

    // the replacement acceptor is registered before the first call is processed
    wait_until(|| server.in_flight() == 1 && server.registered_acceptors() == 1).await;
    let second = server.submit(2);
    assert_eq!(server.in_flight(), 2);
    assert_eq!(server.stats().arrivals_without_acceptor, 0);

    assert_eq!(first.await.expect("reply"), Ok(2));
    assert_eq!(second.await.expect("reply"), Ok(4));

    let stats = running.stop().await;
    assert_eq!(stats.min_accepting, Some(1));
    assert_eq!(stats.max_accepting, 1);
}

#[tokio::test]
async fn test_sequential_calls_never_lack_an_acceptor() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(
        Multiplexer::new(Arc::clone(&server), doubler())
            .with_config(MultiplexerConfig::default().with_workers(4)),
    );

    for i in 0..100u32 {
        wait_until(|| server.registered_acceptors() == 1).await;
        assert_eq!(server.submit(i).await.expect("reply"), Ok(i * 2));
    }

    assert_eq!(server.stats().arrivals_without_acceptor, 0);
    let stats = running.stop().await;
    assert_eq!(stats.calls_accepted, 100);
    assert_eq!(stats.min_accepting, Some(1));
    assert_eq!(stats.max_accepting, 1);
}

#[tokio::test]
async fn test_handler_lifetime_isolation() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()));

    for i in 0..20u32 {
        assert_eq!(server.submit(i).await.expect("reply"), Ok(i * 2));
    }
    let mux = Arc::clone(&running.mux);
    wait_until(|| mux.stats().replies_delivered == 20).await;

    let stats = running.stop().await;
    // one handler per call plus the acceptor left at shutdown
    assert_eq!(stats.handlers_created, 21);
    assert_eq!(stats.calls_accepted, 20);
    assert_eq!(stats.replies_sent, 20);
    assert_eq!(stats.handlers_released, 20);
    assert_eq!(stats.live_handlers, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_delivery_only_ends_that_handler() {
    let server = Arc::new(MemoryServer::new());
    let faults = ScriptedFaults::new(|request: &u32| {
        if *request == 1 {
            FaultDecision::none().with_delay(Duration::from_millis(10))
        } else {
            FaultDecision::none()
        }
    });
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()).with_faults(faults));

    wait_until(|| server.registered_acceptors() == 1).await;
    drop(server.submit(1));
    assert_eq!(server.submit(2).await.expect("reply"), Ok(4));

    let mux = Arc::clone(&running.mux);
    wait_until(|| {
        let stats = mux.stats();
        stats.failed_deliveries == 1 && stats.replies_delivered == 1
    })
    .await;

    let stats = running.stop().await;
    assert_eq!(stats.calls_accepted, 2);
    assert_eq!(stats.failed_deliveries, 1);
    assert_eq!(server.stats().replies_failed, 1);
}

#[tokio::test]
async fn test_service_failure_is_sent_as_reply() {
    let server = Arc::new(MemoryServer::new());
    let odd_missing = service_fn(|x: &u32| {
        if x % 2 == 1 {
            Err(CallError::NotFound)
        } else {
            Ok(*x)
        }
    });
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), odd_missing));

    assert_eq!(server.submit(3).await.expect("reply"), Err(CallError::NotFound));
    assert_eq!(server.submit(4).await.expect("reply"), Ok(4));

    let stats = running.stop().await;
    assert_eq!(stats.service_failures, 1);
    assert_eq!(stats.manufactured_failures, 0);
}

#[tokio::test]
async fn test_random_faults_manufacture_failures() {
    let server = Arc::new(MemoryServer::new());
    let always = RandomFaults::new(
        SeededRandomProvider::new(1),
        RandomFaultsConfig::default()
            .with_failure_probability(1.0)
            .with_max_delay(Duration::ZERO),
    );
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()).with_faults(always));

    for i in 0..5u32 {
        assert_eq!(server.submit(i).await.expect("reply"), Err(CallError::Cancelled));
    }

    let stats = running.stop().await;
    assert_eq!(stats.manufactured_failures, 5);
    assert_eq!(stats.service_failures, 0);
}

async fn seeded_run(seed: u64) -> Vec<Result<u32, CallError>> {
    let server = Arc::new(MemoryServer::new());
    let faults = RandomFaults::new(SeededRandomProvider::new(seed), RandomFaultsConfig::default());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()).with_faults(faults));

    let mut replies = Vec::new();
    for i in 0..30u32 {
        replies.push(server.submit(i).await.expect("reply"));
    }
    running.stop().await;
    replies
}

#[tokio::test(start_paused = true)]
async fn test_seeded_faults_are_reproducible() {
    let first = seeded_run(7).await;
    let second = seeded_run(7).await;
    assert_eq!(first, second);
    assert!(first.iter().any(|r| r.is_err()));
    assert!(first.iter().any(|r| r.is_ok()));
}

#[tokio::test(start_paused = true)]
async fn test_many_workers_keep_one_acceptor() {
    init_tracing();
    let server = Arc::new(MemoryServer::new());
    let faults = ScriptedFaults::new(|request: &u32| {
        FaultDecision::none().with_delay(Duration::from_millis(u64::from(request % 5) + 1))
    });
    let running = spawn_mux(
        Multiplexer::new(Arc::clone(&server), doubler())
            .with_faults(faults)
            .with_config(MultiplexerConfig::default().with_workers(4)),
    );

    let replies: Vec<_> = (0..200u32).map(|i| server.submit(i)).collect();
    for (i, reply) in replies.into_iter().enumerate() {
        assert_eq!(reply.await.expect("reply"), Ok(i as u32 * 2));
    }

    let stats = running.stop().await;
    assert_eq!(stats.calls_accepted, 200);
    assert_eq!(stats.min_accepting, Some(1));
    assert_eq!(stats.max_accepting, 1);
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()));
    wait_until(|| server.registered_acceptors() == 1).await;

    let mux = Arc::clone(&running.mux);
    let stats = running.stop().await;
    assert_eq!(stats.handlers_created, 1);
    assert!(mux.queue().is_shutdown());

    // the stale acceptor is skipped; the call waits for a server that is gone
    let _pending = server.submit(1);
    assert_eq!(server.backlog_len(), 1);
    assert_eq!(server.registered_acceptors(), 0);
}

#[tokio::test]
async fn test_closing_the_server_stops_serving() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(Multiplexer::new(Arc::clone(&server), doubler()));
    wait_until(|| server.registered_acceptors() == 1).await;

    server.close();

    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("serve returns")
        .expect("join");
    assert!(matches!(result, Err(EngineError::SubstrateClosed)));
    assert_eq!(running.mux.stats().accept_cancellations, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closing_the_server_stops_every_worker() {
    let server = Arc::new(MemoryServer::new());
    let running = spawn_mux(
        Multiplexer::new(Arc::clone(&server), doubler())
            .with_config(MultiplexerConfig::default().with_workers(4)),
    );
    wait_until(|| server.registered_acceptors() == 1).await;

    server.close();

    let result = tokio::time::timeout(Duration::from_secs(5), running.task)
        .await
        .expect("serve returns")
        .expect("join");
    assert!(matches!(result, Err(EngineError::SubstrateClosed)));
    assert_eq!(running.mux.stats().accept_cancellations, 1);
}

#[tokio::test]
async fn test_two_multiplexers_on_one_server_answer_their_own_callers() {
    let server = Arc::new(MemoryServer::new());
    let thousands = spawn_mux(Multiplexer::new(
        Arc::clone(&server),
        service_fn(|x: &u32| Ok::<_, CallError>(x + 1000)),
    ));
    let two_thousands = spawn_mux(Multiplexer::new(
        Arc::clone(&server),
        service_fn(|x: &u32| Ok::<_, CallError>(x + 2000)),
    ));
    // both hand out tag 1 to their first acceptor
    wait_until(|| server.registered_acceptors() == 2).await;

    let first = server.submit(1);
    let second = server.submit(2);

    let first = first.await.expect("reply").expect("answered");
    let second = second.await.expect("reply").expect("answered");
    assert_eq!(first % 1000, 1);
    assert_eq!(second % 1000, 2);
    assert_ne!(first / 1000, second / 1000);

    assert_eq!(thousands.stop().await.calls_accepted, 1);
    assert_eq!(two_thousands.stop().await.calls_accepted, 1);
    assert_eq!(server.stats().replies_routed, 2);
}
