use arxbus_core::protocol::{
    AsyncDispatcher, BoardAddress, BusConfig, BusTransport, Command, DispatchError, Dispatcher,
    Reply,
};
use arxbus_core::sim::{SimBoard, SimulatedBus};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn setup(addresses: &[u8]) -> (SimulatedBus, AsyncDispatcher) {
    let sim = SimulatedBus::with_seed(5);
    for (i, &raw) in addresses.iter().enumerate() {
        sim.add_board(raw, SimBoard::new(i as u16 + 1));
    }
    let config = BusConfig {
        wake_idle_threshold_ms: None,
        poll_interval_ms: 1,
        response_timeout_ms: 1000,
        ..BusConfig::default()
    };
    let transport = Arc::new(BusTransport::new(Box::new(sim.clone()), config));
    (sim, AsyncDispatcher::new(Dispatcher::new(transport)))
}

fn addr(raw: u8) -> BoardAddress {
    BoardAddress::new(raw).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_dispatch() {
    let (_sim, dispatcher) = setup(&[0x81]);
    let reply = dispatcher
        .dispatch(addr(0x81), Command::Echo("async".into()))
        .await
        .unwrap();
    assert_eq!(reply, Reply::Text("async".into()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_cancel() {
    let (sim, dispatcher) = setup(&[0x81]);
    sim.set_silent(0x81, true);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let result = dispatcher
        .dispatch_with_cancel(addr(0x81), Command::GetAll, token)
        .await;
    assert!(matches!(result, Err(DispatchError::Cancelled)));
    assert!(start.elapsed() < Duration::from_millis(500));

    // The blocking side gives the bus back promptly
    sim.set_silent(0x81, false);
    let reply = dispatcher.dispatch(addr(0x81), Command::OneWireCount).await;
    assert_eq!(reply.unwrap(), Reply::Count(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatch_each_in_order() {
    let boards = [0x81, 0x82, 0x83];
    let (sim, dispatcher) = setup(&boards);
    sim.set_silent(0x82, true);

    let addresses: Vec<BoardAddress> = boards.iter().map(|&b| addr(b)).collect();
    let results = dispatcher
        .dispatch_each(&addresses, Command::BoardInfo, CancellationToken::new())
        .await;

    assert_eq!(results.len(), 3);
    assert!(matches!(results[0].1, Ok(Reply::BoardInfo(ref info)) if info.serial_number == 1));
    assert!(matches!(
        results[1].1,
        Err(DispatchError::DeviceUnreachable { .. })
    ));
    assert!(matches!(results[2].1, Ok(Reply::BoardInfo(ref info)) if info.serial_number == 3));

    let order: Vec<u8> = sim.history().iter().map(|(_, f)| f[0]).collect();
    assert_eq!(order, boards.to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_tasks_share_bus() {
    let (sim, dispatcher) = setup(&[0x81, 0x82]);

    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            let raw = if i % 2 == 0 { 0x81 } else { 0x82 };
            tokio::spawn(async move {
                dispatcher
                    .dispatch(addr(raw), Command::Echo(format!("task{}", i)))
                    .await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        let reply = task.await.unwrap().unwrap();
        assert_eq!(reply, Reply::Text(format!("task{}", i)));
    }
    assert_eq!(sim.history().len(), 8);
}
