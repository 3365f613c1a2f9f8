use arxbus_core::board::BoardSession;
use arxbus_core::channel::ChannelConfig;
use arxbus_core::protocol::{
    BoardAddress, BusConfig, BusTransport, Command, DispatchError, Dispatcher, FailureReason,
    MemorySlot, Opcode,
};
use arxbus_core::scaling::{CurrentCalibration, InputCoupling};
use arxbus_core::sim::{SimBoard, SimSensor, SimulatedBus};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const BOARD: u8 = 0x9F;

fn sensors() -> Vec<SimSensor> {
    vec![
        SimSensor::new(0x2800_0000_0A1B_C301, 0x1900),
        SimSensor::new(0x2800_0000_0A1B_C302, 0xF100),
        SimSensor::new(0x2800_0000_0A1B_C303, 0x0080),
    ]
}

fn setup_board(board: SimBoard) -> (SimulatedBus, BoardSession) {
    let sim = SimulatedBus::with_seed(11);
    sim.add_board(BOARD, board);
    let config = BusConfig {
        wake_idle_threshold_ms: None,
        poll_interval_ms: 1,
        ..BusConfig::default()
    };
    let transport = Arc::new(BusTransport::new(Box::new(sim.clone()), config));
    let session = BoardSession::new(
        Dispatcher::new(transport),
        BoardAddress::new(BOARD).unwrap(),
    );
    (sim, session)
}

fn setup() -> (SimulatedBus, BoardSession) {
    setup_board(
        SimBoard::new(0x0042)
            .with_sensors(sensors())
            .with_coupling(0x8001),
    )
}

#[test]
fn test_board_info() {
    let (_sim, mut session) = setup();
    let info = session.board_info().unwrap();
    assert_eq!(info.serial_number, 0x0042);
    assert_eq!(info.firmware_version, 0x0103);
    assert_eq!(info.onewire_count, 0);

    let coupling = session.coupling().unwrap();
    assert_eq!(coupling[0], InputCoupling::Fiber);
    assert_eq!(coupling[1], InputCoupling::Coax);
    assert_eq!(coupling[15], InputCoupling::Fiber);
    assert_eq!(session.serial_number().unwrap(), 0x0042);
}

#[test]
fn test_echo_and_last_command() {
    let (_sim, mut session) = setup();
    assert_eq!(session.echo("ping 123").unwrap(), "ping 123");
    session
        .set_channel(4, &ChannelConfig::from_word(0xFF33))
        .unwrap();
    assert_eq!(session.last_command().unwrap(), "SETC4FF33");
}

#[test]
fn test_board_clock() {
    let (_sim, mut session) = setup();
    session.set_time(0x0001_E240).unwrap();
    assert_eq!(session.time().unwrap(), 0x0001_E240);
}

#[test]
fn test_memory_slots() {
    let (sim, mut session) = setup();

    let err = session.load(MemorySlot::new(1).unwrap()).unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::NoDataStored));

    session
        .set_all_channels(&ChannelConfig::from_word(0x1234))
        .unwrap();
    session.save(MemorySlot::new(1).unwrap()).unwrap();
    session
        .set_all_channels(&ChannelConfig::from_word(0x0000))
        .unwrap();

    session.load(MemorySlot::new(1).unwrap()).unwrap();
    assert_eq!(sim.board(BOARD).unwrap().channels, [0x1234; 16]);

    assert!(MemorySlot::new(3).is_err());
}

#[test]
fn test_reset_reloads_boot_slot() {
    let (sim, mut session) = setup();
    session
        .set_all_channels(&ChannelConfig::from_word(0x4321))
        .unwrap();
    session.save(MemorySlot::BOOT).unwrap();
    session
        .set_all_channels(&ChannelConfig::from_word(0x0000))
        .unwrap();
    session.board_info().unwrap();
    assert!(session.cache().info.is_some());

    session.reset().unwrap();
    assert!(session.cache().info.is_none());
    assert_eq!(sim.board(BOARD).unwrap().channels, [0x4321; 16]);
}

#[test]
fn test_save_failure() {
    let (sim, mut session) = setup();
    sim.force_response(
        BOARD,
        Opcode::Save,
        Some(arxbus_core::protocol::ResponseFrame::failed(2)),
    );
    let err = session.save(MemorySlot::BOOT).unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::WriteFailed));
}

#[test]
fn test_onewire_temperatures() {
    let (_sim, mut session) = setup();
    assert_eq!(session.onewire_search().unwrap(), 3);
    assert_eq!(session.onewire_count().unwrap(), 3);

    let temps = session.onewire_temperatures().unwrap();
    assert_eq!(temps, vec![25.0, -15.0, 0.5]);
}

#[test]
fn test_onewire_sensors() {
    let (_sim, mut session) = setup();
    session.onewire_search().unwrap();

    let found = session.onewire_sensors().unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found[1].index, 1);
    assert_eq!(found[1].serial_number, 0x2800_0000_0A1B_C302);
    assert_eq!(found[1].temperature, -15.0);
}

#[test]
fn test_onewire_errors() {
    let (sim, mut session) = setup();

    // Nothing searched yet
    let err = session.onewire_temperatures().unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::NoSensorsAvailable));

    session.onewire_search().unwrap();
    let err = session.onewire_serial(5).unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::IndexOutOfRange));

    sim.with_board(BOARD, |b| b.sensors[2].faulty = true).unwrap();
    let err = session.onewire_temperatures().unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::PartialReadFailure));

    sim.force_response(
        BOARD,
        Opcode::OneWireSearch,
        Some(arxbus_core::protocol::ResponseFrame::failed(1)),
    );
    let err = session.onewire_search().unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::SensorBusError));
    assert_eq!(session.cache().onewire_count, None);
}

#[test]
fn test_onewire_short_temperature_reply() {
    let (sim, mut session) = setup();
    assert_eq!(session.onewire_search().unwrap(), 3);

    // Two readings for three known devices
    sim.force_response(
        BOARD,
        Opcode::OneWireTemps,
        Some(arxbus_core::protocol::ResponseFrame::ack("19001900")),
    );
    let err = session.onewire_temperatures().unwrap_err();
    assert!(matches!(
        err,
        DispatchError::MalformedPayload {
            opcode: Opcode::OneWireTemps,
            ..
        }
    ));

    let err = session
        .dispatcher()
        .dispatch(
            BoardAddress::new(BOARD).unwrap(),
            &Command::OneWireTemps { sensor_count: 3 },
        )
        .unwrap_err();
    assert!(matches!(err, DispatchError::MalformedPayload { .. }));
}

#[test]
fn test_broadcast_session_rejects_queries() {
    let (sim, _) = setup();
    let transport = Arc::new(BusTransport::new(
        Box::new(sim.clone()),
        BusConfig {
            wake_idle_threshold_ms: None,
            ..BusConfig::default()
        },
    ));
    let mut everyone = BoardSession::new(Dispatcher::new(transport), BoardAddress::BROADCAST);

    let err = everyone.channel(3).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument(_)));
    assert!(matches!(
        everyone.onewire_temperatures(),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(matches!(
        everyone.board_info(),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(sim.history().is_empty());

    // Writes still go out to every board
    everyone.set_all_channels(&ChannelConfig::default()).unwrap();
    assert_eq!(sim.history().len(), 1);
}

#[test]
fn test_monitor_scaling() {
    let (sim, mut session) = setup();
    sim.with_board(BOARD, |b| {
        b.chip_temp = 0xFF9C;
        b.board_current_counts = 0x0100;
    })
    .unwrap();

    assert!((session.chip_temperature().unwrap() + 10.0).abs() < 1e-9);

    let board_ma = session.board_current().unwrap();
    assert!((board_ma - 2048.0).abs() <= 16.0, "{}", board_ma);

    let cal = CurrentCalibration::default();
    let amps = session.all_current(&cal).unwrap();
    // 0x100 counts ≈ 1.024 V: coax 100 mA/V, fiber 1 mA/V
    assert!((amps[1] - 0.1024).abs() < 0.001, "{}", amps[1]);
    assert!((amps[0] - 0.001024).abs() < 0.00001, "{}", amps[0]);

    let counts = session.all_power_counts().unwrap();
    assert!(counts.iter().all(|c| (0x1FE..=0x202).contains(c)));
}

#[test]
fn test_set_comm_follows_board() {
    let (sim, mut session) = setup();
    let new_address = BoardAddress::from_board_number(0x22).unwrap();
    session.set_comm(new_address, None).unwrap();

    assert_eq!(session.address(), new_address);
    assert_eq!(sim.addresses(), vec![0xA2]);
    assert_eq!(session.echo("moved").unwrap(), "moved");
}

#[test]
fn test_unreachable_board_invalidates_cache() {
    let (sim, mut session) = setup();
    session.board_info().unwrap();
    session.all_channels().unwrap();

    sim.set_silent(BOARD, true);
    let err = session.channel(0).unwrap_err();
    assert!(matches!(err, DispatchError::DeviceUnreachable { .. }));
    assert!(session.cache().info.is_none());
    assert!(session.cache().channels.iter().all(Option::is_none));
}
