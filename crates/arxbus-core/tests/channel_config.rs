use arxbus_core::board::BoardSession;
use arxbus_core::channel::{Attenuation, ChannelConfig, ChannelReadout};
use arxbus_core::protocol::{
    BoardAddress, BusConfig, BusTransport, Command, DispatchError, Dispatcher, FailureReason,
    Opcode, Reply,
};
use arxbus_core::sim::{SimBoard, SimulatedBus};
use pretty_assertions::assert_eq;
use std::sync::Arc;

const BOARD: u8 = 0xA0;

fn setup_with_dispatcher() -> (SimulatedBus, Dispatcher, BoardSession) {
    let sim = SimulatedBus::with_seed(3);
    sim.add_board(BOARD, SimBoard::new(0x0100));
    let config = BusConfig {
        wake_idle_threshold_ms: None,
        poll_interval_ms: 1,
        ..BusConfig::default()
    };
    let transport = Arc::new(BusTransport::new(Box::new(sim.clone()), config));
    let dispatcher = Dispatcher::new(transport);
    let session = BoardSession::new(dispatcher.clone(), BoardAddress::new(BOARD).unwrap());
    (sim, dispatcher, session)
}

fn setup() -> (SimulatedBus, BoardSession) {
    let (sim, _, session) = setup_with_dispatcher();
    (sim, session)
}

fn scenario_config() -> ChannelConfig {
    ChannelConfig {
        lowpass_wide: true,
        signal_enabled: true,
        highpass_wide: false,
        atten1: Attenuation::new(25).unwrap(),
        atten2: Attenuation::new(0).unwrap(),
        dc_power_on: true,
    }
}

#[test]
fn test_every_word_roundtrips() {
    for word in 0..=u16::MAX {
        let config = ChannelConfig::from_word(word);
        assert_eq!(config.to_word(), word);
        assert_eq!(ChannelConfig::from_word(config.to_word()), config);
    }
}

#[test]
fn test_setc_scenario() {
    let config = scenario_config();
    assert_eq!(config.to_word(), 0xFF33);
    assert_eq!(
        Command::SetChannel {
            channel: 3,
            word: config.to_word()
        }
        .args(),
        "3FF33"
    );

    let (sim, mut session) = setup();
    session.set_channel(3, &config).unwrap();
    assert_eq!(sim.board(BOARD).unwrap().channels[3], 0xFF33);
    assert_eq!(session.channel(3).unwrap(), config);
}

#[test]
fn test_geta_unreadable_channel() {
    let (sim, dispatcher, mut session) = setup_with_dispatcher();
    let words: [u16; 16] = std::array::from_fn(|i| 0x7FF8 | i as u16 & 0x7);
    sim.with_board(BOARD, |b| b.channels = words).unwrap();
    sim.set_unreadable(BOARD, 7, true);

    // Only field 7 reads all ones
    let reply = dispatcher
        .dispatch(BoardAddress::new(BOARD).unwrap(), &Command::GetAll)
        .unwrap();
    let Reply::Values(values) = reply else {
        panic!("unexpected reply {:?}", reply);
    };
    for (chan, value) in values.iter().enumerate() {
        if chan == 7 {
            assert_eq!(*value, 0xFFFF);
        } else {
            assert_eq!(*value, words[chan]);
        }
    }

    let readouts = session.all_channels().unwrap();
    for (chan, readout) in readouts.iter().enumerate() {
        assert_eq!(readout.is_ambiguous(), chan == 7, "channel {}", chan);
    }
    assert_eq!(
        readouts[7],
        ChannelReadout::Ambiguous(ChannelConfig::from_word(0xFFFF))
    );
    assert_eq!(session.cache().channels[7], None);
    assert_eq!(
        session.cache().channels[2],
        Some(ChannelConfig::from_word(words[2]))
    );

    // The single-channel read reports the failure properly
    let err = session.channel(7).unwrap_err();
    assert_eq!(err.failure_reason(), Some(FailureReason::DeviceBusError));
}

#[test]
fn test_set_all_and_each() {
    let (sim, mut session) = setup();

    session.set_all_channels(&scenario_config()).unwrap();
    assert_eq!(sim.board(BOARD).unwrap().channels, [0xFF33; 16]);

    let configs: [ChannelConfig; 16] = std::array::from_fn(|chan| ChannelConfig {
        atten1: Attenuation::new(chan as u8).unwrap(),
        atten2: Attenuation::new(63 - chan as u8).unwrap(),
        signal_enabled: chan % 2 == 0,
        ..ChannelConfig::default()
    });
    session.set_each_channel(&configs).unwrap();

    let readouts = session.all_channels().unwrap();
    let read_back: Vec<ChannelConfig> = readouts.iter().map(|r| r.config()).collect();
    assert_eq!(read_back, configs.to_vec());
}

#[test]
fn test_modify_and_verify() {
    let (sim, mut session) = setup();

    let updated = session
        .modify_channel(5, |c| {
            c.dc_power_on = true;
            c.atten1 = Attenuation::from_db(6.0).unwrap();
        })
        .unwrap();
    assert!(updated.dc_power_on);
    assert_eq!(updated.atten1.db(), 6.0);
    assert!(session.verify_channel(5, &updated).unwrap());

    // Someone else changes the board behind our back
    sim.with_board(BOARD, |b| b.channels[5] = 0x0000).unwrap();
    assert!(!session.verify_channel(5, &updated).unwrap());
}

#[test]
fn test_writes_invalidate_cache() {
    let (_sim, mut session) = setup();

    session.channel(2).unwrap();
    assert!(session.cache().channels[2].is_some());

    session.set_channel(2, &scenario_config()).unwrap();
    assert_eq!(session.cache().channels[2], None);

    session.all_channels().unwrap();
    assert!(session.cache().channels.iter().all(Option::is_some));
    session.set_all_channels(&ChannelConfig::default()).unwrap();
    assert!(session.cache().channels.iter().all(Option::is_none));
}

#[test]
fn test_failed_write_reports_reason() {
    let (sim, mut session) = setup();
    sim.set_unreadable(BOARD, 9, true);
    session.channel(1).unwrap();

    let err = session.set_channel(9, &scenario_config()).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::CommandFailed {
            opcode: Opcode::SetChannel,
            reason: FailureReason::DeviceBusError
        }
    ));
    // A board-level failure keeps unrelated cache entries
    assert!(session.cache().channels[1].is_some());
}

#[test]
fn test_out_of_range_channel_is_local() {
    let (sim, mut session) = setup();
    assert!(matches!(
        session.channel(16),
        Err(DispatchError::InvalidArgument(_))
    ));
    assert!(sim.history().is_empty());
}
