use arxbus_core::onewire::decode_temperature;
use arxbus_core::scaling::{
    adc_volts, board_current_ma, chip_temp_celsius, CurrentCalibration, InputCoupling,
    PowerCalibration,
};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_power_reference_calibration() {
    let cal = PowerCalibration::default();
    assert!(approx(cal.volts(0), 0.0));
    assert!(approx(cal.watts(0), 0.0));

    // 574 counts × 4 mV / 2.296 = 1.0 V → 1 V² / 50 Ω
    assert!(approx(cal.volts(574), 1.0));
    assert!(approx(cal.watts(574), 0.02));
}

#[test]
fn test_power_custom_calibration() {
    let cal = PowerCalibration {
        volts_per_count: 0.001,
        detector_gain: 1.0,
        load_ohms: 75.0,
    };
    assert!(approx(cal.volts(1500), 1.5));
    assert!(approx(cal.watts(1500), 0.03));
}

#[test]
fn test_current_by_coupling() {
    let cal = CurrentCalibration::default();
    assert!(approx(cal.volts(250), 1.0));
    assert!(approx(cal.amps(250, InputCoupling::Coax), 0.1));
    assert!(approx(cal.amps(250, InputCoupling::Fiber), 0.001));
}

#[test]
fn test_board_current() {
    assert_eq!(board_current_ma(0), 0.0);
    assert_eq!(board_current_ma(125), 1000.0);
}

#[test]
fn test_chip_temperature() {
    assert!(approx(chip_temp_celsius(0x00FA), 25.0));
    assert!(approx(chip_temp_celsius(0xFF9C), -10.0));
    assert!(approx(chip_temp_celsius(0), 0.0));
}

#[test]
fn test_adc_volts() {
    assert!(approx(adc_volts(0x0800, 0.8), 1.6384));
    assert!(approx(adc_volts(1000, 4.0), 4.0));
}

#[test]
fn test_onewire_temperature_decoding() {
    assert_eq!(decode_temperature(0xF100), -15.0);
    assert_eq!(decode_temperature(0x1900), 25.0);
    assert_eq!(decode_temperature(0x7FF0), 2047.0 / 16.0);
    assert_eq!(decode_temperature(0x8000), -128.0);
}

#[test]
fn test_coupling_map_roundtrip() {
    for map in [0x0000u16, 0xFFFF, 0x8001, 0x5A5A] {
        assert_eq!(InputCoupling::to_map(&InputCoupling::from_map(map)), map);
    }
}
