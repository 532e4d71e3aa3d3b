mod common;

use std::time::Duration;

use common::{fast_handshake, ready_device, MockBoard};
use remote_wiring::{
    CapabilityError, ConnectionConfig, DeviceEvent, DriverError, PinMode, PinState, RemoteDevice,
    SerialConfig, TransportError,
};

fn drain(rx: &std::sync::mpsc::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    rx.try_iter().collect()
}

// ----------------------------------------------------------------------------
// Connection and handshake
// ----------------------------------------------------------------------------

#[test]
fn connect_opens_stream_with_requested_settings() {
    let board = MockBoard::uno();
    let device = RemoteDevice::new(board.stream());
    let events = device.events();
    device.connect(&ConnectionConfig::default()).unwrap();

    assert_eq!(board.begun_with(), Some((57_600, SerialConfig::default())));
    assert_eq!(drain(&events), vec![DeviceEvent::ConnectionEstablished]);
    assert!(!device.is_ready());
}

#[test]
fn refused_connection_raises_failure() {
    let board = MockBoard::uno();
    board.set_refuse_begin(true);
    let device = RemoteDevice::new(board.stream());
    let events = device.events();

    let err = device.connect(&ConnectionConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        DriverError::Transport(TransportError::ConnectionFailed(_))
    ));
    assert!(matches!(
        drain(&events).as_slice(),
        [DeviceEvent::ConnectionFailed(_)]
    ));
}

#[test]
fn handshake_raises_ready_and_installs_profile() {
    let board = MockBoard::uno();
    let device = RemoteDevice::new(board.stream());
    let events = device.events();
    device.connect(&ConnectionConfig::default()).unwrap();

    let profile = device.handshake(&fast_handshake()).unwrap();
    assert_eq!(profile.total_pin_count(), 20);
    assert!(device.is_ready());
    assert_eq!(board.flushed()[0], vec![0xF0, 0x6B, 0xF7]);
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::ConnectionEstablished, DeviceEvent::Ready]
    );
}

#[test]
fn silent_board_fails_handshake_after_all_attempts() {
    let board = MockBoard::uno();
    board.set_answer_capabilities(false);
    let device = RemoteDevice::new(board.stream());
    device.connect(&ConnectionConfig::default()).unwrap();
    let events = device.events();

    let err = device.handshake(&fast_handshake()).unwrap_err();
    assert!(matches!(err, DriverError::Timeout(_)));
    assert_eq!(board.flushed().len(), 3);
    assert!(!device.is_ready());
    assert!(matches!(
        drain(&events).as_slice(),
        [DeviceEvent::ConnectionFailed(_)]
    ));
}

#[test]
fn later_capability_response_keeps_modes_without_second_ready() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(13, PinMode::Output).unwrap();
    let events = device.events();

    board.send_capabilities();
    device.process_input().unwrap();

    assert!(drain(&events).is_empty());
    assert!(device.is_ready());
    assert_eq!(device.get_pin_mode(13).unwrap(), Some(PinMode::Output));
    assert_eq!(board.pin_mode(13), Some(PinMode::Output));
}

#[test]
fn input_tracking_survives_capability_requery() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();

    device.request_capabilities().unwrap();
    device.process_input().unwrap();
    assert_eq!(device.get_pin_mode(2).unwrap(), board.pin_mode(2));

    board.drive_input(2, PinState::High);
    device.process_input().unwrap();
    assert_eq!(device.digital_read(2).unwrap(), PinState::High);

    board.drive_input(2, PinState::Low);
    device.process_input().unwrap();
    assert_eq!(device.digital_read(2).unwrap(), PinState::Low);
}

#[test]
fn dropped_event_channel_is_unregistered() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    let kept = device.events();
    drop(device.events());
    assert_eq!(device.listener_count(), 2);

    board.drive_input(2, PinState::High);
    device.process_input().unwrap();

    assert_eq!(device.listener_count(), 1);
    assert_eq!(drain(&kept).len(), 1);
}

#[test]
fn unsubscribed_callback_is_not_called() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = std::sync::Arc::clone(&calls);
    let id = device.subscribe(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    assert!(device.unsubscribe(id));
    assert!(!device.unsubscribe(id));
    board.drive_input(2, PinState::High);
    device.process_input().unwrap();

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(device.listener_count(), 0);
}

#[test]
fn operations_before_ready_are_rejected() {
    let board = MockBoard::uno();
    board.set_answer_capabilities(false);
    let device = RemoteDevice::new(board.stream());
    device.connect(&ConnectionConfig::default()).unwrap();

    assert!(matches!(
        device.pin_mode(13, PinMode::Output),
        Err(DriverError::NotReady(_))
    ));
    assert!(matches!(
        device.digital_read(13),
        Err(DriverError::NotReady(_))
    ));
    assert!(board.flushed().is_empty());
}

#[test]
fn read_failure_is_reported_as_lost_connection() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();

    board.set_fail_reads(true);
    let err = device.process_input().unwrap_err();
    assert!(matches!(
        err,
        DriverError::Transport(TransportError::ConnectionLost(_))
    ));
    assert!(!device.is_ready());
    assert!(matches!(
        drain(&events).as_slice(),
        [DeviceEvent::ConnectionLost(_)]
    ));
}

// ----------------------------------------------------------------------------
// Pin modes
// ----------------------------------------------------------------------------

#[test]
fn input_mode_reaches_board_and_enables_port_reporting() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.pin_mode(2, PinMode::Input).unwrap();

    assert_eq!(board.flushed(), vec![vec![0xF4, 2, 0x00, 0xD0, 0x01]]);
    assert_eq!(board.pin_mode(2), Some(PinMode::Input));
    assert_eq!(device.get_pin_mode(2).unwrap(), Some(PinMode::Input));
    assert!(!device.is_confirmed(2).unwrap());
}

#[test]
fn leaving_input_disables_port_reporting() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.pin_mode(2, PinMode::Input).unwrap();
    device.pin_mode(2, PinMode::Output).unwrap();

    assert_eq!(board.reports(), vec![(0xD0, true), (0xD0, false)]);
}

#[test]
fn analog_mode_enables_channel_reporting() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.pin_mode(15, PinMode::Analog).unwrap();

    assert_eq!(board.flushed(), vec![vec![0xF4, 15, 0x02, 0xC1, 0x01]]);
    assert_eq!(board.reports(), vec![(0xC1, true)]);
}

#[test]
fn repeated_mode_set_changes_nothing_further() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();

    for _ in 0..3 {
        device.pin_mode(13, PinMode::Output).unwrap();
    }

    assert_eq!(device.get_pin_mode(13).unwrap(), Some(PinMode::Output));
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::PinModeChanged {
            pin: 13,
            mode: PinMode::Output
        }]
    );
}

#[test]
fn unsupported_mode_writes_nothing() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    let err = device.pin_mode(2, PinMode::Analog).unwrap_err();
    assert!(matches!(
        err,
        DriverError::Capability(CapabilityError::ModeNotSupported {
            pin: 2,
            mode: PinMode::Analog
        })
    ));
    assert!(matches!(
        device.pin_mode(0, PinMode::Input),
        Err(DriverError::Capability(
            CapabilityError::ModeNotSupported { .. }
        ))
    ));
    assert!(board.flushed().is_empty());
}

#[test]
fn out_of_range_pins_are_rejected_everywhere() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let out_of_range = |r: Result<(), DriverError>| {
        matches!(
            r,
            Err(DriverError::Capability(CapabilityError::PinOutOfRange {
                pin: 20,
                total: 20
            }))
        )
    };

    assert!(out_of_range(device.pin_mode(20, PinMode::Output)));
    assert!(out_of_range(device.digital_write(20, PinState::High)));
    assert!(out_of_range(device.analog_write(20, 1)));
    assert!(out_of_range(device.query_pin_state(20)));
    assert!(out_of_range(device.get_pin_mode(20).map(|_| ())));
    assert!(out_of_range(device.digital_read(20).map(|_| ())));
    assert!(out_of_range(device.analog_read(20).map(|_| ())));
    assert!(board.flushed().is_empty());
}

// ----------------------------------------------------------------------------
// Digital pins
// ----------------------------------------------------------------------------

#[test]
fn digital_write_switches_to_output_and_drives_pin() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.digital_write(13, PinState::High).unwrap();

    assert_eq!(
        board.flushed(),
        vec![vec![0xF4, 13, 0x01, 0x91, 0x20, 0x00]]
    );
    assert_eq!(board.pin_mode(13), Some(PinMode::Output));
    assert_eq!(board.pin_value(13), 1);
    assert_eq!(device.digital_read(13).unwrap(), PinState::High);

    device.digital_write(13, PinState::Low).unwrap();
    assert_eq!(board.pin_value(13), 0);
    assert_eq!(device.digital_read(13).unwrap(), PinState::Low);
}

#[test]
fn digital_write_keeps_other_pins_in_port() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.digital_write(10, PinState::High).unwrap();
    device.digital_write(12, PinState::High).unwrap();

    assert_eq!(board.pin_value(10), 1);
    assert_eq!(board.pin_value(12), 1);
    assert_eq!(board.flushed()[1], vec![0xF4, 12, 0x01, 0x91, 0x14, 0x00]);
}

#[test]
fn digital_write_needs_output_capability() {
    let board = MockBoard::new(vec![vec![(PinMode::Analog, 10)]]);
    let device = ready_device(&board);

    assert!(matches!(
        device.digital_write(0, PinState::High),
        Err(DriverError::Capability(CapabilityError::ModeNotSupported {
            pin: 0,
            mode: PinMode::Output
        }))
    ));
    assert!(board.flushed().is_empty());
}

#[test]
fn board_report_updates_input_pin_and_notifies() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    let events = device.events();

    board.drive_input(2, PinState::High);
    device.process_input().unwrap();

    assert_eq!(device.digital_read(2).unwrap(), PinState::High);
    assert!(device.is_confirmed(2).unwrap());
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::DigitalPinChanged {
            pin: 2,
            state: PinState::High
        }]
    );
}

#[test]
fn port_report_changes_only_reported_pin() {
    let board = MockBoard::new(vec![vec![(PinMode::Input, 1)]; 8]);
    let device = ready_device(&board);
    for pin in 0..8 {
        device.pin_mode(pin, PinMode::Input).unwrap();
    }

    board.send(&[0x90, 0x01, 0x00]);
    device.process_input().unwrap();

    assert_eq!(device.digital_read(0).unwrap(), PinState::High);
    for pin in 1..8 {
        assert_eq!(device.digital_read(pin).unwrap(), PinState::Low);
    }
}

#[test]
fn input_report_does_not_clear_driven_outputs() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    device.digital_write(3, PinState::High).unwrap();
    let events = device.events();

    board.send(&[0x90, 0x04, 0x00]);
    device.process_input().unwrap();

    assert_eq!(device.digital_read(3).unwrap(), PinState::High);
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::DigitalPinChanged {
            pin: 2,
            state: PinState::High
        }]
    );
}

#[test]
fn digital_write_does_not_echo_input_bits() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    board.drive_input(2, PinState::High);
    device.process_input().unwrap();
    board.clear_flushed();

    device.digital_write(4, PinState::High).unwrap();
    assert_eq!(
        board.flushed(),
        vec![vec![0xF4, 4, 0x01, 0x90, 0x10, 0x00]]
    );
}

// ----------------------------------------------------------------------------
// Analog pins
// ----------------------------------------------------------------------------

#[test]
fn analog_report_maps_channel_to_pin() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(14, PinMode::Analog).unwrap();
    let events = device.events();

    board.send_analog(0, 512);
    board.send_analog(0, 512);
    device.process_input().unwrap();

    assert_eq!(device.analog_read(14).unwrap(), 512);
    assert!(device.is_confirmed(14).unwrap());
    let expected = DeviceEvent::AnalogValueChanged {
        channel: Some(0),
        pin: 14,
        value: 512,
    };
    assert_eq!(drain(&events), vec![expected.clone(), expected]);
}

#[test]
fn extended_analog_for_unknown_pin_is_dropped() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();

    board.send(&[0xF0, 0x6F, 40, 0x10, 0x02, 0xF7]);
    board.send(&[0xF0, 0x6F, 9, 0x10, 0x02, 0xF7]);
    device.process_input().unwrap();

    assert_eq!(device.frame_errors(), 0);
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::AnalogValueChanged {
            channel: None,
            pin: 9,
            value: 0x110
        }]
    );
}

#[test]
fn analog_read_needs_analog_capability() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    assert_eq!(device.analog_read(15).unwrap(), 0);
    assert!(matches!(
        device.analog_read(2),
        Err(DriverError::Capability(CapabilityError::ModeNotSupported {
            pin: 2,
            mode: PinMode::Analog
        }))
    ));
}

#[test]
fn analog_write_switches_to_pwm() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.analog_write(3, 128).unwrap();

    assert_eq!(
        board.flushed(),
        vec![vec![0xF4, 3, 0x03, 0xE3, 0x00, 0x01]]
    );
    assert_eq!(board.pin_mode(3), Some(PinMode::Pwm));
    assert_eq!(board.pin_value(3), 128);
    assert!(device.analog_write(2, 128).is_err());
}

#[test]
fn report_analog_checks_channel() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.report_analog(5, true).unwrap();
    assert_eq!(board.flushed(), vec![vec![0xC5, 0x01]]);
    assert!(device.report_analog(6, true).is_err());
}

// ----------------------------------------------------------------------------
// Queries, SysEx and errors
// ----------------------------------------------------------------------------

#[test]
fn pin_state_response_confirms_cache() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();

    device.query_pin_state(13).unwrap();
    assert_eq!(board.flushed(), vec![vec![0xF0, 0x6D, 13, 0xF7]]);

    board.send(&[0xF0, 0x6E, 13, 0x01, 0x01, 0xF7]);
    device.process_input().unwrap();

    assert_eq!(device.get_pin_mode(13).unwrap(), Some(PinMode::Output));
    assert_eq!(device.digital_read(13).unwrap(), PinState::High);
    assert!(device.is_confirmed(13).unwrap());
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::PinStateReported {
            pin: 13,
            mode: Some(PinMode::Output),
            value: 1
        }]
    );
}

#[test]
fn firmware_and_strings_are_surfaced() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();

    device.query_firmware().unwrap();
    board.send(&[0xF0, 0x79, 2, 5, b'F', 0, b'w', 0, 0xF7]);
    board.send(&[0xF0, 0x71, b'h', 0, b'i', 0, 0xF7]);
    device.process_input().unwrap();

    let firmware = device.firmware().unwrap();
    assert_eq!((firmware.major, firmware.minor), (2, 5));
    assert_eq!(firmware.name, "Fw");
    assert_eq!(
        drain(&events),
        vec![
            DeviceEvent::FirmwareReported {
                major: 2,
                minor: 5,
                name: "Fw".into()
            },
            DeviceEvent::StringReceived("hi".into()),
        ]
    );
}

#[test]
fn garbage_is_counted_and_skipped() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();

    board.send(&[0x05, 0xF3, 0x90, 0x04, 0x00]);
    device.process_input().unwrap();

    assert_eq!(device.frame_errors(), 2);
    assert_eq!(device.digital_read(2).unwrap(), PinState::High);
}

#[test]
fn raw_sysex_and_string_are_framed() {
    let board = MockBoard::uno();
    let device = ready_device(&board);

    device.send_sysex(0x42, &[0x01, 0xFF]).unwrap();
    device.send_string("ok").unwrap();
    assert!(device.send_sysex(0x80, &[]).is_err());

    assert_eq!(
        board.flushed(),
        vec![
            vec![0xF0, 0x42, 0x01, 0x7F, 0xF7],
            vec![0xF0, 0x71, b'o', 0, b'k', 0, 0xF7],
        ]
    );
}

#[test]
fn system_reset_forgets_cached_modes() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.digital_write(13, PinState::High).unwrap();
    board.clear_flushed();

    device.system_reset().unwrap();

    assert_eq!(board.flushed(), vec![vec![0xFF]]);
    assert_eq!(device.get_pin_mode(13).unwrap(), None);
    assert_eq!(device.digital_read(13).unwrap(), PinState::Low);
}

#[test]
fn i2c_requests_and_replies() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    let events = device.events();
    let wire = device.i2c();

    wire.enable(0).unwrap();
    wire.read(0x48, 2, Some(0x10), true).unwrap();
    wire.stop(0x48).unwrap();
    assert!(wire.read(0x48, 2, None, true).is_err());
    assert!(wire.enable(0x4000).is_err());

    assert_eq!(
        board.flushed(),
        vec![
            vec![0xF0, 0x78, 0x00, 0x00, 0xF7],
            vec![0xF0, 0x76, 0x48, 0x10, 0x10, 0x00, 0x02, 0x00, 0xF7],
            vec![0xF0, 0x76, 0x48, 0x18, 0xF7],
        ]
    );

    board.send(&[0xF0, 0x77, 0x48, 0, 0x10, 0, 0x34, 0, 0x7F, 0x01, 0xF7]);
    device.process_input().unwrap();
    assert_eq!(
        drain(&events),
        vec![DeviceEvent::I2cReply {
            address: 0x48,
            register: 0x10,
            data: vec![0x34, 0xFF]
        }]
    );
}

// ----------------------------------------------------------------------------
// Listener thread
// ----------------------------------------------------------------------------

#[test]
fn listener_thread_applies_board_input() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(7, PinMode::Pullup).unwrap();
    let events = device.events();
    device.start_listening().unwrap();

    board.drive_input(7, PinState::High);
    let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(
        event,
        DeviceEvent::DigitalPinChanged {
            pin: 7,
            state: PinState::High
        }
    );
    assert_eq!(device.digital_read(7).unwrap(), PinState::High);

    device.finish().unwrap();
    assert!(!device.is_connected());
}

#[test]
fn subscribers_see_events_in_decode_order() {
    let board = MockBoard::uno();
    let device = ready_device(&board);
    device.pin_mode(2, PinMode::Input).unwrap();
    device.pin_mode(14, PinMode::Analog).unwrap();

    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&seen);
    device.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    board.drive_input(2, PinState::High);
    board.send_analog(0, 7);
    board.drive_input(2, PinState::Low);
    device.process_input().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            DeviceEvent::DigitalPinChanged {
                pin: 2,
                state: PinState::High
            },
            DeviceEvent::AnalogValueChanged {
                channel: Some(0),
                pin: 14,
                value: 7
            },
            DeviceEvent::DigitalPinChanged {
                pin: 2,
                state: PinState::Low
            },
        ]
    );
}
