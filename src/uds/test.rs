use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::uds::mock::SimEcuChannel;
use crate::uds::{security_access, UdsCommand, UdsServer, UdsServerOptions, UdsSessionType};
use crate::DiagError;

fn options() -> UdsServerOptions {
    UdsServerOptions {
        read_timeout_ms: 200,
        write_timeout_ms: 200,
        // Keep background chatter out of the scripted exchanges
        keepalive_enabled: false,
        busy_repeat_backoff_ms: 1000,
        ..Default::default()
    }
}

fn server_with(
    callback: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
) -> UdsServer {
    UdsServer::new_over_iso_tp(
        options(),
        SimEcuChannel::new(callback),
        Default::default(),
        None,
    )
    .unwrap()
}

#[test]
fn positive_response_is_sid_plus_0x40() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| vec![vec![req[0] + 0x40, req[1]]]);
    let resp = server
        .execute_command_with_response(UdsCommand::DiagnosticSessionControl, &[0x03])
        .unwrap();
    assert_eq!(resp[0], 0x50);
    assert_eq!(resp[1], 0x03);
}

#[test]
fn mismatched_response_sid_is_a_protocol_violation() {
    let _ = env_logger::try_init();
    // ECU answers with the wrong service id
    let mut server = server_with(|_req: &[u8]| vec![vec![0x6E, 0x00]]);
    let err = server
        .execute_command_with_response(UdsCommand::ReadDataByIdentifier, &[0xF1, 0x90])
        .unwrap_err();
    assert!(matches!(err, DiagError::WrongMessage));
}

#[test]
fn negative_response_surfaces_code_and_definition() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| vec![vec![0x7F, req[0], 0x31]]);
    let err = server
        .execute_command_with_response(UdsCommand::ReadDataByIdentifier, &[0x00, 0x01])
        .unwrap_err();
    match err {
        DiagError::ECUError { code, def } => {
            assert_eq!(code, 0x31);
            assert_eq!(def.unwrap(), "request out of range");
        }
        other => panic!("expected ECUError, got {other:?}"),
    }
}

#[test]
fn negative_response_with_foreign_echo_is_rejected() {
    let _ = env_logger::try_init();
    // NRC echoes a service we never sent
    let mut server = server_with(|_req: &[u8]| vec![vec![0x7F, 0x2E, 0x13]]);
    let err = server
        .execute_command_with_response(UdsCommand::ReadDataByIdentifier, &[0xF1, 0x90])
        .unwrap_err();
    assert!(matches!(err, DiagError::WrongMessage));
}

#[test]
fn response_pending_extends_the_exchange() {
    let _ = env_logger::try_init();
    // Three responsePending replies, then the seed
    let mut server = server_with(|req: &[u8]| {
        vec![
            vec![0x7F, req[0], 0x78],
            vec![0x7F, req[0], 0x78],
            vec![0x7F, req[0], 0x78],
            vec![0x67, 0x03, 0x11, 0x22, 0x33, 0x44],
        ]
    });
    let resp = server
        .execute_command_with_response(UdsCommand::SecurityAccess, &[0x03])
        .unwrap();
    assert_eq!(resp, vec![0x67, 0x03, 0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn response_pending_beyond_the_cap_fails() {
    let _ = env_logger::try_init();
    let mut opts = options();
    opts.response_pending_max = 2;
    opts.p2_star_max_ms = 50;
    let mut server = UdsServer::new_over_iso_tp(
        opts,
        SimEcuChannel::new(|req: &[u8]| vec![vec![0x7F, req[0], 0x78]; 5]),
        Default::default(),
        None,
    )
    .unwrap();
    let err = server
        .execute_command_with_response(UdsCommand::RoutineControl, &[0x01, 0xFF, 0x00])
        .unwrap_err();
    assert!(matches!(err, DiagError::ResponsePendingExhausted));
}

#[test]
fn busy_repeat_request_is_retried() {
    let _ = env_logger::try_init();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_cb = calls.clone();
    let mut server = server_with(move |req: &[u8]| {
        if calls_cb.fetch_add(1, Ordering::SeqCst) == 0 {
            vec![vec![0x7F, req[0], 0x21]]
        } else {
            vec![vec![req[0] + 0x40, req[1]]]
        }
    });
    let resp = server
        .execute_command_with_response(UdsCommand::TesterPresent, &[0x00])
        .unwrap();
    assert_eq!(resp[0], 0x7E);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn session_transitions_are_tracked() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| vec![vec![req[0] + 0x40, req[1]]]);
    assert_eq!(server.session_info().session_type, UdsSessionType::Default);

    server.set_session_mode(UdsSessionType::Extended).unwrap();
    assert_eq!(server.session_info().session_type, UdsSessionType::Extended);

    server.set_session_mode(UdsSessionType::Default).unwrap();
    assert_eq!(server.session_info().session_type, UdsSessionType::Default);
}

#[test]
fn rejected_session_change_leaves_state_alone() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| {
        if req[0] == 0x10 && req[1] == 0x02 {
            vec![vec![0x7F, req[0], 0x22]]
        } else {
            vec![vec![req[0] + 0x40, req[1]]]
        }
    });
    server.set_session_mode(UdsSessionType::Extended).unwrap();
    assert!(server.set_session_mode(UdsSessionType::Programming).is_err());
    assert_eq!(server.session_info().session_type, UdsSessionType::Extended);
}

#[test]
fn security_unlock_grants_the_level() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| {
        match (req[0], req[1]) {
            // Seed request for level 1
            (0x27, 0x01) => vec![vec![0x67, 0x01, 0xDE, 0xAD, 0xBE, 0xEF]],
            // Key send: accept the XOR-ed seed
            (0x27, 0x02) if req[2..] == [0x21, 0x52, 0x41, 0x10] => {
                vec![vec![0x67, 0x02]]
            }
            (0x27, 0x02) => vec![vec![0x7F, 0x27, 0x35]],
            _ => vec![vec![req[0] + 0x40, req[1]]],
        }
    });
    let xor = |seed: &[u8], _level: u8| seed.iter().map(|b| b ^ 0xFF).collect::<Vec<u8>>();
    security_access::unlock(&mut server, 1, &xor).unwrap();
    assert_eq!(server.session_info().security_level, 1);
}

#[test]
fn exceeded_attempts_locks_security_access() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| {
        match (req[0], req[1]) {
            (0x27, 0x01) => vec![vec![0x67, 0x01, 0x01, 0x02]],
            // Every key is wrong, and the ECU has had enough
            (0x27, 0x02) => vec![vec![0x7F, 0x27, 0x36]],
            _ => vec![vec![req[0] + 0x40, req[1]]],
        }
    });
    let junk = |_seed: &[u8], _level: u8| vec![0x00, 0x00];
    let err = security_access::unlock(&mut server, 1, &junk).unwrap_err();
    assert!(matches!(err, DiagError::SecurityDenied { code: 0x36 }));
    assert_eq!(server.session_info().security_level, 0);

    // The local lockout now refuses further attempts before the wire
    let err = security_access::request_seed(&mut server, 1).unwrap_err();
    assert!(matches!(err, DiagError::SecurityDenied { code: 0x37 }));
}

#[test]
fn empty_payload_is_refused() {
    let _ = env_logger::try_init();
    let mut server = server_with(|req: &[u8]| vec![vec![req[0] + 0x40]]);
    assert!(matches!(
        server.send_byte_array(&[]),
        Err(DiagError::ParameterInvalid)
    ));
}
