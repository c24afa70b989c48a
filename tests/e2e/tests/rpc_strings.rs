// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: String parameter RPC through an IPC gate to a user server thread
//! INTENT: Pin the wire semantics of input, output and optional strings end to end
//! DEPS: neuron (gates, threads), nexus-ipc (serve loop), nexus-utcb (codec)
//! TESTS: simple/empty/null/embedded-zero/unterminated inputs, hand-crafted oversized length,
//!        empty/null/terminated/unterminated outputs, optional strings, delivered rights

use neuron::ROOT_TASK_CAP;
use nexus_abi::{Error, Rights};
use nexus_e2e::{op, StringServer, STRINGS_LABEL, STRINGS_PROTOCOL};
use nexus_ipc::{MsgTag, Wait};
use nexus_utcb::InStr;

#[test]
fn in_simple_string() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::from("Hello World")), 0);
    let captured = server.captured();
    assert_eq!(captured.string, b"Hello World");
    assert_eq!(captured.string.len(), 11);
    assert_eq!(captured.size, 12);
}

#[test]
fn in_empty_string() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::from("")), 0);
    let captured = server.captured();
    assert_eq!(captured.size, 1);
    assert!(captured.string.is_empty());
}

#[test]
fn in_null_string_is_refused_by_the_caller() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::new(0, b"")), Error::MessageTooShort.status());
    assert_eq!(server.captured().size, 0, "nothing reached the handler");
}

#[test]
fn in_string_with_embedded_zero() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::new(4, b"a\0b")), 0);
    let captured = server.captured();
    assert_eq!(captured.string, b"a\0b");
    assert_eq!(captured.string.len(), 3);
}

#[test]
fn in_string_without_terminator_is_cut() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::new(3, b"xyz")), 0);
    let captured = server.captured();
    assert_eq!(captured.string, b"xy");
    assert_eq!(captured.string.len(), 2);
}

#[test]
fn in_oversized_length_in_hand_crafted_message() {
    let server = StringServer::start();
    let mut c = server.client();
    let gate = c.gate();
    let raw = c.raw();
    raw.utcb().set_word(0, op::IN_SIMPLE).unwrap();
    raw.utcb().set_word(1, !1u64).unwrap();
    let rtag = raw.call(gate, MsgTag::new(STRINGS_PROTOCOL, 2), Wait::Blocking).unwrap();
    assert_eq!(rtag.status(), Error::MessageTooShort.status());
    assert_eq!(rtag.words(), 1);
}

#[test]
fn out_empty_string() {
    let server = StringServer::start();
    server.set_reply(b"\0");
    let mut c = server.client();
    let mut buf = [0xffu8; 60];
    assert_eq!(c.out_simple_str(&mut buf), (0, Some(1)));
    assert_eq!(buf[0], 0);
    assert_eq!(server.captured().size, 60);
}

#[test]
fn out_null_string_fails() {
    let server = StringServer::start();
    server.set_reply(b"");
    let mut c = server.client();
    let mut buf = [0u8; 60];
    assert_eq!(c.out_simple_str(&mut buf), (Error::MessageTooShort.status(), None));
}

#[test]
fn out_terminated_string() {
    let server = StringServer::start();
    server.set_reply(b"Goodbye Friends.\0");
    let mut c = server.client();
    let mut buf = [0u8; 60];
    let (status, len) = c.out_simple_str(&mut buf);
    assert_eq!(status, 0);
    assert_eq!(len, Some(17));
    assert_eq!(&buf[..17], b"Goodbye Friends.\0");
}

#[test]
fn out_unterminated_string_gets_terminated() {
    let server = StringServer::start();
    server.set_reply(b"xxyyzz");
    let mut c = server.client();
    let mut buf = [0xffu8; 60];
    assert_eq!(c.out_simple_str(&mut buf), (0, Some(6)));
    assert_eq!(&buf[..6], b"xxyyz\0");
}

#[test]
fn out_string_truncated_to_capacity() {
    let server = StringServer::start();
    server.set_reply(b"a rather long answer\0");
    let mut c = server.client();
    let mut buf = [0xffu8; 8];
    let (status, len) = c.out_simple_str(&mut buf);
    assert_eq!(status, 0);
    assert_eq!(len, Some(21), "reported length exceeds the buffer");
    assert_eq!(&buf, b"a rathe\0");
}

#[test]
fn opt_in_string_not_given() {
    let server = StringServer::start();
    let mut c = server.client();
    assert_eq!(c.in_opt_str(false, None), 0);
    assert!(server.captured().string.is_empty());
}

#[test]
fn opt_in_string_given() {
    let server = StringServer::start();
    let mut c = server.client();
    let value = InStr::from("foobar");
    assert_eq!(value.length(), 7);
    assert_eq!(c.in_opt_str(true, Some(value)), 0);
    let captured = server.captured();
    assert_eq!(captured.string, b"foobar");
    assert_eq!(captured.string.len(), 6);
}

#[test]
fn opt_out_string_not_given_leaves_buffer() {
    let server = StringServer::start();
    server.set_reply(b"ignored\0");
    let mut c = server.client();
    let mut buf = [0u8; 60];
    buf[0] = b'x';
    assert_eq!(c.out_opt_str(false, &mut buf), (0, None));
    assert_eq!(buf[0], b'x');
    assert_eq!(buf[1], 0);
}

#[test]
fn opt_out_string_given() {
    let server = StringServer::start();
    server.set_reply(b"Westward ho\0");
    let mut c = server.client();
    let mut buf = [0u8; 60];
    assert_eq!(c.out_opt_str(true, &mut buf), (0, Some(12)));
    assert_eq!(&buf[..12], b"Westward ho\0");
}

#[test]
fn unknown_opcode_and_wrong_protocol() {
    let server = StringServer::start();
    let mut c = server.client();
    let gate = c.gate();
    let raw = c.raw();
    raw.utcb().set_word(0, 77).unwrap();
    let rtag = raw.call(gate, MsgTag::new(STRINGS_PROTOCOL, 1), Wait::Blocking).unwrap();
    assert_eq!(rtag.status(), Error::UnknownOpcode.status());

    raw.utcb().set_word(0, op::IN_SIMPLE).unwrap();
    let rtag = raw.call(gate, MsgTag::new(STRINGS_PROTOCOL + 1, 1), Wait::Blocking).unwrap();
    assert_eq!(rtag.status(), Error::BadProtocol.status());
}

#[test]
fn server_sees_gate_label_and_invoked_rights() {
    let server = StringServer::start();
    assert_eq!(server.client().whoami(), (Rights::all(), STRINGS_LABEL));

    let weak = {
        let mut root = server.client();
        root.raw().map(ROOT_TASK_CAP, server.gate(), Rights::WRITE).unwrap()
    };
    assert_eq!(server.client_for(weak).whoami(), (Rights::WRITE, STRINGS_LABEL));
}

#[test]
fn deleted_gate_stops_delivering() {
    let server = StringServer::start();
    let copy = {
        let mut root = server.client();
        root.raw().map(ROOT_TASK_CAP, server.gate(), Rights::all()).unwrap()
    };
    let k = server.kernel();
    k.delete(k.root_task(), copy).unwrap();
    let mut c = server.client();
    assert_eq!(c.in_simple_str(InStr::from("late")), Error::InvalidCapability.status());
}
