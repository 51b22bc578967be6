// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! End-to-end tests over a deterministic in-process frame pair.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use captp::local;
use captp::local::Server;
use captp::message::{CapDescriptor, Disembargo, Frame, MessageTarget, Return, WirePayload};
use captp::payload::Content;
use captp::twoparty::Pipe;
use captp::{new_client, Client, Config, Error, ErrorKind, FrameSender, Payload, Session, StructRef};

const TEST_INTERFACE: u64 = 0x00c7;

const PING: u16 = 0;
const GET_SERVICE: u16 = 1;
const ECHO: u16 = 2;
const GET_HANDLE: u16 = 3;
const FAIL: u16 = 4;
const NEVER: u16 = 5;
const OP: u16 = 6;

// A stand-in for the host codec: a value plus an explicit map from pipeline
// paths to cap table slots.
struct TestContent {
    value: u64,
    slots: Vec<(Vec<u16>, u32)>,
}

impl Content for TestContent {
    fn cap_slot(&self, transform: &[u16]) -> captp::Result<Option<u32>> {
        Ok(self
            .slots
            .iter()
            .find(|(path, _)| path == transform)
            .map(|(_, slot)| *slot))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn data(value: u64) -> Payload {
    Payload::new(
        Rc::new(TestContent {
            value,
            slots: Vec::new(),
        }),
        Vec::new(),
    )
}

/// A payload carrying one capability, addressed by pipeline path `[0]`.
fn cap_payload(value: u64, cap: Client) -> Payload {
    Payload::new(
        Rc::new(TestContent {
            value,
            slots: vec![(vec![0], 0)],
        }),
        vec![cap.hook],
    )
}

fn value_of(payload: &Payload) -> u64 {
    payload
        .body
        .as_any()
        .downcast_ref::<TestContent>()
        .expect("payload body is not TestContent")
        .value
}

fn result_value(r: &StructRef) -> u64 {
    value_of(&r.response().expect("unresolved").expect("call failed"))
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::Bootstrap { .. } => "bootstrap".into(),
        Frame::Call { target, .. } => match target {
            MessageTarget::ImportedCap(_) => "call:import".into(),
            MessageTarget::PromisedAnswer { .. } => "call:answer".into(),
        },
        Frame::Return { which, .. } => match which {
            Return::Results(_) => "return:results".into(),
            Return::Exception(_) => "return:exception".into(),
            Return::Canceled => "return:canceled".into(),
        },
        Frame::Finish {
            release_result_caps,
            ..
        } => format!("finish:release={release_result_caps}"),
        Frame::Release {
            reference_count, ..
        } => format!("release:{reference_count}"),
        Frame::Disembargo { context, .. } => match context {
            Disembargo::SenderLoopback(_) => "disembargo:request".into(),
            Disembargo::ReceiverLoopback(_) => "disembargo:reply".into(),
        },
    }
}

struct Spy {
    inner: Pipe,
    log: Rc<RefCell<Vec<String>>>,
}

impl FrameSender for Spy {
    fn queue_send(&self, frame: Frame) {
        self.log.borrow_mut().push(describe(&frame));
        self.inner.queue_send(frame);
    }
}

/// Two sessions joined by a pair of frame queues, pumped by hand.
struct Net {
    a: Session,
    b: Session,
    from_a: Pipe,
    from_b: Pipe,
    a_log: Rc<RefCell<Vec<String>>>,
    b_log: Rc<RefCell<Vec<String>>>,
}

fn connect(a_config: Config, b_config: Config) -> Net {
    let from_a = Pipe::new();
    let from_b = Pipe::new();
    let a_log = Rc::new(RefCell::new(Vec::new()));
    let b_log = Rc::new(RefCell::new(Vec::new()));
    let a = Session::new(
        Box::new(Spy {
            inner: from_a.clone(),
            log: a_log.clone(),
        }),
        a_config,
    )
    .unwrap();
    let b = Session::new(
        Box::new(Spy {
            inner: from_b.clone(),
            log: b_log.clone(),
        }),
        b_config,
    )
    .unwrap();
    Net {
        a,
        b,
        from_a,
        from_b,
        a_log,
        b_log,
    }
}

impl Net {
    /// Delivers frames in both directions until the wire is quiet.
    fn pump(&self) {
        loop {
            if let Some(frame) = self.from_a.pop() {
                self.b.handle_frame(frame).unwrap();
                continue;
            }
            if let Some(frame) = self.from_b.pop() {
                self.a.handle_frame(frame).unwrap();
                continue;
            }
            break;
        }
    }

    fn pump_from_a(&self) {
        while let Some(frame) = self.from_a.pop() {
            self.b.handle_frame(frame).unwrap();
        }
    }

    fn pump_from_b(&self) {
        while let Some(frame) = self.from_b.pop() {
            self.a.handle_frame(frame).unwrap();
        }
    }

    fn clear_logs(&self) {
        self.a_log.borrow_mut().clear();
        self.b_log.borrow_mut().clear();
    }

    fn count(log: &Rc<RefCell<Vec<String>>>, which: &str) -> usize {
        log.borrow().iter().filter(|s| s.as_str() == which).count()
    }
}

/// The bootstrap service used by most scenarios.
#[derive(Default)]
struct TestPeer {
    calls: Cell<u32>,
    handle_count: Rc<Cell<i64>>,
    gated: RefCell<Vec<captp::StructResolver>>,
    hung: RefCell<Vec<captp::StructResolver>>,
}

impl Server for TestPeer {
    fn dispatch_call(
        self: Rc<Self>,
        interface_id: u64,
        method_id: u16,
        mut params: Payload,
    ) -> StructRef {
        if interface_id != TEST_INTERFACE {
            return StructRef::error(Error::exception("unknown interface"));
        }
        self.calls.set(self.calls.get() + 1);
        match method_id {
            PING => StructRef::ok(data(value_of(&params))),
            GET_SERVICE => {
                let (sref, resolver) = StructRef::new_pair();
                self.gated.borrow_mut().push(resolver);
                sref
            }
            ECHO => {
                if params.cap_table.is_empty() {
                    return StructRef::error(Error::exception("echo needs a capability"));
                }
                let cap = params.cap_table.remove(0);
                StructRef::ok(cap_payload(value_of(&params), Client::new(cap)))
            }
            GET_HANDLE => StructRef::ok(cap_payload(
                0,
                new_client(Handle::new(&self.handle_count)),
            )),
            FAIL => StructRef::error(Error::exception("intentional failure")),
            NEVER => {
                let (sref, resolver) = StructRef::new_pair();
                self.hung.borrow_mut().push(resolver);
                sref
            }
            _ => StructRef::error(Error::exception("unknown method")),
        }
    }
}

fn test_peer_config(peer: &Rc<TestPeer>) -> Config {
    Config {
        bootstrap: Some(Client::new(Box::new(local::Client::from_rc(peer.clone())))),
        tags: vec!["server".into()],
        ..Config::default()
    }
}

/// A service whose only method records its argument; used as the loopback
/// target in the embargo scenario.
struct Recorder {
    log: Rc<RefCell<Vec<u64>>>,
}

impl Server for Recorder {
    fn dispatch_call(
        self: Rc<Self>,
        _interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> StructRef {
        assert_eq!(method_id, OP);
        self.log.borrow_mut().push(value_of(&params));
        StructRef::ok(data(value_of(&params)))
    }
}

struct OpService;

impl Server for OpService {
    fn dispatch_call(
        self: Rc<Self>,
        _interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> StructRef {
        assert_eq!(method_id, OP);
        StructRef::ok(data(value_of(&params) + 1))
    }
}

struct Handle {
    count: Rc<Cell<i64>>,
}

impl Handle {
    fn new(count: &Rc<Cell<i64>>) -> Self {
        let count = count.clone();
        count.set(count.get() + 1);
        Self { count }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

impl Server for Handle {
    fn dispatch_call(
        self: Rc<Self>,
        _interface_id: u64,
        _method_id: u16,
        _params: Payload,
    ) -> StructRef {
        StructRef::ok(Payload::empty())
    }
}

#[test]
fn bootstrap_ping() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    let r = boot.call(TEST_INTERFACE, PING, data(7));
    net.pump();

    assert_eq!(result_value(&r), 7);
    assert_eq!(peer.calls.get(), 1);

    assert_eq!(Net::count(&net.b_log, "bootstrap"), 1);
    assert_eq!(Net::count(&net.b_log, "call:answer"), 1);
    assert_eq!(Net::count(&net.b_log, "finish:release=false"), 2);
    assert_eq!(Net::count(&net.a_log, "return:results"), 2);

    drop(boot);
    drop(r);
    net.pump();
    assert_eq!(Net::count(&net.b_log, "release:1"), 1);
    assert!(net.a.is_idle(), "server tables leak: {:?}", net.a.counts());
    assert!(net.b.is_idle(), "client tables leak: {:?}", net.b.counts());
}

#[test]
fn promise_pipelining() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    net.pump();
    net.clear_logs();

    let s = boot.call(TEST_INTERFACE, GET_SERVICE, data(0));
    let svc = s.cap(&[0]);
    let r = svc.call(TEST_INTERFACE, OP, data(5));

    // Both calls leave before anything comes back: one aimed at the
    // resolved bootstrap import, the pipelined one at the open answer.
    assert_eq!(
        *net.b_log.borrow(),
        vec!["call:import".to_string(), "call:answer".to_string()]
    );

    net.pump_from_b();
    // The server has both calls but has returned nothing: the pipelined
    // call arrived before its first return was sent.
    assert_eq!(peer.gated.borrow().len(), 1);
    assert_eq!(Net::count(&net.a_log, "return:results"), 0);

    let resolver = peer.gated.borrow_mut().pop().unwrap();
    resolver.resolve(Ok(cap_payload(0, new_client(OpService))));
    assert_eq!(Net::count(&net.a_log, "return:results"), 2);

    net.pump();
    assert_eq!(result_value(&r), 6);

    drop(boot);
    drop(s);
    drop(svc);
    drop(r);
    net.pump();
    assert!(net.a.is_idle(), "server tables leak: {:?}", net.a.counts());
    assert!(net.b.is_idle(), "client tables leak: {:?}", net.b.counts());
}

#[test]
fn loopback_embargo_preserves_call_order() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let recorder_log = Rc::new(RefCell::new(Vec::new()));
    let l = new_client(Recorder {
        log: recorder_log.clone(),
    });

    let boot = net.b.bootstrap();
    let echoed = boot.call(
        TEST_INTERFACE,
        ECHO,
        Payload::new(
            Rc::new(TestContent {
                value: 0,
                slots: Vec::new(),
            }),
            vec![l.hook.add_ref()],
        ),
    );
    let p = echoed.cap(&[0]);
    let r1 = p.call(TEST_INTERFACE, OP, data(1));

    // Server translates the echo, reflects the in-flight pipelined call
    // back at us, and describes the result as a capability we host.
    net.pump_from_b();

    // Client: the return reveals the loopback; the pipeline cap goes behind
    // an embargo, and the reflected call is delivered straight to `l`.
    net.pump_from_a();
    assert_eq!(*recorder_log.borrow(), vec![1]);
    assert_eq!(Net::count(&net.b_log, "disembargo:request"), 1);

    // Calls made after the resolution must wait for the disembargo.
    let r2 = p.call(TEST_INTERFACE, OP, data(2));
    let r3 = p.call(TEST_INTERFACE, OP, data(3));
    assert_eq!(*recorder_log.borrow(), vec![1]);

    net.pump();
    assert_eq!(*recorder_log.borrow(), vec![1, 2, 3]);
    assert_eq!(Net::count(&net.a_log, "disembargo:reply"), 1);
    assert_eq!(result_value(&r1), 1);
    assert_eq!(result_value(&r2), 2);
    assert_eq!(result_value(&r3), 3);
    assert_eq!(net.b.counts().embargoes, 0);

    drop((boot, echoed, p, r1, r2, r3, l));
    net.pump();
    assert!(net.a.is_idle(), "server tables leak: {:?}", net.a.counts());
    assert!(net.b.is_idle(), "client tables leak: {:?}", net.b.counts());
}

#[test]
fn round_tripped_cap_keeps_its_identity() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let l = new_client(Recorder {
        log: Rc::new(RefCell::new(Vec::new())),
    });
    let boot = net.b.bootstrap();
    let echoed = boot.call(
        TEST_INTERFACE,
        ECHO,
        Payload::new(
            Rc::new(TestContent {
                value: 0,
                slots: Vec::new(),
            }),
            vec![l.hook.add_ref()],
        ),
    );
    net.pump();

    // No pipelined sends, so no embargo: the echoed slot is our own
    // capability again, by identity, not a proxy for it.
    let back = echoed.cap(&[0]).shortest();
    assert_eq!(back.hook.get_ptr(), l.hook.get_ptr());

    drop((boot, echoed, back, l));
    net.pump();
    assert!(net.a.is_idle());
    assert!(net.b.is_idle());
}

#[test]
fn release_retires_the_export() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    let r = boot.call(TEST_INTERFACE, GET_HANDLE, data(0));
    net.pump();
    assert_eq!(peer.handle_count.get(), 1);
    assert_eq!(net.a.counts().exports, 2); // bootstrap + handle

    let h = r.cap(&[0]);
    drop(r);
    drop(h);
    net.pump();
    assert_eq!(peer.handle_count.get(), 0);
    assert_eq!(net.a.counts().exports, 1); // bootstrap only
    assert_eq!(Net::count(&net.b_log, "release:1"), 1);

    drop(boot);
    net.pump();
    assert!(net.a.is_idle());
    assert!(net.b.is_idle());
}

#[test]
fn exception_resolves_only_that_call() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    let bad = boot.call(TEST_INTERFACE, FAIL, data(0));
    let good = boot.call(TEST_INTERFACE, PING, data(3));
    net.pump();

    match bad.response() {
        Some(Err(e)) => {
            assert_eq!(e.kind, ErrorKind::Exception);
            assert_eq!(e.description, "intentional failure");
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(result_value(&good), 3);
    assert_eq!(Net::count(&net.a_log, "return:exception"), 1);

    drop((boot, bad, good));
    net.pump();
    assert!(net.a.is_idle());
    assert!(net.b.is_idle());
}

#[test]
fn cancellation_sends_finish_and_suppresses_the_callback() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    net.pump();
    net.clear_logs();

    let r = boot.call(TEST_INTERFACE, NEVER, data(0));
    let fired = Rc::new(Cell::new(false));
    let fired2 = fired.clone();
    r.when_resolved(move |_| fired2.set(true));
    drop(r);

    assert_eq!(
        *net.b_log.borrow(),
        vec!["call:import".to_string(), "finish:release=true".to_string()]
    );
    net.pump();
    assert_eq!(Net::count(&net.a_log, "return:canceled"), 1);
    assert!(!fired.get());

    // The server's method body finishing later is absorbed quietly.
    let resolver = peer.hung.borrow_mut().pop().unwrap();
    resolver.resolve(Ok(data(9)));
    net.pump();
    assert!(!fired.get());

    drop(boot);
    net.pump();
    assert!(net.a.is_idle(), "server tables leak: {:?}", net.a.counts());
    assert!(net.b.is_idle(), "client tables leak: {:?}", net.b.counts());
}

#[test]
fn abort_fails_outstanding_questions() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    let boot = net.b.bootstrap();
    let r = boot.call(TEST_INTERFACE, PING, data(1));
    net.b.abort(Error::disconnected("test shutdown"));

    match r.response() {
        Some(Err(e)) => assert_eq!(e.kind, ErrorKind::Exception),
        other => panic!("unexpected response: {other:?}"),
    }
    assert!(net.b.is_idle());

    // Calls on capabilities of the dead session fail immediately.
    let after = boot.call(TEST_INTERFACE, PING, data(2));
    assert!(matches!(after.response(), Some(Err(_))));
}

#[test]
fn unknown_ids_are_fatal() {
    let net = connect(Config::default(), Config::default());
    let result = net.b.handle_frame(Frame::Return {
        answer_id: 99,
        which: Return::Canceled,
    });
    match result {
        Err(e) => assert_eq!(e.kind, ErrorKind::Protocol),
        Ok(()) => panic!("expected a protocol error"),
    }
    assert!(net.b.is_idle());
}

#[test]
fn third_party_caps_are_rejected() {
    let peer = Rc::new(TestPeer::default());
    let net = connect(test_peer_config(&peer), Config::default());

    net.a.handle_frame(Frame::Bootstrap { question_id: 0 }).unwrap();
    let result = net.a.handle_frame(Frame::Call {
        question_id: 1,
        target: MessageTarget::PromisedAnswer {
            question_id: 0,
            transform: Default::default(),
        },
        interface_id: TEST_INTERFACE,
        method_id: PING,
        params: WirePayload {
            body: Rc::new(TestContent {
                value: 0,
                slots: Vec::new(),
            }),
            cap_table: vec![CapDescriptor::ThirdPartyHosted],
        },
    });
    match result {
        Err(e) => assert_eq!(e.kind, ErrorKind::Protocol),
        Ok(()) => panic!("expected a protocol error"),
    }
}

#[test]
fn third_party_tail_calls_are_rejected_at_construction() {
    let result = Session::new(
        Box::new(Pipe::new()),
        Config {
            allow_third_party_tail_call: true,
            ..Config::default()
        },
    );
    assert!(result.is_err());
}

#[test]
fn drive_runs_a_session_over_channels() {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let (to_b, mut b_source) = captp::twoparty::channel();
        let (to_a, mut a_source) = captp::twoparty::channel();

        let peer = Rc::new(TestPeer::default());
        let a = Rc::new(Session::new(Box::new(to_b), test_peer_config(&peer)).unwrap());
        let b = Rc::new(Session::new(Box::new(to_a), Config::default()).unwrap());

        let a2 = a.clone();
        tokio::task::spawn_local(async move {
            let _ = captp::twoparty::drive(&a2, &mut a_source).await;
        });
        let b2 = b.clone();
        tokio::task::spawn_local(async move {
            let _ = captp::twoparty::drive(&b2, &mut b_source).await;
        });

        let boot = b.bootstrap();
        let payload = boot
            .call(TEST_INTERFACE, PING, data(11))
            .promise()
            .await
            .unwrap();
        assert_eq!(value_of(&payload), 11);
    });
}
