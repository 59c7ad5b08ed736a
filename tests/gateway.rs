//! End-to-end gateway scenarios over in-process pipes and the memory
//! store: a client connection on one side, the broker and a callee pool
//! on the other.

use std::sync::Arc;
use std::time::{Duration, Instant};

use may::sync::Mutex;
use serde_json::json;

use juggler::broker::CalleeBroker;
use juggler::msg::{CallPayload, CODE_CAPACITY_EXCEEDED};
use juggler::{
    Callee, Client, ClientConfig, Conn, Error, Kind, KvBroker, MemoryStore, Msg, PanicRecover,
    Server,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn gateway(
    configure_broker: impl FnOnce(&mut KvBroker<MemoryStore>),
    configure_srv: impl FnOnce(&mut Server),
) -> (Arc<Server>, Arc<KvBroker<MemoryStore>>) {
    let mut broker = KvBroker::new(Arc::new(MemoryStore::new()));
    broker.blocking_timeout = ms(100);
    configure_broker(&mut broker);
    let broker = Arc::new(broker);
    let mut srv = Server::new(broker.clone(), broker.clone());
    configure_srv(&mut srv);
    (Arc::new(srv), broker)
}

fn connect(srv: &Arc<Server>) -> (Arc<Client>, Arc<Mutex<Vec<Msg>>>, Arc<Conn>) {
    let (gw_side, client_side) = juggler::transport::pipe();
    let conn = srv.clone().serve(Arc::new(gw_side)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let client = Client::connect(
        Arc::new(client_side),
        ClientConfig::default(),
        move |m: Msg| sink.lock().unwrap().push(m),
    );
    (client, seen, conn)
}

fn kinds(seen: &Mutex<Vec<Msg>>) -> Vec<Kind> {
    seen.lock().unwrap().iter().map(Msg::kind).collect()
}

fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(ms(10));
    }
}

fn echo_pool(broker: Arc<KvBroker<MemoryStore>>, workers: usize) -> juggler::callee::CalleePool {
    Callee::new(broker)
        .listen(
            &["echo"],
            workers,
            Arc::new(|cp: &CallPayload| Ok(cp.args.clone())),
        )
        .unwrap()
}

#[test]
fn happy_rpc() {
    let (srv, broker) = gateway(|_| {}, |_| {});
    let _pool = echo_pool(broker, 1);
    let (client, seen, _conn) = connect(&srv);

    let call_uuid = client.call("echo", json!("hi"), ms(1000)).unwrap();

    assert!(wait_until(ms(2000), || {
        kinds(&seen).contains(&Kind::Res)
    }));
    let msgs = seen.lock().unwrap();
    match msgs.iter().find(|m| m.kind() == Kind::Ok).unwrap() {
        Msg::Ok { payload, .. } => assert_eq!(payload.for_uuid, call_uuid),
        _ => unreachable!(),
    }
    match msgs.iter().find(|m| m.kind() == Kind::Res).unwrap() {
        Msg::Res { payload, .. } => {
            assert_eq!(payload.call_uuid, call_uuid);
            assert_eq!(payload.args, json!("hi"));
        }
        _ => unreachable!(),
    }
    drop(msgs);

    // no expiration for an answered call
    std::thread::sleep(ms(1100));
    assert!(!kinds(&seen).contains(&Kind::Exp));
}

#[test]
fn expired_rpc_gets_one_exp_and_the_late_result_is_dropped() {
    let (srv, broker) = gateway(|_| {}, |_| {});
    // no worker pool at all
    let (client, seen, _conn) = connect(&srv);

    let call_uuid = client.call("slow", json!(1), ms(60)).unwrap();

    assert!(wait_until(ms(1000), || {
        kinds(&seen).contains(&Kind::Exp)
    }));

    // a worker finally picks up the call, way too late
    let calls = broker.calls(&["slow"]).unwrap();
    let cp = calls.recv().unwrap();
    assert_eq!(cp.msg_uuid, call_uuid);
    Callee::new(broker)
        .invoke_and_store_result(&cp, &|_: &CallPayload| Ok(json!(1)))
        .unwrap();
    calls.close();

    // the result never reaches the client, and there is exactly one EXP
    std::thread::sleep(ms(300));
    let final_kinds = kinds(&seen);
    assert!(!final_kinds.contains(&Kind::Res));
    assert_eq!(
        final_kinds.iter().filter(|k| **k == Kind::Exp).count(),
        1
    );
}

#[test]
fn over_cap_calls_are_rejected_with_the_capacity_code() {
    let (srv, _broker) = gateway(|b| b.call_cap = 2, |_| {});
    let (client, seen, _conn) = connect(&srv);

    for _ in 0..3 {
        client.call("busy", json!(null), ms(5000)).unwrap();
    }

    assert!(wait_until(ms(1000), || seen.lock().unwrap().len() == 3));
    let msgs = seen.lock().unwrap();
    let oks = msgs.iter().filter(|m| m.kind() == Kind::Ok).count();
    let errs: Vec<_> = msgs
        .iter()
        .filter_map(|m| match m {
            Msg::Err { payload, .. } => Some(payload.code),
            _ => None,
        })
        .collect();
    assert_eq!(oks, 2);
    assert_eq!(errs, vec![CODE_CAPACITY_EXCEEDED]);
}

#[test]
fn panics_are_contained_to_the_poisoned_connection() {
    let (srv, broker) = gateway(
        |_| {},
        |srv| {
            srv.handler = Some(Box::new(PanicRecover {
                inner: |conn: &Arc<Conn>, m: Msg| {
                    if m.kind() == Kind::Pub {
                        panic!("poison message");
                    }
                    juggler::handler::process_msg(conn, m);
                },
                close_conn: true,
                print_stack: false,
            }));
        },
    );
    let _pool = echo_pool(broker, 1);

    let (victim, _victim_seen, victim_conn) = connect(&srv);
    let (healthy, healthy_seen, _healthy_conn) = connect(&srv);

    victim.publish("c", json!(null)).unwrap();

    assert!(victim_conn.wait_close_timeout(ms(1000)));
    match victim_conn.close_err().as_deref() {
        Some(Error::Panic(cause)) => assert_eq!(cause, "poison message"),
        other => panic!("expected panic close cause, got {other:?}"),
    }
    // the gateway tears the victim's transport down
    assert!(victim.wait_close_timeout(ms(1000)));

    // the sibling connection is unaffected
    healthy.call("echo", json!("still here"), ms(1000)).unwrap();
    assert!(wait_until(ms(2000), || {
        kinds(&healthy_seen).contains(&Kind::Res)
    }));
}

#[test]
fn pubsub_fanout_with_patterns() {
    let (srv, _broker) = gateway(|_| {}, |_| {});
    let (sub_client, sub_seen, _sub_conn) = connect(&srv);
    let (pub_client, pub_seen, _pub_conn) = connect(&srv);

    sub_client.subscribe("c", false).unwrap();
    sub_client.subscribe("c.*", true).unwrap();
    // both subscriptions acknowledged before publishing
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).iter().filter(|k| **k == Kind::Ok).count() == 2
    }));

    pub_client.publish("c", json!(42)).unwrap();
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).contains(&Kind::Evnt)
    }));
    {
        let msgs = sub_seen.lock().unwrap();
        match msgs.iter().find(|m| m.kind() == Kind::Evnt).unwrap() {
            Msg::Evnt { payload, .. } => {
                assert_eq!(payload.channel, "c");
                assert_eq!(payload.pattern, None);
                assert_eq!(payload.args, json!(42));
            }
            _ => unreachable!(),
        }
    }

    pub_client.publish("c.x", json!("deep")).unwrap();
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).iter().filter(|k| **k == Kind::Evnt).count() == 2
    }));
    {
        let msgs = sub_seen.lock().unwrap();
        match msgs.iter().filter(|m| m.kind() == Kind::Evnt).nth(1).unwrap() {
            Msg::Evnt { payload, .. } => {
                assert_eq!(payload.channel, "c.x");
                assert_eq!(payload.pattern.as_deref(), Some("c.*"));
                assert_eq!(payload.args, json!("deep"));
            }
            _ => unreachable!(),
        }
    }

    // exactly one event per publication, and none for the publisher
    std::thread::sleep(ms(200));
    assert_eq!(
        kinds(&sub_seen).iter().filter(|k| **k == Kind::Evnt).count(),
        2
    );
    assert!(!kinds(&pub_seen).contains(&Kind::Evnt));
}

#[test]
fn unsubscribe_stops_events() {
    let (srv, _broker) = gateway(|_| {}, |_| {});
    let (sub_client, sub_seen, _sub_conn) = connect(&srv);
    let (pub_client, _pub_seen, _pub_conn) = connect(&srv);

    sub_client.subscribe("c", false).unwrap();
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).contains(&Kind::Ok)
    }));

    pub_client.publish("c", json!(1)).unwrap();
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).contains(&Kind::Evnt)
    }));

    sub_client.unsubscribe("c", false).unwrap();
    assert!(wait_until(ms(1000), || {
        kinds(&sub_seen).iter().filter(|k| **k == Kind::Ok).count() == 2
    }));

    pub_client.publish("c", json!(2)).unwrap();
    std::thread::sleep(ms(300));
    assert_eq!(
        kinds(&sub_seen).iter().filter(|k| **k == Kind::Evnt).count(),
        1
    );
}
