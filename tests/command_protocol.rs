//! Queue behavior and the textual command protocol, seen from outside the crate.

use speechflow::pipeline::{
    CommandArg, CommandPacket, NotifyPolicy, Packet, PacketKind, PacketQueue, Reply, StageEvent,
    event_channel,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn test_queue_is_fifo_across_threads() {
    let queue = PacketQueue::new();
    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            for t in 1..=100 {
                queue.put(Packet::marker(t, format!("m{}", t)));
            }
        })
    };

    let times: Vec<_> = (0..100).map(|_| queue.get().start()).collect();
    producer.join().unwrap();

    assert_eq!(times, (1..=100).collect::<Vec<_>>());
    assert!(queue.is_empty());
}

#[test]
fn test_bounded_queue_blocks_producer() {
    let queue = PacketQueue::bounded(2);
    queue.put(Packet::marker(1, "a"));
    queue.put(Packet::marker(2, "b"));
    assert!(queue.try_put(Packet::marker(3, "c")).is_err());

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.put(Packet::marker(3, "c")))
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.count(), 2);

    assert_eq!(queue.get().start(), 1);
    assert!(producer.join().unwrap());
    assert_eq!(queue.count(), 2);
}

#[test]
fn test_filter_rejects_other_kinds_silently() {
    let queue = PacketQueue::new();
    assert!(queue.set_filter(PacketKind::Observation));

    assert!(!queue.put(Packet::marker(1, "START")));
    assert!(queue.put(Packet::observation(2, vec![1.0], true)));

    assert_eq!(queue.count(), 1);
    assert_eq!(queue.filter(), Some(PacketKind::Observation));
}

#[test]
fn test_notify_once_per_transition() {
    let queue = PacketQueue::new();
    let (listener, waiter) = event_channel();
    queue.request_notify(listener);

    queue.put(Packet::marker(1, "a"));
    queue.put(Packet::marker(2, "b"));
    assert_eq!(waiter.try_next(), Some(StageEvent::DataArrived(queue.id())));
    assert_eq!(waiter.try_next(), None);

    queue.pop();
    queue.pop();
    queue.put(Packet::marker(3, "c"));
    assert_eq!(waiter.try_next(), Some(StageEvent::DataArrived(queue.id())));
}

#[test]
fn test_notify_every_put() {
    let queue = PacketQueue::new();
    let (listener, waiter) = event_channel();
    queue.request_notify_with(listener, NotifyPolicy::EveryPut);

    for t in 1..=3 {
        queue.put(Packet::marker(t, "x"));
    }
    assert_eq!(waiter.drain(), 3);
}

#[test]
fn test_observer_sees_packets_in_order() {
    let queue = PacketQueue::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    queue.add_observer(move |packet| sink.lock().unwrap().push(packet.start()));

    queue.put(Packet::marker(4, "a"));
    queue.put(Packet::marker(9, "b"));

    assert_eq!(*seen.lock().unwrap(), vec![4, 9]);
    assert_eq!(queue.count(), 2);
}

#[test]
fn test_command_text_round_trip() {
    for text in [
        "start()",
        "setmode(25)",
        r#"usegrp("colors")"#,
        r#"aborted(3,1,"a \"quoted\" word",42.5)"#,
    ] {
        let command = CommandPacket::parse(text).unwrap();
        let again = CommandPacket::parse(&command.to_string()).unwrap();
        assert_eq!(command, again, "round trip of {}", text);
    }
}

#[test]
fn test_command_argument_types() {
    let command = CommandPacket::parse(r#"foo(-3, 0.5, "bar")"#).unwrap();
    assert_eq!(command.name, "foo");
    assert_eq!(
        command.args,
        vec![
            CommandArg::Int(-3),
            CommandArg::Float(0.5),
            CommandArg::Str("bar".to_string()),
        ]
    );
}

#[test]
fn test_malformed_commands_are_errors() {
    for text in ["", "foo", "foo(", "foo(1,)", "(1)", r#"foo("open)"#] {
        assert!(CommandPacket::parse(text).is_err(), "{} should not parse", text);
    }
}

#[test]
fn test_replies_survive_text_form() {
    let replies = [
        Reply::Started { seq: 2, total: 10 },
        Reply::Finished { seq: 2 },
        Reply::Error { seq: 7 },
        Reply::Timeout,
    ];
    for reply in replies {
        let text = reply.to_command().to_string();
        let parsed = CommandPacket::parse(&text).unwrap();
        assert_eq!(Reply::from_command(&parsed), Some(reply));
    }
    assert_eq!(
        Reply::from_command(&CommandPacket::parse("start()").unwrap()),
        None
    );
}
