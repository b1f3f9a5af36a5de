use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use caman_protocol::{AppMessage, CaError, CaMessage, Destination, Message};

use super::*;
use crate::plugin::TableTiming;
use crate::testutil::{cat_section, packetize, pat_section, pmt_section, MockPlugin, PluginCall};

fn fast_params() -> TsParams {
    TsParams {
        pat: TableTiming::from_millis(200, 5),
        pmt: TableTiming::from_millis(200, 5),
        cat: TableTiming::from_millis(50, 5),
        ..TsParams::default()
    }
}

fn manager_with(plugins: &[(&str, &Arc<MockPlugin>)]) -> CaManager {
    let manager = CaManager::new();
    manager.open(fast_params()).unwrap();
    for (name, plugin) in plugins {
        manager
            .register_ca(name, Arc::clone(plugin) as Arc<dyn CaPlugin>, CaOptions::default())
            .unwrap();
        manager.open_ca(name).unwrap();
    }
    manager
}

fn raw(id: u32) -> CaMessage {
    CaMessage::Raw {
        tag: "test".into(),
        data: id.to_be_bytes().to_vec(),
    }
}

fn raw_id(msg: &Message) -> u32 {
    match &msg.body {
        CaMessage::Raw { data, .. } => u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
        other => panic!("unexpected message {:?}", other),
    }
}

#[test]
fn test_start_update_stop() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);

    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();
    assert_eq!(
        plugin.starts(),
        vec![PluginCall::StartPmt {
            service_id: 101,
            version: 0
        }]
    );
    let binding = manager.binding(101).unwrap();
    assert_eq!(binding.ca_name.as_deref(), Some("ciA"));
    assert!(binding.seen);
    assert!(!binding.forced);

    // a new PMT version is delivered to the same plug-in
    manager.feed_section(&pmt_section(101, 1, &[0x0500])).unwrap();
    assert_eq!(plugin.starts().len(), 2);
    assert_eq!(
        plugin.starts()[1],
        PluginCall::StartPmt {
            service_id: 101,
            version: 1
        }
    );

    // the same section again changes nothing
    manager.feed_section(&pmt_section(101, 1, &[0x0500])).unwrap();
    assert_eq!(plugin.starts().len(), 2);

    manager.stop_service(101).unwrap();
    assert_eq!(plugin.stops(), vec![101]);
    assert!(manager.binding(101).is_none());

    manager.stop_service(101).unwrap();
    assert_eq!(plugin.stops(), vec![101]);
}

#[test]
fn test_start_from_packets_fed_by_another_thread() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = CaManager::new();
    manager
        .open(TsParams {
            pat: TableTiming::from_millis(2000, 5),
            pmt: TableTiming::from_millis(2000, 5),
            ..TsParams::default()
        })
        .unwrap();
    manager
        .register_ca("ciA", plugin.clone(), CaOptions::default())
        .unwrap();
    manager.open_ca("ciA").unwrap();

    let mut ts = packetize(0x0000, 0, &pat_section(1, 0, &[(101, 0x0101)]));
    ts.extend(packetize(0x0101, 0, &pmt_section(101, 0, &[0x0500])));

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(20));
            manager.feed(&ts).unwrap();
        });
        manager.start_service(101, None).unwrap();
    });

    assert_eq!(manager.known_services(), vec![101]);
    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("ciA"));
}

#[test]
fn test_feeding_other_services_while_start_waits() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = CaManager::new();
    manager
        .open(TsParams {
            pat: TableTiming::from_millis(2000, 5),
            pmt: TableTiming::from_millis(2000, 5),
            cat: TableTiming::from_millis(50, 5),
            ..TsParams::default()
        })
        .unwrap();
    manager
        .register_ca("soft", plugin.clone(), CaOptions::default())
        .unwrap();
    manager.open_ca("soft").unwrap();
    manager.feed_section(&pmt_section(102, 0, &[0x0500])).unwrap();
    manager.start_service(102, None).unwrap();

    // PAT and an update of the bound service 102 first, then the awaited PMT
    let mut first = packetize(0x0000, 0, &pat_section(1, 0, &[(101, 0x0101), (102, 0x0102)]));
    first.extend(packetize(0x0102, 0, &pmt_section(102, 1, &[0x0500])));
    let second = packetize(0x0101, 0, &pmt_section(101, 0, &[0x0500]));

    let started = std::time::Instant::now();
    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(Duration::from_millis(20));
            manager.feed(&first).unwrap();
            manager.feed(&second).unwrap();
        });
        manager.start_service(101, None).unwrap();
    });

    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("soft"));
    assert!(plugin.starts().contains(&PluginCall::StartPmt {
        service_id: 102,
        version: 1
    }));
}

#[test]
fn test_forced_unknown_ca_is_not_found() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();

    let result = manager.start_service(101, Some("unknownCA"));
    assert!(matches!(result, Err(CaError::NotFound(name)) if name == "unknownCA"));
    assert!(manager.binding(101).is_none());
    assert!(plugin.starts().is_empty());
    assert_eq!(manager.queued_messages(), 0);
}

#[test]
fn test_forced_binding_ignores_auto_match() {
    let manual = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[]);
    manager
        .register_ca("manual", manual.clone(), CaOptions { auto_match: false })
        .unwrap();
    manager.open_ca("manual").unwrap();
    manager.feed_section(&pmt_section(102, 0, &[0x0500])).unwrap();

    assert!(matches!(
        manager.start_service(102, None),
        Err(CaError::NotSupported)
    ));
    manager.start_service(102, Some("manual")).unwrap();
    let binding = manager.binding(102).unwrap();
    assert_eq!(binding.ca_name.as_deref(), Some("manual"));
    assert!(binding.forced);

    // updates stay on the forced plug-in
    manager.feed_section(&pmt_section(102, 1, &[0x0500])).unwrap();
    assert_eq!(manual.starts().len(), 2);
}

#[test]
fn test_registration_errors() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);

    assert!(matches!(
        manager.register_ca("ciA", plugin.clone(), CaOptions::default()),
        Err(CaError::AlreadyExists(_))
    ));
    assert!(matches!(
        manager.register_ca("", plugin.clone(), CaOptions::default()),
        Err(CaError::BadParam(_))
    ));
    assert!(matches!(
        manager.unregister_ca("ciB"),
        Err(CaError::NotFound(_))
    ));
    assert!(matches!(manager.open_ca("ciA"), Err(CaError::AlreadyOpen)));
    assert!(matches!(manager.open_ca("ciB"), Err(CaError::NotFound(_))));
}

#[test]
fn test_first_match_in_registration_order() {
    let skipped = MockPlugin::new(&[0x0500]);
    let first = MockPlugin::new(&[0x0100, 0x0500]);
    let second = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[]);
    manager
        .register_ca("skipped", skipped.clone(), CaOptions { auto_match: false })
        .unwrap();
    manager.open_ca("skipped").unwrap();
    for (name, plugin) in [("first", &first), ("second", &second)] {
        manager
            .register_ca(name, Arc::clone(plugin) as Arc<dyn CaPlugin>, CaOptions::default())
            .unwrap();
        manager.open_ca(name).unwrap();
    }

    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();

    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("first"));
    assert_eq!(first.starts().len(), 1);
    assert!(skipped.starts().is_empty());
    assert!(second.starts().is_empty());
}

#[test]
fn test_disabled_plugin_is_not_matched() {
    let first = MockPlugin::new(&[0x0500]);
    let second = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("first", &first), ("second", &second)]);
    manager.enable_ca("first", false).unwrap();

    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();
    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("second"));
    assert!(matches!(
        manager.start_service(101, Some("first")),
        Err(CaError::Disabled(_))
    ));
    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("second"));
    assert!(second.stops().is_empty());
}

#[test]
fn test_clear_service_stays_unbound() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(103, 0, &[])).unwrap();

    manager.start_service(103, None).unwrap();
    let binding = manager.binding(103).unwrap();
    assert_eq!(binding.ca_name, None);
    assert!(plugin.starts().is_empty());

    // becoming scrambled binds it
    manager.feed_section(&pmt_section(103, 1, &[0x0500])).unwrap();
    assert_eq!(manager.binding(103).unwrap().ca_name.as_deref(), Some("ciA"));

    manager.stop_service(103).unwrap();
    assert_eq!(plugin.stops(), vec![103]);
}

#[test]
fn test_no_match_is_not_supported() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x1234])).unwrap();

    assert!(matches!(
        manager.start_service(101, None),
        Err(CaError::NotSupported)
    ));
    assert!(manager.binding(101).is_none());
}

#[test]
fn test_cat_systems_take_part_in_matching() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&cat_section(0, &[0x0500])).unwrap();
    manager.feed_section(&pmt_section(101, 0, &[0x1234])).unwrap();

    manager.start_service(101, None).unwrap();
    assert_eq!(manager.binding(101).unwrap().ca_name.as_deref(), Some("ciA"));
    assert!(plugin.calls().contains(&PluginCall::NewCat));
}

#[test]
fn test_rejected_start_leaves_no_binding() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    plugin.reject_start(true);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();

    assert!(matches!(
        manager.start_service(101, None),
        Err(CaError::NotSupported)
    ));
    assert!(manager.binding(101).is_none());
}

#[test]
fn test_pmt_wait_errors() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);

    // nothing at all
    assert!(matches!(
        manager.start_service(101, None),
        Err(CaError::Timeout)
    ));

    manager
        .feed_section(&pat_section(1, 0, &[(101, 0x0101)]))
        .unwrap();
    assert!(matches!(
        manager.start_service(202, None),
        Err(CaError::BadParam(_))
    ));
    assert!(matches!(
        manager.start_service(101, None),
        Err(CaError::Timeout)
    ));
}

#[test]
fn test_pause_defers_requests() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.feed_section(&pmt_section(102, 0, &[0x0500])).unwrap();

    manager.pause().unwrap();
    assert!(manager.is_paused());
    manager.start_service(101, None).unwrap();
    manager.start_service(102, None).unwrap();
    manager.stop_service(102).unwrap();
    // discarded while paused
    manager.feed_section(&pmt_section(101, 1, &[0x0500])).unwrap();
    assert!(plugin.starts().is_empty());

    manager.resume().unwrap();
    assert!(!manager.is_paused());
    assert_eq!(
        plugin.starts(),
        vec![PluginCall::StartPmt {
            service_id: 101,
            version: 0
        }]
    );
    assert!(manager.binding(102).is_none());
    assert!(plugin.stops().is_empty());
}

#[test]
fn test_ci_slot_serves_one_service() {
    let plugin = MockPlugin::ci(&[0x0500]);
    let manager = manager_with(&[("ci0", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.feed_section(&pmt_section(102, 0, &[0x0500])).unwrap();

    manager.start_service(101, None).unwrap();
    manager.start_service(102, None).unwrap();

    assert_eq!(plugin.stops(), vec![101]);
    assert!(manager.binding(101).is_none());
    assert_eq!(manager.binding(102).unwrap().ca_name.as_deref(), Some("ci0"));
}

#[test]
fn test_logical_plugin_serves_many_services() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("soft", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.feed_section(&pmt_section(102, 0, &[0x0500])).unwrap();

    manager.start_service(101, None).unwrap();
    manager.start_service(102, None).unwrap();
    assert!(plugin.stops().is_empty());
    assert_eq!(manager.bindings().len(), 2);
    assert_eq!(manager.bindings()[0].service_id, 101);
}

#[test]
fn test_stream_change_drops_bindings() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager
        .feed_section(&pat_section(1, 0, &[(101, 0x0101)]))
        .unwrap();
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();

    manager
        .feed_section(&pat_section(2, 0, &[(101, 0x0101)]))
        .unwrap();
    assert!(manager.bindings().is_empty());
    assert!(manager.known_services().is_empty());
    assert!(plugin.calls().contains(&PluginCall::TsChanged));

    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();
    plugin.clear_calls();
    manager.ts_changed().unwrap();
    assert!(manager.bindings().is_empty());
    assert_eq!(plugin.calls(), vec![PluginCall::TsChanged]);
}

#[test]
fn test_cam_removal_unbinds_and_reaches_app() {
    let plugin = MockPlugin::ci(&[0x0500]);
    let manager = manager_with(&[("ci0", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();

    plugin
        .sender()
        .send(Destination::Manager, CaMessage::CamState { inserted: false })
        .unwrap();
    assert!(manager.binding(101).is_none());

    let msg = manager.get_msg(None, Duration::ZERO).unwrap();
    assert_eq!(msg.dest, Destination::App);
    assert_eq!(msg.body, CaMessage::CamState { inserted: false });
    manager.free_msg(msg);
    assert_eq!(plugin.freed(), 1);
}

#[test]
fn test_plugins_cannot_address_plugins() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    assert!(matches!(
        plugin.sender().send(Destination::Ca, raw(1)),
        Err(CaError::BadParam(_))
    ));
    assert_eq!(manager.queued_messages(), 0);
    assert_eq!(plugin.freed(), 1);
}

#[test]
fn test_callback_or_queue_exactly_once() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let callback: MsgCallback = Arc::new(move |msg: Message| sink.lock().push(msg));
    manager.set_callback(Some("ciA"), Some(callback));
    plugin.sender().send(Destination::App, raw(1)).unwrap();
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(manager.queued_messages(), 0);

    manager.set_callback(Some("ciA"), None);
    plugin.sender().send(Destination::App, raw(2)).unwrap();
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(manager.queued_messages(), 1);

    let msg = manager.get_msg(Some("ciA"), Duration::ZERO).unwrap();
    assert_eq!(raw_id(&msg), 2);
    manager.free_msg(msg);
    assert!(matches!(
        manager.get_msg(None, Duration::from_millis(10)),
        Err(CaError::Timeout)
    ));

    for msg in seen.lock().drain(..) {
        manager.free_msg(msg);
    }
    assert_eq!(plugin.freed(), 2);
}

#[test]
fn test_default_callback_yields_to_named_one() {
    let a = MockPlugin::new(&[0x0500]);
    let b = MockPlugin::new(&[0x0600]);
    let manager = manager_with(&[("a", &a), ("b", &b)]);
    let named = Arc::new(Mutex::new(0usize));
    let fallback = Arc::new(Mutex::new(0usize));

    let count = Arc::clone(&named);
    manager.set_callback(Some("a"), Some(Arc::new(move |_: Message| *count.lock() += 1)));
    let count = Arc::clone(&fallback);
    manager.set_callback(None, Some(Arc::new(move |_: Message| *count.lock() += 1)));

    a.sender().send(Destination::App, raw(1)).unwrap();
    b.sender().send(Destination::App, raw(2)).unwrap();
    assert_eq!(*named.lock(), 1);
    assert_eq!(*fallback.lock(), 1);
}

#[test]
fn test_disabled_plugin_cannot_send() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.enable_ca("ciA", false).unwrap();

    assert!(matches!(
        plugin.sender().send(Destination::App, raw(1)),
        Err(CaError::Disabled(_))
    ));
    assert!(matches!(
        manager.put_msg(Some("ciA"), AppMessage::GetCaInfo),
        Err(CaError::Disabled(_))
    ));
    assert_eq!(manager.queued_messages(), 0);
    // the refused message went back to its producer
    assert_eq!(plugin.freed(), 1);

    manager.enable_ca("ciA", true).unwrap();
    plugin.sender().send(Destination::App, raw(1)).unwrap();
    assert_eq!(manager.queued_messages(), 1);
}

#[test]
fn test_put_msg_broadcast() {
    let a = MockPlugin::new(&[0x0500]);
    let b = MockPlugin::new(&[0x0600]);
    let manager = manager_with(&[("a", &a), ("b", &b)]);

    manager.put_msg(None, AppMessage::GetCaInfo).unwrap();
    let received = PluginCall::Receive(AppMessage::GetCaInfo.message_type());
    assert!(a.calls().contains(&received));
    assert!(b.calls().contains(&received));

    assert!(matches!(
        manager.put_msg(Some("c"), AppMessage::GetCaInfo),
        Err(CaError::NotFound(_))
    ));
}

#[test]
fn test_unregister_frees_queued_messages() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    let sender = plugin.sender();
    sender.send(Destination::App, raw(1)).unwrap();
    sender.send(Destination::App, raw(2)).unwrap();

    manager.unregister_ca("ciA").unwrap();
    assert_eq!(plugin.freed(), 2);
    assert_eq!(manager.queued_messages(), 0);
    assert!(plugin.calls().contains(&PluginCall::Close));
    assert!(manager.plugins().is_empty());
    assert!(matches!(
        sender.send(Destination::App, raw(3)),
        Err(CaError::NotFound(_))
    ));
}

#[test]
fn test_unregister_stops_served_services() {
    let plugin = MockPlugin::ci(&[0x0500]);
    let manager = manager_with(&[("ci0", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();
    plugin.clear_calls();

    manager.unregister_ca("ci0").unwrap();
    assert_eq!(
        plugin.calls(),
        vec![
            PluginCall::StopPmt(101),
            PluginCall::Enable(false),
            PluginCall::Close
        ]
    );
    assert!(manager.binding(101).is_none());
    assert!(manager.plugins().is_empty());
}

#[test]
fn test_close_stops_services_and_plugins() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();
    plugin.clear_calls();

    manager.close().unwrap();
    assert_eq!(
        plugin.calls(),
        vec![
            PluginCall::StopPmt(101),
            PluginCall::Enable(false),
            PluginCall::Close
        ]
    );
    assert!(!manager.is_open());
    assert_eq!(manager.plugins()[0].state, PluginState::Registered);
    manager.close().unwrap();

    assert!(matches!(
        manager.start_service(101, None),
        Err(CaError::NotOpen)
    ));
    assert!(matches!(manager.feed(&[]), Err(CaError::NotOpen)));
    assert!(matches!(manager.open_ca("ciA"), Err(CaError::NotOpen)));
}

#[test]
fn test_close_ca_unbinds_without_stop() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    manager.feed_section(&pmt_section(101, 0, &[0x0500])).unwrap();
    manager.start_service(101, None).unwrap();

    manager.close_ca("ciA").unwrap();
    assert!(plugin.stops().is_empty());
    assert!(manager.binding(101).is_none());
    assert!(matches!(manager.close_ca("ciA"), Err(CaError::NotOpen)));

    manager.open_ca("ciA").unwrap();
    manager.start_service(101, None).unwrap();
    manager.stop_ca("ciA").unwrap();
    assert_eq!(plugin.stops(), vec![101]);
}

#[test]
fn test_sender_outliving_manager() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    let sender = plugin.sender();
    drop(manager);

    assert!(matches!(
        sender.send(Destination::App, raw(1)),
        Err(CaError::Unavailable(_))
    ));
}

#[test]
fn test_queue_overflow_frees_oldest() {
    let plugin = MockPlugin::new(&[0x0500]);
    let manager = manager_with(&[("ciA", &plugin)]);
    let sender = plugin.sender();
    for id in 0..MAX_QUEUED_MESSAGES as u32 + 3 {
        sender.send(Destination::App, raw(id)).unwrap();
    }

    assert_eq!(plugin.freed(), 3);
    assert_eq!(manager.queued_messages(), MAX_QUEUED_MESSAGES);
    let msg = manager.get_msg(None, Duration::ZERO).unwrap();
    assert_eq!(raw_id(&msg), 3);
    manager.free_msg(msg);
}

#[test]
fn test_random_message_traffic_frees_each_message_once() {
    let a = MockPlugin::new(&[0x0500]);
    let b = MockPlugin::new(&[0x0600]);
    let manager = manager_with(&[("a", &a), ("b", &b)]);
    let senders = [a.sender(), b.sender()];
    let inbox: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let mut rng = StdRng::seed_from_u64(0x0CA0_0500);

    let mut next_id = 0u32;
    let mut taken = HashSet::new();
    let mut take = |msg: &Message| assert!(taken.insert(raw_id(msg)), "message taken twice");

    for _ in 0..10_000 {
        match rng.gen_range(0..6) {
            0 | 1 => {
                let sender = &senders[rng.gen_range(0..senders.len())];
                sender.send(Destination::App, raw(next_id)).unwrap();
                next_id += 1;
            }
            2 => {
                let filter = match rng.gen_range(0..3) {
                    0 => Some("a"),
                    1 => Some("b"),
                    _ => None,
                };
                if let Ok(msg) = manager.get_msg(filter, Duration::ZERO) {
                    if let Some(name) = filter {
                        assert_eq!(msg.ca_name, name);
                    }
                    take(&msg);
                    manager.free_msg(msg);
                }
            }
            3 => {
                let callback = if rng.gen_bool(0.5) {
                    let inbox = Arc::clone(&inbox);
                    let callback: MsgCallback = Arc::new(move |msg: Message| inbox.lock().push(msg));
                    Some(callback)
                } else {
                    None
                };
                let name = match rng.gen_range(0..3) {
                    0 => Some("a"),
                    1 => Some("b"),
                    _ => None,
                };
                manager.set_callback(name, callback);
            }
            _ => {
                let pending: Vec<Message> = inbox.lock().drain(..).collect();
                for msg in pending {
                    take(&msg);
                    manager.free_msg(msg);
                }
            }
        }
    }

    for name in [Some("a"), Some("b"), None] {
        manager.set_callback(name, None);
    }
    while let Ok(msg) = manager.get_msg(None, Duration::ZERO) {
        take(&msg);
        manager.free_msg(msg);
    }
    let pending: Vec<Message> = inbox.lock().drain(..).collect();
    for msg in pending {
        take(&msg);
        manager.free_msg(msg);
    }

    assert_eq!(a.freed() + b.freed(), next_id as usize);
}
