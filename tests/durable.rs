//! The switch over a durable broker with an in-process fallback.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use streamswitch::{
    Broker, CatchupListener, Consumer, DiscardList, DurableStream, DurableStreamConfig,
    HandlerResult, LogBroker, LogBrokerConfig, MemoryStream, Message, MessageHandler, Producer,
    Registration, Result, Sequence, Stream, StreamError, StreamMux, Subject, Switch, SwitchConfig,
};
use tempfile::TempDir;

fn subject(s: &str) -> Subject {
    Subject::parse(s).unwrap()
}

fn broker_config(dir: &TempDir) -> LogBrokerConfig {
    LogBrokerConfig {
        path: dir.path().join("broker"),
        sync_interval: 1,
        create_if_missing: true,
    }
}

struct Projection {
    consumes: Vec<Subject>,
    produces: Vec<Subject>,
    target: Option<Arc<dyn Stream>>,
    seen: Mutex<Vec<(String, u64)>>,
    caught_up: AtomicUsize,
    seen_at_caught_up: AtomicUsize,
}

impl Projection {
    fn new(consumes: &str, produces: Option<&str>, target: Option<Arc<dyn Stream>>) -> Self {
        Self {
            consumes: vec![subject(consumes)],
            produces: produces.into_iter().map(subject).collect(),
            target,
            seen: Mutex::new(Vec::new()),
            caught_up: AtomicUsize::new(0),
            seen_at_caught_up: AtomicUsize::new(0),
        }
    }
}

impl MessageHandler for Projection {
    fn handle_message(&self, msg: &Message) -> HandlerResult {
        self.seen
            .lock()
            .push((msg.subject().to_string(), msg.sequence().0));
        if let (Some(target), Some(produced)) = (&self.target, self.produces.first()) {
            let row: serde_json::Value = msg.decode_body()?;
            target.publish(Message::json(produced.clone(), &row)?)?;
        }
        Ok(())
    }
}

impl Consumer for Projection {
    fn consumes(&self) -> Vec<Subject> {
        self.consumes.clone()
    }
}

impl Producer for Projection {
    fn produces(&self) -> Vec<Subject> {
        self.produces.clone()
    }
}

impl CatchupListener for Projection {
    fn caught_up(&self) {
        self.seen_at_caught_up
            .store(self.seen.lock().len(), Ordering::SeqCst);
        self.caught_up.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_switch_replays_durable_backlog() {
    let dir = TempDir::new().unwrap();

    // Backlog written by an earlier process.
    {
        let broker = Arc::new(LogBroker::create(broker_config(&dir)).unwrap());
        let stream = DurableStream::new(broker);
        for id in 1..=3 {
            let msg = Message::json(subject("team:created"), &serde_json::json!({ "id": id })).unwrap();
            stream.publish(msg).unwrap();
        }
    }

    let broker = Arc::new(LogBroker::open(broker_config(&dir)).unwrap());
    assert_eq!(broker.last_sequence("team").unwrap(), Sequence(3));
    let config = DurableStreamConfig {
        discard: DiscardList::from_reader("team:broken import:2\n".as_bytes()).unwrap(),
        ..Default::default()
    };
    let durable = Arc::new(DurableStream::with_config(broker, config));
    let local: Arc<dyn Stream> = Arc::new(MemoryStream::new());

    let mut mux = StreamMux::new(local.clone());
    mux.handle(durable.clone(), "team").unwrap();

    let teams = Arc::new(Projection::new("team:created", Some("team.table:updated"), Some(local.clone())));
    let table = Arc::new(Projection::new("team.table", None, None));
    let registrations = vec![
        Registration::new(teams.clone()).producer().catchup_listener().build(),
        Registration::new(table.clone()).catchup_listener().build(),
    ];

    let (caught_up_tx, caught_up_rx) = unbounded();
    let switch = Arc::new(
        Switch::new(Arc::new(mux), registrations, SwitchConfig::default())
            .unwrap()
            .on_caught_up(move || {
                let _ = caught_up_tx.send(());
            }),
    );
    let (shutdown, cancel) = Switch::shutdown_channel();
    let handle = {
        let switch = switch.clone();
        thread::spawn(move || switch.run(&cancel))
    };

    caught_up_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        *teams.seen.lock(),
        vec![("team:created".to_string(), 1), ("team:created".to_string(), 3)]
    );
    assert_eq!(teams.caught_up.load(Ordering::SeqCst), 1);
    assert_eq!(table.caught_up.load(Ordering::SeqCst), 1);
    assert_eq!(table.seen.lock().len(), 2);
    assert!(table.seen.lock().iter().all(|(s, seq)| s == "team.table:updated" && *seq == 0));

    let stats = durable.stats();
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.discarded, 1);

    drop(shutdown);
    handle.join().unwrap().unwrap();
}

/// Open the broker, retrying while a previous run still holds the lock.
fn reopen(dir: &TempDir) -> Arc<LogBroker> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match LogBroker::open_or_create(broker_config(dir)) {
            Ok(broker) => return Arc::new(broker),
            Err(StreamError::Locked) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("opening broker: {}", e),
        }
    }
}

fn start(mux: StreamMux, registrations: Vec<Registration>) -> (Sender<()>, JoinHandle<Result<()>>, Receiver<()>) {
    let (caught_up_tx, caught_up_rx) = unbounded();
    let switch = Switch::new(Arc::new(mux), registrations, SwitchConfig::default())
        .unwrap()
        .on_caught_up(move || {
            let _ = caught_up_tx.send(());
        });
    let (shutdown, cancel) = Switch::shutdown_channel();
    let handle = thread::spawn(move || switch.run(&cancel));
    (shutdown, handle, caught_up_rx)
}

/// Models built from services, both domains on the durable broker.
fn model_pipeline(broker: Arc<LogBroker>) -> (Arc<DurableStream<LogBroker>>, Arc<Projection>, Arc<Projection>, StreamMux) {
    let durable = Arc::new(DurableStream::new(broker));
    let mut mux = StreamMux::new(Arc::new(MemoryStream::new()));
    mux.handles(durable.clone(), ["service", "model"]).unwrap();

    let target: Arc<dyn Stream> = durable.clone();
    let models = Arc::new(Projection::new("service:created", Some("model:updated"), Some(target)));
    let viewer = Arc::new(Projection::new("model", None, None));
    (durable, models, viewer, mux)
}

#[test]
fn test_produced_durable_domain_survives_restart() {
    let dir = TempDir::new().unwrap();
    let created = |id: u32| Message::json(subject("service:created"), &serde_json::json!({ "id": id })).unwrap();

    // First run: replay two services, then one live.
    {
        let broker = reopen(&dir);
        let (durable, models, viewer, mux) = model_pipeline(broker.clone());
        durable.publish(created(1)).unwrap();
        durable.publish(created(2)).unwrap();

        let registrations = vec![
            Registration::new(models.clone()).producer().catchup_listener().build(),
            Registration::new(viewer.clone()).catchup_listener().build(),
        ];
        let (shutdown, handle, caught_up) = start(mux, registrations);
        caught_up.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(viewer.caught_up.load(Ordering::SeqCst), 1);

        durable.publish(created(3)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while broker.last_sequence("model").unwrap() < Sequence(3) {
            assert!(Instant::now() < deadline, "live model update never stored");
            thread::sleep(Duration::from_millis(5));
        }
        // The marker published on "model" at catch-up was not stored.
        assert_eq!(broker.last_sequence("model").unwrap(), Sequence(3));

        drop(shutdown);
        handle.join().unwrap().unwrap();
    }

    // Second run: the viewer must replay every stored model before catching up.
    let broker = reopen(&dir);
    let (_durable, models, viewer, mux) = model_pipeline(broker);
    let registrations = vec![
        Registration::new(models).producer().catchup_listener().build(),
        Registration::new(viewer.clone()).catchup_listener().build(),
    ];
    let (shutdown, handle, caught_up) = start(mux, registrations);
    caught_up.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(viewer.caught_up.load(Ordering::SeqCst), 1);
    assert_eq!(viewer.seen_at_caught_up.load(Ordering::SeqCst), 3);
    let seen = viewer.seen.lock().clone();
    assert_eq!(
        seen[..3],
        [
            ("model:updated".to_string(), 1),
            ("model:updated".to_string(), 2),
            ("model:updated".to_string(), 3),
        ]
    );

    drop(shutdown);
    handle.join().unwrap().unwrap();
}
