#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    neuron_channels::{RecordingOutbound, RequestContext},
    neuron_commands::Command,
    neuron_common::{
        CapabilitySet, InboundMessage,
        events::{DispatchEvent, EventBus, EventHandler, EventKind},
    },
    neuron_config::NeuronConfig,
    neuron_conversation::{
        DialogFlow, DialogOutcome, DialogStep, DialogStore, InMemoryDialogStore, ReplyWaiter,
    },
    neuron_dispatch::{DispatchOutcome, Dispatcher, DispatcherBuilder},
    neuron_middleware::middleware_fn,
    serde_json::json,
    tokio::sync::mpsc,
};

#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<DispatchEvent>>,
}

impl EventLog {
    fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(DispatchEvent::kind).collect()
    }
}

#[async_trait]
impl EventHandler for EventLog {
    fn name(&self) -> &str {
        "event-log"
    }

    fn events(&self) -> &[EventKind] {
        &[
            EventKind::MessageRateLimited,
            EventKind::CommandExecuted,
            EventKind::CommandDenied,
            EventKind::CommandFailed,
            EventKind::MiddlewareFailed,
            EventKind::DialogCompleted,
            EventKind::DialogCancelled,
        ]
    }

    async fn handle(&self, event: &DispatchEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Bot {
    outbound: Arc<RecordingOutbound>,
    log: Arc<EventLog>,
    builder: DispatcherBuilder,
}

fn bot() -> Bot {
    let outbound = Arc::new(RecordingOutbound::new());
    let log = Arc::new(EventLog::default());
    let mut events = EventBus::new();
    events.register(log.clone());
    let builder = DispatcherBuilder::with_events(NeuronConfig::default(), outbound.clone(), events);
    Bot {
        outbound,
        log,
        builder,
    }
}

type Ready = std::future::Ready<anyhow::Result<()>>;

/// Handler that only counts its invocations.
fn counting(calls: &Arc<AtomicUsize>) -> impl Fn(RequestContext) -> Ready + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

fn msg(channel: &str, author: &str, content: &str) -> InboundMessage {
    InboundMessage::new(channel, author, content)
}

#[tokio::test]
async fn ping_is_handled_once_without_denial() {
    let mut bot = bot();
    let calls = Arc::new(AtomicUsize::new(0));
    bot.builder
        .register(Command::new("ping").run(counting(&calls)))
        .unwrap();
    let dispatcher = bot.builder.build();

    let outcome = dispatcher.dispatch(msg("C", "U", "!ping")).await;

    assert_eq!(outcome, DispatchOutcome::Handled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bot.log.kinds(), vec![EventKind::CommandExecuted]);
}

#[tokio::test]
async fn kick_without_capability_is_denied() {
    let mut bot = bot();
    let calls = Arc::new(AtomicUsize::new(0));
    bot.builder
        .register(Command::new("kick").requires("MODERATE").run(counting(&calls)))
        .unwrap();
    let dispatcher = bot.builder.build();

    let empty = msg("C", "U", "!kick bob").with_capabilities(CapabilitySet::new());
    let outcome = dispatcher.dispatch(empty).await;

    assert_eq!(outcome, DispatchOutcome::Denied);
    assert!(outcome.is_handled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let events = bot.log.events.lock().unwrap().clone();
    assert!(matches!(
        &events[..],
        [DispatchEvent::CommandDenied { command, missing, .. }]
            if command == "kick" && missing == &vec!["MODERATE".to_string()]
    ));
    assert_eq!(bot.outbound.texts_for("C"), vec![
        NeuronConfig::default().commands.denied_message
    ]);

    let moderator: CapabilitySet = ["MODERATE"].into_iter().collect();
    let outcome = dispatcher
        .dispatch(msg("C", "M", "!kick bob").with_capabilities(moderator))
        .await;
    assert_eq!(outcome, DispatchOutcome::Handled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chatter_bots_and_bursts_are_filtered() {
    let mut bot = bot();
    bot.builder
        .register(Command::new("ping").run(|_ctx| async { Ok::<(), anyhow::Error>(()) }))
        .unwrap();
    let dispatcher = bot.builder.build();

    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "hello there")).await,
        DispatchOutcome::Unhandled
    );
    assert_eq!(
        dispatcher.dispatch(msg("C", "B", "!ping").from_bot()).await,
        DispatchOutcome::Ignored
    );

    // One token already spent on the chatter above.
    for _ in 0..4 {
        assert_eq!(
            dispatcher.dispatch(msg("C", "U", "!ping")).await,
            DispatchOutcome::Handled
        );
    }
    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "!ping")).await,
        DispatchOutcome::RateLimited
    );
    assert_eq!(
        dispatcher.dispatch(msg("C", "other", "!ping")).await,
        DispatchOutcome::Handled
    );
    assert!(bot.log.kinds().contains(&EventKind::MessageRateLimited));

    let snapshot = dispatcher.stats_snapshot();
    assert!(snapshot.contains(&("messages.handled".to_string(), 5)));
    assert!(snapshot.contains(&("messages.rate_limited".to_string(), 1)));
}

#[tokio::test]
async fn middleware_can_block_and_failures_are_contained() {
    let mut bot = bot();
    let calls = Arc::new(AtomicUsize::new(0));
    bot.builder
        .register(Command::new("ping").run(counting(&calls)))
        .unwrap();
    bot.builder
        .middleware(middleware_fn("explode", |ctx, next| {
            Box::pin(async move {
                if ctx.message.content.contains("explode") {
                    anyhow::bail!("middleware exploded");
                }
                next.run(ctx).await
            })
        }))
        .middleware(middleware_fn("mute", |ctx, next| {
            Box::pin(async move {
                if ctx.message.author_id == "muted" {
                    return Ok(());
                }
                next.run(ctx).await
            })
        }));
    let dispatcher = bot.builder.build();

    assert_eq!(
        dispatcher.dispatch(msg("C", "muted", "!ping")).await,
        DispatchOutcome::Blocked
    );
    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "!ping explode")).await,
        DispatchOutcome::MiddlewareFailed
    );
    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "!ping")).await,
        DispatchOutcome::Handled
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(bot.log.kinds().contains(&EventKind::MiddlewareFailed));
}

#[tokio::test]
async fn handler_faults_do_not_stop_dispatch() {
    let mut bot = bot();
    bot.builder
        .register(Command::new("boom").run(|_ctx| async { Err::<(), _>(anyhow::anyhow!("handler broke")) }))
        .unwrap();
    bot.builder
        .register(Command::new("ping").run(|ctx| async move {
            ctx.reply("pong").await;
            Ok::<(), anyhow::Error>(())
        }))
        .unwrap();
    let dispatcher = bot.builder.build();

    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "!boom")).await,
        DispatchOutcome::Failed
    );
    assert_eq!(
        dispatcher.dispatch(msg("C", "U", "!ping")).await,
        DispatchOutcome::Handled
    );
    assert_eq!(bot.outbound.texts_for("C"), vec!["pong"]);
    assert_eq!(bot.log.kinds(), vec![
        EventKind::CommandFailed,
        EventKind::CommandExecuted
    ]);
}

/// A bot with a `!profile` command running a two-step dialog; finished
/// outcomes land in the returned vector.
struct DialogBot {
    outbound: Arc<RecordingOutbound>,
    store: Arc<InMemoryDialogStore>,
    waiter: ReplyWaiter,
    outcomes: Arc<Mutex<Vec<DialogOutcome>>>,
    dispatcher: Arc<Dispatcher>,
}

fn dialog_bot() -> DialogBot {
    let mut bot = bot();
    let store = Arc::new(InMemoryDialogStore::new());
    let engine = bot.builder.dialog_engine(store.clone());
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let flow = DialogFlow::new("profile")
        .step(DialogStep::new("name", "What is your name?"))
        .step(DialogStep::new("age", "How old are you?"));

    let sink = Arc::clone(&outcomes);
    bot.builder
        .register(Command::new("profile").run(move |ctx| {
            let engine = engine.clone();
            let flow = flow.clone();
            let sink = Arc::clone(&sink);
            async move {
                let outcome = engine
                    .start(&flow, ctx.channel_id(), ctx.author_id())
                    .await?;
                sink.lock().unwrap().push(outcome);
                Ok::<(), anyhow::Error>(())
            }
        }))
        .unwrap();

    let waiter = bot.builder.waiter().clone();
    DialogBot {
        outbound: bot.outbound,
        store,
        waiter,
        outcomes,
        dispatcher: Arc::new(bot.builder.build()),
    }
}

async fn until(mut ready: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if ready() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn two_step_dialog_completes_through_the_serve_loop() {
    let bot = dialog_bot();
    let (tx, rx) = mpsc::channel(16);
    let dispatcher = Arc::clone(&bot.dispatcher);
    let server = tokio::spawn(async move { dispatcher.serve(rx).await });

    tx.send(msg("C", "U", "!profile")).await.unwrap();
    until(|| bot.waiter.has_pending("C")).await;
    tx.send(msg("C", "U", "Alice")).await.unwrap();
    until(|| {
        bot.outbound
            .texts_for("C")
            .contains(&"How old are you?".to_string())
            && bot.waiter.has_pending("C")
    })
    .await;
    tx.send(msg("C", "U", "30")).await.unwrap();
    until(|| !bot.outcomes.lock().unwrap().is_empty()).await;

    let outcome = bot.outcomes.lock().unwrap()[0].clone();
    let DialogOutcome::Completed(data) = outcome else {
        panic!("dialog was cancelled");
    };
    assert_eq!(serde_json::Value::Object(data), json!({"name": "Alice", "age": "30"}));
    assert!(bot.store.get("dialog:profile:U").await.unwrap().is_none());
    assert_eq!(
        bot.dispatcher
            .stats()
            .count(DispatchOutcome::ReplyDelivered),
        2
    );

    drop(tx);
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unanswered_dialog_times_out_and_cleans_up() {
    let bot = dialog_bot();
    let (tx, rx) = mpsc::channel(16);
    let dispatcher = Arc::clone(&bot.dispatcher);
    let server = tokio::spawn(async move { dispatcher.serve(rx).await });

    tx.send(msg("C", "U", "!profile")).await.unwrap();
    until(|| bot.waiter.has_pending("C")).await;
    assert!(bot.store.get("dialog:profile:U").await.unwrap().is_some());

    until(|| !bot.outcomes.lock().unwrap().is_empty()).await;

    assert_eq!(bot.outcomes.lock().unwrap()[0], DialogOutcome::Cancelled);
    assert!(bot.store.is_empty());
    assert!(!bot.waiter.has_pending("C"));
    assert_eq!(bot.outbound.texts_for("C"), vec![
        "What is your name?",
        "Timed out waiting for reply."
    ]);

    // A late reply is ordinary chatter now.
    assert_eq!(
        bot.dispatcher.dispatch(msg("C", "U", "Alice")).await,
        DispatchOutcome::Unhandled
    );

    drop(tx);
    server.await.unwrap();
}

#[tokio::test]
async fn file_storage_config_persists_checkpoints() {
    let dir = tempfile::TempDir::new().unwrap();
    let storage = neuron_config::StorageConfig {
        kind: neuron_config::StorageKind::File,
        path: dir.path().join("dialogs.json"),
    };

    let state = neuron_conversation::DialogState {
        step: 1,
        data: json!({"name": "Alice"}).as_object().cloned().unwrap(),
    };
    neuron_dispatch::open_dialog_store(&storage)
        .set("dialog:profile:u1", &state)
        .await
        .unwrap();

    let reopened = neuron_dispatch::open_dialog_store(&storage);
    let loaded = reopened.get("dialog:profile:u1").await.unwrap().unwrap();
    assert_eq!(loaded.step, 1);
    assert_eq!(loaded.data["name"], "Alice");
    assert!(dir.path().join("dialogs.json").exists());
}
