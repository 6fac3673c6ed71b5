//! The demo command set served by the console front end.

use std::sync::{Arc, OnceLock};

use {
    neuron_channels::{CapabilitySource, ChannelOutbound, RequestContext},
    neuron_commands::Command,
    neuron_common::{CapabilitySet, InboundMessage, events::EventBus},
    neuron_config::NeuronConfig,
    neuron_conversation::{
        DialogEngine, DialogError, DialogFlow, DialogOutcome, DialogStep, StepError,
    },
    neuron_dispatch::{Dispatcher, DispatcherBuilder, open_dialog_store},
    neuron_middleware::middleware_fn,
    serde_json::{Map, Value},
    tracing::debug,
};

pub const MODERATE: &str = "MODERATE";

/// Two-step profile dialog: a name, then an age between 1 and 150.
pub fn profile_flow() -> DialogFlow {
    DialogFlow::new("profile")
        .step(
            DialogStep::new("name", "What's your name?")
                .validate(|msg| {
                    if msg.content.trim().is_empty() {
                        Err(StepError::Rejected)
                    } else {
                        Ok(())
                    }
                })
                .transform(|msg| Ok(Value::String(msg.content.trim().to_string()))),
        )
        .step(
            DialogStep::new("age", "How old are you?")
                .validate(|msg| match msg.content.trim().parse::<u8>() {
                    Ok(age) if (1..=150).contains(&age) => Ok(()),
                    _ => Err(StepError::RejectedWith(
                        "Please answer with a number between 1 and 150.".into(),
                    )),
                })
                .transform(|msg| {
                    let age: u8 = msg.content.trim().parse().map_err(anyhow::Error::from)?;
                    Ok(Value::from(age))
                }),
        )
}

fn profile_summary(data: &Map<String, Value>) -> String {
    let name = data.get("name").and_then(Value::as_str).unwrap_or("stranger");
    match data.get("age").and_then(Value::as_u64) {
        Some(age) => format!("Nice to meet you, {name} ({age})."),
        None => format!("Nice to meet you, {name}."),
    }
}

/// Grants a fixed capability set to every author.
struct StaticGrants(CapabilitySet);

impl CapabilitySource for StaticGrants {
    fn capabilities(&self, _message: &InboundMessage) -> Option<CapabilitySet> {
        Some(self.0.clone())
    }
}

/// Build the dispatcher with the demo commands and middleware registered.
///
/// `grants` are handed to every console author; without `MODERATE` the
/// `kick` command is denied.
pub fn build_bot(
    config: NeuronConfig,
    outbound: Arc<dyn ChannelOutbound>,
    grants: CapabilitySet,
    events: EventBus,
) -> anyhow::Result<Dispatcher> {
    let store = open_dialog_store(&config.storage);
    let mut builder = DispatcherBuilder::with_events(config, outbound, events);
    let engine = builder.dialog_engine(store);
    let help = Arc::new(OnceLock::<String>::new());

    builder.capabilities(Arc::new(StaticGrants(grants)));
    builder.middleware(middleware_fn("log", |ctx, next| {
        Box::pin(async move {
            debug!(
                channel_id = %ctx.message.channel_id,
                author_id = %ctx.message.author_id,
                content = %ctx.message.content,
                "inbound"
            );
            next.run(ctx).await
        })
    }));

    builder.register(
        Command::new("ping")
            .description("Check the bot is alive")
            .run(|ctx| async move {
                ctx.reply("pong").await;
                Ok(())
            }),
    )?;

    builder.register(
        Command::new("echo")
            .alias("say")
            .usage("<text>")
            .description("Repeat the text back")
            .run(|ctx| async move {
                if ctx.args.is_empty() {
                    anyhow::bail!("nothing to echo");
                }
                ctx.reply(&ctx.args.join(" ")).await;
                Ok(())
            }),
    )?;

    builder.register(
        Command::new("kick")
            .usage("<user>")
            .description("Remove a user from the channel")
            .requires(MODERATE)
            .run(|ctx| async move {
                let target = ctx.args.first().map_or("nobody", String::as_str);
                ctx.reply(&format!("{target} was kicked by {}.", ctx.author_id()))
                    .await;
                Ok(())
            }),
    )?;

    builder.register(profile_command(engine))?;

    let help_text = Arc::clone(&help);
    builder.register(
        Command::new("help")
            .alias("commands")
            .description("List commands")
            .run(move |ctx| {
                let help = Arc::clone(&help_text);
                async move {
                    let text = help.get().map_or("No commands registered.", String::as_str);
                    ctx.reply(text).await;
                    Ok(())
                }
            }),
    )?;

    let dispatcher = builder.build();
    let _ = help.set(dispatcher.commands().help_text());
    Ok(dispatcher)
}

fn profile_command(engine: DialogEngine) -> Command {
    let resume_engine = engine.clone();
    Command::new("profile")
        .description("Tell the bot about yourself")
        .run(move |ctx| {
            let engine = engine.clone();
            async move {
                let outcome = engine
                    .start(&profile_flow(), ctx.channel_id(), ctx.author_id())
                    .await?;
                finish_profile(&ctx, outcome).await;
                Ok(())
            }
        })
        .subcommand(
            Command::new("resume")
                .description("Continue an interrupted profile")
                .run(move |ctx| {
                    let engine = resume_engine.clone();
                    async move {
                        match engine
                            .resume(&profile_flow(), ctx.channel_id(), ctx.author_id())
                            .await
                        {
                            Ok(outcome) => finish_profile(&ctx, outcome).await,
                            Err(DialogError::StateMissing { .. }) => {
                                ctx.reply("There is no profile to resume.").await;
                            },
                            Err(e) => return Err(e.into()),
                        }
                        Ok(())
                    }
                }),
        )
}

async fn finish_profile(ctx: &RequestContext, outcome: DialogOutcome) {
    if let DialogOutcome::Completed(data) = outcome {
        ctx.reply(&profile_summary(&data)).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        neuron_channels::RecordingOutbound,
        neuron_dispatch::DispatchOutcome,
        serde_json::json,
        std::time::Duration,
        tokio::sync::mpsc,
    };

    fn bot(grants: &[&str]) -> (Arc<RecordingOutbound>, Dispatcher) {
        let outbound = Arc::new(RecordingOutbound::new());
        let dispatcher = build_bot(
            NeuronConfig::default(),
            outbound.clone(),
            grants.iter().copied().collect(),
            EventBus::new(),
        )
        .unwrap();
        (outbound, dispatcher)
    }

    #[tokio::test]
    async fn ping_and_echo() {
        let (out, bot) = bot(&[]);
        let ping = bot.dispatch(InboundMessage::new("c", "u", "!ping")).await;
        let echo = bot
            .dispatch(InboundMessage::new("c", "u", "!say hello  there"))
            .await;
        let empty = bot.dispatch(InboundMessage::new("c", "u", "!echo")).await;

        assert_eq!(ping, DispatchOutcome::Handled);
        assert_eq!(echo, DispatchOutcome::Handled);
        assert_eq!(empty, DispatchOutcome::Failed);
        assert_eq!(out.texts_for("c"), vec!["pong", "hello there"]);
    }

    #[tokio::test]
    async fn help_lists_every_command() {
        let (out, bot) = bot(&[]);
        bot.dispatch(InboundMessage::new("c", "u", "!help")).await;

        let text = out.texts_for("c").join("\n");
        for line in ["!ping", "!echo <text>", "!kick <user>", "!profile resume", "!help"] {
            assert!(text.contains(line), "missing {line} in {text}");
        }
    }

    #[tokio::test]
    async fn kick_needs_moderate() {
        let (out, bot) = bot(&[]);
        let denied = bot.dispatch(InboundMessage::new("c", "u", "!kick bob")).await;
        assert_eq!(denied, DispatchOutcome::Denied);
        assert_eq!(
            out.texts_for("c"),
            vec![NeuronConfig::default().commands.denied_message]
        );

        let (out, bot) = self::bot(&[MODERATE]);
        let allowed = bot.dispatch(InboundMessage::new("c", "mod", "!kick bob")).await;
        assert_eq!(allowed, DispatchOutcome::Handled);
        assert_eq!(out.texts_for("c"), vec!["bob was kicked by mod."]);
    }

    #[tokio::test]
    async fn resume_without_state_says_so() {
        let (out, bot) = bot(&[]);
        let outcome = bot
            .dispatch(InboundMessage::new("c", "u", "!profile resume"))
            .await;
        assert_eq!(outcome, DispatchOutcome::Handled);
        assert_eq!(out.texts_for("c"), vec!["There is no profile to resume."]);
    }

    #[tokio::test(start_paused = true)]
    async fn profile_dialog_over_serve() {
        let (out, bot) = bot(&[]);
        let bot = Arc::new(bot);
        let (tx, rx) = mpsc::channel(16);
        let server = tokio::spawn({
            let bot = Arc::clone(&bot);
            async move { bot.serve(rx).await }
        });

        let send = |text: &str| InboundMessage::new("c", "alice", text);
        tx.send(send("!profile")).await.unwrap();
        wait_for(&out, 1).await;
        tx.send(send("Alice")).await.unwrap();
        wait_for(&out, 2).await;
        tx.send(send("old")).await.unwrap();
        wait_for(&out, 4).await;
        tx.send(send("30")).await.unwrap();
        wait_for(&out, 5).await;

        assert_eq!(
            out.texts_for("c"),
            vec![
                "What's your name?",
                "How old are you?",
                "Please answer with a number between 1 and 150.",
                "How old are you?",
                "Nice to meet you, Alice (30).",
            ]
        );
        assert_eq!(bot.stats().count(DispatchOutcome::ReplyDelivered), 3);

        drop(tx);
        server.await.unwrap();
    }

    async fn wait_for(out: &RecordingOutbound, count: usize) {
        for _ in 0..1000 {
            if out.sent().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} messages sent", out.sent().len());
    }

    #[test]
    fn summary_formats_collected_data() {
        let data = json!({"name": "Alice", "age": 30});
        assert_eq!(
            profile_summary(data.as_object().unwrap()),
            "Nice to meet you, Alice (30)."
        );
        assert_eq!(profile_summary(&Map::new()), "Nice to meet you, stranger.");
    }
}
