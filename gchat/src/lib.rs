//! Streaming conversation orchestration over model providers.
//!
//! One turn in, one metered token stream out: a session binds a provider,
//! bounds the conversation context, streams frames as the backend produces
//! them, meters usage transactionally, and collapses every backend failure
//! into one stable error contract, with cleanup guaranteed to run exactly
//! once per turn.

mod error;
mod frames;
mod normalize;
mod pipeline;
mod session;
mod types;

pub mod prelude {
    pub use crate::{
        CONTENT_POLICY_MESSAGE, ChatError, ChatErrorKind, ChatGateway, ConversationSession,
        DeliveryPacing, FALLBACK_MESSAGE, Frame, FrameStream, GatewayBuilder, GatewayHooks,
        NoopGatewayHooks, NormalizedError, PipelineEvent, PromptSource, Rechunker, SessionPhase,
        StaticPromptSource, ThreadBinding, TokenPipeline, TurnDisposition, TurnRequest,
        key_flag_for, normalize_internal, normalize_provider_error,
    };
    pub use gcommon::{ErrorCode, ErrorRecord, MetadataMap, ThreadId, TraceId, TurnId};
}

pub use error::{ChatError, ChatErrorKind};
pub use frames::{Frame, STREAMING_STATUS, encode_chunk};
pub use normalize::{
    CONTENT_POLICY_MESSAGE, FALLBACK_MESSAGE, NormalizedError, key_flag_for, normalize_internal,
    normalize_provider_error,
};
pub use pipeline::{PipelineEvent, Rechunker, TokenPipeline};
pub use session::{ChatGateway, ConversationSession, FrameStream, GatewayBuilder};
pub use types::{
    DeliveryPacing, GatewayHooks, NoopGatewayHooks, PromptSource, SessionPhase,
    StaticPromptSource, ThreadBinding, TurnDisposition, TurnRequest,
};

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_stream::stream;
    use futures_util::StreamExt;
    use gcommon::{ErrorCode, ThreadId, UsdMicros};
    use gmemory::{InMemoryThreadStore, StoredContext, ThreadStore};
    use gprovider::{
        BoxedTokenStream, Completion, CompletionRequest, KeyFlag, KeyStatusSink, Message,
        ModelConfig, ModelProvider, ProviderBinder, ProviderError, ProviderFuture, ProviderKeyId,
        ProviderKind, ProviderRegistry, ResolvedAccess, Role, StaticKeyResolver, StopCause,
        StreamingCall, UsageDelta, UsageHandle,
    };

    use crate::{
        ChatErrorKind, ChatGateway, DeliveryPacing, SessionPhase, ThreadBinding, TurnRequest,
    };

    /// What the fake backend does once the stream is opened.
    #[derive(Debug, Clone)]
    enum Script {
        /// Emit every token, then report usage and finish cleanly.
        Complete {
            tokens: Vec<&'static str>,
            usage: UsageDelta,
        },
        /// Emit the tokens, then fail without ever reporting usage.
        FailAfter {
            tokens: Vec<&'static str>,
            error: ProviderError,
        },
        /// Emit tokens forever with a small delay between them.
        Endless,
    }

    struct FakeProvider {
        model: String,
        script: Script,
    }

    impl ModelProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn model(&self) -> &str {
            &self.model
        }

        fn complete(
            &self,
            request: CompletionRequest,
        ) -> ProviderFuture<'static, Result<Completion, ProviderError>> {
            let model = self.model.clone();
            Box::pin(async move {
                request.validate()?;
                Ok(Completion {
                    provider: ProviderKind::OpenAi,
                    model,
                    text: "summary text".to_string(),
                    stop: StopCause::EndTurn,
                    usage: UsageDelta::tokens(5, 5),
                })
            })
        }

        fn stream(
            &self,
            request: CompletionRequest,
        ) -> ProviderFuture<'static, Result<StreamingCall, ProviderError>> {
            let script = self.script.clone();
            Box::pin(async move {
                request.validate()?;
                let (mut reporter, usage) = UsageHandle::channel();

                let tokens: BoxedTokenStream = match script {
                    Script::Complete { tokens, usage: delta } => Box::pin(stream! {
                        for token in tokens {
                            yield Ok(token.to_string());
                        }
                        reporter.report(delta);
                    }),
                    Script::FailAfter { tokens, error } => Box::pin(stream! {
                        // The reporter is dropped without reporting.
                        let _reporter = reporter;
                        for token in tokens {
                            yield Ok(token.to_string());
                        }
                        yield Err(error);
                    }),
                    Script::Endless => Box::pin(stream! {
                        let _reporter = reporter;
                        loop {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                            yield Ok("tick ".to_string());
                        }
                    }),
                };

                Ok(StreamingCall { tokens, usage })
            })
        }
    }

    struct FakeBinder {
        script: Script,
    }

    impl ProviderBinder for FakeBinder {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }

        fn bind(&self, access: ResolvedAccess, config: ModelConfig) -> Arc<dyn ModelProvider> {
            let model = if access.model.trim().is_empty() {
                config.model
            } else {
                access.model
            };
            Arc::new(FakeProvider {
                model,
                script: self.script.clone(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingKeySink {
        flags: Mutex<Vec<(String, KeyFlag)>>,
    }

    impl KeyStatusSink for RecordingKeySink {
        fn flag(&self, key_id: &ProviderKeyId, flag: KeyFlag) {
            self.flags
                .lock()
                .expect("flags lock")
                .push((key_id.to_string(), flag));
        }
    }

    struct Harness {
        gateway: ChatGateway,
        store: Arc<dyn ThreadStore>,
        key_sink: Arc<RecordingKeySink>,
    }

    fn harness(script: Script) -> Harness {
        let mut registry = ProviderRegistry::new();
        registry.register(FakeBinder { script });

        let keys = Arc::new(StaticKeyResolver::new());
        keys.insert("key-1", "", "sk-live-123")
            .expect("key should insert");

        let store: Arc<dyn ThreadStore> = Arc::new(InMemoryThreadStore::new());
        let key_sink = Arc::new(RecordingKeySink::default());

        let gateway = ChatGateway::builder(Arc::new(registry), keys, Arc::clone(&store))
            .key_status(Arc::clone(&key_sink) as Arc<dyn KeyStatusSink>)
            .build();

        Harness {
            gateway,
            store,
            key_sink,
        }
    }

    fn binding(thread: &str) -> ThreadBinding {
        ThreadBinding::new(
            thread,
            ProviderKind::OpenAi,
            "key-1",
            ModelConfig::new("gpt-4o-mini", 4096),
        )
    }

    async fn wait_for_closed(session: &crate::ConversationSession) {
        for _ in 0..200 {
            if session.phase() == SessionPhase::Closed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached Closed");
    }

    #[tokio::test]
    async fn streaming_turn_preserves_order_meters_usage_and_persists_context() {
        let delta = UsageDelta::tokens(30, 20).with_cost(UsdMicros::parse("$0.005").expect("cost"));
        let fixture = harness(Script::Complete {
            tokens: vec!["a", "b", "c"],
            usage: delta,
        });

        // Seed the aggregate at 100 tokens / $0.010.
        fixture
            .store
            .create_if_missing(gmemory::ThreadRecord::new(
                "thread-1",
                ProviderKind::OpenAi,
                "gpt-4o-mini",
            ))
            .await
            .expect("thread should create");
        fixture
            .store
            .apply_usage(
                &ThreadId::from("thread-1"),
                gmemory::UsageIncrement {
                    total_used: 100,
                    prompt: 60,
                    completion: 40,
                    cost: UsdMicros::parse("$0.010").expect("seed cost"),
                    ..gmemory::UsageIncrement::default()
                },
            )
            .await
            .expect("seed usage should apply");

        let mut session = fixture.gateway.session(binding("thread-1"));
        let turn = TurnRequest::new("turn-1", "hello there")
            .with_pacing(DeliveryPacing::new().with_chunk_chars(1));
        let stream = session.stream_turn(turn).await.expect("turn should start");

        let frames: Vec<_> = stream.collect().await;
        let bodies: Vec<_> = frames.iter().map(|frame| frame.body.as_str()).collect();
        assert_eq!(bodies, vec!["data: a\n\n", "data: b\n\n", "data: c\n\n"]);
        assert!(frames.iter().all(|frame| frame.status == 200));

        wait_for_closed(&session).await;

        let record = fixture
            .store
            .get(&ThreadId::from("thread-1"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.usage.total_used, 150);
        assert_eq!(record.usage.prompt, 90);
        assert_eq!(record.usage.completion, 60);
        assert_eq!(record.usage.total_cost.to_string(), "$0.015");
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4o-mini"));
        assert!(record.last_error.is_none());

        let context = fixture
            .store
            .load_context(&ThreadId::from("thread-1"))
            .await
            .expect("context should load");
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].role, Role::User);
        assert_eq!(context.messages[0].content, "hello there");
        assert_eq!(context.messages[1].role, Role::Assistant);
        assert_eq!(context.messages[1].content, "abc");
    }

    #[tokio::test]
    async fn rate_limit_after_two_chunks_appends_terminal_frame_and_flags_key() {
        let fixture = harness(Script::FailAfter {
            tokens: vec!["stream", "partly"],
            error: ProviderError::http(ProviderKind::OpenAi, 429, "Rate limit reached"),
        });

        let mut session = fixture.gateway.session(binding("thread-2"));
        let turn = TurnRequest::new("turn-1", "hello")
            .with_pacing(DeliveryPacing::new().with_chunk_chars(6));
        let stream = session.stream_turn(turn).await.expect("turn should start");

        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].body, "data: stream\n\n");
        assert_eq!(frames[0].status, 200);
        assert_eq!(frames[1].body, "data: partly\n\n");

        let terminal = &frames[2];
        assert_eq!(terminal.status, 429);
        assert!(terminal.body.contains("\"error_code\":\"rate_limit_exceeded\""));

        wait_for_closed(&session).await;
        assert_eq!(session.phase(), SessionPhase::Closed);

        let record = fixture
            .store
            .get(&ThreadId::from("thread-2"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        // No usage was reported, so the aggregate is untouched.
        assert_eq!(record.usage.total_used, 0);
        let last_error = record.last_error.expect("error should be recorded");
        assert_eq!(last_error.code, ErrorCode::RateLimitExceeded);
        assert_eq!(last_error.status, 429);

        let flags = fixture.key_sink.flags.lock().expect("flags lock");
        assert_eq!(flags.as_slice(), &[("key-1".to_string(), KeyFlag::Avoid)]);
    }

    #[tokio::test]
    async fn regenerate_turn_rebills_nothing_and_replaces_the_reply() {
        let delta = UsageDelta::tokens(30, 20).with_cost(UsdMicros::parse("$0.005").expect("cost"));
        let fixture = harness(Script::Complete {
            tokens: vec!["better answer"],
            usage: delta,
        });

        fixture
            .store
            .create_if_missing(gmemory::ThreadRecord::new(
                "thread-3",
                ProviderKind::OpenAi,
                "gpt-4o-mini",
            ))
            .await
            .expect("thread should create");
        fixture
            .store
            .save_context(
                &ThreadId::from("thread-3"),
                StoredContext::new(
                    vec![
                        Message::new(Role::User, "original question"),
                        Message::new(Role::Assistant, "first answer"),
                    ],
                    None,
                ),
            )
            .await
            .expect("context should seed");

        let mut session = fixture.gateway.session(binding("thread-3"));
        let turn = TurnRequest::new("turn-1", "")
            .regenerate()
            .with_credit_price(5)
            .paid_tier();
        let stream = session.stream_turn(turn).await.expect("turn should start");
        let frames: Vec<_> = stream.collect().await;
        assert!(!frames.is_empty());

        wait_for_closed(&session).await;

        let record = fixture
            .store
            .get(&ThreadId::from("thread-3"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        // Regenerate bills nothing: no tokens, no cost, no credits.
        assert_eq!(record.usage.total_used, 0);
        assert_eq!(record.credits_used, 0);
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4o-mini"));

        let context = fixture
            .store
            .load_context(&ThreadId::from("thread-3"))
            .await
            .expect("context should load");
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].content, "original question");
        assert_eq!(context.messages[1].content, "better answer");
    }

    #[tokio::test]
    async fn paid_turns_charge_the_credit_price() {
        let delta = UsageDelta::tokens(10, 10).with_cost(UsdMicros::from_micros(1_000));
        let fixture = harness(Script::Complete {
            tokens: vec!["ok"],
            usage: delta,
        });

        let mut session = fixture.gateway.session(binding("thread-4"));
        let turn = TurnRequest::new("turn-1", "hello")
            .with_credit_price(3)
            .paid_tier();
        let frames: Vec<_> = session
            .stream_turn(turn)
            .await
            .expect("turn should start")
            .collect()
            .await;
        assert!(!frames.is_empty());
        wait_for_closed(&session).await;

        let record = fixture
            .store
            .get(&ThreadId::from("thread-4"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.credits_used, 3);

        // A free-tier turn with the same price charges nothing.
        let mut session = fixture.gateway.session(binding("thread-4"));
        let turn = TurnRequest::new("turn-2", "hello again").with_credit_price(3);
        let frames: Vec<_> = session
            .stream_turn(turn)
            .await
            .expect("turn should start")
            .collect()
            .await;
        assert!(!frames.is_empty());
        wait_for_closed(&session).await;

        let record = fixture
            .store
            .get(&ThreadId::from("thread-4"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.credits_used, 3);
    }

    #[tokio::test]
    async fn disconnected_consumer_still_reaches_closed_with_cleanup() {
        let fixture = harness(Script::Endless);

        let mut session = fixture.gateway.session(binding("thread-5"));
        let turn = TurnRequest::new("turn-1", "talk forever")
            .with_pacing(DeliveryPacing::new().with_chunk_chars(1));
        let mut stream = session.stream_turn(turn).await.expect("turn should start");

        let first = stream.next().await.expect("first frame should arrive");
        assert_eq!(first.status, 200);

        // Walk away mid-stream.
        drop(stream);

        wait_for_closed(&session).await;

        // Finalizing ran: the scope closed with the model reference even
        // though no usage was ever reported.
        let record = fixture
            .store
            .get(&ThreadId::from("thread-5"))
            .await
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(record.last_response_model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(record.usage.total_used, 0);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn sessions_are_single_use() {
        let fixture = harness(Script::Complete {
            tokens: vec!["done"],
            usage: UsageDelta::tokens(1, 1),
        });

        let mut session = fixture.gateway.session(binding("thread-6"));
        let frames: Vec<_> = session
            .stream_turn(TurnRequest::new("turn-1", "hi"))
            .await
            .expect("turn should start")
            .collect()
            .await;
        assert!(!frames.is_empty());
        wait_for_closed(&session).await;

        let error = session
            .stream_turn(TurnRequest::new("turn-2", "again"))
            .await
            .expect_err("second turn should fail");
        assert_eq!(error.kind, ChatErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn empty_input_is_rejected_before_the_session_is_consumed() {
        let fixture = harness(Script::Complete {
            tokens: vec!["done"],
            usage: UsageDelta::tokens(1, 1),
        });

        let mut session = fixture.gateway.session(binding("thread-7"));
        let error = session
            .stream_turn(TurnRequest::new("turn-1", "   "))
            .await
            .expect_err("empty input should fail");
        assert_eq!(error.kind, ChatErrorKind::InvalidRequest);
        assert_eq!(session.phase(), SessionPhase::Idle);

        // The session is still usable after the rejected request.
        let frames: Vec<_> = session
            .stream_turn(TurnRequest::new("turn-1", "hello"))
            .await
            .expect("turn should start")
            .collect()
            .await;
        assert!(!frames.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_key_produces_one_authentication_error_frame() {
        let fixture = harness(Script::Complete {
            tokens: vec!["unused"],
            usage: UsageDelta::tokens(1, 1),
        });

        let mut binding = binding("thread-8");
        binding.key_id = ProviderKeyId::from("missing-key");

        let mut session = fixture.gateway.session(binding);
        let frames: Vec<_> = session
            .stream_turn(TurnRequest::new("turn-1", "hello"))
            .await
            .expect("turn should start")
            .collect()
            .await;

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, 401);
        assert!(frames[0].body.contains("\"error_code\":\"authentication_error\""));

        wait_for_closed(&session).await;

        let flags = fixture.key_sink.flags.lock().expect("flags lock");
        assert_eq!(
            flags.as_slice(),
            &[("missing-key".to_string(), KeyFlag::Invalid)]
        );
    }

    #[tokio::test]
    async fn inter_chunk_delay_paces_delivery() {
        let fixture = harness(Script::Complete {
            tokens: vec!["abcdef"],
            usage: UsageDelta::tokens(1, 1),
        });

        let mut session = fixture.gateway.session(binding("thread-9"));
        let turn = TurnRequest::new("turn-1", "hello").with_pacing(
            DeliveryPacing::new()
                .with_chunk_chars(2)
                .with_inter_chunk_delay(Duration::from_millis(10)),
        );

        let started = std::time::Instant::now();
        let frames: Vec<_> = session
            .stream_turn(turn)
            .await
            .expect("turn should start")
            .collect()
            .await;
        let elapsed = started.elapsed();

        assert_eq!(frames.len(), 3);
        assert!(
            elapsed >= Duration::from_millis(30),
            "three paced chunks should take at least three delays, took {elapsed:?}"
        );
    }
}
