//! End-to-end orchestrator tests over scripted providers and media.
//!
//! Everything external is a double: the LLM echoes a canned reply, TTS
//! returns fixed-size audio, the transcoder passes bytes through, and
//! the media transport swallows chunks. What is real is the whole core:
//! manager, arbiter, bindings, pipelines, and events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use chorus_audio::{PcmPassthrough, Transcoder};
use chorus_core::{AgentManager, BusDispatcher, EventStream, MediaFactory, Providers};
use chorus_media::{MediaCapture, MediaTransport, Participant};
use chorus_providers::{
    Availability, ChatTurn, LlmProvider, LlmReply, SttEvent, SttProvider, SttStream, Transcript,
    TtsAudio, TtsProvider,
};
use chorus_types::{
    AgentId, AttachOptions, AudioFormat, CoreConfig, CoreEvent, CoreResult, ErrorKind, LlmParams,
    RoomId, SpeakingEndReason, VoiceParams,
};

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

struct EchoLlm;

#[async_trait]
impl LlmProvider for EchoLlm {
    async fn generate(
        &self,
        _caller: &str,
        _persona: &str,
        history: &[ChatTurn],
        _params: &LlmParams,
    ) -> CoreResult<LlmReply> {
        let last = history.last().map(|t| t.content.as_str()).unwrap_or("");
        Ok(LlmReply {
            text: format!("echo: {last}"),
            model_tag: "echo-model".into(),
            tokens: 7,
        })
    }

    fn availability(&self) -> Availability {
        Availability::Ready
    }

    fn name(&self) -> &str {
        "echo"
    }
}

struct FixedTts {
    audio_bytes: usize,
}

#[async_trait]
impl TtsProvider for FixedTts {
    async fn synthesize(&self, _text: &str, _voice: &VoiceParams) -> CoreResult<TtsAudio> {
        Ok(TtsAudio {
            bytes: vec![0x55; self.audio_bytes],
            format: AudioFormat::Mp3,
        })
    }

    fn supports_voice(&self, _voice: &str) -> bool {
        true
    }

    fn availability(&self) -> Availability {
        Availability::Ready
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// STT double whose streaming sessions accept audio and stay silent.
struct SilentStt;

#[async_trait]
impl SttProvider for SilentStt {
    async fn transcribe(&self, _audio: &[u8], _lang: &str) -> CoreResult<Option<Transcript>> {
        Ok(None)
    }

    async fn open_stream(&self, session: &str, _lang: &str) -> CoreResult<SttStream> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
        let (events_tx, events_rx) = mpsc::channel::<SttEvent>(8);
        let task = tokio::spawn(async move {
            // Hold the events side open while draining audio.
            let _keepalive = events_tx;
            while audio_rx.recv().await.is_some() {}
        });
        Ok(SttStream::from_parts(session, audio_tx, events_rx, task))
    }

    fn availability(&self) -> Availability {
        Availability::Ready
    }

    fn name(&self) -> &str {
        "silent"
    }
}

/// Media transport double: never fails, swallows audio, captures silence.
struct NullTransport {
    produces: AtomicU32,
}

#[async_trait]
impl MediaTransport for NullTransport {
    async fn join(&self, _room: &RoomId, _peer: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn leave(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn produce(&self, _format: AudioFormat) -> CoreResult<String> {
        let n = self.produces.fetch_add(1, Ordering::SeqCst);
        Ok(format!("producer-{n}"))
    }

    async fn send_audio(&self, _producer: &str, _chunk: &[u8]) -> CoreResult<()> {
        Ok(())
    }

    async fn stop_produce(&self, _producer: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn consume(
        &self,
        _source: &str,
        duration_ms: u64,
        format: AudioFormat,
    ) -> CoreResult<MediaCapture> {
        // Behave like a real capture: take the requested duration, return
        // nothing worth transcribing.
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        Ok(MediaCapture {
            consumer_id: "consumer".into(),
            audio: Vec::new(),
            format,
        })
    }

    async fn stop_consume(&self, _consumer: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn list_participants(&self) -> CoreResult<Vec<Participant>> {
        Ok(Vec::new())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

struct NullMediaFactory;

#[async_trait]
impl MediaFactory for NullMediaFactory {
    async fn transport(&self) -> CoreResult<Arc<dyn MediaTransport>> {
        Ok(Arc::new(NullTransport {
            produces: AtomicU32::new(0),
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Config tuned so a speaking turn lasts ~15 ms per 128 audio bytes.
fn fast_config() -> CoreConfig {
    CoreConfig {
        egress_buffer_bytes: 64,
        ..CoreConfig::default()
    }
}

fn manager_with(config: CoreConfig, tts_audio_bytes: usize) -> AgentManager {
    let providers = Providers {
        llm: Arc::new(EchoLlm),
        tts: Arc::new(FixedTts {
            audio_bytes: tts_audio_bytes,
        }),
        stt: Arc::new(SilentStt),
    };
    let transcoder: Arc<dyn Transcoder> = Arc::new(PcmPassthrough);
    AgentManager::new(config, providers, transcoder, Arc::new(NullMediaFactory))
        .expect("manager should build")
}

fn manager() -> AgentManager {
    manager_with(fast_config(), 128)
}

async fn next_matching(
    stream: &mut EventStream,
    pred: impl Fn(&CoreEvent) -> bool,
) -> CoreEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = stream.next().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn create_in_room(manager: &AgentManager, id: &str, room: &str) -> AgentId {
    let agent = AgentId::new(id);
    manager
        .create_agent(&format!("persona of {id}"), Some(agent.clone()), None)
        .await
        .expect("create should succeed");
    manager
        .attach_agent_to_room(&agent, &RoomId::new(room), AttachOptions::default())
        .await
        .expect("attach should succeed");
    agent
}

// ---------------------------------------------------------------------------
// Lifecycle round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_then_delete_restores_registry_and_orders_events() {
    let manager = manager();
    let mut events = manager.subscribe();

    let before = manager.list_agents().await.len();
    let snap = manager.create_agent("P1", None, None).await.unwrap();
    manager.delete_agent(&snap.id).await.unwrap();
    assert_eq!(manager.list_agents().await.len(), before);

    let created = next_matching(&mut events, |e| matches!(e, CoreEvent::AgentCreated { .. })).await;
    let deleted = next_matching(&mut events, |e| matches!(e, CoreEvent::AgentDeleted { .. })).await;
    assert!(created.ts() <= deleted.ts());
}

#[tokio::test]
async fn global_cap_is_enforced() {
    let manager = manager_with(
        CoreConfig {
            max_agents: 2,
            ..fast_config()
        },
        128,
    );
    manager.create_agent("P1", None, None).await.unwrap();
    manager.create_agent("P2", None, None).await.unwrap();

    let err = manager.create_agent("P3", None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert_eq!(manager.list_agents().await.len(), 2);
}

#[tokio::test]
async fn duplicate_id_rejected() {
    let manager = manager();
    let id = AgentId::new("dup");
    manager
        .create_agent("P1", Some(id.clone()), None)
        .await
        .unwrap();
    let err = manager
        .create_agent("P2", Some(id), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[tokio::test]
async fn empty_persona_rejected() {
    let manager = manager();
    let err = manager.create_agent("   ", None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn attach_then_detach_restores_maps_and_orders_events() {
    let manager = manager();
    let mut events = manager.subscribe();
    let room = RoomId::new("R");

    let a = create_in_room(&manager, "A", "R").await;
    assert_eq!(manager.get_agent(&a).await.unwrap().room, Some(room.clone()));
    assert_eq!(manager.get_room(&room).await.unwrap().agents, vec![a.clone()]);

    manager.detach_agent_from_room(&a).await.unwrap();
    assert_eq!(manager.get_agent(&a).await.unwrap().room, None);
    // Last agent out destroys the room.
    assert!(matches!(
        manager.get_room(&room).await,
        Err(e) if e.kind() == ErrorKind::NotFound
    ));

    next_matching(&mut events, |e| matches!(e, CoreEvent::RoomJoined { .. })).await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::RoomLeft { error: None, .. })
    })
    .await;
}

#[tokio::test]
async fn per_room_cap_is_enforced() {
    let manager = manager_with(
        CoreConfig {
            max_agents_per_room: 2,
            ..fast_config()
        },
        128,
    );
    create_in_room(&manager, "A", "R").await;
    create_in_room(&manager, "B", "R").await;

    let c = AgentId::new("C");
    manager.create_agent("P3", Some(c.clone()), None).await.unwrap();
    let err = manager
        .attach_agent_to_room(&c, &RoomId::new("R"), AttachOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
    assert_eq!(manager.get_room(&RoomId::new("R")).await.unwrap().agents.len(), 2);
}

#[tokio::test]
async fn re_attach_rejected_everywhere() {
    let manager = manager();
    let a = create_in_room(&manager, "A", "R").await;

    // Same room and a different room both reject while attached.
    for room in ["R", "S"] {
        let err = manager
            .attach_agent_to_room(&a, &RoomId::new(room), AttachOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }
}

#[tokio::test]
async fn delete_attached_agent_leaves_room_first() {
    let manager = manager();
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;

    manager.delete_agent(&a).await.unwrap();

    next_matching(&mut events, |e| matches!(e, CoreEvent::RoomLeft { .. })).await;
    next_matching(&mut events, |e| matches!(e, CoreEvent::AgentDeleted { .. })).await;
    assert!(manager.list_agents().await.is_empty());
}

// ---------------------------------------------------------------------------
// Speaking turns (seed scenarios 1, 2, 6)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_agents_speak_sequentially_without_interleaving() {
    let manager = manager();
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;
    let b = create_in_room(&manager, "B", "R").await;

    manager.request_speak(&a, "Hello").await.unwrap();
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == a && text == "Hello")
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingEnd { agent, reason, .. }
            if *agent == a && *reason == SpeakingEndReason::Completed)
    })
    .await;

    manager.request_speak(&b, "Hi").await.unwrap();
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == b && text == "Hi")
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == b)
    })
    .await;

    let stats = manager.stats().await;
    assert_eq!(stats.voice_turns, 2);
    assert_eq!(stats.tts_calls, 2);
}

#[tokio::test]
async fn overlapping_speaks_queue_then_drain() {
    let manager = manager_with(fast_config(), 2048); // ~30 chunks ≈ 240 ms per turn
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;
    let b = create_in_room(&manager, "B", "R").await;
    let room = RoomId::new("R");

    manager.request_speak(&a, "one").await.unwrap();
    manager.request_speak(&b, "two").await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == a && text == "one")
    })
    .await;

    // Queue holds B while A is speaking.
    let view = manager.get_room(&room).await.unwrap();
    assert_eq!(view.conversation.current_speaker, Some(a.clone()));
    assert_eq!(view.conversation.queue, vec![b.clone()]);

    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == a)
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingStart { agent, text, .. } if *agent == b && text == "two")
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingEnd { agent, .. } if *agent == b)
    })
    .await;

    let view = manager.get_room(&room).await.unwrap();
    assert!(view.conversation.queue.is_empty());
    assert!(view.conversation.current_speaker.is_none());
}

#[tokio::test]
async fn forced_stop_at_time_limit() {
    // ~64 KiB of audio at 64-byte chunks ≈ 8 s of pacing; the 500 ms
    // limit fires long before the turn could complete.
    let manager = manager_with(
        CoreConfig {
            speaking_time_limit_ms: 500,
            ..fast_config()
        },
        64 * 1024,
    );
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;

    manager.request_speak(&a, "a very long story").await.unwrap();
    let started = std::time::Instant::now();
    let event = next_matching(&mut events, |e| matches!(e, CoreEvent::SpeakingEnd { .. })).await;
    match event {
        CoreEvent::SpeakingEnd { agent, reason, .. } => {
            assert_eq!(agent, a);
            assert_eq!(reason, SpeakingEndReason::ForcedStop);
        }
        other => panic!("unexpected event {other:?}"),
    }
    // Within one ingress bucket of the limit.
    assert!(
        started.elapsed() < Duration::from_millis(1_600),
        "forced stop took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn speak_rejections() {
    let manager = manager();
    let a = AgentId::new("A");
    manager.create_agent("P", Some(a.clone()), None).await.unwrap();

    // Empty text.
    let err = manager.request_speak(&a, "   ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Not attached.
    let err = manager.request_speak(&a, "hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Unknown agent.
    let err = manager
        .request_speak(&AgentId::new("ghost"), "hello")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn cancel_speak_interrupts_turn() {
    let manager = manager_with(fast_config(), 64 * 1024);
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;

    manager.request_speak(&a, "interminable").await.unwrap();
    next_matching(&mut events, |e| matches!(e, CoreEvent::SpeakingStart { .. })).await;

    manager.cancel_speak(&a).await.unwrap();
    let event = next_matching(&mut events, |e| matches!(e, CoreEvent::SpeakingEnd { .. })).await;
    match event {
        CoreEvent::SpeakingEnd { reason, .. } => {
            assert_eq!(reason, SpeakingEndReason::Cancelled)
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Transcript triggering (seed scenarios 3, 4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn high_confidence_transcript_triggers_reply_and_speech() {
    let manager = manager();
    let mut events = manager.subscribe();
    let a = create_in_room(&manager, "A", "R").await;

    manager
        .ingest_transcript(&RoomId::new("R"), "R-s1", "hello agent", 0.95)
        .await
        .unwrap();

    // The reply lands in the conversation, then gets spoken.
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::ConversationMessage { agent, message, .. }
            if *agent == a && message.content == "echo: hello agent")
    })
    .await;
    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::SpeakingStart { agent, .. } if *agent == a)
    })
    .await;
}

#[tokio::test]
async fn low_confidence_transcript_never_triggers() {
    let manager = manager();
    let mut events = manager.subscribe();
    create_in_room(&manager, "A", "R").await;

    manager
        .ingest_transcript(&RoomId::new("R"), "R-s1", "mumble", 0.4)
        .await
        .unwrap();

    next_matching(&mut events, |e| {
        matches!(e, CoreEvent::TranscriptionUpdate { confidence, .. } if *confidence == 0.4)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    while let Some(event) = events.try_next() {
        assert!(
            !matches!(
                event,
                CoreEvent::ConversationMessage { .. } | CoreEvent::SpeakingStart { .. }
            ),
            "low-confidence transcript must not trigger {event:?}"
        );
    }

    // It is still in the room's log.
    let view = manager.get_room(&RoomId::new("R")).await.unwrap();
    assert_eq!(view.conversation.log.len(), 1);
    assert_eq!(manager.stats().await.llm_calls, 0);
}

// ---------------------------------------------------------------------------
// Text exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn process_text_round_trip() {
    let manager = manager();
    let a = AgentId::new("A");
    manager.create_agent("P", Some(a.clone()), None).await.unwrap();

    let reply = manager.process_text(&a, "how are you?", "caller").await.unwrap();
    assert_eq!(reply.content, "echo: how are you?");

    let snap = manager.get_agent(&a).await.unwrap();
    assert_eq!(snap.history_len, 2);
    assert_eq!(snap.metrics.llm_calls, 1);
}

#[tokio::test]
async fn history_stays_bounded() {
    let manager = manager_with(
        CoreConfig {
            history_cap: 6,
            ..fast_config()
        },
        128,
    );
    let a = AgentId::new("A");
    manager.create_agent("P", Some(a.clone()), None).await.unwrap();

    for i in 0..10 {
        manager
            .process_text(&a, &format!("msg {i}"), "caller")
            .await
            .unwrap();
    }
    let snap = manager.get_agent(&a).await.unwrap();
    assert_eq!(snap.history_len, 6);
    assert_eq!(snap.metrics.messages, 20);
}

// ---------------------------------------------------------------------------
// Bus dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bus_control_and_event_round_trip() {
    use chorus_bus::envelope::{self, topics};
    use chorus_bus::{Bus, MemoryBus};

    let manager = manager();
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::connected());
    let _dispatcher = BusDispatcher::start(Arc::clone(&bus), manager.clone())
        .await
        .unwrap();
    let mut speaking_events = bus.subscribe("agent.speaking.start").await.unwrap();

    // Create and attach over the bus.
    bus.publish(
        topics::AGENT_CREATE,
        envelope::encode(&envelope::CreateAgent {
            persona: "bus persona".into(),
            id: Some(AgentId::new("bus-agent")),
            config: None,
        })
        .unwrap(),
    )
    .unwrap();
    bus.publish(
        topics::AGENT_JOIN_ROOM,
        envelope::encode(&envelope::JoinRoom {
            id: AgentId::new("bus-agent"),
            room: RoomId::new("R"),
            options: AttachOptions::default(),
        })
        .unwrap(),
    )
    .unwrap();

    // Wait until the agent is attached.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(snap) = manager.get_agent(&AgentId::new("bus-agent")).await {
                if snap.room.is_some() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent should attach via bus");

    // Speak over the bus and observe the event republished to the bus.
    bus.publish(
        topics::AGENT_SPEAK,
        envelope::encode(&envelope::Speak {
            id: AgentId::new("bus-agent"),
            text: "over the wire".into(),
        })
        .unwrap(),
    )
    .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), speaking_events.recv())
        .await
        .expect("speaking.start should be republished")
        .expect("bus subscription should stay open");
    let event: CoreEvent = serde_json::from_slice(&frame.payload).unwrap();
    assert!(matches!(
        event,
        CoreEvent::SpeakingStart { text, .. } if text == "over the wire"
    ));
}

#[tokio::test]
async fn malformed_bus_payload_changes_nothing() {
    use chorus_bus::envelope::topics;
    use chorus_bus::{Bus, MemoryBus};

    let manager = manager();
    let bus: Arc<dyn Bus> = Arc::new(MemoryBus::connected());
    let _dispatcher = BusDispatcher::start(Arc::clone(&bus), manager.clone())
        .await
        .unwrap();

    bus.publish(topics::AGENT_CREATE, b"not json at all".to_vec())
        .unwrap();
    bus.publish(
        topics::AGENT_CREATE,
        br#"{"persona": "x", "unexpected": 1}"#.to_vec(),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(manager.list_agents().await.is_empty());
}
