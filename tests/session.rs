//! Session pipeline integration tests
//!
//! A coordinator is driven through its channels with scripted collaborators.
//! Timer behaviour runs on paused tokio time.

use std::time::Duration;

use cadence::Gateways;
use cadence::protocol::{ClientMessage, ServerMessage};
use cadence::session::{INTERRUPTION_MARKER, Inbound, Role, SessionSettings};

mod common;
use common::{
    FloodingSynthesizer, Harness, RecordingSynthesizer, ScriptedGenerator, ScriptedTranscriber,
    audio_chunks, gateways, tokens,
};

const QUIET: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn three_chunks_then_silence_make_one_utterance() {
    let stt = ScriptedTranscriber::replying("what time is it");
    let llm = ScriptedGenerator::tokens(&["It is noon."]);
    let mut h = Harness::start(gateways(stt.clone(), llm.clone(), RecordingSynthesizer::new()));

    for (len, byte) in [(100, 1u8), (200, 2), (50, 3)] {
        h.send(ClientMessage::AudioInput {
            data: vec![byte; len],
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    let utterances = stt.utterances();
    assert_eq!(utterances.len(), 1);
    let expected = [vec![1u8; 100], vec![2; 200], vec![3; 50]].concat();
    assert_eq!(utterances[0].len(), 350);
    assert_eq!(utterances[0], expected);

    let messages = h.until_turn_end().await;
    assert_eq!(
        messages.first(),
        Some(&ServerMessage::SttResult {
            text: "what time is it".to_string()
        })
    );
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn chunks_inside_the_silence_window_do_not_split_the_utterance() {
    let stt = ScriptedTranscriber::replying("hello");
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::tokens(&["Hi."]),
        RecordingSynthesizer::new(),
    ));

    for _ in 0..5 {
        h.audio(32).await;
        tokio::time::sleep(Duration::from_millis(450)).await;
    }
    assert!(stt.utterances().is_empty());

    // 450ms after the last chunk; the threshold is 500ms
    tokio::time::sleep(Duration::from_millis(49)).await;
    assert!(stt.utterances().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(stt.utterances().len(), 1);
    assert_eq!(stt.utterances()[0].len(), 5 * 32);

    let messages = h.until_turn_end().await;
    let transcripts = messages
        .iter()
        .filter(|m| matches!(m, ServerMessage::SttResult { .. }))
        .count();
    assert_eq!(transcripts, 1);
    assert!(h.drain(QUIET).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn end_utterance_skips_the_silence_wait() {
    let stt = ScriptedTranscriber::replying("hello");
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::tokens(&["Hi."]),
        RecordingSynthesizer::new(),
    ));

    let started = tokio::time::Instant::now();
    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;

    let messages = h.until_turn_end().await;
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(stt.utterances().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn end_utterance_with_empty_buffer_is_a_no_op() {
    let stt = ScriptedTranscriber::replying("hello");
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::tokens(&["Hi."]),
        RecordingSynthesizer::new(),
    ));

    h.send(ClientMessage::EndUtterance).await;
    assert!(h.drain(QUIET).await.is_empty());
    assert!(stt.utterances().is_empty());
}

#[tokio::test(start_paused = true)]
async fn no_speech_sends_exactly_one_error() {
    let llm = ScriptedGenerator::tokens(&["never"]);
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::no_speech(),
        llm.clone(),
        RecordingSynthesizer::new(),
    ));

    h.audio(128).await;
    h.send(ClientMessage::EndUtterance).await;

    let mut messages = h.until_turn_end().await;
    messages.extend(h.drain(QUIET).await);
    assert_eq!(
        messages,
        vec![ServerMessage::Error {
            error: "No speech detected".to_string()
        }]
    );
    assert_eq!(llm.calls(), 0);

    // no turn was recorded
    let history = h.finish().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history.turns()[0].role, Role::System);
}

#[tokio::test(start_paused = true)]
async fn sentence_end_triggers_a_single_flush() {
    let synth = RecordingSynthesizer::new();
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("greet me"),
        ScriptedGenerator::tokens(&["Hello, ", "world."]),
        synth.clone(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;

    assert_eq!(synth.flushed(), vec!["Hello, world.".to_string()]);
    assert_eq!(
        messages,
        vec![
            ServerMessage::SttResult {
                text: "greet me".to_string()
            },
            ServerMessage::LlmToken {
                token: "Hello, ".to_string()
            },
            ServerMessage::LlmToken {
                token: "world.".to_string()
            },
            ServerMessage::AudioChunk {
                data: b"Hello, world.".to_vec()
            },
            ServerMessage::ResponseComplete,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn fragments_are_synthesized_in_generation_order() {
    let synth = RecordingSynthesizer::new();
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("tell me more"),
        ScriptedGenerator::tokens(&["First.", " Second!", " and the", " rest"]),
        synth.clone(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;

    let fragments = vec![
        "First.".to_string(),
        " Second!".to_string(),
        " and the rest".to_string(),
    ];
    assert_eq!(synth.flushed(), fragments);
    let audio: Vec<Vec<u8>> = fragments.iter().map(|f| f.as_bytes().to_vec()).collect();
    assert_eq!(audio_chunks(&messages), audio);
}

#[tokio::test(start_paused = true)]
async fn normal_turn_adds_one_user_and_one_assistant_turn() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("hi"),
        ScriptedGenerator::tokens(&["Hello", " there."]),
        RecordingSynthesizer::new(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    h.until_turn_end().await;

    let history = h.finish().await;
    let turns = history.turns();
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1].role, Role::User);
    assert_eq!(turns[1].text, "hi");
    assert_eq!(turns[2].role, Role::Assistant);
    assert_eq!(turns[2].text, "Hello there.");
    assert!(!turns[2].interrupted);
}

#[tokio::test(start_paused = true)]
async fn generator_sees_history_with_new_user_turn() {
    let llm = ScriptedGenerator::tokens(&["Sure."]);
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("help"),
        llm.clone(),
        RecordingSynthesizer::new(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    h.until_turn_end().await;

    let histories = llm.histories.lock().unwrap().clone();
    let seen = &histories[0];
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].role, Role::System);
    assert_eq!(seen[0].text, "You are a helpful voice assistant.");
    assert_eq!(seen[1].role, Role::User);
    assert_eq!(seen[1].text, "help");
}

#[tokio::test(start_paused = true)]
async fn interrupt_between_tokens_stops_everything() {
    let stt = ScriptedTranscriber::replying("count");
    let synth = RecordingSynthesizer::new();
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::paced(&["One", " two", " three", " four"], Duration::from_millis(100)),
        synth.clone(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;

    assert!(matches!(
        h.next(QUIET).await,
        Some(ServerMessage::SttResult { .. })
    ));
    assert_eq!(
        h.next(QUIET).await,
        Some(ServerMessage::LlmToken {
            token: "One".to_string()
        })
    );

    // audio buffered mid-turn is dropped by the interrupt
    h.audio(64).await;
    h.send(ClientMessage::Interrupt).await;

    assert!(h.drain(QUIET).await.is_empty());
    assert!(synth.flushed().is_empty());
    assert_eq!(stt.utterances().len(), 1);

    let history = h.finish().await;
    let assistant = &history.turns()[2];
    assert!(assistant.interrupted);
    assert_eq!(assistant.text, format!("One{INTERRUPTION_MARKER}"));
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_synthesis_stops_audio() {
    let synth = RecordingSynthesizer::slow(3, Duration::from_millis(100));
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("story"),
        ScriptedGenerator::tokens(&["Once upon a time.", " The end."]),
        synth.clone(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;

    loop {
        match h.next(QUIET).await {
            Some(ServerMessage::AudioChunk { .. }) => break,
            Some(_) => {}
            None => panic!("no audio before timeout"),
        }
    }
    h.send(ClientMessage::Interrupt).await;

    let after = h.drain(QUIET).await;
    assert!(tokens(&after).is_empty());
    assert!(audio_chunks(&after).is_empty());
    assert!(after.is_empty());
    assert_eq!(synth.flushed(), vec!["Once upon a time.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_reaches_synthesis_when_client_stops_reading() {
    let synth = FloodingSynthesizer::new(20_000);
    let h = Harness::start(Gateways {
        transcriber: ScriptedTranscriber::replying("read me a book"),
        generator: ScriptedGenerator::tokens(&["Chapter one."]),
        synthesizer: synth.clone(),
    });

    h.audio(320).await;
    h.send(ClientMessage::EndUtterance).await;

    // nothing reads outbound from here on
    tokio::time::sleep(Duration::from_millis(500)).await;
    let before = synth.produced();
    assert!(before > 0, "synthesis never started");
    assert!(before < 1_000, "produced {before} chunks with nobody reading");

    h.send(ClientMessage::Interrupt).await;
    for _ in 0..100 {
        if synth.stopped() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(synth.stopped());
    assert!(synth.produced() < 1_000);
}

#[tokio::test(start_paused = true)]
async fn repeated_interrupts_mark_history_once() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("go"),
        ScriptedGenerator::paced(&["Going", " on"], Duration::from_millis(100)),
        RecordingSynthesizer::new(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    h.next(QUIET).await;
    h.next(QUIET).await;

    h.send(ClientMessage::Interrupt).await;
    h.send(ClientMessage::Interrupt).await;
    h.send(ClientMessage::Interrupt).await;
    assert!(h.drain(QUIET).await.is_empty());

    let history = h.finish().await;
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.turns()[2].text.matches(INTERRUPTION_MARKER.trim()).count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn interrupt_while_idle_is_harmless() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("hi"),
        ScriptedGenerator::tokens(&["Hey."]),
        RecordingSynthesizer::new(),
    ));

    h.send(ClientMessage::Interrupt).await;
    assert!(h.drain(QUIET).await.is_empty());

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
}

#[tokio::test(start_paused = true)]
async fn new_utterance_replaces_the_active_turn() {
    let stt = ScriptedTranscriber::replying("again");
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::paced(&["A", " b", " c."], Duration::from_millis(100)),
        RecordingSynthesizer::new(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    h.next(QUIET).await;
    assert_eq!(
        h.next(QUIET).await,
        Some(ServerMessage::LlmToken {
            token: "A".to_string()
        })
    );

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;

    let messages = h.until_turn_end().await;
    assert_eq!(
        messages.first(),
        Some(&ServerMessage::SttResult {
            text: "again".to_string()
        })
    );
    assert_eq!(tokens(&messages), vec!["A", " b", " c."]);
    assert_eq!(stt.utterances().len(), 2);

    let history = h.finish().await;
    let texts: Vec<&str> = history.turns().iter().map(|t| t.text.as_str()).collect();
    assert_eq!(
        texts,
        vec![
            "You are a helpful voice assistant.",
            "again",
            "A [interrupted]",
            "again",
            "A b c."
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn generation_failure_keeps_partial_reply() {
    let synth = RecordingSynthesizer::new();
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("hi"),
        ScriptedGenerator::failing_after(&["Partial"], "upstream reset"),
        synth.clone(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;

    assert_eq!(
        messages.last(),
        Some(&ServerMessage::Error {
            error: "response generation failed: upstream reset".to_string()
        })
    );
    assert!(!messages.contains(&ServerMessage::ResponseComplete));
    assert!(synth.flushed().is_empty());

    let history = h.finish().await;
    assert_eq!(history.turns()[2].text, "Partial");
    assert!(!history.turns()[2].interrupted);
}

#[tokio::test(start_paused = true)]
async fn synthesis_failure_keeps_streamed_tokens() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("hi"),
        ScriptedGenerator::tokens(&["Hi.", " More."]),
        RecordingSynthesizer::failing(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;

    assert_eq!(tokens(&messages), vec!["Hi."]);
    match messages.last() {
        Some(ServerMessage::Error { error }) => {
            assert!(error.starts_with("speech synthesis failed"), "{error}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(h.drain(QUIET).await.is_empty());

    let history = h.finish().await;
    assert_eq!(history.turns()[2].text, "Hi.");
    assert!(!history.turns()[2].interrupted);
}

#[tokio::test(start_paused = true)]
async fn protocol_violation_reports_and_keeps_session_open() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("hi"),
        ScriptedGenerator::tokens(&["Hello."]),
        RecordingSynthesizer::new(),
    ));

    let err = ClientMessage::parse(r#"{"type":"dance"}"#).unwrap_err();
    h.inbound.send(Inbound::Invalid(err)).await.unwrap();

    match h.next(QUIET).await {
        Some(ServerMessage::Error { error }) => assert!(error.starts_with("invalid message")),
        other => panic!("expected error, got {other:?}"),
    }

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    let messages = h.until_turn_end().await;
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
}

#[tokio::test(start_paused = true)]
async fn undecodable_audio_is_dropped_silently() {
    let stt = ScriptedTranscriber::replying("hi");
    let mut h = Harness::start(gateways(
        stt.clone(),
        ScriptedGenerator::tokens(&["Hello."]),
        RecordingSynthesizer::new(),
    ));

    h.audio(10).await;
    let err = ClientMessage::parse(r#"{"type":"audio_input","data":"@@not base64@@"}"#).unwrap_err();
    assert!(err.is_audio_decode());
    h.inbound.send(Inbound::Invalid(err)).await.unwrap();
    h.audio(20).await;
    h.send(ClientMessage::EndUtterance).await;

    let messages = h.until_turn_end().await;
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
    assert_eq!(stt.utterances()[0].len(), 30);
}

#[tokio::test(start_paused = true)]
async fn full_buffer_finalizes_early() {
    let stt = ScriptedTranscriber::replying("long");
    let settings = SessionSettings {
        max_utterance_bytes: 100,
        ..SessionSettings::default()
    };
    let mut h = Harness::with_settings(
        gateways(
            stt.clone(),
            ScriptedGenerator::tokens(&["Ok."]),
            RecordingSynthesizer::new(),
        ),
        &settings,
    );

    let started = tokio::time::Instant::now();
    h.audio(60).await;
    h.audio(60).await;

    let messages = h.until_turn_end().await;
    assert_eq!(messages.last(), Some(&ServerMessage::ResponseComplete));
    assert!(started.elapsed() < settings.silence);
    assert_eq!(stt.utterances()[0].len(), 120);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_the_active_turn() {
    let mut h = Harness::start(gateways(
        ScriptedTranscriber::replying("bye"),
        ScriptedGenerator::paced(&["Good", "bye"], Duration::from_millis(100)),
        RecordingSynthesizer::new(),
    ));

    h.audio(64).await;
    h.send(ClientMessage::EndUtterance).await;
    h.next(QUIET).await;
    h.next(QUIET).await;

    h.shutdown.cancel();
    let history = h.task.await.unwrap();
    assert_eq!(history.turns()[2].text, format!("Good{INTERRUPTION_MARKER}"));
}
