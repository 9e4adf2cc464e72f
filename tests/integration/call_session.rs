//! End-to-end call sessions over the in-process transport.

use crate::helpers::{path, scripted_stages, start_call, test_config};
use siphon::call::EndReason;
use siphon::error::{StageError, StageKind};
use siphon::memory::{CallerMemory, InMemoryCallerMemory};
use siphon::persistence::{JsonlSink, PersistenceForwarder};
use siphon::pipeline::messages::Speaker;
use siphon::pipeline::turn::{TransitionCause, TurnState};
use siphon::stage::StageSet;
use siphon::stage::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
use siphon::telephony::{SignalingEvent, TelephonyCommand, signaling_pair};
use siphon::RuntimeEvent;
use std::sync::Arc;
use std::time::Duration;

const LONG_ANSWER: &str = "We are open from nine in the morning until six in the evening \
    on weekdays and from ten until four on Saturdays and we are closed on public holidays";

#[tokio::test]
async fn caller_question_gets_a_spoken_answer() {
    let config = test_config();
    let (stages, llm) = scripted_stages(&config, &["what are your hours"], &["nine to five"]);
    let mut call = start_call(config.clone(), stages, false, |s| s);

    call.caller.silence(100).await;
    call.caller.speak(300).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    call.caller.hang_up();

    let summary = call.finish().await;
    assert_eq!(summary.call.end_reason, Some(EndReason::HungUp));
    assert_eq!(summary.transcript, vec!["what are your hours"]);
    assert_eq!(summary.generations, 1);
    assert_eq!(
        path(&summary),
        vec![
            TurnState::UserSpeaking,
            TurnState::AgentProcessing,
            TurnState::AgentSpeaking,
            TurnState::Idle,
        ]
    );
    // Three words, five frames each.
    assert_eq!(summary.frames_sent, 15);
    assert_eq!(call.caller.heard().await.len(), 15);

    let requests = llm.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].utterance.text, "what are your hours");
    assert_eq!(requests[0].system_instructions, config.agent.system_instructions);
    assert!(requests[0].history.is_empty());
}

#[tokio::test]
async fn barge_in_cancels_the_answer_and_truncates_audio() {
    let config = test_config();
    let (stages, llm) = scripted_stages(
        &config,
        &["what are your hours", "are you open on sunday"],
        &[LONG_ANSWER, "yes from eleven"],
    );
    let mut call = start_call(config, stages, true, |s| s);

    call.caller.speak(300).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentProcessing, TurnState::AgentSpeaking).await;
    call.caller.silence(200).await;
    let heard_before_barge_in = call.caller.heard_count();
    call.caller.speak(200).await;

    let interruption = call
        .wait_for(|e| matches!(e, RuntimeEvent::Interruption { .. }))
        .await;
    let RuntimeEvent::Interruption {
        truncation_latency,
        frames_discarded,
        ..
    } = interruption
    else {
        unreachable!()
    };
    assert!(frames_discarded > 0, "queued agent audio should be discarded");
    assert!(
        truncation_latency < Duration::from_millis(150),
        "barge-in took {truncation_latency:?}"
    );

    call.caller.silence(800).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    call.caller.hang_up();
    let summary = call.finish().await;

    assert_eq!(summary.interruptions, 1);
    assert_eq!(summary.generations, 2);
    assert!(summary.frames_discarded > 0);
    assert!(heard_before_barge_in > 0);
    assert_eq!(
        summary.transcript,
        vec!["what are your hours", "are you open on sunday"]
    );
    assert!(summary.transitions.iter().any(|t| t.from == TurnState::AgentSpeaking
        && t.to == TurnState::Interrupted
        && t.cause == TransitionCause::BargeIn));
    assert!(summary
        .transitions
        .iter()
        .any(|t| t.from == TurnState::Interrupted && t.to == TurnState::UserSpeaking));

    // Most of the long answer never played.
    let total_answer_frames = LONG_ANSWER.split_whitespace().count() as u64 * 5;
    assert!(summary.frames_sent < total_answer_frames);

    // The follow-up request sees the cut-off answer in its history.
    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let last = requests[1].history.last().expect("history should not be empty");
    assert_eq!(last.speaker, Speaker::Agent);
    assert!(last.interrupted);
    assert!(last.text.starts_with("We are"));
    assert_eq!(requests[1].utterance.text, "are you open on sunday");

    // Outbound sequence numbers never go backwards, even across truncation.
    let heard = call.caller.heard().await;
    assert!(heard.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn disabled_interruptions_let_the_agent_finish() {
    let config = test_config();
    let (stages, _llm) = scripted_stages(
        &config,
        &["what are your hours", "hello?"],
        &["nine to five on weekdays and ten to four on saturdays"],
    );
    let mut call = start_call(config, stages, true, |s| s);
    call.handle.set_allow_interruptions(false);

    call.caller.speak(300).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentProcessing, TurnState::AgentSpeaking).await;
    call.caller.speak(300).await;
    call.caller.silence(200).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    call.caller.hang_up();

    let summary = call.finish().await;
    assert_eq!(summary.interruptions, 0);
    assert_eq!(summary.generations, 1);
    assert!(summary.transitions.iter().all(|t| t.to != TurnState::Interrupted));
    assert_eq!(summary.frames_discarded, 0);
    // 11 words, five frames each, all delivered.
    assert_eq!(summary.frames_sent, 55);
}

#[tokio::test]
async fn signaling_drives_the_call_lifecycle() {
    let config = test_config();
    let (stages, _llm) = scripted_stages(&config, &["hi"], &["hello there"]);
    let (link, mut signaling) = signaling_pair(8);
    let mut call = start_call(config, stages, false, |s| s.with_telephony(link));

    signaling.events.send(SignalingEvent::Ringing).await.unwrap();
    signaling.events.send(SignalingEvent::Answered).await.unwrap();
    call.caller.speak(200).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    signaling.events.send(SignalingEvent::HungUp).await.unwrap();

    let summary = call.finish().await;
    assert_eq!(summary.call.end_reason, Some(EndReason::HungUp));
    assert!(summary.call.answered_at.is_some());
    assert!(summary.call.ended_at.is_some());
    assert!(signaling.commands.try_recv().is_err());
}

#[tokio::test]
async fn transfer_ends_the_call() {
    let config = test_config();
    let (stages, _llm) = scripted_stages(&config, &[], &[]);
    let (link, signaling) = signaling_pair(8);
    let mut call = start_call(config, stages, false, |s| s.with_telephony(link));

    signaling.events.send(SignalingEvent::Answered).await.unwrap();
    call.caller.silence(100).await;
    signaling
        .events
        .send(SignalingEvent::Transferred {
            destination: "sip:front-desk@example.com".into(),
        })
        .await
        .unwrap();

    let summary = call.finish().await;
    assert_eq!(
        summary.call.end_reason,
        Some(EndReason::Transferred {
            destination: "sip:front-desk@example.com".into()
        })
    );
}

#[tokio::test]
async fn fatal_provider_failure_hangs_up() {
    let config = test_config();
    let stages = StageSet {
        stt: Arc::new(ScriptedStt::new(["hi"], config.vad.clone())),
        llm: Arc::new(
            ScriptedLlm::new(["unused"])
                .fail_next_start(StageError::fatal(StageKind::Llm, "invalid api key")),
        ),
        tts: Arc::new(ScriptedTts::new(config.vad.sample_rate)),
    };
    let (link, mut signaling) = signaling_pair(8);
    let mut call = start_call(config, stages, false, |s| s.with_telephony(link));

    signaling.events.send(SignalingEvent::Answered).await.unwrap();
    call.caller.speak(200).await;
    call.caller.silence(700).await;

    let summary = call.finish().await;
    let Some(EndReason::ProviderFailure { detail }) = &summary.call.end_reason else {
        panic!("unexpected end: {:?}", summary.call.end_reason);
    };
    assert!(detail.contains("invalid api key"));
    assert_eq!(summary.frames_sent, 0);
    assert_eq!(summary.call.turn_state, TurnState::Idle);

    match signaling.commands.recv().await {
        Some(TelephonyCommand::HangUp { call_id, reason }) => {
            assert_eq!(call_id, summary.call.id);
            assert!(matches!(reason, EndReason::ProviderFailure { .. }));
        }
        other => panic!("expected hang-up, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_llm_failure_is_retried() {
    let config = test_config();
    let llm = Arc::new(
        ScriptedLlm::new(["sure thing"])
            .with_token_delay(Duration::from_millis(1))
            .fail_next_start(StageError::transient(StageKind::Llm, "503 service unavailable")),
    );
    let stages = StageSet {
        stt: Arc::new(ScriptedStt::new(["book a table"], config.vad.clone())),
        llm: llm.clone(),
        tts: Arc::new(ScriptedTts::new(config.vad.sample_rate)),
    };
    let mut call = start_call(config, stages, false, |s| s);

    call.caller.speak(200).await;
    call.caller.silence(700).await;
    // The reply text and the end of playout may be reported in either order.
    let mut said = None;
    let mut flushed = false;
    while said.is_none() || !flushed {
        match call.wait_for(|_| true).await {
            RuntimeEvent::AgentText { text, .. } => said = Some(text),
            RuntimeEvent::TurnChanged { transition, .. } => {
                flushed |= transition.to == TurnState::Idle;
            }
            _ => {}
        }
    }
    assert_eq!(said.as_deref(), Some("sure thing"));
    call.caller.hang_up();

    let summary = call.finish().await;
    assert_eq!(summary.call.end_reason, Some(EndReason::HungUp));
    assert_eq!(summary.frames_sent, 10);
    assert_eq!(llm.requests().len(), 2);
}

#[tokio::test]
async fn stt_restarts_after_a_transient_failure() {
    let config = test_config();
    let stages = StageSet {
        stt: Arc::new(
            ScriptedStt::new(["book a table"], config.vad.clone())
                .fail_next_start(StageError::transient(StageKind::Stt, "connection reset")),
        ),
        llm: Arc::new(ScriptedLlm::new(["done"]).with_token_delay(Duration::ZERO)),
        tts: Arc::new(ScriptedTts::new(config.vad.sample_rate)),
    };
    let mut call = start_call(config, stages, false, |s| s);

    // Give the restart backoff time to elapse before speaking.
    call.caller.silence(200).await;
    call.caller.speak(200).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    call.caller.hang_up();

    let summary = call.finish().await;
    assert_eq!(summary.transcript, vec!["book a table"]);
    assert_eq!(summary.call.end_reason, Some(EndReason::HungUp));
}

#[tokio::test]
async fn heavy_inbound_loss_ends_the_call() {
    let config = test_config();
    let (stages, _llm) = scripted_stages(&config, &[], &[]);
    let (link, mut signaling) = signaling_pair(8);
    let mut call = start_call(config.clone(), stages, false, |s| s.with_telephony(link));
    signaling.events.send(SignalingEvent::Answered).await.unwrap();

    // Two of every three frames go missing.
    for i in 0..(config.transport.loss_window_frames as u64) {
        call.caller.send_with_sequence(i * 3).await;
    }

    let summary = call.finish().await;
    assert!(matches!(
        summary.call.end_reason,
        Some(EndReason::TransportLost { .. })
    ));
    assert!(matches!(
        signaling.commands.recv().await,
        Some(TelephonyCommand::HangUp { .. })
    ));
}

#[tokio::test]
async fn persistence_writes_call_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.persistence.record_audio = true;
    config.persistence.save_transcription = true;
    config.persistence.save_metadata = true;
    let sink = Arc::new(JsonlSink::new(dir.path()));
    let forwarder = Arc::new(PersistenceForwarder::spawn(sink.clone(), &config.persistence));
    let (stages, _llm) = scripted_stages(&config, &["cancel my order"], &["it is cancelled"]);
    let mut call = start_call(config, stages, false, |s| {
        s.with_persistence(Arc::clone(&forwarder))
    });

    call.caller.speak(200).await;
    call.caller.silence(700).await;
    call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
    call.caller.hang_up();
    let summary = call.finish().await;
    forwarder.close().await;

    let call_dir = sink.call_dir(&summary.call.id);
    let transcript = std::fs::read_to_string(call_dir.join("transcript.jsonl")).unwrap();
    assert_eq!(transcript.lines().count(), 1);
    assert!(transcript.contains("cancel my order"));

    let metadata = std::fs::read_to_string(call_dir.join("metadata.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = metadata
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.first().unwrap()["record"], "call_started");
    let last = records.last().unwrap();
    assert_eq!(last["record"], "call_ended");
    assert_eq!(last["answered"], true);
    assert_eq!(
        records.iter().filter(|r| r["record"] == "transition").count(),
        summary.transitions.len()
    );

    assert!(!std::fs::read(call_dir.join("inbound.pcm")).unwrap().is_empty());
    let outbound = std::fs::read(call_dir.join("outbound.pcm")).unwrap();
    assert_eq!(outbound.len() as u64, summary.frames_sent * 640);
}

#[tokio::test]
async fn one_forwarder_persists_consecutive_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.persistence.save_metadata = true;
    let sink = Arc::new(JsonlSink::new(dir.path()));
    let forwarder = Arc::new(PersistenceForwarder::spawn(sink.clone(), &config.persistence));

    let mut ids = Vec::new();
    for utterance in ["first question", "second question"] {
        let (stages, _llm) = scripted_stages(&config, &[utterance], &["noted"]);
        let mut call = start_call(config.clone(), stages, false, |s| {
            s.with_persistence(Arc::clone(&forwarder))
        });
        call.caller.speak(200).await;
        call.caller.silence(700).await;
        call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
        call.caller.hang_up();
        ids.push(call.finish().await.call.id);
    }
    forwarder.close().await;

    assert_eq!(forwarder.dropped(), 0);
    for id in &ids {
        let metadata = std::fs::read_to_string(sink.call_dir(id).join("metadata.jsonl")).unwrap();
        let records: Vec<serde_json::Value> = metadata
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.first().unwrap()["record"], "call_started", "call {id}");
        assert_eq!(records.last().unwrap()["record"], "call_ended", "call {id}");
    }
}

#[tokio::test]
async fn returning_caller_is_recognised() {
    let config = test_config();
    let memory = Arc::new(InMemoryCallerMemory::new());

    let mut requests = Vec::new();
    for (utterance, response) in [("book a cleaning", "booked"), ("is it still on", "yes")] {
        let (stages, llm) = scripted_stages(&config, &[utterance], &[response]);
        let store: Arc<dyn CallerMemory> = memory.clone();
        let mut call = start_call(config.clone(), stages, false, |s| {
            s.with_caller("+1 (555) 010-0199").with_caller_memory(store)
        });
        call.caller.speak(200).await;
        call.caller.silence(700).await;
        call.wait_for_turn(TurnState::AgentSpeaking, TurnState::Idle).await;
        call.caller.hang_up();
        call.finish().await;
        requests.push(llm.requests().remove(0));
    }

    assert_eq!(requests[0].system_instructions, config.agent.system_instructions);
    let recalled = &requests[1].system_instructions;
    assert!(recalled.starts_with(&config.agent.system_instructions));
    assert!(recalled.contains("Call #1 of 1: Caller said: book a cleaning"), "{recalled}");

    let profile = memory.load("+15550100199").await.unwrap().unwrap();
    assert_eq!(profile.total_calls, 2);
    assert_eq!(profile.notes.len(), 2);
    assert_eq!(profile.notes[1].summary, "Caller said: is it still on");
}
