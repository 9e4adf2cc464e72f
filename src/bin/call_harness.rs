//! Scripted end-to-end call for exercising a session without a phone line.
//!
//! The simulated caller asks a question, barges in while the agent is
//! answering, then hangs up once the second answer has played. Runtime events
//! are logged to stderr and a JSON call report is printed to stdout.
//!
//! Usage: `siphon-call-harness [config.toml]`
//!
//! Without an argument the default config file is used if it exists. Enabled
//! persistence streams are written under `persistence.output_dir`, and with
//! `memory.enabled` the scripted caller is remembered across runs.

use siphon::audio::{CallerEnd, ChannelTransport};
use siphon::memory::FileCallerMemory;
use siphon::persistence::{JsonlSink, PersistenceForwarder};
use siphon::pipeline::messages::{AudioFrame, Direction};
use siphon::stage::StageSet;
use siphon::stage::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
use siphon::{AgentConfig, CallId, RuntimeEvent, SessionOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const FRAME_MS: u64 = 20;

/// Caller ID presented by the scripted call.
const HARNESS_CALLER: &str = "+1 555 010 0199";

/// Caller timeline: (speaking, duration in ms).
const CALLER_SCRIPT: &[(bool, u64)] = &[
    (false, 200),
    (true, 400),
    (false, 1_400),
    (true, 400),
    (false, 3_000),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the report; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("siphon=info")),
        )
        .init();

    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => AgentConfig::from_file(&path)?,
        None => {
            let path = AgentConfig::default_config_path();
            if path.exists() {
                info!(path = %path.display(), "using default config file");
                AgentConfig::from_file(&path)?
            } else {
                AgentConfig::default()
            }
        }
    };
    config.validate()?;

    let persistence_dir = config
        .persistence
        .any_enabled()
        .then(|| config.persistence.resolved_output_dir());
    let forwarder = Arc::new(match &persistence_dir {
        Some(dir) => PersistenceForwarder::spawn(Arc::new(JsonlSink::new(dir)), &config.persistence),
        None => PersistenceForwarder::disabled(),
    });
    let memory_dir = config.memory.enabled.then(|| config.memory.resolved_dir());

    let sample_rate = config.vad.sample_rate;
    let stages = StageSet {
        stt: Arc::new(ScriptedStt::new(
            ["What are your opening hours", "Actually are you open on Sunday"],
            config.vad.clone(),
        )),
        llm: Arc::new(ScriptedLlm::new([
            "We are open from nine in the morning until six in the evening on weekdays \
             and from ten until four on Saturdays",
            "Yes, on Sundays we open from eleven until three",
        ])),
        tts: Arc::new(ScriptedTts::new(sample_rate)),
    };

    let (transport, caller) = ChannelTransport::pair(&config.transport);
    let transport = transport.with_playout_pacing(true);
    let (events_tx, events_rx) = broadcast::channel(256);
    let call_id = CallId::new();
    let mut session = SessionOrchestrator::new(config, call_id.clone(), stages, Arc::new(transport))
        .with_runtime_events(events_tx)
        .with_persistence(Arc::clone(&forwarder))
        .with_caller(HARNESS_CALLER);
    if let Some(dir) = &memory_dir {
        session = session.with_caller_memory(Arc::new(FileCallerMemory::new(dir)));
    }

    info!(call_id = %call_id, "starting scripted call");
    let watcher = tokio::spawn(log_runtime_events(events_rx));
    let heard = tokio::spawn(run_caller(caller, sample_rate));
    let summary = session.run().await?;
    let frames_heard = heard.await?;
    let interruptions = watcher.await?;
    forwarder.close().await;

    let report = serde_json::json!({
        "summary": summary,
        "frames_heard": frames_heard,
        "truncation_latencies_us": interruptions,
        "persistence_dir": persistence_dir,
        "persistence_dropped": forwarder.dropped(),
        "memory_dir": memory_dir,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Play the caller script in real time, then hang up. Returns frames heard.
async fn run_caller(caller: CallerEnd, sample_rate: u32) -> u64 {
    let CallerEnd { speak, mut hear } = caller;
    let listener = tokio::spawn(async move {
        let mut heard = 0_u64;
        while hear.recv().await.is_some() {
            heard += 1;
        }
        heard
    });

    let samples_per_frame = (u64::from(sample_rate) * FRAME_MS / 1_000) as usize;
    let loud: Vec<i16> = (0..samples_per_frame)
        .map(|i| if i % 2 == 0 { 8_000 } else { -8_000 })
        .collect();
    let quiet = vec![0_i16; samples_per_frame];

    let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
    let mut sequence = 0_u64;
    'script: for &(speaking, duration_ms) in CALLER_SCRIPT {
        for _ in 0..duration_ms / FRAME_MS {
            ticker.tick().await;
            let samples = if speaking { &loud } else { &quiet };
            let frame = AudioFrame::from_pcm16(
                Direction::Inbound,
                sequence,
                Duration::from_millis(sequence * FRAME_MS),
                sample_rate,
                samples,
            );
            sequence += 1;
            if speak.send(frame).await.is_err() {
                break 'script;
            }
        }
    }
    drop(speak);
    listener.await.unwrap_or(0)
}

/// Log runtime events; returns barge-in truncation latencies in microseconds.
async fn log_runtime_events(mut events: broadcast::Receiver<RuntimeEvent>) -> Vec<u64> {
    let mut latencies = Vec::new();
    loop {
        match events.recv().await {
            Ok(event) => {
                if let RuntimeEvent::Interruption { truncation_latency, .. } = &event {
                    latencies.push(truncation_latency.as_micros() as u64);
                }
                let ended = matches!(event, RuntimeEvent::CallEnded { .. });
                match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "siphon::harness", "{json}"),
                    Err(e) => info!(target: "siphon::harness", "unencodable event: {e}"),
                }
                if ended {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                info!(target: "siphon::harness", missed, "runtime events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    latencies
}
