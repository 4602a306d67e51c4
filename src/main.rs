use anyhow::{Context, ensure};
use chrono::Local;
use log::info;
use std::time::Duration;
use tokio::sync::oneshot;

use relay_call::calls::loopback::{
    LoopbackRelay, answer_next_call, loopback_services, random_seed, run_call,
};
use relay_call::{Call, CallConfig, CallState, CallType};

// Two users negotiate an encrypted call through an in-memory relay, talk for a
// moment and hang up.
//
// Usage:
//   cargo run                          # default call settings
//   cargo run -- call-config.json      # settings from a JSON file

const ALICE: i64 = 1001;
const BOB: i64 = 1002;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading call config {path}"))?;
            CallConfig::from_json(&json).with_context(|| format!("parsing call config {path}"))?
        }
        None => CallConfig::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: CallConfig) -> anyhow::Result<()> {
    let relay = LoopbackRelay::new();
    let alice_updates = relay.register(ALICE);
    let mut bob_updates = relay.register(BOB);

    let bob_services = loopback_services(&relay, BOB);
    let bob_config = config.clone();
    let bob = tokio::spawn(async move {
        let call = answer_next_call(bob_services, &mut bob_updates, bob_config, &random_seed())
            .await?;
        info!("Bob answered call {}", call.id());
        let (_keep, never) = oneshot::channel::<()>();
        Some(run_call(call, bob_updates, never).await)
    });

    let mut alice_call = Call::new(loopback_services(&relay, ALICE), BOB, CallType::Outgoing, config);
    let mut alice_states = alice_call.subscribe();
    alice_call.start(&random_seed());
    let (hangup_tx, hangup_rx) = oneshot::channel();
    let alice = tokio::spawn(run_call(alice_call, alice_updates, hangup_rx));

    // Media reports Established again once the loopback session connects.
    let connected = tokio::time::timeout(Duration::from_secs(10), async {
        let mut saw_handshake = false;
        while let Ok(state) = alice_states.recv().await {
            match state {
                CallState::WaitingInitAck => saw_handshake = true,
                CallState::Established if saw_handshake => return true,
                s if s.is_terminal() => return false,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    ensure!(connected, "call did not connect");

    info!("Connected, talking for a second");
    tokio::time::sleep(Duration::from_secs(1)).await;
    let _ = hangup_tx.send(());

    let alice_call = alice.await.context("alice task")?;
    let bob_call = bob
        .await
        .context("bob task")?
        .context("bob never received the call")?;

    let alice_fp = alice_call.key_fingerprint().context("alice has no key")?;
    let bob_fp = bob_call.key_fingerprint().context("bob has no key")?;
    info!("Alice fingerprint {alice_fp:016x}, state {}", alice_call.state());
    info!("Bob   fingerprint {bob_fp:016x}, state {}", bob_call.state());
    ensure!(alice_fp == bob_fp, "fingerprints differ");
    Ok(())
}
