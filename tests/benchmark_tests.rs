//! Performance benchmarks for the hot paths of the buzzer server

use server::client_manager::{Client, ClientKind, ClientManager, Frame};
use server::config::GameConfig;
use server::game::Engine;
use server::model::{Device, RosterUpdate, Team};
use shared::{Action, FrameParser, Message};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

fn populated_engine(teams: usize, per_team: usize) -> Engine {
    let engine = Engine::new(&GameConfig::default());
    let mut team_map = BTreeMap::new();
    let mut bumpers = BTreeMap::new();
    for t in 0..teams {
        let team_id = format!("team-{}", t);
        team_map.insert(team_id.clone(), Team::new(team_id.clone()));
        for p in 0..per_team {
            bumpers.insert(
                format!("{:02X}:{:02X}", t, p),
                Device::new(format!("Player {}-{}", t, p), Some(&team_id)),
            );
        }
    }
    engine.replace_roster(RosterUpdate {
        teams: Some(team_map),
        bumpers: Some(bumpers),
    });
    engine
}

/// Benchmarks stream parsing of many small messages arriving in 4 KiB reads
#[test]
fn benchmark_stream_parsing() {
    let one = Message::empty(Action::Button).with_id("AA:BB:CC:DD:EE:FF").encode_stream().unwrap();
    let stream: Vec<u8> = one.iter().copied().cycle().take(one.len() * 10_000).collect();

    let start = Instant::now();
    let mut parser = FrameParser::new();
    let mut parsed = 0;
    for chunk in stream.chunks(4096) {
        parser.append(chunk);
        parsed += parser.parse().len();
    }
    let duration = start.elapsed();

    println!(
        "Stream parsing: {} messages in {:?} ({:.2} μs/message)",
        parsed,
        duration,
        duration.as_micros() as f64 / parsed as f64
    );

    assert_eq!(parsed, 10_000);
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks buzz recording across a full room of devices
#[test]
fn benchmark_buzz_recording() {
    let engine = populated_engine(8, 6);
    let devices: Vec<String> = engine.current_roster_snapshot().bumpers.into_keys().collect();

    let rounds = 200;
    let start = Instant::now();
    for round in 0..rounds {
        engine.start_round(30);
        for (i, device) in devices.iter().enumerate() {
            let timestamp = (round * 1_000 + (devices.len() - i)) as i64;
            engine.record_buzz(device, timestamp, "A");
        }
        engine.stop_round();
    }
    let duration = start.elapsed();

    println!(
        "Buzz recording: {} rounds × {} devices in {:?}",
        rounds,
        devices.len(),
        duration
    );

    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks score updates that recompute team sums every time
#[test]
fn benchmark_score_updates() {
    let engine = populated_engine(8, 6);

    let iterations = 10_000;
    let start = Instant::now();
    for i in 0..iterations {
        let team = format!("team-{}", i % 8);
        engine.distribute_team_score(&team, (i % 13) as i64 - 6);
    }
    let duration = start.elapsed();

    println!(
        "Score updates: {} distributions in {:?} ({:.2} μs/update)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    let snapshot = engine.current_roster_snapshot();
    for (id, team) in &snapshot.teams {
        let members: i64 = snapshot
            .bumpers
            .values()
            .filter(|device| device.team.as_deref() == Some(id.as_str()))
            .map(|device| device.score)
            .sum();
        assert_eq!(team.score, members);
    }
    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks snapshot encoding for a full room
#[test]
fn benchmark_snapshot_encoding() {
    let engine = populated_engine(8, 6);

    let iterations = 1_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let message = Message::new(Action::Update, &engine.current_state_snapshot()).unwrap();
        let _frame = message.encode_frame().unwrap();
    }
    let duration = start.elapsed();

    println!(
        "Snapshot encoding: {} snapshots in {:?} ({:.2} μs/snapshot)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2 seconds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks fan-out of shared frames to many clients
#[tokio::test]
async fn benchmark_fan_out() {
    let mut manager = ClientManager::new(100);
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1_024);
        manager.add_client(Client::new(format!("client-{}", i), ClientKind::Display, i, tx));
        receivers.push(rx);
    }

    let frame: Frame = Arc::from(Message::empty(Action::UpdateTimer).encode_frame().unwrap());
    let iterations = 1_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let dropped = manager.fan_out(&frame);
        assert!(dropped.is_empty());
    }
    let duration = start.elapsed();

    println!(
        "Fan-out: {} frames to {} clients in {:?}",
        iterations,
        manager.len(),
        duration
    );

    assert_eq!(manager.len(), 100);
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}
