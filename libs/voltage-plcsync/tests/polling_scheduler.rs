//! Polling scheduler tests against the simulated PLC

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::{Duration, Instant};

use common::{connected_context, wait_until};
use voltage_plcsync::{Area, PlcError, RunState, Value};

#[tokio::test]
async fn test_bounded_group_runs_exact_cycles() {
    let (plc, ctx) = connected_context().await;
    plc.poke_word(Area::Memory, 4, 0x0A0B);
    plc.poke(Area::Memory, 6, &[0x42]);

    ctx.add_polling_group("bounded", &["Word2", "Status"], 10, 3)
        .unwrap();
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("bounded")
            .is_some_and(|s| s.state == RunState::Stopped)
    })
    .await;

    let snap = ctx.group_snapshot("bounded").unwrap();
    assert_eq!(snap.cycles, 3);
    assert_eq!(snap.read_errors, 0);
    assert_eq!(snap.variables, vec!["Word2".to_string(), "Status".to_string()]);
    assert_eq!(plc.read_count(), 6);

    assert_eq!(ctx.word("Word2").unwrap(), 0x0A0B);
    assert_eq!(ctx.byte("Word2_HighByte").unwrap(), 0x0A);
    assert_eq!(ctx.byte("Status").unwrap(), 0x42);
    assert!(ctx.is_changed("Word2_LowBit0").unwrap());
}

#[tokio::test]
async fn test_unbounded_group_runs_until_removed() {
    let (plc, ctx) = connected_context().await;
    ctx.add_polling_group("forever", &["Run"], 10, 0).unwrap();

    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("forever").is_some_and(|s| s.cycles >= 3)
    })
    .await;
    plc.poke(Area::Memory, 8, &[0x01]);
    wait_until(Duration::from_secs(2), || ctx.flag("Run").unwrap()).await;

    ctx.remove_polling_group("forever").await.unwrap();
    assert!(ctx.group_snapshot("forever").is_none());

    let reads = plc.read_count();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(plc.read_count(), reads);
}

#[tokio::test]
async fn test_offline_device_skips_cycles_then_resumes() {
    let (plc, ctx) = connected_context().await;
    ctx.add_polling_group("field", &["Sensor"], 10, 0).unwrap();
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("field").is_some_and(|s| s.cycles >= 1)
    })
    .await;

    plc.set_online(false);
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("field")
            .is_some_and(|s| s.skipped_cycles >= 2)
    })
    .await;
    assert!(!ctx.alive());

    plc.poke_word(Area::Input, 0, 0x0777);
    plc.set_online(true);
    let resumed_from = ctx.group_snapshot("field").unwrap().cycles;
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("field")
            .is_some_and(|s| s.cycles > resumed_from)
    })
    .await;
    wait_until(Duration::from_secs(2), || ctx.word("Sensor").unwrap() == 0x0777).await;
    assert!(ctx.alive());

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_remove_interrupts_long_interval() {
    let (_plc, ctx) = connected_context().await;
    ctx.add_polling_group("slow", &["Word2"], 500, 0).unwrap();
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("slow").is_some_and(|s| s.cycles >= 1)
    })
    .await;

    let started = Instant::now();
    ctx.remove_polling_group("slow").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_result_read_after_stop_is_discarded() {
    let (plc, ctx) = connected_context().await;
    plc.poke_word(Area::Memory, 4, 0x1234);
    plc.set_read_delay(Duration::from_millis(150));

    ctx.add_polling_group("stale", &["Word2"], 20, 0).unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    ctx.remove_polling_group("stale").await.unwrap();

    assert_eq!(plc.read_count(), 1);
    assert_eq!(ctx.word("Word2").unwrap(), 0);
    assert!(!ctx.is_changed("Word2").unwrap());
}

#[tokio::test]
async fn test_group_validation() {
    let (_plc, ctx) = connected_context().await;
    let none: [&str; 0] = [];

    assert!(matches!(
        ctx.add_polling_group("", &["Word2"], 10, 0),
        Err(PlcError::PollingGroup(_))
    ));
    assert!(matches!(
        ctx.add_polling_group("empty", &none, 10, 0),
        Err(PlcError::PollingGroup(_))
    ));
    assert!(matches!(
        ctx.add_polling_group("bad", &["Nope"], 10, 0),
        Err(PlcError::UnknownVariable(_))
    ));

    ctx.add_polling_group("dup", &["Word2"], 10, 0).unwrap();
    assert!(matches!(
        ctx.add_polling_group("dup", &["Status"], 10, 0),
        Err(PlcError::PollingGroup(_))
    ));
    assert!(ctx.remove_polling_group("missing").await.is_err());
    ctx.shutdown().await;
    assert!(ctx.polling_groups().is_empty());
}

#[tokio::test]
async fn test_finished_group_name_is_reusable() {
    let (_plc, ctx) = connected_context().await;
    ctx.add_polling_group("once", &["Word2"], 5, 1).unwrap();
    wait_until(Duration::from_secs(2), || {
        ctx.group_snapshot("once")
            .is_some_and(|s| s.state == RunState::Stopped)
    })
    .await;

    ctx.add_polling_group("once", &["Status", "Run"], 0, 2).unwrap();
    let snap = ctx.group_snapshot("once").unwrap();
    assert_eq!(snap.variables.len(), 2);
    assert_eq!(snap.interval_ms, 20);
    assert_eq!(snap.max_cycles, 2);
}

#[tokio::test]
async fn test_independent_groups_poll_their_own_variables() {
    let (plc, ctx) = connected_context().await;
    ctx.add_polling_group("a", &["Word2"], 10, 2).unwrap();
    ctx.add_polling_group("b", &["Out"], 15, 2).unwrap();

    wait_until(Duration::from_secs(2), || {
        ctx.polling_groups()
            .iter()
            .all(|s| s.state == RunState::Stopped)
    })
    .await;
    let names: Vec<String> = ctx.polling_groups().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(plc.read_count(), 4);

    // a write through the mirror still works alongside polling
    ctx.write_var("Status", Value::Byte(9), false).await.unwrap();
    assert_eq!(plc.peek(Area::Memory, 6, 1), vec![9]);
}
