//! Pipeline Flow Integration Tests
//!
//! Drives a [`Pipeline`] directly with ticks and checks what subscribers see:
//! bar aggregation, snapshot-then-delta ordering, replay equivalence and
//! shared indicator computation.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::sync::Arc;
use std::time::Duration;

use market_pipeline::application::ports::NoopFeedControl;
use market_pipeline::domain::market::millis_to_utc;
use market_pipeline::{
    Bar, IndicatorKind, IndicatorOutput, Pipeline, PipelineSettings, PushEvent, SeriesKey,
    SubscriberHandle, Tick, Timeframe,
};
use rust_decimal::Decimal;

/// Minute-aligned base timestamp.
const T0: i64 = 1_700_000_040_000;

fn pipeline() -> Pipeline {
    Pipeline::new(
        PipelineSettings {
            subscriber_buffer: 4096,
            grace_period: Duration::from_millis(50),
            ..PipelineSettings::default()
        },
        Arc::new(NoopFeedControl),
    )
}

fn tick(symbol: &str, price: i64, volume: i64, offset_ms: i64) -> Tick {
    Tick::new(
        symbol,
        Decimal::from(price),
        Decimal::from(volume),
        millis_to_utc(T0 + offset_ms),
    )
}

fn drain(handle: &mut SubscriberHandle) -> Vec<PushEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.try_recv() {
        events.push(event.as_ref().clone());
    }
    events
}

fn closed_bars(events: &[PushEvent]) -> Vec<Bar> {
    events
        .iter()
        .filter_map(|event| match event {
            PushEvent::Bar { payload, .. } if payload.closed => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

fn indicator_outputs(events: &[PushEvent]) -> Vec<IndicatorOutput> {
    events
        .iter()
        .filter_map(|event| match event {
            PushEvent::Indicator { payload, .. } => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

/// A deterministic wandering price path, one tick every 20 seconds.
fn price_path(count: usize) -> Vec<Tick> {
    (0..count)
        .map(|i| {
            let i = i64::try_from(i).unwrap();
            let price = 100 + (i * 7) % 11 - (i * 3) % 5;
            tick("BTC-USD", price, 1 + i % 3, i * 20_000)
        })
        .collect()
}

#[test]
fn test_ticks_aggregate_into_minute_bars() {
    let pipeline = pipeline();
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let mut sub = pipeline.connect();
    pipeline.attach(sub.id, &key, &[]).unwrap();

    pipeline.process_tick(&tick("BTC-USD", 100, 1, 0));
    pipeline.process_tick(&tick("BTC-USD", 102, 2, 10_000));
    pipeline.process_tick(&tick("BTC-USD", 101, 4, 70_000));

    let events = drain(&mut sub);
    assert_eq!(events[0].kind(), "snapshot");

    let closed = closed_bars(&events);
    assert_eq!(closed.len(), 1);
    let bucket0 = &closed[0];
    assert_eq!(bucket0.start_millis(), T0);
    assert_eq!(bucket0.open, Decimal::from(100));
    assert_eq!(bucket0.high, Decimal::from(102));
    assert_eq!(bucket0.low, Decimal::from(100));
    assert_eq!(bucket0.close, Decimal::from(102));
    assert_eq!(bucket0.volume, Decimal::from(3));
    assert!(!bucket0.synthesized);

    let Some(PushEvent::Bar { payload: bucket1, .. }) = events.last() else {
        panic!("expected an open bar update last, got {events:?}");
    };
    assert!(!bucket1.closed);
    assert_eq!(bucket1.start_millis(), T0 + 60_000);
    assert_eq!(bucket1.open, Decimal::from(101));
    assert_eq!(bucket1.close, Decimal::from(101));
    assert_eq!(bucket1.volume, Decimal::from(4));
}

#[test]
fn test_snapshot_precedes_live_updates() {
    let pipeline = pipeline();
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let mut first = pipeline.connect();
    pipeline.attach(first.id, &key, &[]).unwrap();
    pipeline.process_tick(&tick("BTC-USD", 100, 1, 0));
    pipeline.process_tick(&tick("BTC-USD", 105, 1, 61_000));

    let mut late = pipeline.connect();
    pipeline.attach(late.id, &key, &[]).unwrap();
    pipeline.process_tick(&tick("BTC-USD", 106, 1, 62_000));

    let events = drain(&mut late);
    let PushEvent::Snapshot { payload, .. } = &events[0] else {
        panic!("expected snapshot first, got {:?}", events[0]);
    };
    assert_eq!(payload.bars.len(), 1);
    assert_eq!(payload.open_bar.as_ref().unwrap().close, Decimal::from(105));
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].kind(), "bar");

    assert_eq!(drain(&mut first).len(), 5);
}

#[test]
fn test_snapshot_plus_live_delta_matches_full_replay() {
    let ticks = price_path(90);
    let indicators = [IndicatorKind::Sma { period: 3 }, IndicatorKind::Ema { period: 4 }];
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);

    // Reference: one subscriber sees every tick.
    let reference = pipeline();
    let mut full = reference.connect();
    reference.attach(full.id, &key, &indicators).unwrap();
    for tick in &ticks {
        reference.process_tick(tick);
    }
    let full_events = drain(&mut full);
    let expected_bars = closed_bars(&full_events);
    let expected_outputs = indicator_outputs(&full_events);
    assert!(expected_bars.len() > 20);

    // Candidate: a second subscriber joins halfway.
    let candidate = pipeline();
    let anchor = candidate.connect();
    candidate.attach(anchor.id, &key, &indicators).unwrap();
    let (before, after) = ticks.split_at(45);
    for tick in before {
        candidate.process_tick(tick);
    }
    let mut joiner = candidate.connect();
    candidate.attach(joiner.id, &key, &indicators).unwrap();
    for tick in after {
        candidate.process_tick(tick);
    }

    let events = drain(&mut joiner);
    let PushEvent::Snapshot { payload, .. } = &events[0] else {
        panic!("expected snapshot first");
    };
    let mut bars = payload.bars.clone();
    bars.extend(closed_bars(&events[1..]));
    assert_eq!(bars, expected_bars);

    let live_outputs = indicator_outputs(&events[1..]);
    let tail = &expected_outputs[expected_outputs.len() - live_outputs.len()..];
    assert_eq!(live_outputs, tail);
}

#[test]
fn test_shared_indicators_computed_once_per_bar() {
    let pipeline = pipeline();
    let key = SeriesKey::new("ETH-USD", Timeframe::MINUTE);
    let sma = [IndicatorKind::Sma { period: 2 }];

    let mut subscribers: Vec<_> = (0..3).map(|_| pipeline.connect()).collect();
    for sub in &subscribers {
        pipeline.attach(sub.id, &key, &sma).unwrap();
    }
    let mut bystander = pipeline.connect();
    pipeline
        .attach(bystander.id, &SeriesKey::new("SOL-USD", Timeframe::MINUTE), &sma)
        .unwrap();

    // Six minutes of ticks close five bars.
    for minute in 0..6 {
        pipeline.process_tick(&tick("ETH-USD", 2000 + minute, 1, minute * 60_000));
    }

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.bars_closed, 5);
    assert_eq!(stats.indicator_computations, 5);

    for sub in &mut subscribers {
        let outputs = indicator_outputs(&drain(sub));
        assert_eq!(outputs.len(), 5);
        assert!(outputs[0].value.is_none());
        assert!(outputs[4].value.is_some());
    }
    let bystander_events = drain(&mut bystander);
    assert_eq!(bystander_events.len(), 1);
    assert_eq!(bystander_events[0].kind(), "snapshot");
}

#[test]
fn test_late_and_unrouted_ticks_are_counted() {
    let pipeline = pipeline();
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let sub = pipeline.connect();
    pipeline.attach(sub.id, &key, &[]).unwrap();

    pipeline.process_tick(&tick("BTC-USD", 100, 1, 65_000));
    pipeline.process_tick(&tick("BTC-USD", 99, 1, 5_000));
    pipeline.process_tick(&tick("DOGE-USD", 1, 1, 65_000));

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.ticks_processed, 3);
    assert_eq!(stats.dropped_late, 1);
    assert_eq!(stats.dropped_unrouted, 1);
}

#[test]
fn test_empty_buckets_are_synthesized_from_previous_close() {
    let pipeline = pipeline();
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let mut sub = pipeline.connect();
    pipeline.attach(sub.id, &key, &[]).unwrap();

    pipeline.process_tick(&tick("BTC-USD", 100, 1, 0));
    pipeline.process_tick(&tick("BTC-USD", 110, 1, 185_000));

    let closed = closed_bars(&drain(&mut sub));
    assert_eq!(closed.len(), 3);
    for pair in closed.windows(2) {
        assert_eq!(pair[0].end_time, pair[1].start_time);
    }
    for bar in &closed[1..] {
        assert!(bar.synthesized);
        assert_eq!(bar.open, Decimal::from(100));
        assert_eq!(bar.close, Decimal::from(100));
        assert_eq!(bar.volume, Decimal::ZERO);
    }
    assert_eq!(pipeline.stats().snapshot().bars_synthesized, 2);
}

#[test]
fn test_detached_series_torn_down_after_grace_period() {
    let pipeline = pipeline();
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let sub = pipeline.connect();
    pipeline.attach(sub.id, &key, &[IndicatorKind::Rsi { period: 14 }]).unwrap();
    pipeline.process_tick(&tick("BTC-USD", 100, 1, 0));

    assert!(pipeline.detach(sub.id, &key));
    assert_eq!(pipeline.status().pending_teardowns, 2);
    assert_eq!(pipeline.sweep(std::time::Instant::now()), 0);
    assert!(pipeline.snapshot(&key).is_some());

    let later = std::time::Instant::now() + Duration::from_secs(1);
    assert_eq!(pipeline.sweep(later), 2);
    assert!(pipeline.snapshot(&key).is_none());
    assert_eq!(pipeline.status().series, 0);
}

#[test]
fn test_oversized_gap_is_counted_as_discontinuity() {
    let pipeline = Pipeline::new(
        PipelineSettings {
            max_gap_fill: 2,
            ..PipelineSettings::default()
        },
        Arc::new(NoopFeedControl),
    );
    let key = SeriesKey::new("BTC-USD", Timeframe::MINUTE);
    let mut sub = pipeline.connect();
    pipeline.attach(sub.id, &key, &[]).unwrap();

    pipeline.process_tick(&tick("BTC-USD", 100, 1, 0));
    pipeline.process_tick(&tick("BTC-USD", 101, 1, 180_000));
    pipeline.process_tick(&tick("BTC-USD", 102, 1, 900_000));

    let stats = pipeline.stats().snapshot();
    assert_eq!(stats.bars_synthesized, 2);
    assert_eq!(stats.bar_discontinuities, 1);

    let closed = closed_bars(&drain(&mut sub));
    assert_eq!(closed.len(), 4);
    assert_eq!(closed[3].start_millis(), T0 + 180_000);
}
