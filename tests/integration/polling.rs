use std::time::Duration;

use alloy::primitives::{Address, address};
use resilient_provider::{
    DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_DELAY, Event, EventSelector, LogQuery,
    assert_recorded, test_utils::EventRecorder,
};
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;

use crate::common::{MockSetup, wait_for_new_client};

const CONTRACT: Address = address!("0x0000000000000000000000000000000000000abc");
const OTHER: Address = address!("0x0000000000000000000000000000000000000def");

#[tokio::test(start_paused = true)]
async fn first_cycle_records_the_head_as_baseline() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(100);
    let recorder = EventRecorder::new();

    let provider =
        setup.builder().on(EventSelector::Address(CONTRACT), recorder.callback()).connect().await?;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(provider.last_processed_block(), Some(100));
    assert!(setup.chain.log_queries().is_empty());
    assert!(recorder.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn logs_missed_by_the_live_stream_are_backfilled() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(100);
    let recorder = EventRecorder::new();
    let provider = setup.builder().connect().await?;
    provider.on(EventSelector::Address(CONTRACT), recorder.callback()).await?;
    sleep(Duration::from_secs(1)).await;

    setup.chain.mine(1);
    let missed = setup.chain.emit_log(CONTRACT);
    setup.chain.emit_log(OTHER);
    sleep(DEFAULT_POLL_INTERVAL).await;

    assert_recorded!(recorder, 1);
    assert_eq!(recorder.block_numbers(), vec![missed.block_number]);
    assert_eq!(provider.last_processed_block(), Some(101));
    assert_eq!(
        setup.chain.log_queries(),
        vec![LogQuery { address: CONTRACT, from_block: 101, to_block: 101 }]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn each_polled_log_fires_its_callback_once() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(10);
    let first = EventRecorder::new();
    let second = EventRecorder::new();
    let provider = setup
        .builder()
        .on(EventSelector::Address(CONTRACT), first.callback())
        .on(EventSelector::Address(CONTRACT), second.callback())
        .connect()
        .await?;
    sleep(Duration::from_secs(1)).await;

    for _ in 0..3 {
        setup.chain.mine(1);
        setup.chain.emit_log(CONTRACT);
    }
    sleep(DEFAULT_POLL_INTERVAL * 3).await;

    assert_recorded!(first, 3);
    assert_recorded!(second, 3);
    assert_eq!(first.block_numbers(), vec![Some(11), Some(12), Some(13)]);
    assert_eq!(provider.last_processed_block(), Some(13));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_query_holds_the_watermark_until_it_succeeds() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(50);
    let failing = EventRecorder::new();
    let healthy = EventRecorder::new();
    let provider = setup
        .builder()
        .on(EventSelector::Address(CONTRACT), failing.callback())
        .on(EventSelector::Address(OTHER), healthy.callback())
        .connect()
        .await?;
    sleep(Duration::from_secs(1)).await;

    let mut watermarks = vec![provider.last_processed_block()];
    setup.chain.fail_logs_for(CONTRACT, true);
    setup.chain.mine(1);
    setup.chain.emit_log(CONTRACT);
    setup.chain.emit_log(OTHER);

    for _ in 0..3 {
        sleep(DEFAULT_POLL_INTERVAL).await;
        watermarks.push(provider.last_processed_block());
    }
    assert!(failing.is_empty());
    assert_eq!(provider.last_processed_block(), Some(50));

    setup.chain.fail_logs_for(CONTRACT, false);
    sleep(DEFAULT_POLL_INTERVAL).await;
    watermarks.push(provider.last_processed_block());

    assert_recorded!(failing, 1);
    assert_eq!(provider.last_processed_block(), Some(51));
    // the healthy subscription sees its log on every retried cycle
    assert_eq!(healthy.len(), 4);
    assert!(watermarks.windows(2).all(|pair| pair[0] <= pair[1]), "{watermarks:?}");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn head_failure_skips_the_cycle() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(20);
    let recorder = EventRecorder::new();
    let provider =
        setup.builder().on(EventSelector::Address(CONTRACT), recorder.callback()).connect().await?;
    sleep(Duration::from_secs(1)).await;

    setup.chain.fail_block_number(true);
    setup.chain.mine(1);
    setup.chain.emit_log(CONTRACT);
    sleep(DEFAULT_POLL_INTERVAL).await;
    assert!(recorder.is_empty());
    assert_eq!(provider.last_processed_block(), Some(20));

    setup.chain.fail_block_number(false);
    sleep(DEFAULT_POLL_INTERVAL).await;
    assert_recorded!(recorder, 1);
    assert_eq!(provider.last_processed_block(), Some(21));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn start_block_backfills_history_on_the_first_cycle() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(3);
    setup.chain.emit_log(CONTRACT);
    setup.chain.set_block_number(7);
    setup.chain.emit_log(CONTRACT);
    setup.chain.set_block_number(9);
    let recorder = EventRecorder::new();

    let provider = setup
        .builder()
        .start_block(2)
        .on(EventSelector::Address(CONTRACT), recorder.callback())
        .connect()
        .await?;

    assert_recorded!(recorder, 2);
    assert_eq!(recorder.block_numbers(), vec![Some(3), Some(7)]);
    assert_eq!(provider.last_processed_block(), Some(9));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn block_subscriptions_are_acknowledged_without_queries() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(5);
    let blocks = EventRecorder::new();
    let provider = setup.builder().on(EventSelector::Block, blocks.callback()).connect().await?;
    sleep(Duration::from_secs(1)).await;

    setup.chain.mine(3);
    sleep(DEFAULT_POLL_INTERVAL).await;

    assert_eq!(provider.last_processed_block(), Some(8));
    assert!(setup.chain.log_queries().is_empty());
    assert!(blocks.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn watermark_carries_over_a_reconnect() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(30);
    let recorder = EventRecorder::new();
    let provider =
        setup.builder().on(EventSelector::Address(CONTRACT), recorder.callback()).connect().await?;
    let first_client = provider.client().expect("client is published after connect");
    sleep(Duration::from_secs(1)).await;
    assert_eq!(provider.last_processed_block(), Some(30));

    // events emitted while disconnected never reach the live stream
    setup.socket().close("connection dropped");
    setup.chain.mine(1);
    setup.chain.emit_log(CONTRACT);
    setup.chain.mine(1);
    setup.chain.emit_log(CONTRACT);
    sleep(DEFAULT_RECONNECT_DELAY).await;

    wait_for_new_client(&provider, &first_client).await;
    assert_recorded!(recorder, 2);
    assert_eq!(recorder.block_numbers(), vec![Some(31), Some(32)]);
    assert_eq!(provider.last_processed_block(), Some(32));
    assert_eq!(
        setup.chain.log_queries(),
        vec![LogQuery { address: CONTRACT, from_block: 31, to_block: 32 }]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn live_and_polled_deliveries_share_the_callback() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_block_number(1);
    let recorder = EventRecorder::new();
    let provider =
        setup.builder().on(EventSelector::Address(CONTRACT), recorder.callback()).connect().await?;
    sleep(Duration::from_secs(1)).await;

    setup.chain.mine(1);
    let log = setup.chain.emit_log(CONTRACT);
    let client = provider.client().expect("client is published after connect");
    client.emit(EventSelector::Address(CONTRACT), &Event::from(log));
    assert_recorded!(recorder, 1);

    // at-least-once: the poller hands over the same log again
    sleep(DEFAULT_POLL_INTERVAL).await;
    assert_recorded!(recorder, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backfill_respects_the_node_block_range_limit() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    setup.chain.set_max_block_range(Some(10));
    setup.chain.set_block_number(4);
    setup.chain.emit_log(CONTRACT);
    setup.chain.set_block_number(27);
    setup.chain.emit_log(CONTRACT);
    setup.chain.set_block_number(35);
    let recorder = EventRecorder::new();

    let provider = setup
        .builder()
        .max_block_range(10)
        .start_block(0)
        .on(EventSelector::Address(CONTRACT), recorder.callback())
        .connect()
        .await?;

    let mut marks = provider.watermark_stream();
    let mut seen = Vec::new();
    timeout(Duration::from_secs(5), async {
        while let Some(mark) = marks.next().await {
            seen.push(mark);
            if mark == Some(35) {
                break;
            }
        }
    })
    .await?;

    assert_recorded!(recorder, 2);
    assert_eq!(recorder.block_numbers(), vec![Some(4), Some(27)]);
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    let ranges: Vec<_> =
        setup.chain.log_queries().iter().map(|query| (query.from_block, query.to_block)).collect();
    assert_eq!(ranges, vec![(1, 10), (11, 20), (21, 30), (31, 35)]);
    Ok(())
}
