use alloy::primitives::{Address, address};
use resilient_provider::{
    ConnectionError, ConnectionState, DEFAULT_RECONNECT_DELAY, Event, EventSelector,
    assert_recorded,
    test_utils::{EventRecorder, log_at},
};
use tokio::time::sleep;

use crate::common::{MockSetup, wait_for_new_client};

const CONTRACT: Address = address!("0x0000000000000000000000000000000000000abc");
const OTHER: Address = address!("0x0000000000000000000000000000000000000def");

#[tokio::test(start_paused = true)]
async fn every_subscription_is_replayed_once_per_client() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    let first = provider.client().expect("client is published after connect");

    provider.on(EventSelector::Block, EventRecorder::new().callback()).await?;
    provider.on(EventSelector::Address(CONTRACT), EventRecorder::new().callback()).await?;
    assert_eq!(
        first.subscribe_calls(),
        vec![EventSelector::Block, EventSelector::Address(CONTRACT)]
    );

    setup.socket().close("connection reset");
    let second = wait_for_new_client(&provider, &first).await;

    assert_eq!(
        second.subscribe_calls(),
        vec![EventSelector::Block, EventSelector::Address(CONTRACT)]
    );
    assert_eq!(provider.subscriptions().await.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn duplicate_pairs_are_registered_once() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    let client = provider.client().expect("client is published after connect");
    let recorder = EventRecorder::new();
    let callback = recorder.callback();

    provider.on(EventSelector::Address(CONTRACT), callback.clone()).await?;
    provider.on(EventSelector::Address(CONTRACT), callback).await?;
    // a different callback on the same selector is its own subscription
    provider.on(EventSelector::Address(CONTRACT), recorder.callback()).await?;

    assert_eq!(client.subscribe_calls().len(), 2);
    assert_eq!(provider.subscriptions().await.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn subscription_made_while_disconnected_is_replayed() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    let first = provider.client().expect("client is published after connect");

    setup.socket().close("connection reset");
    provider.wait_for_state(ConnectionState::Closed).await?;
    assert!(provider.client().is_none());

    let recorder = EventRecorder::new();
    provider.on(EventSelector::Address(CONTRACT), recorder.callback()).await?;
    assert!(first.subscribe_calls().is_empty());

    sleep(DEFAULT_RECONNECT_DELAY).await;
    let second = wait_for_new_client(&provider, &first).await;
    assert_eq!(second.subscribe_calls(), vec![EventSelector::Address(CONTRACT)]);

    second.emit(EventSelector::Address(CONTRACT), &Event::from(log_at(CONTRACT, 7, 0)));
    assert_recorded!(recorder, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn removed_subscriptions_are_not_replayed() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    let first = provider.client().expect("client is published after connect");
    let kept = EventRecorder::new().callback();
    let dropped = EventRecorder::new().callback();

    provider.on(EventSelector::Address(CONTRACT), kept).await?;
    provider.on(EventSelector::Address(OTHER), dropped.clone()).await?;
    assert!(provider.off(EventSelector::Address(OTHER), dropped.clone()).await?);
    assert!(!provider.off(EventSelector::Address(OTHER), dropped).await?);
    assert_eq!(first.active_selectors(), vec![EventSelector::Address(CONTRACT)]);

    setup.socket().close("connection reset");
    let second = wait_for_new_client(&provider, &first).await;

    assert_eq!(second.subscribe_calls(), vec![EventSelector::Address(CONTRACT)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn replayed_callbacks_receive_events_from_the_new_client() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let recorder = EventRecorder::new();
    let provider =
        setup.builder().on(EventSelector::Address(CONTRACT), recorder.callback()).connect().await?;
    let first = provider.client().expect("client is published after connect");

    first.emit(EventSelector::Address(CONTRACT), &Event::from(log_at(CONTRACT, 1, 0)));
    assert_recorded!(recorder, 1);

    setup.socket().close("connection reset");
    let second = wait_for_new_client(&provider, &first).await;

    second.emit(EventSelector::Address(CONTRACT), &Event::from(log_at(CONTRACT, 2, 0)));
    assert_recorded!(recorder, 2);
    assert_eq!(recorder.block_numbers(), vec![Some(1), Some(2)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_replay_does_not_block_the_others() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    let first = provider.client().expect("client is published after connect");

    provider.on(EventSelector::Block, EventRecorder::new().callback()).await?;
    provider.on(EventSelector::Address(CONTRACT), EventRecorder::new().callback()).await?;

    setup.chain.fail_subscribe_for(EventSelector::Block, true);
    setup.socket().close("connection reset");
    let second = wait_for_new_client(&provider, &first).await;

    assert_eq!(
        second.subscribe_calls(),
        vec![EventSelector::Block, EventSelector::Address(CONTRACT)]
    );
    assert_eq!(second.active_selectors(), vec![EventSelector::Address(CONTRACT)]);
    // the failed entry stays registered for the next replay
    assert_eq!(provider.subscriptions().await.len(), 2);

    setup.chain.fail_subscribe_for(EventSelector::Block, false);
    setup.socket().close("connection reset");
    let third = wait_for_new_client(&provider, &second).await;
    assert_eq!(third.active_selectors().len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_subscription_is_unregistered() -> anyhow::Result<()> {
    let setup = MockSetup::new();
    let provider = setup.builder().connect().await?;
    setup.chain.fail_subscribe_for(EventSelector::Address(CONTRACT), true);

    let result =
        provider.on(EventSelector::Address(CONTRACT), EventRecorder::new().callback()).await;

    assert!(matches!(result, Err(ConnectionError::Rpc { .. })));
    assert!(provider.subscriptions().await.is_empty());
    Ok(())
}
