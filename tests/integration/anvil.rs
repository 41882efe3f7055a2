use std::time::Duration;

use resilient_provider::{
    ConnectionError, ConnectionState, EventSelector, LogQuery, ResilientProviderBuilder,
    assert_recorded, test_utils::EventRecorder,
};

use crate::common::{build_provider, deploy_counter, spawn_anvil};

#[tokio::test]
async fn live_logs_and_blocks_from_anvil() -> anyhow::Result<()> {
    let anvil = spawn_anvil(None)?;
    let signer = build_provider(&anvil).await?;
    let counter = deploy_counter(signer).await?;
    let address = *counter.address();

    let logs = EventRecorder::new();
    let blocks = EventRecorder::new();
    let provider = ResilientProviderBuilder::new(anvil.ws_endpoint())
        .chain_id(anvil.chain_id())
        .on(EventSelector::Address(address), logs.callback())
        .on(EventSelector::Block, blocks.callback())
        .connect()
        .await?;
    assert_eq!(provider.state(), ConnectionState::Open);
    let start = provider.get_block_number().await?;

    for _ in 0..3 {
        counter.increase().send().await?.watch().await?;
    }

    assert_recorded!(logs, 3);
    assert_recorded!(blocks, 3);
    let head = provider.get_block_number().await?;
    assert_eq!(head, start + 3);

    let history =
        provider.get_logs(LogQuery { address, from_block: 0, to_block: head }).await?;
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|log| log.address() == address));

    provider.shutdown();
    provider.wait_for_state(ConnectionState::Terminated).await?;
    Ok(())
}

#[tokio::test]
async fn chain_id_mismatch_fails_the_attempt() -> anyhow::Result<()> {
    let anvil = spawn_anvil(None)?;

    let result = ResilientProviderBuilder::new(anvil.ws_endpoint())
        .chain_id(anvil.chain_id() + 1)
        .max_reconnect_attempts(1)
        .ready_timeout(Duration::from_secs(5))
        .connect()
        .await;

    assert!(matches!(result, Err(ConnectionError::RetriesExhausted { attempts: 1 })));
    Ok(())
}

#[tokio::test]
async fn unreachable_node_exhausts_retries() {
    let result = ResilientProviderBuilder::new("ws://127.0.0.1:1")
        .max_reconnect_attempts(2)
        .reconnect_delay(Duration::from_millis(10))
        .ready_timeout(Duration::from_secs(2))
        .connect()
        .await;

    assert!(matches!(result, Err(ConnectionError::RetriesExhausted { attempts: 2 })));
}
