//! End-to-end runs over a real loopback network: spawn nodes, propose a
//! computation, wait for the reveal, check the aggregate.

use std::sync::Arc;
use std::time::Duration;

use tallynet::config::Settings;
use tallynet::error::Error;
use tallynet::network::Network;
use tallynet::node::{FixedResponse, ResponsePolicy};
use tallynet::registry::CompStatus;

const AWAIT: Duration = Duration::from_secs(60);

/// A network with three coordinators and one contributor per fixed value.
async fn network_with_values(values: &[u64]) -> Network {
    let mut network = Network::new(Settings::ephemeral()).await.unwrap();
    network.start_network(3, 0).await.unwrap();
    for &value in values {
        let policy: Arc<dyn ResponsePolicy> = Arc::new(FixedResponse(value));
        network
            .add_contributor_with_policy(Some(policy))
            .await
            .unwrap();
    }
    network
}

#[tokio::test(flavor = "multi_thread")]
async fn three_contributors_aggregate_to_their_sum() {
    let mut network = network_with_values(&[11, 20, 72]).await;

    let comp_id = network
        .propose_computation("sum of three", 3, 1)
        .await
        .unwrap();
    let record = network.await_result(&comp_id, AWAIT).await.unwrap();

    assert_eq!(record.status, CompStatus::Completed);
    assert_eq!(record.result, Some(103));
    assert_eq!(record.participants_count, Some(3));
    assert_eq!(record.mean(), Some(103.0 / 3.0));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn single_contributor_reveals_its_value_only_in_aggregate() {
    let mut network = network_with_values(&[54]).await;

    let comp_id = network
        .propose_computation("single contributor", 3, 1)
        .await
        .unwrap();
    let record = network.await_result(&comp_id, AWAIT).await.unwrap();

    assert_eq!(record.result, Some(54));
    assert_eq!(record.participants_count, Some(1));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_exactly_met() {
    let mut network = network_with_values(&[25, 75]).await;

    let comp_id = network
        .propose_computation("two of two", 3, 2)
        .await
        .unwrap();
    let record = network.await_result(&comp_id, AWAIT).await.unwrap();

    assert_eq!(record.result, Some(100));
    assert_eq!(record.participants_count, Some(2));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_not_met_fails_without_a_result() {
    let mut network = network_with_values(&[25, 75]).await;

    let comp_id = network
        .propose_computation("needs three", 3, 3)
        .await
        .unwrap();
    let err = network.await_result(&comp_id, AWAIT).await.unwrap_err();
    assert!(matches!(err, Error::ComputationFailed { .. }));

    let record = network.status(&comp_id).unwrap().unwrap();
    assert_eq!(record.status, CompStatus::Failed);
    assert!(record
        .fail_reason
        .as_deref()
        .unwrap_or_default()
        .contains("threshold"));
    assert!(record.result.is_none());

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deadline_with_no_contributors_fails_threshold() {
    let mut network = network_with_values(&[]).await;

    let comp_id = network
        .propose_computation("nobody home", 2, 1)
        .await
        .unwrap();
    let err = network.await_result(&comp_id, AWAIT).await.unwrap_err();
    assert!(matches!(err, Error::ComputationFailed { .. }));
    assert!(network
        .status(&comp_id)
        .unwrap()
        .unwrap()
        .result
        .is_none());

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn hundred_contributors() {
    let values: Vec<u64> = (0..100).collect();
    let mut network = network_with_values(&values).await;

    let comp_id = network
        .propose_computation("large fan-out", 10, 1)
        .await
        .unwrap();
    let record = network
        .await_result(&comp_id, Duration::from_secs(120))
        .await
        .unwrap();

    assert_eq!(record.result, Some(4950));
    assert_eq!(record.participants_count, Some(100));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_computations_progress_independently() {
    let mut network = network_with_values(&[1, 2, 3]).await;

    let first = network
        .propose_computation("first of two", 3, 1)
        .await
        .unwrap();
    let second = network
        .propose_computation("second of two", 3, 1)
        .await
        .unwrap();
    assert_ne!(first, second);

    let first_record = network.await_result(&first, AWAIT).await.unwrap();
    let second_record = network.await_result(&second, AWAIT).await.unwrap();
    assert_eq!(first_record.result, Some(6));
    assert_eq!(second_record.result, Some(6));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn await_result_timeout_leaves_the_computation_running() {
    let mut network = network_with_values(&[7]).await;

    let comp_id = network
        .propose_computation("slow caller", 4, 1)
        .await
        .unwrap();
    let err = network
        .await_result(&comp_id, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // The computation was unaffected by the caller's impatience.
    let record = network.await_result(&comp_id, AWAIT).await.unwrap();
    assert_eq!(record.result, Some(7));

    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_network_enforces_the_coordinator_count() {
    let mut network = Network::new(Settings::ephemeral()).await.unwrap();

    for wrong in [0, 2, 4] {
        let err = network.start_network(wrong, 0).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    network.start_network(3, 2).await.unwrap();
    // A second start on a running network is refused.
    assert!(network.start_network(3, 0).await.is_err());

    let status = network.network_status().unwrap();
    assert_eq!(status.coordinator_count, 3);
    assert_eq!(status.contributor_count, 2);
    assert_eq!(status.nodes.len(), 5);

    network.shutdown().await.unwrap();
    assert_eq!(network.network_status().unwrap().nodes.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn propose_requires_three_coordinators() {
    let mut network = Network::new(Settings::ephemeral()).await.unwrap();
    let err = network
        .propose_computation("no network yet", 5, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    network.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn propose_validates_its_arguments() {
    let mut network = network_with_values(&[]).await;

    assert!(matches!(
        network.propose_computation("zero deadline", 0, 1).await,
        Err(Error::PreconditionFailed(_))
    ));
    assert!(matches!(
        network.propose_computation("zero threshold", 5, 0).await,
        Err(Error::PreconditionFailed(_))
    ));

    network.shutdown().await.unwrap();
}
