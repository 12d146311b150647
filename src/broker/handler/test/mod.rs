use std::time::Duration;

use tempfile::TempDir;

use crate::broker::config::BrokerConfig;
use crate::broker::Broker;
use crate::cluster::Cluster;
use crate::protocol::{
    BrokerId, FetchPartition, FetchRequest, FetchTopic, PartitionProduceData, ProduceRequest, Record,
    RecordBatch, TopicProduceData,
};

/// A single-node, bootstrapped broker on a fresh data directory.
pub(crate) async fn new_broker() -> anyhow::Result<(TempDir, Broker)> {
    let dir = tempfile::tempdir()?;
    let config = BrokerConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let broker = Broker::start(config, &Cluster::in_process()).await?;
    Ok((dir, broker))
}

/// `n` brokers of one in-process cluster, started once every broker knows every other one.
/// Broker ids run from 1, and broker 1 bootstraps the cluster.
pub(crate) async fn new_cluster(n: i32) -> anyhow::Result<(TempDir, Vec<Broker>)> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::in_process();
    let config = |id: i32| BrokerConfig {
        id: BrokerId(id),
        port: 9000 + id as u16,
        data_dir: dir.path().join(format!("broker-{}", id)),
        bootstrap: id == 1,
        ..Default::default()
    };

    let first = Broker::start(config(1), &cluster).await?;
    let mut brokers = vec![first.clone()];
    for id in 2..=n {
        let config = BrokerConfig {
            join: vec![first.addr()],
            ..config(id)
        };
        brokers.push(Broker::start(config, &cluster).await?);
    }

    for _ in 0..500 {
        let mut known = true;
        for broker in &brokers {
            known &= broker.store.get_alive_nodes()?.len() == n as usize;
        }
        if known {
            return Ok((dir, brokers));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("brokers never learned about each other")
}

pub(crate) fn produce(topic: &str, partition: i32, values: &[&'static str]) -> ProduceRequest {
    ProduceRequest {
        topic_data: vec![TopicProduceData {
            name: topic.to_string(),
            partition_data: vec![PartitionProduceData {
                index: partition,
                records: RecordBatch::new(values.iter().map(|v| Record::new(*v)).collect()),
            }],
        }],
        ..Default::default()
    }
}

pub(crate) fn fetch(topic: &str, partition: i32, offset: i64) -> FetchRequest {
    FetchRequest {
        topics: vec![FetchTopic {
            topic: topic.to_string(),
            partitions: vec![FetchPartition {
                partition,
                fetch_offset: offset,
                ..Default::default()
            }],
        }],
        ..Default::default()
    }
}
