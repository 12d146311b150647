use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use hedda::broker::config::BrokerConfig;
use hedda::broker::server::Server;
use hedda::broker::Broker;
use hedda::cluster::Cluster;
use hedda::log::Log;
use hedda::protocol::*;
use tempfile::TempDir;

async fn eventually<F, Fut>(what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("timed out waiting for {}", what)
}

fn config(dir: &TempDir, id: i32, join: Vec<SocketAddr>) -> BrokerConfig {
    BrokerConfig {
        id: BrokerId(id),
        port: 19000 + id as u16,
        data_dir: dir.path().join(format!("broker-{}", id)),
        bootstrap: join.is_empty(),
        join,
        ..Default::default()
    }
}

async fn request<R>(broker: &Broker, req: R) -> anyhow::Result<R::Response>
where
    R: Request + Into<RequestKind>,
    R::Response: TryFrom<ResponseKind, Error = anyhow::Error>,
{
    R::Response::try_from(broker.handle_request(req.into()).await)
}

fn produce(topic: &str, partition: i32, values: &[&'static str]) -> ProduceRequest {
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

fn fetch(topic: &str, partition: i32, offset: i64) -> FetchRequest {
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

fn create(topic: &str, partitions: i32, replication_factor: i16) -> CreateTopicsRequest {
    CreateTopicsRequest {
        topics: vec![CreatableTopic::new(topic, partitions, replication_factor)],
        timeout_ms: 1000,
    }
}

async fn partition_metadata(
    broker: &Broker,
    topic: &str,
) -> anyhow::Result<MetadataResponsePartition> {
    let res = request(
        broker,
        MetadataRequest {
            topics: Some(vec![topic.to_string()]),
        },
    )
    .await?;
    res.topics
        .into_iter()
        .next()
        .and_then(|t| t.partitions.into_iter().next())
        .ok_or_else(|| anyhow::anyhow!("no metadata for {}", topic))
}

fn values(data: &PartitionData) -> Vec<bytes::Bytes> {
    data.records
        .iter()
        .flat_map(|b| b.records.iter().map(|r| r.value.clone()))
        .collect()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn single_node_topic_lifecycle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let broker = Broker::start(config(&dir, 1, vec![]), &Cluster::in_process()).await?;
    assert!(broker.is_leader());
    assert!(broker.is_ready_for_consistent_reads());

    let res = request(&broker, create("the-topic", 1, 1)).await?;
    assert_eq!(res.topics[0].error_code, ErrorCode::None);

    let res = request(&broker, produce("the-topic", 0, &["hello", "world"])).await?;
    let pr = &res.responses[0].partition_responses[0];
    assert_eq!(pr.error_code, ErrorCode::None);
    assert_eq!(pr.base_offset, 0);

    let res = request(&broker, fetch("the-topic", 0, 0)).await?;
    let data = &res.responses[0].partitions[0];
    assert_eq!(data.high_watermark, 2);
    assert_eq!(values(data), vec!["hello", "world"]);

    let res = request(
        &broker,
        ListOffsetsRequest {
            topics: vec![ListOffsetsTopic {
                name: "the-topic".into(),
                partitions: vec![
                    ListOffsetsPartition {
                        partition_index: 0,
                        timestamp: LATEST_TIMESTAMP,
                    },
                    ListOffsetsPartition {
                        partition_index: 0,
                        timestamp: EARLIEST_TIMESTAMP,
                    },
                ],
            }],
            ..Default::default()
        },
    )
    .await?;
    let offsets: Vec<_> = res.topics[0].partitions.iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![2, 0]);

    let res = request(
        &broker,
        MetadataRequest {
            topics: Some(vec!["the-topic".into(), "nope".into()]),
        },
    )
    .await?;
    assert_eq!(res.topics[0].error_code, ErrorCode::None);
    assert_eq!(res.topics[0].partitions[0].leader_id, BrokerId(1));
    assert_eq!(res.topics[1].error_code, ErrorCode::UnknownTopicOrPartition);

    let res = request(
        &broker,
        DeleteTopicsRequest {
            topic_names: vec!["the-topic".into()],
            timeout_ms: 1000,
        },
    )
    .await?;
    assert_eq!(res.responses[0].error_code, ErrorCode::None);
    let res = request(&broker, produce("the-topic", 0, &["gone"])).await?;
    assert_eq!(
        res.responses[0].partition_responses[0].error_code,
        ErrorCode::UnknownTopicOrPartition
    );
    let res = request(&broker, fetch("the-topic", 0, 0)).await?;
    let data = &res.responses[0].partitions[0];
    assert_eq!(data.error_code, ErrorCode::UnknownTopicOrPartition);
    assert!(data.records.is_empty());
    let res = request(
        &broker,
        ListOffsetsRequest {
            topics: vec![ListOffsetsTopic {
                name: "the-topic".into(),
                partitions: vec![ListOffsetsPartition {
                    partition_index: 0,
                    timestamp: LATEST_TIMESTAMP,
                }],
            }],
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(
        res.topics[0].partitions[0].error_code,
        ErrorCode::UnknownTopicOrPartition
    );
    let res = request(
        &broker,
        MetadataRequest {
            topics: Some(vec!["the-topic".into()]),
        },
    )
    .await?;
    assert_eq!(res.topics[0].error_code, ErrorCode::UnknownTopicOrPartition);
    assert!(res.topics[0].partitions.is_empty());
    let res = request(&broker, MetadataRequest { topics: None }).await?;
    assert!(res.topics.iter().all(|t| t.name != "the-topic"));

    broker.shutdown().await?;
    assert!(!broker.is_ready_for_consistent_reads());
    Ok(())
}

#[tokio::test]
async fn restart_rehosts_partitions() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let broker = Broker::start(config(&dir, 1, vec![]), &Cluster::in_process()).await?;
        request(&broker, create("durable", 1, 1)).await?;
        request(&broker, produce("durable", 0, &["a", "b", "c"])).await?;
        broker.shutdown().await?;
    }

    let broker = Broker::start(config(&dir, 1, vec![]), &Cluster::in_process()).await?;
    let res = request(&broker, fetch("durable", 0, 1)).await?;
    let data = &res.responses[0].partitions[0];
    assert_eq!(data.error_code, ErrorCode::None);
    assert_eq!(values(data), vec!["a", "b", "c"]);

    let res = request(&broker, produce("durable", 0, &["d"])).await?;
    assert_eq!(res.responses[0].partition_responses[0].base_offset, 3);
    broker.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn followers_replicate_and_take_over() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::in_process();
    let first = Broker::start(config(&dir, 1, vec![]), &cluster).await?;
    let mut brokers = vec![first.clone()];
    for id in 2..=3 {
        brokers.push(Broker::start(config(&dir, id, vec![first.addr()]), &cluster).await?);
    }
    let controller = &first;
    eventually("all brokers registered", move || async move {
        Ok(controller.store().get_alive_nodes()?.len() == 3)
    })
    .await?;

    let res = request(&first, create("replicated", 1, 3)).await?;
    assert_eq!(res.topics[0].error_code, ErrorCode::None);
    let meta = partition_metadata(&first, "replicated").await?;
    assert_eq!(meta.replica_nodes.len(), 3);
    let leader = brokers
        .iter()
        .find(|b| b.id() == meta.leader_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown leader {}", meta.leader_id))?;

    let res = request(&leader, produce("replicated", 0, &["one", "two"])).await?;
    assert_eq!(res.responses[0].partition_responses[0].error_code, ErrorCode::None);

    let all = &brokers;
    eventually("followers caught up", move || async move {
        Ok(all.iter().all(|b| {
            b.registry()
                .get("replicated", 0)
                .map_or(false, |p| p.log.newest_offset() == 2)
        }))
    })
    .await?;
    let current = &leader;
    eventually("high watermark advanced", move || async move {
        let res = request(current, fetch("replicated", 0, 0)).await?;
        Ok(res.responses[0].partitions[0].high_watermark == 2)
    })
    .await?;

    // fail the leader without a graceful leave
    leader.shutdown().await?;
    let survivors: Vec<_> = brokers
        .iter()
        .filter(|b| b.id() != leader.id())
        .cloned()
        .collect();
    let (observer, failed) = (&survivors[0], leader.id());
    eventually("a new leader was elected", move || async move {
        let meta = partition_metadata(observer, "replicated").await?;
        Ok(meta.leader_id != failed
            && !meta.leader_id.is_none()
            && !meta.isr_nodes.contains(&failed))
    })
    .await?;
    assert!(survivors.iter().any(|b| b.is_leader()));

    let meta = partition_metadata(&survivors[0], "replicated").await?;
    let new_leader = survivors
        .iter()
        .find(|b| b.id() == meta.leader_id)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("unknown leader {}", meta.leader_id))?;
    let current = &new_leader;
    eventually("new leader serves writes", move || async move {
        let res = request(current, produce("replicated", 0, &["three"])).await?;
        Ok(res.responses[0].partition_responses[0].base_offset == 2)
    })
    .await?;

    let res = request(&new_leader, fetch("replicated", 0, 0)).await?;
    assert_eq!(
        values(&res.responses[0].partitions[0]),
        vec!["one", "two", "three"]
    );

    for broker in survivors {
        broker.shutdown().await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_broker_is_deregistered() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cluster = Cluster::in_process();
    let first = Broker::start(config(&dir, 1, vec![]), &cluster).await?;
    let second = Broker::start(config(&dir, 2, vec![first.addr()]), &cluster).await?;
    let controller = &first;
    eventually("second broker registered", move || async move {
        Ok(controller.store().get_node(BrokerId(2))?.is_some())
    })
    .await?;

    second.leave_cluster().await?;
    assert!(!second.is_ready_for_consistent_reads());
    eventually("second broker deregistered", move || async move {
        Ok(controller.store().get_node(BrokerId(2))?.is_none())
    })
    .await?;

    second.shutdown().await?;
    first.shutdown().await
}

/// Starts a broker of its own TCP cluster on an ephemeral port, serving it.
async fn serve(
    dir: &TempDir,
    id: i32,
    join: Vec<SocketAddr>,
) -> anyhow::Result<(Broker, tokio::task::JoinHandle<anyhow::Result<()>>)> {
    let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let port = server.local_addr()?.port();
    let broker = Broker::start(BrokerConfig { port, ..config(dir, id, join) }, &Cluster::tcp()).await?;
    let task = tokio::spawn(server.run(broker.clone()));
    Ok((broker, task))
}

#[tokio::test]
async fn tcp_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (broker, server) = serve(&dir, 1, vec![]).await?;
    let addr = broker.addr();

    let client = BrokerClient::connect(addr).await?;
    let res = ApiVersionsResponse::try_from(client.send(ApiVersionsRequest::default()).await?)?;
    assert!(res
        .api_keys
        .iter()
        .any(|v| v.api_key == ApiKey::FetchKey as i16));

    let res = CreateTopicsResponse::try_from(client.send(create("wire", 2, 1)).await?)?;
    assert_eq!(res.topics[0].error_code, ErrorCode::None);
    let res = ProduceResponse::try_from(client.send(produce("wire", 1, &["over", "tcp"])).await?)?;
    assert_eq!(res.responses[0].partition_responses[0].base_offset, 0);
    let res = FetchResponse::try_from(client.send(fetch("wire", 1, 0)).await?)?;
    assert_eq!(values(&res.responses[0].partitions[0]), vec!["over", "tcp"]);

    broker.shutdown().await?;
    server.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[tracing_test::traced_test]
async fn brokers_form_a_cluster_over_tcp() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (first, first_server) = serve(&dir, 1, vec![]).await?;
    let (second, second_server) = serve(&dir, 2, vec![first.addr()]).await?;

    let brokers = [&first, &second];
    eventually("both brokers registered everywhere", move || async move {
        for broker in brokers {
            if broker.store().get_alive_nodes()?.len() != 2 {
                return Ok(false);
            }
        }
        Ok(true)
    })
    .await?;
    assert!(first.is_leader());
    assert!(!second.is_leader());

    let res = request(&first, create("spread", 1, 2)).await?;
    assert_eq!(res.topics[0].error_code, ErrorCode::None);
    let observer = &second;
    eventually("the topic reached broker 2", move || async move {
        Ok(partition_metadata(observer, "spread").await.is_ok())
    })
    .await?;
    let meta = partition_metadata(&second, "spread").await?;
    assert_eq!(meta.replica_nodes.len(), 2);
    let (leader, follower) = if meta.leader_id == first.id() {
        (&first, &second)
    } else {
        (&second, &first)
    };

    let client = BrokerClient::connect(leader.addr()).await?;
    let res = ProduceResponse::try_from(client.send(produce("spread", 0, &["x", "y"])).await?)?;
    assert_eq!(res.responses[0].partition_responses[0].error_code, ErrorCode::None);
    eventually("the follower replicated", move || async move {
        Ok(follower
            .registry()
            .get("spread", 0)
            .map_or(false, |p| p.log.newest_offset() == 2))
    })
    .await?;
    let client = &client;
    eventually("the high watermark advanced", move || async move {
        let res = FetchResponse::try_from(client.send(fetch("spread", 0, 0)).await?)?;
        Ok(res.responses[0].partitions[0].high_watermark == 2)
    })
    .await?;

    second.shutdown().await?;
    first.shutdown().await?;
    first_server.await??;
    second_server.await??;
    Ok(())
}
