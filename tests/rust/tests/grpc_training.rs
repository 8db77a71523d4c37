//! Training over the gRPC coordinator
//!
//! Each rank runs in its own task with its own client connection, the way
//! separate processes would.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use common::{config, run_ok, train, RankOutcome, TIMEOUT};
use coordinator::{CoordinatorServer, CoordinatorService, GrpcProcessGroup};
use runtime_core::{CoordinatorConfig, WorkerCoordinator};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use trainer::Resume;

async fn start_coordinator(
    world_size: usize,
    config: &CoordinatorConfig,
) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let service = CoordinatorService::new(world_size, config)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let shutdown = async move {
            rx.await.ok();
        };
        if let Err(e) = CoordinatorServer::new(service)
            .run_with_listener(listener, shutdown)
            .await
        {
            panic!("coordinator failed: {}", e);
        }
    });

    Ok((addr, tx))
}

async fn connect(
    addr: SocketAddr,
    rank: usize,
    world_size: usize,
) -> Result<(Arc<GrpcProcessGroup>, WorkerCoordinator)> {
    let config = CoordinatorConfig {
        join_timeout: TIMEOUT,
        collective_timeout: TIMEOUT,
        ..Default::default()
    };
    let group = GrpcProcessGroup::connect(format!("http://{}", addr), rank, world_size, &config)
        .await?;
    let group = Arc::new(group);
    let coordinator = WorkerCoordinator::join(group.clone(), TIMEOUT).await?;
    Ok((group, coordinator))
}

#[tokio::test]
async fn test_collectives_over_grpc() -> Result<()> {
    let (addr, _shutdown) = start_coordinator(3, &CoordinatorConfig::default()).await?;

    let mut handles = Vec::new();
    for rank in 0..3 {
        handles.push(tokio::spawn(async move {
            let (group, c) = connect(addr, rank, 3).await?;

            let mean = c.reduce_mean("mean", rank as f64).await?;
            let root_value = (rank == 2).then(|| "from rank 2".to_string());
            let received: String = c.broadcast("hello", root_value.as_ref(), 2).await?;
            let ranks: Vec<usize> = c.all_gather("ranks", &rank).await?;
            c.barrier("done").await?;
            group.leave().await?;

            anyhow::Ok((mean, received, ranks))
        }));
    }

    for handle in handles {
        let (mean, received, ranks) = handle.await??;
        assert_eq!(mean, 1.0);
        assert_eq!(received, "from rank 2");
        assert_eq!(ranks, vec![0, 1, 2]);
    }
    Ok(())
}

#[tokio::test]
async fn test_grpc_training_matches_in_process_training() -> Result<()> {
    const WORLD_SIZE: usize = 2;

    let local_dir = tempdir()?;
    let local_path = local_dir.path().to_path_buf();
    let in_process = run_ok(WORLD_SIZE, move |c| {
        let config = config(&local_path);
        async move { train(c, config, Resume::Fresh, None).await }
    })
    .await?;

    let (addr, _shutdown) = start_coordinator(WORLD_SIZE, &CoordinatorConfig::default()).await?;
    let dir = tempdir()?;

    let mut handles = Vec::new();
    for rank in 0..WORLD_SIZE {
        let path = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            let (group, c) = connect(addr, rank, WORLD_SIZE).await?;
            let outcome = train(Arc::new(c), config(&path), Resume::Fresh, None).await?;
            group.leave().await?;
            anyhow::Ok(outcome)
        }));
    }

    let mut over_grpc: Vec<RankOutcome> = Vec::new();
    for handle in handles {
        over_grpc.push(handle.await??);
    }

    for (grpc, local) in over_grpc.iter().zip(&in_process) {
        assert!(grpc.summary.finished);
        assert_eq!(grpc.summary.progress, local.summary.progress);
        assert_eq!(grpc.summary.checkpoints, local.summary.checkpoints);
        assert!(grpc.live.bit_eq(&local.live));
        assert!(grpc.shadow.bit_eq(&local.shadow));
    }
    Ok(())
}
