//! End-to-end resume tests over an in-process data-parallel group

mod common;

use std::path::PathBuf;

use anyhow::Result;
use checkpoint::format::staging_dir;
use common::{config, run_local_group, run_ok, train, RankOutcome};
use runtime_core::Error;
use tempfile::tempdir;
use trainer::Resume;

const WORLD_SIZE: usize = 2;

async fn run(
    world_size: usize,
    dir: PathBuf,
    resume: Resume,
    max_steps: Option<u64>,
) -> Result<Vec<RankOutcome>> {
    run_ok(world_size, move |c| {
        let config = config(&dir);
        let resume = resume.clone();
        async move { train(c, config, resume, max_steps).await }
    })
    .await
}

fn assert_same_state(actual: &[RankOutcome], expected: &[RankOutcome]) {
    assert_eq!(actual.len(), expected.len());
    for (rank, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(a.summary.progress, e.summary.progress, "rank {}", rank);
        assert!(a.live.bit_eq(&e.live), "live differs on rank {}", rank);
        assert!(a.shadow.bit_eq(&e.shadow), "shadow differs on rank {}", rank);
    }
}

#[tokio::test]
async fn test_interrupted_run_resumes_bit_exact() -> Result<()> {
    let reference_dir = tempdir()?;
    let reference = run(
        WORLD_SIZE,
        reference_dir.path().to_path_buf(),
        Resume::Fresh,
        None,
    )
    .await?;
    let steps_per_epoch = reference[0].steps_per_epoch;
    assert_eq!(steps_per_epoch, 4);
    assert!(reference.iter().all(|r| r.summary.finished));
    assert_eq!(reference[0].summary.progress.global_step, 3 * steps_per_epoch);

    // Stop one step into the second epoch; the newest checkpoint is the
    // end of epoch 0
    let dir = tempdir()?;
    let partial = run(
        WORLD_SIZE,
        dir.path().to_path_buf(),
        Resume::Fresh,
        Some(steps_per_epoch + 1),
    )
    .await?;
    assert!(partial.iter().all(|r| !r.summary.finished));

    let resumed = run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Latest, None).await?;
    for outcome in &resumed {
        assert_eq!(outcome.summary.steps_run, 2 * steps_per_epoch);
        assert!(outcome.summary.finished);
    }
    assert_same_state(&resumed, &reference);
    Ok(())
}

#[tokio::test]
async fn test_resume_from_mid_epoch_checkpoint() -> Result<()> {
    let reference_dir = tempdir()?;
    let reference = run(
        WORLD_SIZE,
        reference_dir.path().to_path_buf(),
        Resume::Fresh,
        None,
    )
    .await?;

    let dir = tempdir()?;
    let first = run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Fresh, Some(6)).await?;
    // Saves at steps 2, 4 (cadence and epoch end) and 6
    assert_eq!(
        first[0].summary.checkpoints,
        vec![
            "epoch0-global_step2",
            "epoch0-global_step4",
            "epoch1-global_step6",
        ]
    );

    let resumed = run(
        WORLD_SIZE,
        dir.path().to_path_buf(),
        Resume::Checkpoint("epoch0-global_step2".to_string()),
        None,
    )
    .await?;
    assert_same_state(&resumed, &reference);
    Ok(())
}

#[tokio::test]
async fn test_crash_before_commit_resumes_from_previous_checkpoint() -> Result<()> {
    let reference_dir = tempdir()?;
    let reference = run(
        WORLD_SIZE,
        reference_dir.path().to_path_buf(),
        Resume::Fresh,
        None,
    )
    .await?;

    let dir = tempdir()?;
    run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Fresh, Some(7)).await?;

    // A save of step 8 died after writing some artifacts
    let staging = dir.path().join(staging_dir("epoch1-global_step8"));
    std::fs::create_dir_all(staging.join("live"))?;
    std::fs::write(staging.join("live/w.rank0.bin"), b"partial")?;

    let resumed = run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Latest, None).await?;
    assert!(!staging.exists());
    // Newest commit was step 6
    assert_eq!(resumed[0].summary.steps_run, 3 * 4 - 6);
    assert_same_state(&resumed, &reference);
    Ok(())
}

#[tokio::test]
async fn test_resume_with_different_world_size_fails_on_every_rank() -> Result<()> {
    let dir = tempdir()?;
    run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Fresh, Some(4)).await?;

    let path = dir.path().to_path_buf();
    let results = run_local_group(3, move |c| {
        let config = config(&path);
        async move { train(c, config, Resume::Latest, None).await }
    })
    .await;

    assert_eq!(results.len(), 3);
    for result in results {
        let err = match result {
            Ok(_) => panic!("resume with a different world size must fail"),
            Err(e) => e,
        };
        let err = err
            .downcast_ref::<Error>()
            .unwrap_or_else(|| panic!("unexpected error: {}", err));
        assert!(err.is_fatal(), "{}", err);
    }
    Ok(())
}

#[tokio::test]
async fn test_finished_run_does_no_more_work() -> Result<()> {
    let dir = tempdir()?;
    run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Fresh, None).await?;

    let again = run(WORLD_SIZE, dir.path().to_path_buf(), Resume::Latest, None).await?;
    for outcome in again {
        assert!(outcome.summary.finished);
        assert_eq!(outcome.summary.steps_run, 0);
        assert!(outcome.summary.checkpoints.is_empty());
    }
    Ok(())
}
