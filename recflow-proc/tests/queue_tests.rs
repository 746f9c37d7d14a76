//! Job queue, scheduler and processing directive tests

mod helpers;

use helpers::db_utils::{marc_record, provider, seed_input, service, test_config, test_env};
use helpers::services::{GatedService, PanickingService};
use recflow_common::events::ServiceEvent;
use recflow_common::repo::input::{self, TypeSelector};
use recflow_common::{Error, Record, RecordFilter, ServiceStatus};
use recflow_proc::db::directives::{insert_directive, load_directives_for};
use recflow_proc::db::services;
use recflow_proc::engine::DirectiveEvaluator;
use recflow_proc::models::{DirectiveSource, JobKind, NewDirective};
use recflow_proc::scheduler::JobScheduler;
use serde_json::json;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

async fn wait_for_status(pool: &SqlitePool, service_id: i64, status: ServiceStatus) {
    for _ in 0..500 {
        if services::load_status(pool, service_id).await.unwrap() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("service {} never reached {}", service_id, status);
}

async fn pending(pool: &SqlitePool, service_id: i64) -> i64 {
    input::count_pending_input(pool, service_id, TypeSelector::Any)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_jobs_run_in_enqueue_order() {
    let env = test_env(test_config()).await.unwrap();
    let a = service(&env.state, "A", "scripted").await.unwrap();
    let b = service(&env.state, "B", "scripted").await.unwrap();
    let queue = env.state.queue();

    let first = queue.enqueue(b.id, None, JobKind::ProcessingDirective).await.unwrap().unwrap();
    let second = queue.enqueue(a.id, Some("set1"), JobKind::ServiceReprocess).await.unwrap().unwrap();
    let third = queue.enqueue(a.id, None, JobKind::ProcessingDirective).await.unwrap().unwrap();

    assert!(first.order < second.order);
    assert!(second.order < third.order);
    assert_eq!(queue.len().await.unwrap(), 3);
    assert_eq!(queue.peek().await.unwrap().unwrap().id, first.id);

    let drained: Vec<(i64, Option<String>, JobKind)> = {
        let mut jobs = Vec::new();
        while let Some(job) = queue.next().await.unwrap() {
            jobs.push((job.service_id, job.output_set, job.kind));
        }
        jobs
    };
    assert_eq!(
        drained,
        vec![
            (b.id, None, JobKind::ProcessingDirective),
            (a.id, Some("set1".to_string()), JobKind::ServiceReprocess),
            (a.id, None, JobKind::ProcessingDirective),
        ]
    );
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_duplicate_pending_job_is_not_enqueued() {
    let env = test_env(test_config()).await.unwrap();
    let a = service(&env.state, "A", "scripted").await.unwrap();
    let queue = env.state.queue();

    assert!(queue.enqueue(a.id, Some("s"), JobKind::ProcessingDirective).await.unwrap().is_some());
    assert!(queue.enqueue(a.id, Some("s"), JobKind::ProcessingDirective).await.unwrap().is_none());
    assert!(queue.enqueue(a.id, None, JobKind::ProcessingDirective).await.unwrap().is_some());
    assert!(queue.enqueue(a.id, None, JobKind::ProcessingDirective).await.unwrap().is_none());
    assert_eq!(queue.pending_for(a.id).await.unwrap().len(), 2);

    // Once dequeued, the same pair may be queued again
    queue.next().await.unwrap().unwrap();
    assert!(queue.enqueue(a.id, Some("s"), JobKind::ProcessingDirective).await.unwrap().is_some());
}

#[tokio::test]
async fn test_enqueue_emits_event() {
    let env = test_env(test_config()).await.unwrap();
    let a = service(&env.state, "A", "scripted").await.unwrap();
    let mut events = env.state.event_bus.subscribe();

    let job = env
        .state
        .queue()
        .enqueue(a.id, None, JobKind::ServiceReprocess)
        .await
        .unwrap()
        .unwrap();

    match events.try_recv().unwrap() {
        ServiceEvent::JobEnqueued { job_id, service_id, order, .. } => {
            assert_eq!(job_id, job.id);
            assert_eq!(service_id, a.id);
            assert_eq!(order, job.order);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_remove_for_service_leaves_others() {
    let env = test_env(test_config()).await.unwrap();
    let a = service(&env.state, "A", "scripted").await.unwrap();
    let b = service(&env.state, "B", "scripted").await.unwrap();
    let queue = env.state.queue();
    queue.enqueue(a.id, None, JobKind::ProcessingDirective).await.unwrap();
    queue.enqueue(a.id, Some("x"), JobKind::ProcessingDirective).await.unwrap();
    let kept = queue.enqueue(b.id, None, JobKind::ProcessingDirective).await.unwrap().unwrap();

    assert_eq!(queue.remove_for_service(a.id).await.unwrap(), 2);
    let remaining = queue.list().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, kept.id);
    assert!(queue.remove(kept.id).await.unwrap());
    assert!(!queue.remove(kept.id).await.unwrap());
}

#[tokio::test]
async fn test_directive_matches_format_and_sets() {
    // Given: directives loaded from the database for one provider
    let env = test_env(test_config()).await.unwrap();
    let (source, _) = provider(&env.state, "p").await.unwrap();
    let norm = service(&env.state, "Norm", "scripted").await.unwrap();
    let other = service(&env.state, "Other", "scripted").await.unwrap();
    insert_directive(
        &env.state.db,
        &NewDirective {
            source: DirectiveSource::Provider(source.id),
            target_service_id: norm.id,
            output_set: None,
            formats: vec!["marc21".to_string()],
            sets: vec![],
        },
    )
    .await
    .unwrap();
    insert_directive(
        &env.state.db,
        &NewDirective {
            source: DirectiveSource::Provider(source.id),
            target_service_id: other.id,
            output_set: Some("books".to_string()),
            formats: vec!["marc21".to_string(), "dc".to_string()],
            sets: vec!["books".to_string()],
        },
    )
    .await
    .unwrap();
    let directives = load_directives_for(&env.state.db, DirectiveSource::Provider(source.id))
        .await
        .unwrap();
    assert_eq!(directives.len(), 2);
    let mut evaluator = DirectiveEvaluator::new(directives, env.state.queue());

    // When / Then: format-only match
    let mut plain = marc_record("oai:t:1", json!({}));
    assert_eq!(evaluator.evaluate(&mut plain), 1);
    assert!(plain.input_for.contains(&norm.id));
    assert!(!plain.input_for.contains(&other.id));

    // When / Then: format and set match both
    let mut in_set = marc_record("oai:t:2", json!({})).with_set("books");
    assert_eq!(evaluator.evaluate(&mut in_set), 2);
    assert!(in_set.input_for.contains(&other.id));

    // When / Then: unknown format matches nothing
    let mut unknown = Record::new("oai:t:3", "mods").with_set("books");
    assert_eq!(evaluator.evaluate(&mut unknown), 0);
    assert!(unknown.input_for.is_empty());
}

#[tokio::test]
async fn test_evaluator_enqueues_once_per_commit_window() {
    let env = test_env(test_config()).await.unwrap();
    let (source, _) = provider(&env.state, "p").await.unwrap();
    let target = service(&env.state, "Target", "scripted").await.unwrap();
    insert_directive(
        &env.state.db,
        &NewDirective {
            source: DirectiveSource::Provider(source.id),
            target_service_id: target.id,
            output_set: Some("out".to_string()),
            formats: vec!["marc21".to_string()],
            sets: vec![],
        },
    )
    .await
    .unwrap();
    let directives = load_directives_for(&env.state.db, DirectiveSource::Provider(source.id))
        .await
        .unwrap();
    let queue = env.state.queue();
    let mut evaluator = DirectiveEvaluator::new(directives, queue.clone());

    for n in 0..5 {
        let mut record = marc_record(&format!("oai:t:{}", n), json!({}));
        evaluator.evaluate(&mut record);
    }
    // Nothing is queued before the caller commits
    assert!(queue.is_empty().await.unwrap());
    assert_eq!(evaluator.scheduled().len(), 1);

    assert_eq!(evaluator.enqueue_scheduled().await.unwrap(), 1);
    assert!(evaluator.scheduled().is_empty());
    let jobs = queue.pending_for(target.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].output_set.as_deref(), Some("out"));
    assert_eq!(jobs[0].kind, JobKind::ProcessingDirective);

    // A second window while the job is still pending adds nothing
    let mut record = marc_record("oai:t:9", json!({}));
    evaluator.evaluate(&mut record);
    assert_eq!(evaluator.enqueue_scheduled().await.unwrap(), 0);
    assert_eq!(queue.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_evaluate_clears_processed_mark() {
    let env = test_env(test_config()).await.unwrap();
    let (source, _) = provider(&env.state, "p").await.unwrap();
    let target = service(&env.state, "Target", "scripted").await.unwrap();
    insert_directive(
        &env.state.db,
        &NewDirective {
            source: DirectiveSource::Provider(source.id),
            target_service_id: target.id,
            output_set: None,
            formats: vec!["marc21".to_string()],
            sets: vec![],
        },
    )
    .await
    .unwrap();
    let directives = load_directives_for(&env.state.db, DirectiveSource::Provider(source.id))
        .await
        .unwrap();
    let mut evaluator = DirectiveEvaluator::new(directives, env.state.queue());

    let mut record = marc_record("oai:t:1", json!({}));
    record.processed_by.insert(target.id);
    evaluator.evaluate(&mut record);

    assert!(record.input_for.contains(&target.id));
    assert!(!record.processed_by.contains(&target.id));
}

#[tokio::test]
async fn test_reprocess_requeues_every_consumer() {
    let env = test_env(test_config()).await.unwrap();
    let a = service(&env.state, "A", "scripted").await.unwrap();
    let b = service(&env.state, "B", "scripted").await.unwrap();
    let queue = env.state.queue();
    let mut evaluator = DirectiveEvaluator::new(Vec::new(), queue.clone());

    let mut record = marc_record("oai:t:1", json!({}));
    record.processed_by.insert(a.id);
    record.processed_by.insert(b.id);
    evaluator.reprocess(&mut record);

    assert!(record.processed_by.is_empty());
    assert_eq!(record.input_for.iter().copied().collect::<Vec<_>>(), vec![a.id, b.id]);
    assert_eq!(evaluator.enqueue_scheduled().await.unwrap(), 2);
    assert_eq!(queue.pending_for(a.id).await.unwrap().len(), 1);
    assert_eq!(queue.pending_for(b.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_directive_without_formats_is_rejected() {
    let env = test_env(test_config()).await.unwrap();
    let (source, _) = provider(&env.state, "p").await.unwrap();
    let target = service(&env.state, "Target", "scripted").await.unwrap();

    let result = insert_directive(
        &env.state.db,
        &NewDirective {
            source: DirectiveSource::Provider(source.id),
            target_service_id: target.id,
            output_set: None,
            formats: vec![],
            sets: vec![],
        },
    )
    .await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_run_until_idle_finishes_other_runs_when_one_fails() {
    // Given: a service left RUNNING elsewhere queued ahead of one with real work
    let env = test_env(test_config()).await.unwrap();
    let (_, provider_repo) = provider(&env.state, "p").await.unwrap();
    let held = service(&env.state, "Held", "normalization").await.unwrap();
    let busy = service(&env.state, "Busy", "normalization").await.unwrap();
    seed_input(&provider_repo, busy.id, "r", 300).await.unwrap();
    services::set_status(&env.state.db, held.id, ServiceStatus::Running).await.unwrap();
    let queue = env.state.queue();
    queue.enqueue(held.id, None, JobKind::ServiceReprocess).await.unwrap();
    queue.enqueue(busy.id, None, JobKind::ServiceReprocess).await.unwrap();

    // When
    let result = JobScheduler::new(env.state.clone()).run_until_idle().await;

    // Then: the failure is reported only after the other run finished its pass
    assert!(matches!(result, Err(Error::AlreadyRunning(_))));
    assert_eq!(pending(&env.state.db, busy.id).await, 0);
    let output = env.state.engine().repository_for(&busy);
    assert_eq!(output.get_record_count(&RecordFilter::default()).await.unwrap(), 300);
    assert_eq!(
        services::load_status(&env.state.db, busy.id).await.unwrap(),
        ServiceStatus::NotRunning
    );

    // The busy service keeps its job for a later drain
    assert_eq!(queue.pending_for(held.id).await.unwrap().len(), 1);
    assert!(queue.pending_for(busy.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatch_skips_second_job_for_active_service() {
    let gated = GatedService::new();
    let mut env = test_env(test_config()).await.unwrap();
    env.state = env.state.clone().with_registry(gated.registry());
    let (_, provider_repo) = provider(&env.state, "p").await.unwrap();
    let info = service(&env.state, "Slow", GatedService::KIND).await.unwrap();
    seed_input(&provider_repo, info.id, "r", 2).await.unwrap();
    let queue = env.state.queue();
    queue.enqueue(info.id, None, JobKind::ServiceReprocess).await.unwrap();
    queue.enqueue(info.id, Some("later"), JobKind::ProcessingDirective).await.unwrap();

    let scheduler = JobScheduler::new(env.state.clone());
    let mut tasks = JoinSet::new();

    // When: the first job is running
    assert_eq!(scheduler.dispatch_ready(&mut tasks).await.unwrap(), 1);
    assert_eq!(scheduler.active_services(), vec![info.id]);

    // Then: the second job for the same service waits in the queue
    assert_eq!(scheduler.dispatch_ready(&mut tasks).await.unwrap(), 0);
    let waiting = queue.list().await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].output_set.as_deref(), Some("later"));

    // When: the first run ends, the second job dispatches
    gated.release(2);
    let (job, result) = tasks.join_next().await.unwrap().unwrap();
    assert_eq!(job.output_set, None);
    assert_eq!(result.unwrap().stats.processed, 2);
    assert!(scheduler.active_services().is_empty());

    assert_eq!(scheduler.dispatch_ready(&mut tasks).await.unwrap(), 1);
    let (job, result) = tasks.join_next().await.unwrap().unwrap();
    assert_eq!(job.output_set.as_deref(), Some("later"));
    assert_eq!(result.unwrap().status, ServiceStatus::NotRunning);
    assert!(queue.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_pause_resume_and_cancel_active_run() {
    let gated = GatedService::new();
    let mut env = test_env(test_config()).await.unwrap();
    env.state = env.state.clone().with_registry(gated.registry());
    let (_, provider_repo) = provider(&env.state, "p").await.unwrap();
    let info = service(&env.state, "Slow", GatedService::KIND).await.unwrap();
    seed_input(&provider_repo, info.id, "r", 5).await.unwrap();
    env.state.queue().enqueue(info.id, None, JobKind::ServiceReprocess).await.unwrap();

    let scheduler = JobScheduler::new(env.state.clone());
    let mut tasks = JoinSet::new();
    scheduler.dispatch_ready(&mut tasks).await.unwrap();
    gated.wait_entered(1).await;

    // Pause takes effect once the record in flight completes
    assert!(scheduler.pause(info.id));
    gated.release(1);
    wait_for_status(&env.state.db, info.id, ServiceStatus::Paused).await;

    assert!(scheduler.resume(info.id));
    wait_for_status(&env.state.db, info.id, ServiceStatus::Running).await;
    gated.wait_entered(2).await;

    assert!(scheduler.cancel(info.id));
    gated.release(1);
    let (_, result) = tasks.join_next().await.unwrap().unwrap();
    let outcome = result.unwrap();

    assert_eq!(outcome.status, ServiceStatus::Canceled);
    assert_eq!(outcome.stats.processed, 2);
    assert_eq!(pending(&env.state.db, info.id).await, 3);
    assert!(!scheduler.pause(info.id));
}

#[tokio::test]
async fn test_shutdown_cancels_and_requeues_active_run() {
    // Given: a scheduler loop with a run in progress
    let gated = GatedService::new();
    let mut env = test_env(test_config()).await.unwrap();
    env.state = env.state.clone().with_registry(gated.registry());
    let (_, provider_repo) = provider(&env.state, "p").await.unwrap();
    let info = service(&env.state, "Slow", GatedService::KIND).await.unwrap();
    seed_input(&provider_repo, info.id, "r", 50).await.unwrap();
    let queue = env.state.queue();
    queue.enqueue(info.id, None, JobKind::ServiceReprocess).await.unwrap();

    let scheduler = JobScheduler::new(env.state.clone());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });
    gated.wait_entered(1).await;
    assert!(queue.is_empty().await.unwrap());

    // When: shutdown fires
    shutdown.cancel();
    while !handle.is_finished() {
        gated.release(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.await.unwrap().unwrap();

    // Then: the run stopped early and its job is back in the queue
    assert_eq!(
        services::load_status(&env.state.db, info.id).await.unwrap(),
        ServiceStatus::Canceled
    );
    assert!(pending(&env.state.db, info.id).await > 0);
    let requeued = queue.pending_for(info.id).await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].kind, JobKind::ServiceReprocess);
}

#[tokio::test]
async fn test_panicked_run_requeues_its_job() {
    let mut env = test_env(test_config()).await.unwrap();
    env.state = env.state.clone().with_registry(PanickingService::registry());
    let (_, provider_repo) = provider(&env.state, "p").await.unwrap();
    let info = service(&env.state, "Broken", PanickingService::KIND).await.unwrap();
    seed_input(&provider_repo, info.id, "r", 1).await.unwrap();
    let queue = env.state.queue();
    queue.enqueue(info.id, None, JobKind::ServiceReprocess).await.unwrap();

    let result = JobScheduler::new(env.state.clone()).run_until_idle().await;
    assert!(matches!(result, Err(Error::Internal(_))));

    // The requeue runs on its own task
    for _ in 0..100 {
        if !queue.pending_for(info.id).await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job of the panicked run was not requeued");
}
