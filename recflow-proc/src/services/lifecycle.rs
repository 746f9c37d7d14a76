//! Service registration, removal, upgrade and crash recovery

use recflow_common::events::ServiceEvent;
use recflow_common::repo;
use recflow_common::{time, Error, RecordFilter, RecordStatus, Result, ServiceStatus};
use std::path::Path;
use tracing::{info, warn};

use super::scripts::{self, Version};
use crate::db::{counters, directives, services};
use crate::engine::DirectiveEvaluator;
use crate::models::{JobKind, ServiceInfo};
use crate::AppState;

/// Insert a service, run its install hook and queue a full pass
pub async fn register_service(
    state: &AppState,
    name: &str,
    kind: &str,
    version: &str,
) -> Result<ServiceInfo> {
    if !state.registry.contains(kind) {
        return Err(Error::Config(format!("No service implementation for kind '{}'", kind)));
    }
    version.parse::<Version>()?;
    if services::load_service_by_name(&state.db, name).await?.is_some() {
        return Err(Error::InvalidInput(format!("Service {} already exists", name)));
    }

    let info = services::insert_service(&state.db, name, kind, version).await?;
    let installed = async {
        let mut service = state.instantiate(&info)?;
        service.install(&state.service_context(&info)).await
    }
    .await;
    if let Err(err) = installed {
        warn!(service = %name, error = %err, "Install failed; removing service");
        services::delete_service_row(&state.db, info.id).await?;
        return Err(err);
    }

    state.queue().enqueue(info.id, None, JobKind::ServiceReprocess).await?;
    info!(service = %name, kind, version, "Registered service");
    Ok(info)
}

/// Remove a service and retract its output
///
/// Every output record is tombstoned and detached from its inputs; services that
/// consumed the output are queued to retract what they derived from it.
pub async fn delete_service(state: &AppState, service_id: i64) -> Result<()> {
    let info = services::load_service(&state.db, service_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("service {}", service_id)))?;
    if info.status.is_active() {
        return Err(Error::InvalidInput(format!(
            "Service {} is {}; stop it before deleting",
            info.name, info.status
        )));
    }

    let repo = state.engine().repository_for(&info);
    let mut directive_eval = DirectiveEvaluator::new(Vec::new(), state.queue());
    let mut filter = RecordFilter::default();
    let mut retracted = 0;
    loop {
        let page = repo.get_records(&filter).await?;
        let Some(last_id) = page.last().and_then(|r| r.id) else {
            break;
        };
        for mut output in page {
            let output_id = output.require_id()?;
            for predecessor in repo.get_predecessor_ids(output_id).await? {
                repo.remove_lineage(predecessor, output_id).await?;
            }
            output.predecessors.clear();
            if !output.is_deleted() {
                output.status = RecordStatus::Deleted;
                retracted += 1;
            }
            directive_eval.reprocess(&mut output);
            repo.update_record(&mut output).await?;
        }
        filter = filter.starting_after(last_id);
    }
    repo.process_complete().await?;
    let requeued = directive_eval.enqueue_scheduled().await?;

    services::clear_record_marks(&state.db, service_id).await?;
    directives::delete_directives_for_service(&state.db, service_id).await?;
    state.queue().remove_for_service(service_id).await?;
    counters::delete_scope(&state.db, &info.name).await?;

    let mut service = state.instantiate(&info)?;
    service.uninstall(&state.service_context(&info)).await?;
    services::delete_service_row(&state.db, service_id).await?;

    info!(
        service = %info.name,
        retracted,
        requeued,
        "Deleted service"
    );
    Ok(())
}

/// Move a service to `new_version`, running pending update scripts from `scripts_dir`
pub async fn update_service(
    state: &AppState,
    service_id: i64,
    new_version: &str,
    scripts_dir: Option<&Path>,
) -> Result<ServiceInfo> {
    let info = services::load_service(&state.db, service_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("service {}", service_id)))?;
    if info.status.is_active() {
        return Err(Error::InvalidInput(format!("Service {} is {}", info.name, info.status)));
    }

    let from: Version = info.version.parse()?;
    let to: Version = new_version.parse()?;
    if to < from {
        return Err(Error::InvalidInput(format!(
            "Cannot downgrade {} from {} to {}",
            info.name, from, to
        )));
    }

    if let Some(dir) = scripts_dir {
        let pending = scripts::plan(scripts::load_scripts(dir).await?, from, to);
        scripts::apply(&state.db, &pending).await?;
    }

    let mut service = state.instantiate(&info)?;
    service.update(&state.service_context(&info), &info.version).await?;
    services::update_version(&state.db, service_id, new_version).await?;
    info!(service = %info.name, from = %from, to = %to, "Updated service");

    services::load_service(&state.db, service_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("service {}", service_id)))
}

/// Reset services a crashed process left RUNNING or PAUSED and queue them again
///
/// Their pending input is still pending, so the next pass resumes where the last
/// committed batch ended. Rows staged by batches that never ended are purged first, so
/// call this before anything is dispatched.
pub async fn recover_interrupted_services(state: &AppState) -> Result<Vec<i64>> {
    repo::purge_abandoned_batches(&state.db).await?;
    let queue = state.queue();
    let mut recovered = Vec::new();
    for info in services::interrupted_services(&state.db).await? {
        warn!(service = %info.name, status = %info.status, "Recovering interrupted service");
        services::set_status(&state.db, info.id, ServiceStatus::NotRunning).await?;
        state.event_bus.emit_lossy(ServiceEvent::StatusChanged {
            service_id: info.id,
            old_status: info.status,
            new_status: ServiceStatus::NotRunning,
            timestamp: time::now(),
        });
        queue.enqueue(info.id, None, JobKind::ServiceReprocess).await?;
        recovered.push(info.id);
    }
    Ok(recovered)
}
