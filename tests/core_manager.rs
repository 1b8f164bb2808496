use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio_test::assert_ok;

use core_manager::container::{ContainerError, ContainerHandler};
use core_manager::endpoint::Templates;
use core_manager::jobs::{JobFilter, JobHandler, JobStatus};
use core_manager::logs::{LogFileConfig, LogHandler};
use core_manager::services::ServiceHandler;
use core_manager::types::SrvContainer;
use core_manager::{CoreManager, EndpointBase, EndpointFilter, EndpointManager, ErrorKind, OpContext};

const POLL: Duration = Duration::from_millis(5);

struct OkHandler;

#[async_trait]
impl ContainerHandler for OkHandler {
    async fn exec_cmd(
        &self,
        _ctx: &OpContext,
        _cmd: &[String],
        _tty: bool,
        _env_vars: &BTreeMap<String, String>,
        _work_dir: &str,
    ) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn info(&self, _ctx: &OpContext) -> Result<SrvContainer, ContainerError> {
        Ok(SrvContainer {
            name: "gateway".to_string(),
            id: Some("c0ffee".to_string()),
            state: Some("running".to_string()),
        })
    }

    async fn restart(&self, _ctx: &OpContext) -> Result<(), ContainerError> {
        Ok(())
    }
}

const COMPOSE: &str = "services:\n  core-gateway:\n    container_name: gateway\n";

async fn manager(dir: &std::path::Path) -> CoreManager {
    let factory = |_: &str| -> Arc<dyn ContainerHandler> { Arc::new(OkHandler) };
    let services = ServiceHandler::from_compose(COMPOSE, &factory).unwrap();
    let endpoints = EndpointManager::new(
        Templates::default(),
        dir.join("endpoints.conf"),
        services.ctr_handler("core-gateway").unwrap(),
        vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
        Duration::from_secs(1),
    );
    assert_ok!(endpoints.init().await);

    let log_path = dir.join("gateway.log");
    std::fs::write(&log_path, "l1\nl2\nl3\n").unwrap();
    let logs = LogHandler::new(
        &[LogFileConfig {
            name: "core-gateway".to_string(),
            path: log_path.to_string_lossy().to_string(),
        }],
        64,
    )
    .unwrap();

    CoreManager::new(
        Arc::new(endpoints),
        Arc::new(services),
        logs,
        JobHandler::new(4, Duration::from_secs(3600)),
    )
}

#[tokio::test]
async fn test_mutations_run_as_jobs() {
    let dir = tempdir().unwrap();
    let m = manager(dir.path()).await;
    let ctx = OpContext::background();

    let base = EndpointBase {
        reference: "svc1".to_string(),
        host: "svc1".to_string(),
        int_path: "/".to_string(),
        ext_path: "svc1".to_string(),
        ..Default::default()
    };
    let job_id = m.set_endpoint(base).await.unwrap();
    let job = m.jobs().wait(&job_id, POLL).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);

    let endpoints = m.get_endpoints(&ctx, &EndpointFilter::default()).unwrap();
    let id = endpoints.keys().next().unwrap().clone();
    assert_eq!(m.get_endpoint(&ctx, &id).unwrap().location, "/endpoints/deployment/svc1/svc1");

    let job_id = m.remove_endpoint(&id, true).await.unwrap();
    let job = m.jobs().wait(&job_id, POLL).await.unwrap();
    assert_eq!(job.status(), JobStatus::Error);
    assert_eq!(job.error.unwrap().kind, ErrorKind::NotAllowed);

    let job_id = m.remove_endpoints(EndpointFilter { ids: vec![id.clone()], ..Default::default() }, false)
        .await
        .unwrap();
    assert_eq!(m.jobs().wait(&job_id, POLL).await.unwrap().status(), JobStatus::Completed);
    assert!(m.get_endpoints(&ctx, &EndpointFilter::default()).unwrap().is_empty());

    let errors = m.get_jobs(&JobFilter { status: Some(JobStatus::Error), ..Default::default() }).await;
    assert_eq!(errors.len(), 1);
    assert_eq!(m.get_jobs(&JobFilter::default()).await.len(), 3);
}

#[tokio::test]
async fn test_services_and_logs() {
    let dir = tempdir().unwrap();
    let m = manager(dir.path()).await;
    let ctx = OpContext::background();

    let services = m.get_core_services(&ctx).await.unwrap();
    assert_eq!(services["core-gateway"].container.state.as_deref(), Some("running"));
    assert_eq!(m.get_core_service(&ctx, "core-gateway").await.unwrap().container.name, "gateway");

    let job_id = m.restart_core_service("core-gateway").await.unwrap();
    assert_eq!(m.jobs().wait(&job_id, POLL).await.unwrap().status(), JobStatus::Completed);
    let job_id = m.restart_core_service("unknown").await.unwrap();
    let job = m.jobs().wait(&job_id, POLL).await.unwrap();
    assert_eq!(job.error.unwrap().kind, ErrorKind::NotFound);

    let logs = m.list_logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].service_name, "core-gateway");
    let tail = m.get_log(&ctx, &logs[0].id, 2).await.unwrap();
    assert_eq!(&tail[..], b"l2\nl3\n");

    let job_id = m.restart_core_service("core-gateway").await.unwrap();
    m.jobs().wait(&job_id, POLL).await.unwrap();
    assert!(m.cancel_job(&job_id).await.is_err());
    assert!(m.get_job(&job_id).await.is_ok());
}
