use bytes::Bytes;
use log::info;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::container::{ContainerHandler, DockerCtrHandler};
use crate::context::OpContext;
use crate::endpoint::EndpointManager;
use crate::error::Result;
use crate::jobs::{Job, JobFilter, JobHandler};
use crate::logs::LogHandler;
use crate::services::ServiceHandler;
use crate::types::{CoreService, Endpoint, EndpointBase, EndpointFilter, EndpointMap, LogFile};

/// Точка входа для HTTP слоя и CLI. Изменения выполняются как задачи
/// и возвращают ID задачи; чтение синхронное.
pub struct CoreManager {
    endpoints: Arc<EndpointManager>,
    services: Arc<ServiceHandler>,
    logs: Arc<LogHandler>,
    jobs: JobHandler,
}

impl CoreManager {
    pub fn new(
        endpoints: Arc<EndpointManager>,
        services: Arc<ServiceHandler>,
        logs: LogHandler,
        jobs: JobHandler,
    ) -> Self {
        Self {
            endpoints,
            services,
            logs: Arc::new(logs),
            jobs,
        }
    }

    /// Собирает все обработчики по конфигурации и загружает endpoints
    pub async fn from_config(config: &Config) -> Result<Self> {
        let runtime = config.container.runtime.clone();
        let timeout = config.container.timeout();
        let factory = move |name: &str| -> Arc<dyn ContainerHandler> {
            Arc::new(DockerCtrHandler::new(&runtime, name, timeout))
        };
        let services = ServiceHandler::init(Path::new(&config.compose_file_path), &factory).await?;
        let gateway = services.ctr_handler(&config.gateway_service)?;

        let endpoints = EndpointManager::new(
            config.templates.clone(),
            &config.endpoints_conf_path,
            gateway,
            config.reload_cmd.clone(),
            timeout,
        );
        endpoints.init().await?;

        let logs = LogHandler::new(&config.logs.files, config.logs.buffer_size)?;
        let jobs = JobHandler::new(config.jobs.max_concurrent, config.jobs.max_age());
        info!("Core manager initialized (gateway service '{}')", config.gateway_service);
        Ok(Self::new(Arc::new(endpoints), Arc::new(services), logs, jobs))
    }

    pub fn jobs(&self) -> &JobHandler {
        &self.jobs
    }

    pub fn get_endpoints(&self, ctx: &OpContext, filter: &EndpointFilter) -> Result<EndpointMap> {
        self.endpoints.list(ctx, filter)
    }

    pub fn get_endpoint(&self, ctx: &OpContext, id: &str) -> Result<Endpoint> {
        self.endpoints.get(ctx, id)
    }

    pub async fn set_endpoint(&self, base: EndpointBase) -> Result<String> {
        let desc = format!("set endpoint '{}' ('{}')", base.reference, base.ext_path);
        self.endpoint_job(desc, move |m, ctx| async move { m.set(&ctx, base).await })
            .await
    }

    pub async fn set_endpoints(&self, bases: Vec<EndpointBase>) -> Result<String> {
        let desc = format!("set {} endpoint(s)", bases.len());
        self.endpoint_job(desc, move |m, ctx| async move { m.set_list(&ctx, bases).await })
            .await
    }

    pub async fn add_endpoint_alias(&self, id: &str, path: &str) -> Result<String> {
        let desc = format!("add alias '{}' for endpoint '{}'", path, id);
        let (id, path) = (id.to_string(), path.to_string());
        self.endpoint_job(desc, move |m, ctx| async move { m.add_alias(&ctx, &id, &path).await })
            .await
    }

    pub async fn add_default_gui_endpoint(&self, id: &str) -> Result<String> {
        let desc = format!("add default gui endpoint for '{}'", id);
        let id = id.to_string();
        self.endpoint_job(desc, move |m, ctx| async move { m.add_default_gui(&ctx, &id).await })
            .await
    }

    pub async fn remove_endpoint(&self, id: &str, restrict_standard: bool) -> Result<String> {
        let desc = format!("remove endpoint '{}'", id);
        let id = id.to_string();
        self.endpoint_job(desc, move |m, ctx| async move {
            m.remove(&ctx, &id, restrict_standard).await
        })
        .await
    }

    pub async fn remove_endpoints(&self, filter: EndpointFilter, restrict_standard: bool) -> Result<String> {
        let desc = format!("remove endpoints {:?}", filter);
        self.endpoint_job(desc, move |m, ctx| async move {
            m.remove_all(&ctx, &filter, restrict_standard).await
        })
        .await
    }

    pub async fn get_core_services(&self, ctx: &OpContext) -> Result<BTreeMap<String, CoreService>> {
        self.services.list(ctx).await
    }

    pub async fn get_core_service(&self, ctx: &OpContext, name: &str) -> Result<CoreService> {
        self.services.get(ctx, name).await
    }

    pub async fn restart_core_service(&self, name: &str) -> Result<String> {
        let services = self.services.clone();
        let name = name.to_string();
        self.jobs
            .create(format!("restart core service '{}'", name), move |ctx| async move {
                services.restart(&ctx, &name).await?;
                Ok(ctx.check()?)
            })
            .await
    }

    pub fn list_logs(&self) -> Vec<LogFile> {
        self.logs.list()
    }

    pub async fn get_log(&self, ctx: &OpContext, id: &str, num_lines: usize) -> Result<Bytes> {
        self.logs.tail(ctx, id, num_lines).await
    }

    pub async fn get_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.jobs.list(filter).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs.get(id).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        self.jobs.cancel(id).await
    }

    /// Запускает операцию над endpoints как задачу. Отмена, пришедшая после
    /// успешного изменения, все равно попадает в результат задачи.
    async fn endpoint_job<F, Fut>(&self, description: String, op: F) -> Result<String>
    where
        F: FnOnce(Arc<EndpointManager>, OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let endpoints = self.endpoints.clone();
        self.jobs
            .create(description, move |ctx| async move {
                op(endpoints, ctx.clone()).await?;
                Ok(ctx.check()?)
            })
            .await
    }
}
