use log::{error, info};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::container::ContainerHandler;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::types::{CoreService, SrvContainer};

/// Создает обработчик контейнера по его имени
pub type CtrHandlerFactory<'a> = dyn Fn(&str) -> Arc<dyn ContainerHandler> + 'a;

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    #[serde(default)]
    container_name: Option<String>,
}

struct Service {
    container_name: String,
    ctr_handler: Arc<dyn ContainerHandler>,
}

/// Сервисы ядра из docker compose файла
pub struct ServiceHandler {
    services: BTreeMap<String, Service>,
}

impl ServiceHandler {
    /// Читает таблицу `services.<name>.container_name` из compose файла
    pub async fn init(compose_file: &Path, factory: &CtrHandlerFactory<'_>) -> Result<Self> {
        let content = tokio::fs::read_to_string(compose_file).await.map_err(|e| {
            Error::internal(format!("reading {} failed: {}", compose_file.display(), e))
        })?;
        let handler = Self::from_compose(&content, factory)?;
        info!("Loaded {} core service(s) from {}", handler.services.len(), compose_file.display());
        Ok(handler)
    }

    pub fn from_compose(content: &str, factory: &CtrHandlerFactory<'_>) -> Result<Self> {
        let compose: ComposeFile = serde_yaml::from_str(content).map_err(Error::internal)?;
        let services = compose
            .services
            .into_iter()
            .map(|(name, srv)| {
                // без container_name compose называет контейнер по сервису
                let container_name = srv.container_name.unwrap_or_else(|| name.clone());
                let ctr_handler = factory(&container_name);
                (name, Service { container_name, ctr_handler })
            })
            .collect();
        Ok(Self { services })
    }

    pub async fn list(&self, ctx: &OpContext) -> Result<BTreeMap<String, CoreService>> {
        let mut result = BTreeMap::new();
        for (name, srv) in &self.services {
            ctx.check()?;
            let container = match srv.ctr_handler.info(ctx).await {
                Ok(c) => c,
                Err(e) => {
                    error!("service '{}' container lookup failed: {}", name, e);
                    SrvContainer {
                        name: srv.container_name.clone(),
                        ..Default::default()
                    }
                }
            };
            result.insert(name.clone(), CoreService { name: name.clone(), container });
        }
        Ok(result)
    }

    pub async fn get(&self, ctx: &OpContext, name: &str) -> Result<CoreService> {
        let srv = self.service(name)?;
        let container = srv.ctr_handler.info(ctx).await?;
        Ok(CoreService { name: name.to_string(), container })
    }

    pub async fn restart(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let srv = self.service(name)?;
        info!("Restarting core service '{}' ({})", name, srv.container_name);
        srv.ctr_handler.restart(ctx).await?;
        Ok(())
    }

    /// Обработчик контейнера сервиса (для шлюза)
    pub fn ctr_handler(&self, name: &str) -> Result<Arc<dyn ContainerHandler>> {
        Ok(self.service(name)?.ctr_handler.clone())
    }

    fn service(&self, name: &str) -> Result<&Service> {
        self.services
            .get(name)
            .ok_or_else(|| Error::not_found(format!("service '{}' not found", name)))
    }
}
