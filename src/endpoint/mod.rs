//! Управление endpoints шлюза.
//!
//! Состояние живет в неизменяемом снимке (`ArcSwap`), читатели его не блокируют.
//! Все изменения проходят через `write_gate` целиком: построение кандидата,
//! запись файла и reload прокси. Снимок заменяется только после успешного reload.

use arc_swap::ArcSwap;
use log::{error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub mod codec;
pub mod templates;

pub use templates::{TemplateSet, Templates};

use crate::container::ContainerHandler;
use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::metrics::{self, ENDPOINTS, PROXY_RELOAD_FAILURES};
use crate::types::{Endpoint, EndpointBase, EndpointFilter, EndpointMap, EndpointType};

static HOST_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._\-:\[\]]+$").expect("valid host regex"));
static UNSAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[\s"';{}#]"#).expect("valid unsafe chars regex"));

pub struct EndpointManager {
    templates: Templates,
    conf_path: PathBuf,
    ctr_handler: Arc<dyn ContainerHandler>,
    reload_cmd: Vec<String>,
    reload_timeout: Duration,
    endpoints: ArcSwap<EndpointMap>,
    write_gate: Mutex<()>,
}

impl EndpointManager {
    pub fn new(
        templates: Templates,
        conf_path: impl Into<PathBuf>,
        ctr_handler: Arc<dyn ContainerHandler>,
        reload_cmd: Vec<String>,
        reload_timeout: Duration,
    ) -> Self {
        Self {
            templates,
            conf_path: conf_path.into(),
            ctr_handler,
            reload_cmd,
            reload_timeout,
            endpoints: ArcSwap::from_pointee(EndpointMap::new()),
            write_gate: Mutex::new(()),
        }
    }

    /// Загружает endpoints из конфига. Ошибка декодирования фатальна.
    pub async fn init(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let tree = codec::parse(&self.conf_path).await.map_err(Error::internal)?;
        let endpoints = codec::load_endpoints(&tree, &self.templates).map_err(|e| {
            Error::internal(format!("loading {} failed: {}", self.conf_path.display(), e))
        })?;
        info!("Loaded {} endpoint(s) from {}", endpoints.len(), self.conf_path.display());
        ENDPOINTS.set(endpoints.len() as i64);
        self.endpoints.store(Arc::new(endpoints));
        Ok(())
    }

    pub fn templates(&self) -> &Templates {
        &self.templates
    }

    /// Endpoints, подходящие под фильтр
    pub fn list(&self, ctx: &OpContext, filter: &EndpointFilter) -> Result<EndpointMap> {
        ctx.check()?;
        let snapshot = self.endpoints.load();
        let ids: HashSet<&str> = filter.ids.iter().map(String::as_str).collect();
        let mut matched = EndpointMap::new();
        for (id, endpoint) in snapshot.iter() {
            ctx.check()?;
            if filter.matches(&ids, endpoint) {
                matched.insert(id.clone(), endpoint.clone());
            }
        }
        Ok(matched)
    }

    pub fn get(&self, ctx: &OpContext, id: &str) -> Result<Endpoint> {
        ctx.check()?;
        self.endpoints
            .load()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("endpoint '{}' not found", id)))
    }

    /// Создает или заменяет Standard endpoint
    pub async fn set(&self, ctx: &OpContext, base: EndpointBase) -> Result<()> {
        self.set_list(ctx, vec![base]).await
    }

    pub async fn set_list(&self, ctx: &OpContext, bases: Vec<EndpointBase>) -> Result<()> {
        if bases.is_empty() {
            return Ok(());
        }
        self.mutate(ctx, |current| {
            let mut candidate = current.clone();
            for base in bases {
                validate_base(&base)?;
                let endpoint = self.templates.new_endpoint(EndpointType::Standard, "", base);
                match candidate.get(&endpoint.id) {
                    Some(prev) if !prev.is_standard() => {
                        return Err(Error::invalid_input(format!(
                            "location '{}' is used by {} endpoint '{}'",
                            endpoint.location, prev.endpoint_type, prev.id
                        )));
                    }
                    Some(prev) => {
                        warn!("endpoint '{}' ({}) replaced: ref '{}' -> '{}', host '{}' -> '{}'",
                            prev.id, prev.location, prev.base.reference, endpoint.base.reference,
                            prev.base.host, endpoint.base.host);
                    }
                    None => check_location_free(&candidate, &endpoint)?,
                }
                candidate.insert(endpoint.id.clone(), endpoint);
            }
            Ok(Some(candidate))
        })
        .await
    }

    pub async fn add_alias(&self, ctx: &OpContext, parent_id: &str, path: &str) -> Result<()> {
        self.add_dependent(ctx, parent_id, path, EndpointType::Alias).await
    }

    pub async fn add_default_gui(&self, ctx: &OpContext, parent_id: &str) -> Result<()> {
        self.add_dependent(ctx, parent_id, "", EndpointType::DefaultGui).await
    }

    async fn add_dependent(&self, ctx: &OpContext, parent_id: &str, path: &str, t: EndpointType) -> Result<()> {
        self.mutate(ctx, |current| {
            check_ext_path(path)?;
            let parent = current
                .get(parent_id)
                .ok_or_else(|| Error::not_found(format!("endpoint '{}' not found", parent_id)))?;
            if !parent.is_standard() {
                return Err(Error::invalid_input(format!(
                    "invalid parent type '{}' for endpoint '{}'",
                    parent.endpoint_type, parent_id
                )));
            }
            let mut base = parent.base.clone();
            base.ext_path = path.to_string();
            let endpoint = self.templates.new_endpoint(t, &parent.id, base);
            if let Some(dup) = current.get(&endpoint.id) {
                return Err(Error::invalid_input(format!(
                    "duplicate endpoint '{}' & '{}' -> '{}'",
                    endpoint.base.reference, dup.base.reference, dup.location
                )));
            }
            check_location_free(current, &endpoint)?;
            let mut candidate = current.clone();
            candidate.insert(endpoint.id.clone(), endpoint);
            Ok(Some(candidate))
        })
        .await
    }

    /// Удаляет endpoint и все зависимые от него
    pub async fn remove(&self, ctx: &OpContext, id: &str, restrict_standard: bool) -> Result<()> {
        self.mutate(ctx, |current| {
            let endpoint = current
                .get(id)
                .ok_or_else(|| Error::not_found(format!("endpoint '{}' not found", id)))?;
            if restrict_standard && endpoint.is_standard() {
                return Err(Error::not_allowed(format!("remove endpoint '{}' not allowed", id)));
            }
            let mut candidate = current.clone();
            remove_cascade(current, &mut candidate, id);
            Ok(Some(candidate))
        })
        .await
    }

    /// Удаляет все endpoints под фильтром. При отказе не удаляется ничего.
    pub async fn remove_all(&self, ctx: &OpContext, filter: &EndpointFilter, restrict_standard: bool) -> Result<()> {
        if restrict_standard && filter.is_empty() {
            return Ok(());
        }
        self.mutate(ctx, |current| {
            let ids: HashSet<&str> = filter.ids.iter().map(String::as_str).collect();
            let matched: Vec<&Endpoint> = current.values().filter(|e| filter.matches(&ids, e)).collect();
            if matched.is_empty() {
                return Ok(None);
            }
            if restrict_standard {
                if let Some(e) = matched.iter().find(|e| e.is_standard()) {
                    return Err(Error::not_allowed(format!("remove endpoint '{}' not allowed", e.id)));
                }
            }
            let mut candidate = current.clone();
            for e in matched {
                remove_cascade(current, &mut candidate, &e.id);
            }
            Ok(Some(candidate))
        })
        .await
    }

    /// Строит кандидата под `write_gate` и применяет его
    async fn mutate<F>(&self, ctx: &OpContext, build: F) -> Result<()>
    where
        F: FnOnce(&EndpointMap) -> Result<Option<EndpointMap>>,
    {
        let _gate = self.write_gate.lock().await;
        let current = self.endpoints.load_full();
        match build(&current) {
            Ok(Some(candidate)) => self.update(ctx, candidate).await,
            Ok(None) => Ok(()),
            Err(err) => {
                metrics::record_update(metrics::RESULT_REJECTED);
                Err(err)
            }
        }
    }

    /// render -> write -> reload -> commit. Вызывается только под `write_gate`.
    async fn update(&self, ctx: &OpContext, candidate: EndpointMap) -> Result<()> {
        ctx.check()?;
        let tree = codec::render_tree(&candidate, &self.templates).map_err(Error::internal)?;

        ctx.check()?;
        codec::write(&tree, &self.conf_path).await.map_err(Error::internal)?;

        if let Err(err) = ctx.check() {
            self.restore_file().await;
            metrics::record_update(metrics::RESULT_ROLLED_BACK);
            return Err(err.into());
        }

        // у reload свой таймаут, не зависящий от контекста вызывающего
        let reload_ctx = OpContext::background().with_timeout(self.reload_timeout);
        if let Err(err) = self
            .ctr_handler
            .exec_cmd(&reload_ctx, &self.reload_cmd, true, &BTreeMap::new(), "")
            .await
        {
            error!("Proxy reload failed: {}", err);
            PROXY_RELOAD_FAILURES.inc();
            self.restore_file().await;
            metrics::record_update(metrics::RESULT_ROLLED_BACK);
            return Err(Error::internal(format!("proxy reload failed: {}", err)));
        }

        info!("Endpoints updated: {} endpoint(s)", candidate.len());
        ENDPOINTS.set(candidate.len() as i64);
        self.endpoints.store(Arc::new(candidate));
        metrics::record_update(metrics::RESULT_COMMITTED);
        Ok(())
    }

    async fn restore_file(&self) {
        if let Err(e) = codec::restore_backup(&self.conf_path).await {
            error!("Failed to restore {} from backup: {}", self.conf_path.display(), e);
        }
    }
}

/// Удаляет `id` и endpoints, у которых он родитель
fn remove_cascade(current: &EndpointMap, candidate: &mut EndpointMap, id: &str) {
    candidate.remove(id);
    for dep in current.values().filter(|e| e.parent_id == id) {
        candidate.remove(&dep.id);
    }
}

fn check_location_free(endpoints: &EndpointMap, endpoint: &Endpoint) -> Result<()> {
    match endpoints
        .values()
        .find(|e| e.id != endpoint.id && e.location == endpoint.location)
    {
        Some(e) => Err(Error::invalid_input(format!(
            "location '{}' already used by endpoint '{}'",
            endpoint.location, e.id
        ))),
        None => Ok(()),
    }
}

pub fn check_int_path(path: &str) -> Result<()> {
    if !path.is_empty() && !path.starts_with('/') {
        return Err(Error::invalid_input(format!("internal path '{}' must be absolute", path)));
    }
    if UNSAFE_RE.is_match(path) {
        return Err(Error::invalid_input(format!("internal path '{}' contains invalid characters", path)));
    }
    Ok(())
}

pub fn check_ext_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(Error::invalid_input(format!("external path '{}' must be relative", path)));
    }
    if UNSAFE_RE.is_match(path) {
        return Err(Error::invalid_input(format!("external path '{}' contains invalid characters", path)));
    }
    Ok(())
}

fn validate_base(base: &EndpointBase) -> Result<()> {
    check_int_path(&base.int_path)?;
    check_ext_path(&base.ext_path)?;
    if !HOST_RE.is_match(&base.host) {
        return Err(Error::invalid_input(format!("invalid host '{}'", base.host)));
    }
    if UNSAFE_RE.is_match(&base.reference) {
        return Err(Error::invalid_input(format!("ref '{}' contains invalid characters", base.reference)));
    }
    for t in &base.string_sub.mime_types {
        if t != "*" && t.parse::<mime_guess::mime::Mime>().is_err() {
            return Err(Error::invalid_input(format!("invalid mime type '{}'", t)));
        }
    }
    // таймаут хранится в комментарии как i64 наносекунд
    if i64::try_from(base.proxy_conf.read_timeout.as_nanos()).is_err() {
        return Err(Error::invalid_input(format!(
            "read timeout {:?} is out of range",
            base.proxy_conf.read_timeout
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_checks() {
        assert!(check_int_path("/").is_ok());
        assert!(check_int_path("").is_ok());
        assert!(check_int_path("api").is_err());
        assert!(check_int_path("/a b").is_err());
        assert!(check_ext_path("ui").is_ok());
        assert!(check_ext_path("").is_ok());
        assert!(check_ext_path("/ui").is_err());
        assert!(check_ext_path("ui;").is_err());
    }

    #[test]
    fn test_validate_base() {
        let mut base = EndpointBase {
            reference: "d1".to_string(),
            host: "svc-1.local".to_string(),
            int_path: "/".to_string(),
            ext_path: "ui".to_string(),
            ..Default::default()
        };
        assert!(validate_base(&base).is_ok());

        base.string_sub.mime_types = vec!["text/html".to_string(), "*".to_string()];
        assert!(validate_base(&base).is_ok());
        base.string_sub.mime_types = vec!["not a mime".to_string()];
        assert!(validate_base(&base).is_err());
        base.string_sub.mime_types.clear();

        base.host = String::new();
        assert!(validate_base(&base).is_err());
        base.host = "h;rm".to_string();
        assert!(validate_base(&base).is_err());
        base.host = "10.0.0.1".to_string();
        base.reference = "a b".to_string();
        assert!(validate_base(&base).is_err());
    }

    #[test]
    fn test_read_timeout_bounds() {
        let mut base = EndpointBase {
            reference: "d1".to_string(),
            host: "h".to_string(),
            int_path: "/".to_string(),
            ext_path: "ui".to_string(),
            ..Default::default()
        };
        base.proxy_conf.read_timeout = Duration::from_secs(30);
        assert!(validate_base(&base).is_ok());

        // больше i64::MAX наносекунд
        base.proxy_conf.read_timeout = Duration::from_secs(10_000_000_000);
        assert!(validate_base(&base).is_err());
        // больше u64::MAX наносекунд
        base.proxy_conf.read_timeout = Duration::from_secs(20_000_000_000);
        assert!(validate_base(&base).is_err());

        let t = Templates::default();
        let endpoint = t.new_endpoint(EndpointType::Standard, "", base.clone());
        assert!(codec::encode(&endpoint).is_err());

        base.proxy_conf.read_timeout = Duration::from_nanos(i64::MAX as u64);
        assert!(validate_base(&base).is_ok());
        let endpoint = t.new_endpoint(EndpointType::Standard, "", base);
        let decoded = codec::decode(&codec::encode(&endpoint).unwrap()).unwrap();
        assert_eq!(decoded.base.proxy_conf.read_timeout, Duration::from_nanos(i64::MAX as u64));
    }

    #[test]
    fn test_remove_cascade() {
        let t = Templates::default();
        let parent = t.new_endpoint(
            EndpointType::Standard,
            "",
            EndpointBase { reference: "d1".into(), host: "h".into(), ext_path: "x".into(), ..Default::default() },
        );
        let mut alias_base = parent.base.clone();
        alias_base.ext_path = "a".into();
        let alias = t.new_endpoint(EndpointType::Alias, &parent.id, alias_base);
        let gui = t.new_endpoint(EndpointType::DefaultGui, &parent.id, EndpointBase::default());
        let current: EndpointMap = [parent.clone(), alias, gui]
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let mut candidate = current.clone();
        remove_cascade(&current, &mut candidate, &parent.id);
        assert!(candidate.is_empty());
    }
}
