use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, error, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::templates::{Templates, LOCATION_DIRECTIVE, SET_DIRECTIVE, UPSTREAM_VAR_PREFIX};
use crate::config::nginx_parser::{Directive, NginxConfig, ParseError};
use crate::types::{Endpoint, EndpointMap};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("endpoint metadata is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("endpoint metadata is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("endpoint '{0}' declared more than once")]
    Duplicate(String),
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".bk")
}

fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Кодирует endpoint в текст комментария (base64 от JSON)
pub fn encode(endpoint: &Endpoint) -> Result<String, CodecError> {
    let json = serde_json::to_vec(endpoint)?;
    Ok(STANDARD.encode(json))
}

/// Декодирует комментарий; принимает и base64, и старый формат с открытым JSON
pub fn decode(comment: &str) -> Result<Endpoint, CodecError> {
    let s = comment.trim();
    let s = s.strip_prefix('#').unwrap_or(s).trim();
    if s.starts_with('{') && s.ends_with('}') {
        return Ok(serde_json::from_str(s)?);
    }
    let raw = STANDARD.decode(s)?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Читает конфиг; отсутствующий файл создается пустым
pub async fn parse(path: &Path) -> Result<NginxConfig, CodecError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("endpoints config {} not found, creating empty file", path.display());
            fs::File::create(path).await?;
            String::new()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(NginxConfig::parse_config_content(&content)?)
}

fn first_comment(directive: &Directive) -> Option<&str> {
    directive.comments.iter().map(|c| c.trim()).find(|c| !c.is_empty())
}

fn is_upstream_set(directive: &Directive) -> bool {
    directive.name == SET_DIRECTIVE
        && directive
            .parameters
            .first()
            .is_some_and(|p| p.starts_with(UPSTREAM_VAR_PREFIX))
}

/// Комментарий с метаданными endpoint, если директива его несет.
/// Текущий формат: на `set $v<id> ...`; старый: на самом `location`,
/// внутри которого есть `set $v...` без своего комментария.
fn metadata_comment(directive: &Directive) -> Option<&str> {
    let comment = first_comment(directive)?;
    if is_upstream_set(directive) {
        return Some(comment);
    }
    let legacy = directive.name == LOCATION_DIRECTIVE
        && directive.block.as_ref().is_some_and(|b| {
            b.directives
                .iter()
                .any(|d| is_upstream_set(d) && first_comment(d).is_none())
        });
    legacy.then_some(comment)
}

/// Восстанавливает endpoints из дерева. Любая ошибка декодирования фатальна.
pub fn load_endpoints(tree: &NginxConfig, templates: &Templates) -> Result<EndpointMap, CodecError> {
    let mut comments = Vec::new();
    tree.walk(&mut |directive, _| {
        if let Some(c) = metadata_comment(directive) {
            comments.push(c);
        }
    });

    let mut endpoints = EndpointMap::new();
    for comment in comments {
        let mut endpoint = decode(comment)?;
        endpoint.location = templates.render_location(
            endpoint.endpoint_type,
            &endpoint.base.reference,
            &endpoint.base.ext_path,
        );
        if endpoint.id.is_empty() {
            endpoint.id = Endpoint::derive_id(&endpoint.location);
        }
        if endpoints.contains_key(&endpoint.id) {
            return Err(CodecError::Duplicate(endpoint.id));
        }
        debug!("loaded endpoint {} -> {}", endpoint.id, endpoint.location);
        endpoints.insert(endpoint.id.clone(), endpoint);
    }

    for e in endpoints.values() {
        if !e.parent_id.is_empty() && !endpoints.contains_key(&e.parent_id) {
            warn!("endpoint '{}' references missing parent '{}'", e.id, e.parent_id);
        }
    }
    Ok(endpoints)
}

/// Строит дерево директив для набора endpoints
pub fn render_tree(endpoints: &EndpointMap, templates: &Templates) -> Result<NginxConfig, CodecError> {
    let mut config = NginxConfig::default();
    for endpoint in endpoints.values() {
        let comment = encode(endpoint)?;
        config
            .block
            .directives
            .push(templates.render_location_block(endpoint, comment));
    }
    Ok(config)
}

async fn write_atomic(tmp: &Path, path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp).await?;
    file.write_all(content.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await
}

/// Восстанавливает файл из `.bk`
pub async fn restore_backup(path: &Path) -> Result<(), CodecError> {
    let tmp = tmp_path(path);
    let content = fs::read(backup_path(path)).await?;
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    Ok(result?)
}

/// Записывает дерево: копия в `.bk`, запись во временный файл и rename.
/// При ошибке файл восстанавливается из `.bk`.
pub async fn write(tree: &NginxConfig, path: &Path) -> Result<(), CodecError> {
    let bk = backup_path(path);
    match fs::copy(path, &bk).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::File::create(&bk).await?;
        }
        Err(e) => return Err(e.into()),
    }
    let tmp = tmp_path(path);
    if let Err(err) = write_atomic(&tmp, path, &tree.dump()).await {
        let _ = fs::remove_file(&tmp).await;
        if let Err(e) = restore_backup(path).await {
            error!("restoring {} from backup failed: {}", path.display(), e);
        }
        return Err(err.into());
    }
    Ok(())
}
