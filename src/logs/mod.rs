use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::types::LogFile;

/// Лог файл сервиса в конфигурации
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogFileConfig {
    pub name: String,
    pub path: String,
}

struct Entry {
    service_name: String,
    path: PathBuf,
}

pub struct LogHandler {
    files: BTreeMap<String, Entry>,
    buffer_size: usize,
}

impl LogHandler {
    pub fn new(files: &[LogFileConfig], buffer_size: usize) -> Result<Self> {
        let mut map = BTreeMap::new();
        for f in files {
            let path = PathBuf::from(&f.path);
            if !path.is_absolute() {
                return Err(Error::invalid_input(format!("log path '{}' must be absolute", f.path)));
            }
            let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, f.path.as_bytes()).simple().to_string();
            map.insert(id, Entry { service_name: f.name.clone(), path });
        }
        Ok(Self { files: map, buffer_size: buffer_size.max(1) })
    }

    pub fn list(&self) -> Vec<LogFile> {
        self.files
            .iter()
            .map(|(id, e)| LogFile { id: id.clone(), service_name: e.service_name.clone() })
            .collect()
    }

    /// Последние `n` строк файла (`n == 0` - весь файл)
    pub async fn tail(&self, ctx: &OpContext, id: &str, n: usize) -> Result<Bytes> {
        let entry = self
            .files
            .get(id)
            .ok_or_else(|| Error::not_found(format!("log '{}' not found", id)))?;
        let mut file = File::open(&entry.path).await.map_err(|e| {
            Error::internal(format!("opening {} failed: {}", entry.path.display(), e))
        })?;
        let start = if n == 0 {
            0
        } else {
            self.find_tail_start(ctx, &mut file, n).await?
        };
        debug!("tail {} from offset {}", entry.path.display(), start);
        file.seek(SeekFrom::Start(start)).await.map_err(Error::internal)?;
        let mut out = Vec::new();
        file.read_to_end(&mut out).await.map_err(Error::internal)?;
        Ok(Bytes::from(out))
    }

    /// Смещение начала последних `n` строк; файл читается с конца блоками
    async fn find_tail_start(&self, ctx: &OpContext, file: &mut File, n: usize) -> Result<u64> {
        let len = file.metadata().await.map_err(Error::internal)?.len();
        let mut buf = vec![0u8; self.buffer_size];
        let mut pos = len;
        let mut newlines = 0;
        while pos > 0 {
            ctx.check()?;
            let read = (self.buffer_size as u64).min(pos) as usize;
            pos -= read as u64;
            file.seek(SeekFrom::Start(pos)).await.map_err(Error::internal)?;
            file.read_exact(&mut buf[..read]).await.map_err(Error::internal)?;
            for i in (0..read).rev() {
                let offset = pos + i as u64;
                // перевод строки в конце файла не начинает новую строку
                if buf[i] != b'\n' || offset + 1 == len {
                    continue;
                }
                newlines += 1;
                if newlines == n {
                    return Ok(offset + 1);
                }
            }
        }
        Ok(0)
    }
}
