//! 压缩包的生成与流式解包
//!
//! 发送端把所有文件以 Stored 方式写入临时 ZIP（可 seek，因此本地头中带有
//! 完整的 CRC 和大小，不使用数据描述符），接收端按条目流式读取。

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::FileDescriptor;
use super::progress::ProgressThrottler;
use crate::error::TransferError;

const COPY_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// 接收结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// 收到全部通告的文件
    Complete,
    /// 收到部分文件
    Partial,
    /// 一个文件都没有收到
    Failed,
}

impl TransferOutcome {
    pub fn classify(received: usize, expected: usize) -> Self {
        match received {
            0 => TransferOutcome::Failed,
            n if n >= expected => TransferOutcome::Complete,
            _ => TransferOutcome::Partial,
        }
    }
}

/// 解包结果
#[derive(Debug, Default)]
pub struct UnpackReport {
    pub files: Vec<PathBuf>,
    /// 写入失败而被删除的条目
    pub failed_entry: Option<String>,
    pub bytes: u64,
}

/// 把文件写成 ZIP，返回压缩包字节数
pub fn write_archive(files: &[FileDescriptor], dest: &Path) -> Result<u64, TransferError> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest)?));
    let mut used = HashSet::new();

    for file in files {
        let name = unique_name(&file.name, |candidate| !used.contains(candidate));
        used.insert(name.clone());

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(file.size >= u64::from(u32::MAX));
        zip.start_file(name.as_str(), options).map_err(io::Error::from)?;

        match (&file.text, &file.path) {
            (Some(text), _) => zip.write_all(text.as_bytes())?,
            (None, Some(path)) => {
                let mut source = File::open(path)?;
                io::copy(&mut source, &mut zip)?;
            }
            (None, None) => {
                return Err(TransferError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has neither content nor path", file.name),
                )));
            }
        }
        debug!("Archived entry '{}' ({} bytes)", name, file.size);
    }

    zip.finish().map_err(io::Error::from)?.flush()?;
    Ok(fs::metadata(dest)?.len())
}

/// 流式解包到 `dest_dir`
///
/// 条目写入失败时删除该条目的部分输出并停止处理后续条目，已完成的条目保留。
/// 读取条目头失败说明数据流本身出错，整体返回错误。
pub fn unpack_archive<R, F>(
    reader: &mut R,
    dest_dir: &Path,
    progress: &mut ProgressThrottler<F>,
    cancel: &CancellationToken,
) -> Result<UnpackReport, TransferError>
where
    R: Read,
    F: FnMut(u64, u64),
{
    fs::create_dir_all(dest_dir)?;
    let mut report = UnpackReport::default();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut reader = GuardedReader {
        inner: reader,
        cancel,
        failed: false,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::UserCancelled { is_remote: false });
        }

        let mut entry = match zip::read::read_zipfile_from_stream(&mut reader) {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(TransferError::Io(io::Error::from(e))),
        };

        if entry.is_dir() {
            continue;
        }
        let Some(name) = entry_file_name(entry.name()) else {
            warn!("Skipping archive entry with unusable name: {:?}", entry.name());
            continue;
        };

        let path = unique_name_in(dest_dir, &name);
        debug!("Unpacking '{}' to {:?}", name, path);

        match copy_entry(&mut entry, &path, &mut buffer, &mut report.bytes, progress, cancel) {
            Ok(()) => report.files.push(path),
            Err(e) => {
                warn!("Failed to receive '{}': {}", name, e);
                if let Err(rm) = fs::remove_file(&path) {
                    warn!("Failed to delete partial file {:?}: {}", path, rm);
                }
                if cancel.is_cancelled() {
                    return Err(TransferError::UserCancelled { is_remote: false });
                }
                report.failed_entry = Some(name);
                break;
            }
        }
    }

    progress.finish(report.bytes);
    info!(
        "Unpacked {} file(s), {} bytes{}",
        report.files.len(),
        report.bytes,
        if report.failed_entry.is_some() { " (stopped on failure)" } else { "" }
    );
    Ok(report)
}

fn copy_entry<R, F>(
    entry: &mut R,
    path: &Path,
    buffer: &mut [u8],
    total: &mut u64,
    progress: &mut ProgressThrottler<F>,
    cancel: &CancellationToken,
) -> io::Result<()>
where
    R: Read,
    F: FnMut(u64, u64),
{
    let mut out = BufWriter::new(File::create(path)?);
    loop {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        let n = entry.read(buffer)?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
        *total += n as u64;
        progress.update(*total);
    }
    out.flush()
}

/// 丢弃未读完的条目时 zip 会读空剩余数据，并在读错误时 panic；
/// 出错或取消之后只返回 EOF。
struct GuardedReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
    failed: bool,
}

impl<R: Read> Read for GuardedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.failed || self.cancel.is_cancelled() {
            return Ok(0);
        }
        self.inner.read(buf).inspect_err(|e| {
            if e.kind() != io::ErrorKind::Interrupted {
                self.failed = true;
            }
        })
    }
}

/// 只保留条目名的最后一段路径
fn entry_file_name(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

fn unique_name_in(dir: &Path, name: &str) -> PathBuf {
    dir.join(unique_name(name, |candidate| !dir.join(candidate).exists()))
}

/// `name`, `name (1).ext`, `name (2).ext` ... 中第一个可用的
fn unique_name(name: &str, is_free: impl Fn(&str) -> bool) -> String {
    if is_free(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    (1..)
        .map(|i| format!("{stem} ({i}){ext}"))
        .find(|candidate| is_free(candidate))
        .unwrap_or_else(|| name.to_string())
}
