use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::data::{KnownHeader, Operation, Request};
use crate::effects::backend::{Backend, BackendFactory, Capabilities, IoFeatures};
use crate::effects::reply::BackendContext;
use crate::error::ErrorKind;
use tether_buffer::UploadDevice;

const WRITE_CHUNK: usize = 64 * 1024;

/// Reads or writes a local file.
///
/// Downloads are read straight from the file as the reply asks for
/// bytes. Uploads (`Put`) truncate the target and drain the upload
/// device, waiting on the local waker whenever it has nothing ready.
pub struct LocalFileBackend {
    operation: Operation,
    ctx: Option<BackendContext>,
    file: Option<File>,
    remaining: u64,
    upload: Option<Box<dyn UploadDevice>>,
}

impl LocalFileBackend {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            ctx: None,
            file: None,
            remaining: 0,
            upload: None,
        }
    }

    fn path(ctx: &BackendContext) -> Option<PathBuf> {
        let url = ctx.url()?;
        match url.to_file_path() {
            Ok(path) => Some(path),
            Err(()) => {
                ctx.error(
                    ErrorKind::ProtocolInvalidOperation,
                    format!("Invalid URI: {url}"),
                );
                ctx.finished();
                None
            }
        }
    }

    fn fail(ctx: &BackendContext, path: &Path, err: &io::Error) {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::ContentNotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::ContentAccessDenied,
            _ => ErrorKind::ProtocolFailure,
        };
        ctx.error(kind, format!("Error opening {}: {err}", path.display()));
        ctx.finished();
    }

    fn open_download(&mut self, ctx: &BackendContext, path: PathBuf) {
        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => return Self::fail(ctx, &path, &e),
        };
        if meta.is_dir() {
            ctx.error(
                ErrorKind::ContentOperationNotPermitted,
                format!("Cannot open {}: Path is a directory", path.display()),
            );
            ctx.finished();
            return;
        }
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => return Self::fail(ctx, &path, &e),
        };
        debug!(path = %path.display(), len = meta.len(), "file opened");
        ctx.set_header(KnownHeader::ContentLength, meta.len().to_string());
        ctx.meta_data_changed();
        if self.operation == Operation::Head || meta.len() == 0 {
            ctx.finished();
            return;
        }
        self.remaining = meta.len();
        self.file = Some(file);
        ctx.ready_read();
    }

    fn open_upload(&mut self, ctx: &BackendContext, path: PathBuf) {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path);
        let file = match file {
            Ok(file) => file,
            Err(e) => return Self::fail(ctx, &path, &e),
        };
        debug!(path = %path.display(), "file opened for writing");
        self.file = Some(file);
        if let Some(mut device) = ctx.create_upload_device() {
            device.set_waker(Some(ctx.local_waker()));
            self.upload = Some(device);
        }
        self.pump_upload();
    }

    fn pump_upload(&mut self) {
        let (Some(ctx), Some(file)) = (self.ctx.as_ref(), self.file.as_mut()) else {
            return;
        };
        if let Some(device) = self.upload.as_mut() {
            loop {
                let chunk = match device.read_pointer(WRITE_CHUNK) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        ctx.error(ErrorKind::UnknownContent, format!("Upload failed: {e}"));
                        break;
                    }
                };
                if chunk.is_empty() {
                    if !device.at_end() {
                        trace!("upload device pending");
                        return;
                    }
                    break;
                }
                let n = chunk.len();
                if let Err(e) = file.write_all(chunk) {
                    ctx.error(ErrorKind::ContentAccessDenied, format!("Write error: {e}"));
                    break;
                }
                device.advance_read_pointer(n);
            }
            device.set_waker(None);
        }
        if let Err(e) = file.flush() {
            warn!(error = %e, "flushing uploaded file failed");
        }
        self.upload = None;
        self.file = None;
        ctx.finished();
    }
}

impl Backend for LocalFileBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities::local(IoFeatures::SUPPORTS_SYNCHRONOUS)
    }

    fn open(&mut self, ctx: BackendContext) {
        let Some(path) = Self::path(&ctx) else {
            return;
        };
        self.ctx = Some(ctx.clone());
        match self.operation {
            Operation::Get | Operation::Head => self.open_download(&ctx, path),
            Operation::Put => self.open_upload(&ctx, path),
            other => {
                ctx.error(
                    ErrorKind::ProtocolInvalidOperation,
                    format!("Operation {other} not supported on local files"),
                );
                ctx.finished();
            }
        }
    }

    fn close(&mut self) {
        if let Some(device) = self.upload.as_mut() {
            device.set_waker(None);
        }
        self.upload = None;
        self.file = None;
        self.remaining = 0;
        self.ctx = None;
    }

    fn bytes_available(&self) -> u64 {
        self.remaining
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let want = usize::try_from(self.remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let n = match file.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) => {
                if let Some(ctx) = &self.ctx {
                    ctx.error(ErrorKind::ProtocolFailure, format!("Read error: {e}"));
                    ctx.finished();
                }
                self.remaining = 0;
                return 0;
            }
        };
        if n == 0 {
            // File shrank underneath us.
            self.remaining = 0;
        } else {
            self.remaining -= n as u64;
        }
        if self.remaining == 0 {
            self.file = None;
            if let Some(ctx) = &self.ctx {
                ctx.finished();
            }
        }
        n
    }

    fn wake(&mut self) {
        if self.upload.is_some() {
            self.pump_upload();
        }
    }
}

/// Registers `file:` for the operations the manager does not serve
/// itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileBackendFactory;

impl BackendFactory for FileBackendFactory {
    fn supported_schemes(&self) -> Vec<String> {
        vec!["file".to_owned()]
    }

    fn create(&self, operation: Operation, request: &Request) -> Option<Box<dyn Backend>> {
        if !request.url().scheme().eq_ignore_ascii_case("file") {
            return None;
        }
        match operation {
            Operation::Get | Operation::Head | Operation::Put => {
                Some(Box::new(LocalFileBackend::new(operation)))
            }
            _ => None,
        }
    }
}
