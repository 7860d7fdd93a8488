// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 静态资源
//!
//! - [`StaticResource`]：打包进程序的资源表，键为去掉基础路径后的 URL 路径，
//!   值为 gzip 压缩后的文件内容。
//! - [`StaticPage`]：静态路由。资源表命中时直接输出压缩内容，否则回退到本地目录。
//! - [`FileServer`]：本地目录的文件服务，支持目录列表、条件请求、范围请求与压缩。
//! - [`StripPrefix`]：去掉 URL 前缀后交给下层处理器。
//!
//! 打包工具输出的资源表键名经过 [`obfuscate_key`] 变换（raw deflate + URL 安全的
//! base64），载入时用 [`StaticResource::from_obfuscated`] 还原。

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use log::{debug, error, warn};

use crate::{
    cache::FileCache,
    config::Config,
    exception::Exception,
    intercept::WrapErrorHandler,
    param::{mime_by_path, HttpEncoding, HttpRequestMethod, INDEX_FILE},
    request::Request,
    response::{compress, decide_encoding, should_skip_compression, ResponseWriter},
    router::{redirect, Handler},
    server::AppState,
    util::{format_file_size, http_date, parse_http_date, service_log, HtmlBuilder},
};

/// 资源表键名变换：raw deflate 后做 URL 安全、无填充的 base64 编码
pub fn obfuscate_key(path: &str) -> String {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    // 写入内存缓冲区不会失败
    let _ = encoder.write_all(path.as_bytes());
    let deflated = encoder.finish().unwrap_or_default();
    URL_SAFE_NO_PAD.encode(deflated)
}

/// [`obfuscate_key`] 的逆变换
pub fn reveal_key(key: &str) -> Result<String, Exception> {
    let deflated = URL_SAFE_NO_PAD
        .decode(key)
        .map_err(|e| Exception::msg(format!("invalid resource key {}: {}", key, e)))?;
    let mut path = String::new();
    DeflateDecoder::new(deflated.as_slice()).read_to_string(&mut path)?;
    Ok(path)
}

/// 只读的资源表，构建完成后通过 `Arc` 共享
#[derive(Debug, Clone, Default)]
pub struct StaticResource {
    entries: HashMap<String, Bytes>,
}

impl StaticResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// `gzipped` 必须是 gzip 压缩后的内容
    pub fn insert(&mut self, key: &str, gzipped: impl Into<Bytes>) {
        self.entries.insert(key.to_string(), gzipped.into());
    }

    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn from_entries<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Bytes>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// 载入打包工具生成的资源表，键名为 [`obfuscate_key`] 的结果
    pub fn from_obfuscated<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Result<Self, Exception>
    where
        K: AsRef<str>,
        V: Into<Bytes>,
    {
        let mut resource = Self::new();
        for (key, value) in entries {
            let path = reveal_key(key.as_ref())?;
            resource.entries.insert(path, value.into());
        }
        Ok(resource)
    }

    /// 递归读取目录，逐个文件 gzip 压缩；键为相对于 `dir` 的路径，以 `/` 分隔
    pub fn bundle_dir(dir: impl AsRef<Path>) -> Result<Self, Exception> {
        let root = dir.as_ref();
        let mut resource = Self::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(current) = pending.pop() {
            for entry in fs::read_dir(&current)? {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let content = fs::read(&path)?;
                let gzipped = compress(&content, Some(HttpEncoding::Gzip))?;
                debug!("打包静态资源 {} ({} -> {} bytes)", key, content.len(), gzipped.len());
                resource.entries.insert(key, Bytes::from(gzipped));
            }
        }
        Ok(resource)
    }
}

/// 一个静态路由
pub struct StaticPage {
    base_url: String,
    file_path: PathBuf,
    mapping: Option<Arc<StaticResource>>,
    cache_seconds: u32,
    local: Arc<dyn Handler>,
}

impl StaticPage {
    /// `base_url` 会被补齐结尾的 `/`
    pub fn new(
        base_url: &str,
        file_dir: impl AsRef<Path>,
        mapping: Option<Arc<StaticResource>>,
        config: &Config,
    ) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let file_server: Arc<dyn Handler> = Arc::new(FileServer::new(file_dir.as_ref(), config));
        let strip: Arc<dyn Handler> = Arc::new(StripPrefix::new(&base_url, file_server));
        Self {
            file_path: file_dir.as_ref().to_path_buf(),
            mapping,
            cache_seconds: config.static_cache_seconds(),
            local: Arc::new(WrapErrorHandler::new(strip)),
            base_url,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

impl Handler for StaticPage {
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        let begin = Instant::now();
        let key = request.path().strip_prefix(&self.base_url).unwrap_or("");

        if let Some(content) = self.mapping.as_ref().and_then(|m| m.get(key)) {
            w.headers().add(
                "Cache-Control",
                format!("public, max-age={}", self.cache_seconds),
            );
            w.headers().set("Content-Type", mime_by_path(key));
            w.headers().set("Content-Encoding", "gzip");
            w.write_header(200);
            let _ = w.write(content);
            if state.debug() {
                service_log(&request.method().to_string(), begin, request.path(), "[mapping]");
            }
            return;
        }

        w.headers().add("Cache-Control", "no-cache");
        self.local.serve(state, request, w);
        if state.debug() {
            service_log(&request.method().to_string(), begin, request.path(), "[fs]");
        }
    }
}

/// 去掉路径前缀后交给下层处理器，前缀不匹配时返回 404
pub struct StripPrefix {
    prefix: String,
    inner: Arc<dyn Handler>,
}

impl StripPrefix {
    pub fn new(prefix: &str, inner: Arc<dyn Handler>) -> Self {
        Self {
            prefix: prefix.to_string(),
            inner,
        }
    }
}

impl Handler for StripPrefix {
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        match request.path().strip_prefix(&self.prefix) {
            Some(rest) => {
                let stripped = request.with_path(rest.to_string());
                self.inner.serve(state, &stripped, w);
            }
            None => plain_error(w, 404, "404 page not found"),
        }
    }
}

fn plain_error(w: &mut dyn ResponseWriter, code: u16, message: &str) {
    w.headers().set("Content-Type", "text/plain; charset=utf-8");
    w.headers().set("X-Content-Type-Options", "nosniff");
    w.write_header(code);
    w.write_str(message);
    w.write_str("\n");
}

fn io_error_status(e: &io::Error) -> (u16, &'static str) {
    match e.kind() {
        io::ErrorKind::NotFound => (404, "404 page not found"),
        io::ErrorKind::PermissionDenied => (403, "403 Forbidden"),
        _ => (500, "500 Internal Server Error"),
    }
}

/// 本地目录文件服务
pub struct FileServer {
    root: PathBuf,
    cache: Mutex<FileCache>,
    cache_threshold: u64,
    enable_ranges: bool,
}

impl FileServer {
    pub fn new(root: impl AsRef<Path>, config: &Config) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            cache: Mutex::new(FileCache::from_capacity(config.file_cache_size())),
            cache_threshold: config.cache_threshold(),
            enable_ranges: config.enable_range_requests(),
        }
    }

    fn lock_cache(&self, id: u128) -> MutexGuard<'_, FileCache> {
        match self.cache.lock() {
            Ok(lock) => lock,
            Err(poisoned) => {
                warn!("[ID{}]缓存锁被污染，恢复并继续", id);
                poisoned.into_inner()
            }
        }
    }

    /// 读取文件内容，优先使用缓存
    fn read_file(&self, id: u128, path: &Path, size: u64, modified: SystemTime) -> io::Result<Bytes> {
        if let Some(bytes) = self.lock_cache(id).find(path, modified) {
            debug!("[ID{}]缓存命中，原始大小: {} bytes", id, bytes.len());
            return Ok(bytes);
        }
        debug!("[ID{}]缓存未命中或文件已修改，读取文件: {}", id, path.display());
        let content = Bytes::from(fs::read(path)?);
        if FileCache::should_cache(size, self.cache_threshold) {
            self.lock_cache(id).push(path, content.clone(), modified);
            debug!("[ID{}]文件已加入缓存", id);
        } else {
            debug!("[ID{}]文件过大({} bytes)，跳过缓存", id, size);
        }
        Ok(content)
    }

    fn serve_dir(&self, request: &Request, w: &mut dyn ResponseWriter, upath: &str, dir: &Path) {
        let id = request.id();
        if !upath.ends_with('/') {
            // 相对跳转，前缀已被上层去掉
            let base = upath.rsplit('/').next().unwrap_or("");
            let mut location = format!("{}/", base);
            if !request.query().is_empty() {
                location.push('?');
                location.push_str(request.query());
            }
            redirect(w, &location, 301);
            return;
        }

        let index = dir.join(INDEX_FILE);
        if let Ok(meta) = fs::metadata(&index) {
            if meta.is_file() {
                self.serve_file(request, w, &index, &meta);
                return;
            }
        }

        let mut entries = Vec::new();
        match fs::read_dir(dir) {
            Ok(iter) => {
                for entry in iter.flatten() {
                    entries.push(entry.path());
                }
            }
            Err(e) => {
                error!("[ID{}]无法读取目录{}: {}", id, dir.display(), e);
                let (code, msg) = io_error_status(&e);
                plain_error(w, code, msg);
                return;
            }
        }

        let is_json = request
            .accept()
            .is_some_and(|a| a.contains("application/json"));
        let (mime, body) = if is_json {
            ("application/json", dir_json(&entries))
        } else {
            (
                "text/html; charset=utf-8",
                HtmlBuilder::from_dir(upath, &mut entries).map(|h| h.build().into_bytes()),
            )
        };
        match body {
            Ok(body) => {
                w.headers().set("Content-Type", mime);
                self.write_body(request, w, mime, body);
            }
            Err(e) => {
                error!("[ID{}]无法生成目录列表{}: {}", id, dir.display(), e);
                plain_error(w, 500, "500 Internal Server Error");
            }
        }
    }

    fn serve_file(&self, request: &Request, w: &mut dyn ResponseWriter, path: &Path, meta: &fs::Metadata) {
        let id = request.id();
        let size = meta.len();
        let modified = meta.modified().unwrap_or(UNIX_EPOCH);
        let mime = mime_by_path(&path.to_string_lossy());
        debug!("[ID{}]MIME类型: {}", id, mime);

        w.headers().set("Last-Modified", http_date(modified));
        if self.enable_ranges {
            w.headers().set("Accept-Ranges", "bytes");
        }

        if let Some(since) = request.header("If-Modified-Since").and_then(parse_http_date) {
            if unix_secs(modified) <= unix_secs(since) {
                debug!("[ID{}]文件未修改，返回304", id);
                w.write_header(304);
                return;
            }
        }

        w.headers().set("Content-Type", mime);

        if let (true, Some((start, end))) = (self.enable_ranges, request.range()) {
            let end = end.unwrap_or(size.saturating_sub(1)).min(size.saturating_sub(1));
            if size == 0 || start >= size || start > end {
                error!("[ID{}]无效的Range请求: start={}, end={}, file_size={}", id, start, end, size);
                w.headers().set("Content-Range", format!("bytes */{}", size));
                plain_error(w, 416, "416 Requested Range Not Satisfiable");
                return;
            }
            match read_range(path, start, end - start + 1) {
                Ok(part) => {
                    debug!("[ID{}]处理Range请求: bytes {}-{}/{}", id, start, end, size);
                    w.headers()
                        .set("Content-Range", format!("bytes {}-{}/{}", start, end, size));
                    w.write_header(206);
                    let _ = w.write(&part);
                }
                Err(e) => {
                    error!("[ID{}]读取Range内容失败: {}", id, e);
                    let (code, msg) = io_error_status(&e);
                    plain_error(w, code, msg);
                }
            }
            return;
        }

        match self.read_file(id, path, size, modified) {
            Ok(content) => self.write_body(request, w, mime, content.to_vec()),
            Err(e) => {
                error!("[ID{}]无法读取文件{}: {}", id, path.display(), e);
                let (code, msg) = io_error_status(&e);
                plain_error(w, code, msg);
            }
        }
    }

    /// 按 `Accept-Encoding` 压缩后写出；压缩失败时输出原始内容
    fn write_body(&self, request: &Request, w: &mut dyn ResponseWriter, mime: &str, body: Vec<u8>) {
        let encoding = if should_skip_compression(mime) {
            None
        } else {
            decide_encoding(&request.accept_encoding())
        };
        let body = match compress(&body, encoding) {
            Ok(compressed) => {
                if let Some(e) = encoding {
                    w.headers().set("Content-Encoding", e.to_string());
                    w.headers().add("Vary", "Accept-Encoding");
                }
                compressed
            }
            Err(e) => {
                error!("[ID{}]压缩失败: {}，返回未压缩内容", request.id(), e);
                body
            }
        };
        w.write_header(200);
        let _ = w.write(&body);
    }
}

impl Handler for FileServer {
    fn serve(&self, _state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        match request.method() {
            HttpRequestMethod::Get | HttpRequestMethod::Head => {}
            HttpRequestMethod::Options => {
                w.headers().set("Allow", "GET, HEAD, OPTIONS");
                w.write_header(204);
                return;
            }
            _ => {
                w.headers().set("Allow", "GET, HEAD, OPTIONS");
                plain_error(w, 405, "405 method not allowed");
                return;
            }
        }

        let mut upath = request.path().to_string();
        if !upath.starts_with('/') {
            upath.insert(0, '/');
        }
        if upath.split('/').any(|seg| seg == "..") {
            plain_error(w, 400, "invalid URL path");
            return;
        }

        let full = self.root.join(upath.trim_start_matches('/'));
        debug!("[ID{}]映射物理路径：{}", request.id(), full.display());
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                debug!("[ID{}]无法获取{}的元数据: {}", request.id(), full.display(), e);
                let (code, msg) = io_error_status(&e);
                plain_error(w, code, msg);
                return;
            }
        };

        if meta.is_dir() {
            self.serve_dir(request, w, &upath, &full);
        } else {
            self.serve_file(request, w, &full, &meta);
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn read_range(path: &Path, start: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn dir_json(entries: &[PathBuf]) -> io::Result<Vec<u8>> {
    let listing: Vec<_> = entries
        .iter()
        .map(|p| {
            let meta = fs::metadata(p).ok();
            let is_dir = p.is_dir();
            let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
            let modified = meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
                .unwrap_or_default();
            serde_json::json!({
                "name": p.file_name().and_then(|n| n.to_str()).unwrap_or(""),
                "type": if is_dir { "dir" } else { "file" },
                "size": if is_dir { "-".to_string() } else { format_file_size(size) },
                "raw_size": size,
                "date": modified,
            })
        })
        .collect();
    serde_json::to_vec(&listing).map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Http, response::Response};
    use flate2::read::GzDecoder;
    use std::time::Duration;
    use tempfile::TempDir;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(Config::new()).unwrap())
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        compress(data, Some(HttpEncoding::Gzip)).unwrap()
    }

    fn gunzip(data: &[u8]) -> String {
        let mut out = String::new();
        GzDecoder::new(data).read_to_string(&mut out).unwrap();
        out
    }

    fn get(handler: &dyn Handler, state: &Arc<AppState>, req: Request) -> Response {
        let mut resp = Response::new();
        handler.serve(state, &req, &mut resp);
        resp
    }

    fn site() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello world, hello world").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("empty").join("a.png"), [0x89, b'P', b'N', b'G']).unwrap();
        dir
    }

    #[test]
    fn test_key_transform_is_reversible() {
        let key = obfuscate_key("css/site.css");
        assert!(!key.contains('/') && !key.contains('=') && !key.contains('+'));
        assert_eq!(reveal_key(&key).unwrap(), "css/site.css");
        assert!(reveal_key("***").is_err());
    }

    #[test]
    fn test_from_obfuscated_and_bundle_dir() {
        let res = StaticResource::from_obfuscated(vec![(obfuscate_key("a/b.js"), gzip(b"x"))]).unwrap();
        assert_eq!(res.keys().collect::<Vec<_>>(), vec!["a/b.js"]);

        let dir = site();
        let bundled = StaticResource::bundle_dir(dir.path()).unwrap();
        assert_eq!(bundled.len(), 3);
        assert_eq!(gunzip(bundled.get("docs/index.html").unwrap()), "<h1>docs</h1>");
        assert!(bundled.get("hello.txt").is_some());
    }

    #[test]
    fn test_mapping_hit() {
        let payload = gzip(b"body{}");
        let mapping = StaticResource::from_entries([("abc123", payload.clone())]);
        let config = Config::new().set_static_cache_seconds(600);
        let page = StaticPage::new("/assets", "/nonexistent", Some(Arc::new(mapping)), &config);
        assert_eq!(page.base_url(), "/assets/");

        let resp = get(&page, &state(), Request::new(HttpRequestMethod::Get, "/assets/abc123"));
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
        assert_eq!(resp.header("Cache-Control"), Some("public, max-age=600"));
        assert_eq!(resp.header("Content-Type"), Some("application/octet-stream"));
        assert_eq!(resp.body(), payload.as_slice());
    }

    #[test]
    fn test_mapping_miss_falls_back_to_error_handler() {
        let mapping = StaticResource::from_entries([("abc123", gzip(b"x"))]);
        let dir = site();
        let page = StaticPage::new("/assets/", dir.path(), Some(Arc::new(mapping)), &Config::new());

        let resp = get(&page, &state(), Request::new(HttpRequestMethod::Get, "/assets/missing"));
        assert_eq!(resp.status_code(), 404);
        assert_eq!(resp.header("Cache-Control"), Some("no-cache"));
        let body = String::from_utf8_lossy(resp.body()).to_string();
        assert!(body.contains("Service Error"));
        assert!(body.contains("404 page not found"));
    }

    /// 收集测试进程中的日志行
    struct CaptureLogger;

    static CAPTURED: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());
    static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;

    impl log::Log for CaptureLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            if let Ok(mut lines) = CAPTURED.lock() {
                lines.push(record.args().to_string());
            }
        }

        fn flush(&self) {}
    }

    fn captured_line(path: &str) -> Option<String> {
        CAPTURED
            .lock()
            .unwrap()
            .iter()
            .find(|line| line.contains(path))
            .cloned()
    }

    #[test]
    fn test_debug_access_log_marks_source() {
        if log::set_logger(&CAPTURE_LOGGER).is_ok() {
            log::set_max_level(log::LevelFilter::Info);
        }
        let dir = site();
        let mapping = StaticResource::from_entries([("abc123", gzip(b"x"))]);

        let mut debug_state = AppState::new(Config::new()).unwrap();
        debug_state.set_debug(true);
        let debug_state = Arc::new(debug_state);
        let page = StaticPage::new("/logged/", dir.path(), Some(Arc::new(mapping)), &Config::new());
        get(&page, &debug_state, Request::new(HttpRequestMethod::Get, "/logged/abc123"));
        get(&page, &debug_state, Request::new(HttpRequestMethod::Get, "/logged/hello.txt"));

        let quiet = StaticPage::new("/quiet/", dir.path(), None, &Config::new());
        get(&quiet, &state(), Request::new(HttpRequestMethod::Get, "/quiet/hello.txt"));

        assert!(captured_line("/logged/abc123").unwrap().ends_with("[mapping]"));
        assert!(captured_line("/logged/hello.txt").unwrap().ends_with("[fs]"));
        assert!(captured_line("/quiet/hello.txt").is_none());
    }

    #[test]
    fn test_fallback_serves_local_file() {
        let dir = site();
        let page = StaticPage::new("/s/", dir.path(), None, &Config::new());
        let resp = get(&page, &state(), Request::new(HttpRequestMethod::Get, "/s/hello.txt"));
        assert_eq!(resp.status_code(), 200);
        assert_eq!(resp.header("Cache-Control"), Some("no-cache"));
        assert_eq!(resp.header("Content-Type"), Some("text/plain; charset=utf-8"));
        assert!(resp.header("Last-Modified").is_some());
        assert_eq!(resp.body(), b"hello world, hello world");
    }

    #[test]
    fn test_custom_error_handler_sees_http_error() {
        let dir = site();
        let mut state = AppState::new(Config::new()).unwrap();
        state.set_error_handler(|http: &mut Http, err: &Exception| {
            let code = err.status_code();
            http.writer().write_header(code);
            http.write_str(&format!("custom {}", code));
        });
        let page = StaticPage::new("/s/", dir.path(), None, &Config::new());
        let resp = get(&page, &Arc::new(state), Request::new(HttpRequestMethod::Get, "/s/nope.css"));
        assert_eq!(resp.status_code(), 404);
        assert_eq!(resp.body(), b"custom 404");
    }

    #[test]
    fn test_file_server_directory_rules() {
        let dir = site();
        let fs_handler = FileServer::new(dir.path(), &Config::new());
        let state = state();

        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Get, "/docs"));
        assert_eq!(resp.status_code(), 301);
        assert_eq!(resp.header("Location"), Some("docs/"));

        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Get, "/docs/"));
        assert_eq!(resp.body(), b"<h1>docs</h1>");

        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Get, "/empty/"));
        assert!(String::from_utf8_lossy(resp.body()).contains("a.png"));

        let req = Request::new(HttpRequestMethod::Get, "/empty/").with_header("Accept", "application/json");
        let resp = get(&fs_handler, &state, req);
        let listing: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(listing[0]["name"], "a.png");
        assert_eq!(listing[0]["raw_size"], 4);
    }

    #[test]
    fn test_file_server_rejects_and_errors() {
        let dir = site();
        let fs_handler = FileServer::new(dir.path(), &Config::new());
        let state = state();

        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Get, "/../etc/passwd"));
        assert_eq!(resp.status_code(), 400);
        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Get, "/none.txt"));
        assert_eq!(resp.status_code(), 404);
        assert_eq!(resp.body(), b"404 page not found\n");
        let resp = get(&fs_handler, &state, Request::new(HttpRequestMethod::Delete, "/hello.txt"));
        assert_eq!(resp.status_code(), 405);
    }

    #[test]
    fn test_conditional_and_range_requests() {
        let dir = site();
        let fs_handler = FileServer::new(dir.path(), &Config::new());
        let state = state();

        let future = http_date(SystemTime::now() + Duration::from_secs(3600));
        let req = Request::new(HttpRequestMethod::Get, "/hello.txt").with_header("If-Modified-Since", &future);
        assert_eq!(get(&fs_handler, &state, req).status_code(), 304);

        let req = Request::new(HttpRequestMethod::Get, "/hello.txt").with_header("Range", "bytes=0-4");
        let resp = get(&fs_handler, &state, req);
        assert_eq!(resp.status_code(), 206);
        assert_eq!(resp.body(), b"hello");
        assert_eq!(resp.header("Content-Range"), Some("bytes 0-4/24"));

        let req = Request::new(HttpRequestMethod::Get, "/hello.txt").with_header("Range", "bytes=100-");
        let resp = get(&fs_handler, &state, req);
        assert_eq!(resp.status_code(), 416);
        assert_eq!(resp.header("Content-Range"), Some("bytes */24"));
    }

    #[test]
    fn test_compression_and_cache() {
        let dir = site();
        let fs_handler = FileServer::new(dir.path(), &Config::new());
        let state = state();

        let req = Request::new(HttpRequestMethod::Get, "/hello.txt").with_header("Accept-Encoding", "gzip, br");
        let resp = get(&fs_handler, &state, req);
        assert_eq!(resp.header("Content-Encoding"), Some("gzip"));
        assert_eq!(gunzip(resp.body()), "hello world, hello world");
        assert_eq!(fs_handler.lock_cache(0).len(), 1);

        let req = Request::new(HttpRequestMethod::Get, "/empty/a.png").with_header("Accept-Encoding", "gzip");
        let resp = get(&fs_handler, &state, req);
        assert!(resp.header("Content-Encoding").is_none());
        assert_eq!(resp.body().len(), 4);
    }

    #[test]
    fn test_strip_prefix_mismatch() {
        let inner: Arc<dyn Handler> = Arc::new(FileServer::new(".", &Config::new()));
        let strip = StripPrefix::new("/x/", inner);
        let resp = get(&strip, &state(), Request::new(HttpRequestMethod::Get, "/y/file"));
        assert_eq!(resp.status_code(), 404);
    }
}
