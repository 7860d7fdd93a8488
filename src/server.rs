// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 服务器
//!
//! [`Server`] 负责注册路由；开始服务时路由表被冻结为 `Arc<Router>`，
//! 与只读的 [`AppState`] 一起交给每个连接任务。
//!
//! 每个连接只处理一个请求：读取并解析请求，在阻塞线程池中执行处理函数，
//! 把缓冲的响应写回 Socket 后关闭连接。

use std::{
    fs::File,
    io::{self, BufReader},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{watch, Notify},
    time::{sleep, timeout},
};
use tokio_rustls::{
    rustls::{crypto::ring, ServerConfig},
    TlsAcceptor,
};

use crate::{
    config::Config,
    context::Http,
    exception::Exception,
    lifecycle::{default_error_handle, Service},
    param::HttpRequestMethod,
    request::Request,
    response::{Response, ResponseWriter},
    router::{redirect, Handler, Router},
    session::{
        MemoryStore, SecureCookie, SessionManager, SessionStore, BLOCK_KEY_LEN, HASH_KEY_LEN,
    },
    static_files::{StaticPage, StaticResource},
    template::{TemplateCache, TemplateFunctions},
    util::HtmlBuilder,
};

/// 统一错误处理函数
pub type ErrorHandler = Arc<dyn Fn(&mut Http, &Exception) + Send + Sync>;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

/// 所有请求共享的只读状态
pub struct AppState {
    config: Config,
    debug: bool,
    template_dir: PathBuf,
    templates: Arc<TemplateCache>,
    sessions: SessionManager,
    error_handler: ErrorHandler,
}

impl AppState {
    /// 使用默认的错误处理函数、内存会话存储和空的模板函数表
    pub fn new(config: Config) -> Result<Self, Exception> {
        let config = config.with_defaults();
        let codec = session_codec(&config)?;
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        Ok(Self::from_parts(
            config,
            codec,
            store,
            TemplateFunctions::new(),
            Arc::new(default_error_handle),
        ))
    }

    fn from_parts(
        config: Config,
        codec: SecureCookie,
        store: Arc<dyn SessionStore>,
        functions: TemplateFunctions,
        error_handler: ErrorHandler,
    ) -> Self {
        let sessions = SessionManager::new(
            codec,
            config.cookie_name(),
            config.session_exp(),
            store,
        );
        Self {
            debug: config.debug(),
            template_dir: PathBuf::from(config.template_dir()),
            templates: TemplateCache::new(functions),
            sessions,
            error_handler,
            config,
        }
    }

    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Http, &Exception) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn template_dir(&self) -> &Path {
        &self.template_dir
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn error_handler(&self) -> &ErrorHandler {
        &self.error_handler
    }
}

/// 配置中缺省的密钥随机生成，此时重启后旧的会话 Cookie 全部失效
fn session_codec(config: &Config) -> Result<SecureCookie, Exception> {
    let (hash_key, block_key) = config.session_keys()?;
    let hash_key = hash_key.unwrap_or_else(|| {
        warn!("未配置session_hash_key，使用随机生成的密钥");
        SecureCookie::generate_key(HASH_KEY_LEN)
    });
    let block_key = block_key.unwrap_or_else(|| {
        warn!("未配置session_block_key，使用随机生成的密钥");
        SecureCookie::generate_key(BLOCK_KEY_LEN)
    });
    SecureCookie::new(&hash_key, &block_key)
}

pub struct Server {
    config: Config,
    debug: bool,
    template_dir: PathBuf,
    functions: TemplateFunctions,
    error_handler: ErrorHandler,
    store: Arc<dyn SessionStore>,
    codec: SecureCookie,
    router: Router,
    control: Arc<Control>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self, Exception> {
        let config = config.with_defaults();
        let codec = session_codec(&config)?;
        Ok(Self {
            debug: config.debug(),
            template_dir: PathBuf::from(config.template_dir()),
            functions: TemplateFunctions::new(),
            error_handler: Arc::new(default_error_handle),
            store: Arc::new(MemoryStore::new()),
            codec,
            router: Router::new(),
            control: Arc::new(Control::new()),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// `get_tpl` 查找模板的目录
    pub fn set_template_dir(&mut self, dir: impl AsRef<Path>) {
        self.template_dir = dir.as_ref().to_path_buf();
    }

    /// 注册模板函数，必须在开始服务之前完成
    pub fn set_tpl_func<F: tera::Function + 'static>(&mut self, name: &str, function: F) {
        if self.functions.contains(name) {
            warn!("模板函数 {} 被重复注册", name);
        }
        self.functions.register(name, function);
    }

    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&mut Http, &Exception) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
    }

    pub fn set_session_store(&mut self, store: Arc<dyn SessionStore>) {
        self.store = store;
    }

    /// 直接注册路由处理器，不经过请求生命周期包装
    pub fn handle<H: Handler + 'static>(&mut self, pattern: &str, handler: H) {
        if self.debug {
            info!("Add Handler {}", pattern);
        }
        self.router.insert(pattern, Arc::new(handler));
    }

    /// 普通 web 服务
    pub fn service<F>(&mut self, path: &str, handler: F)
    where
        F: Fn(&mut Http) -> Result<(), Exception> + Send + Sync + 'static,
    {
        if self.debug {
            info!("Add Service {}", path);
        }
        self.router.insert(path, Arc::new(Service::new(handler)));
    }

    /// 创建模板服务：`handler` 返回的数据绑定到模板 `file` 的 `data` 字段。
    ///
    /// HEAD 请求不渲染模板，没有错误时返回 204。返回值需再经
    /// [`Server::service`] 映射到 URL。
    pub fn template_page<T, F>(
        &self,
        file: impl AsRef<Path>,
        handler: F,
    ) -> impl Fn(&mut Http) -> Result<(), Exception> + Send + Sync + 'static
    where
        T: Serialize,
        F: Fn(&mut Http) -> Result<T, Exception> + Send + Sync + 'static,
    {
        let file = file.as_ref().to_path_buf();
        if self.debug {
            info!("Template {}", file.display());
        }
        let max_age = self.config.static_cache_seconds();

        move |http: &mut Http| -> Result<(), Exception> {
            let headers = http.writer().headers();
            headers.set("Cache-Control", format!("private, max-age={}", max_age));
            headers.set("Content-Type", "text/html; charset=utf-8");

            let template = match http.state().templates().resolve(&file) {
                Ok(t) => t,
                Err(e) => {
                    http.write_str("Parse Template Error<br/>");
                    return Err(e);
                }
            };

            let data = handler(http)?;
            if http.request().method() == HttpRequestMethod::Head {
                http.writer().write_header(204);
                return Ok(());
            }

            let html = template.render(&template.page_context(&data))?;
            http.write_str(&html);
            Ok(())
        }
    }

    /// 把对 `location` 的请求永久跳转到 `to`；`location` 为 `/` 时接管所有未注册的路径
    pub fn jump_mapping(&mut self, location: &str, to: &str) {
        let to = to.to_string();
        self.handle(
            location,
            move |_: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter| {
                w.headers().add("Cache-Control", "no-store");
                if request.method() == HttpRequestMethod::Head {
                    w.write_header(405);
                    return;
                }
                redirect(w, &to, 301);
            },
        );
    }

    /// 静态资源服务：优先从 `mapping` 读取，找不到时回退到本地目录 `file_dir`
    pub fn static_page(
        &mut self,
        base_url: &str,
        file_dir: impl AsRef<Path>,
        mapping: Option<Arc<StaticResource>>,
    ) {
        let page = StaticPage::new(base_url, file_dir, mapping, &self.config);
        if self.debug {
            info!(
                "Static {} -> {}",
                page.base_url(),
                page.file_path().display()
            );
        }
        let pattern = page.base_url().to_string();
        self.router.insert(&pattern, Arc::new(page));
    }

    /// 可在其他任务中控制停机的句柄
    pub fn shutdown_handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    fn into_state(self) -> (Arc<AppState>, Arc<Router>, Arc<Control>) {
        let config = self.config.set_debug(self.debug);
        let mut state = AppState::from_parts(
            config,
            self.codec,
            self.store,
            self.functions,
            self.error_handler,
        );
        state.template_dir = self.template_dir;
        (Arc::new(state), Arc::new(self.router), self.control)
    }

    fn address(&self) -> SocketAddrV4 {
        let ip = match self.config.local() {
            true => Ipv4Addr::new(127, 0, 0, 1),
            false => Ipv4Addr::new(0, 0, 0, 0),
        };
        SocketAddrV4::new(ip, self.config.http_port())
    }

    /// 绑定端口，冻结路由表
    pub async fn listen(self) -> Result<Listening, Exception> {
        self.bind(None).await
    }

    async fn bind(self, tls: Option<TlsAcceptor>) -> Result<Listening, Exception> {
        let address = self.address();
        let listener = TcpListener::bind(address).await.map_err(|e| {
            error!("无法绑定端口：{}，错误：{}", address.port(), e);
            e
        })?;
        info!("端口{}绑定完成", address.port());
        let (state, router, control) = self.into_state();
        Ok(Listening {
            listener,
            state,
            router,
            control,
            tls,
        })
    }

    /// 启动服务，直到停机后才返回
    pub async fn start_http_server(self) -> Result<(), Exception> {
        let listening = self.listen().await?;
        info!("Server on http://{}", listening.local_addr()?);
        listening.serve().await
    }

    pub async fn start_https_server(self, cert: &str, key: &str) -> Result<(), Exception> {
        let acceptor = tls_acceptor(cert, key)?;
        let listening = self.bind(Some(acceptor)).await?;
        info!("Server on https://{}", listening.local_addr()?);
        listening.serve().await
    }
}

fn tls_acceptor(cert: &str, key: &str) -> Result<TlsAcceptor, Exception> {
    let certs = {
        let mut reader = BufReader::new(File::open(cert)?);
        rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?
    };
    if certs.is_empty() {
        return Err(Exception::Tls(format!("{} 中没有证书", cert)));
    }
    let private_key = {
        let mut reader = BufReader::new(File::open(key)?);
        rustls_pemfile::private_key(&mut reader)?
            .ok_or_else(|| Exception::Tls(format!("{} 中没有私钥", key)))?
    };
    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Exception::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| Exception::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// 已绑定端口、尚未开始接受连接的服务器
pub struct Listening {
    listener: TcpListener,
    state: Arc<AppState>,
    router: Arc<Router>,
    control: Arc<Control>,
    tls: Option<TlsAcceptor>,
}

impl Listening {
    pub fn local_addr(&self) -> Result<SocketAddr, Exception> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn shutdown_handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// 接受连接直到收到停机信号或监听器失效。返回时仍在处理的连接不受影响，
    /// 由 [`ServerHandle::shutdown`] 等待它们结束。
    pub async fn serve(self) -> Result<(), Exception> {
        let Listening {
            listener,
            state,
            router,
            control,
            tls,
        } = self;
        let mut stopping = control.stopping.subscribe();
        let mut id: u128 = 0;

        loop {
            let (stream, addr) = tokio::select! {
                _ = signalled(&mut stopping) => {
                    info!("主循环接收到停机指令，停止接受新连接");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                        let backoff = accept_backoff(e)?;
                        if !backoff.is_zero() {
                            sleep(backoff).await;
                        }
                        continue;
                    }
                },
            };
            debug!("[ID{}]TCP连接已建立：{}", id, addr);

            let guard = ConnectionGuard::new(Arc::clone(&control));
            let mut closed = control.closed.subscribe();
            let state = Arc::clone(&state);
            let router = Arc::clone(&router);
            let tls = tls.clone();
            tokio::spawn(async move {
                let _guard = guard;
                tokio::select! {
                    _ = signalled(&mut closed) => {
                        warn!("[ID{}]服务器已关闭，中止连接", id);
                    }
                    _ = serve_stream(stream, tls, id, state, router) => {}
                }
            });
            id += 1;
        }
        Ok(())
    }
}

/// accept 出错时的处理：单个连接的错误立即重试，文件描述符耗尽时退避，
/// 其余错误视为监听器失效。
fn accept_backoff(e: io::Error) -> Result<Duration, Exception> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => Ok(Duration::ZERO),
        // EMFILE / ENFILE
        _ if matches!(e.raw_os_error(), Some(23) | Some(24)) => Ok(ACCEPT_BACKOFF),
        _ => Err(e.into()),
    }
}

/// 等待信号变为 true
async fn signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    id: u128,
    state: Arc<AppState>,
    router: Arc<Router>,
) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => handle_connection(stream, id, state, router).await,
            Err(e) => warn!("[ID{}]TLS握手失败: {}", id, e),
        },
        None => handle_connection(stream, id, state, router).await,
    }
}

/// 读取一个完整的请求。客户端未发送任何数据就关闭连接时返回 `None`。
async fn read_request<S>(stream: &mut S, id: u128, limit: usize) -> Result<Option<Request>, Exception>
where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    let head_len = loop {
        if let Some(n) = Request::head_len(&buffer) {
            break n;
        }
        if buffer.len() > limit {
            return Err(Exception::PayloadTooLarge(limit));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(Exception::MalformedRequest("connection closed before request head".into()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let mut request = Request::try_from(&buffer[..head_len], id)?;
    let total = match head_len.checked_add(request.content_length()) {
        Some(total) if total <= limit => total,
        _ => return Err(Exception::PayloadTooLarge(limit)),
    };
    while buffer.len() < total {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Exception::MalformedRequest("request body truncated".into()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    request.set_body(Bytes::copy_from_slice(&buffer[head_len..total]));
    Ok(Some(request))
}

/// # 连接处理器
///
/// 读取解析请求、在阻塞线程池中执行路由，最后写出响应。
async fn handle_connection<S>(mut stream: S, id: u128, state: Arc<AppState>, router: Arc<Router>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let limit = state.config().max_request_size();
    let request = match timeout(READ_TIMEOUT, read_request(&mut stream, id, limit)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            debug!("[ID{}]客户端关闭了连接", id);
            return;
        }
        Ok(Err(e)) => {
            warn!("[ID{}]解析HTTP请求失败: {}", id, e);
            let code = e.status_code();
            let html = HtmlBuilder::from_status_code(code, None).build();
            write_response(&mut stream, id, &Response::from_html(code, &html), false).await;
            discard_input(&mut stream).await;
            return;
        }
        Err(_) => {
            warn!("[ID{}]读取请求超时", id);
            return;
        }
    };
    debug!("[ID{}]成功解析HTTP请求", id);

    let start_time = Instant::now();
    let head_only = request.method() == HttpRequestMethod::Head;
    let dispatched = tokio::task::spawn_blocking(move || {
        let mut response = Response::new();
        router.dispatch(&state, &request, &mut response);
        (request, response)
    })
    .await;

    let (request, response) = match dispatched {
        Ok(pair) => pair,
        Err(e) => {
            error!("[ID{}]处理请求时发生未知异常: {}", id, e);
            let html = HtmlBuilder::from_status_code(500, None).build();
            write_response(&mut stream, id, &Response::from_html(500, &html), head_only).await;
            return;
        }
    };
    debug!(
        "[ID{}]HTTP响应构建完成，服务端用时{}ms。",
        id,
        start_time.elapsed().as_millis()
    );

    info!(
        "[ID{}] {}, {}, {}, {}, {}, {}, ",
        id,
        request.version(),
        request.path(),
        request.method(),
        response.status_code(),
        response.information(),
        request.user_agent(),
    );

    write_response(&mut stream, id, &response, head_only).await;
}

async fn write_response<S>(stream: &mut S, id: u128, response: &Response, head_only: bool)
where
    S: AsyncWrite + Unpin,
{
    let bytes = response.as_bytes(head_only);
    debug!("[ID{}]发送响应，长度: {}", id, bytes.len());
    if let Err(e) = stream.write_all(&bytes).await {
        error!("[ID{}]发送响应失败: {}", id, e);
        return;
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// 错误响应发出后丢弃客户端剩余的输入
async fn discard_input<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut sink = [0u8; READ_CHUNK];
    let drain = async {
        while let Ok(n) = stream.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    };
    let _ = timeout(Duration::from_secs(1), drain).await;
}

/// 停机信号与活跃连接计数
struct Control {
    /// 停止接受新连接
    stopping: watch::Sender<bool>,
    /// 中止所有连接
    closed: watch::Sender<bool>,
    active: AtomicUsize,
    idle: Notify,
}

impl Control {
    fn new() -> Self {
        Self {
            stopping: watch::Sender::new(false),
            closed: watch::Sender::new(false),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }
}

struct ConnectionGuard(Arc<Control>);

impl ConnectionGuard {
    fn new(control: Arc<Control>) -> Self {
        control.active.fetch_add(1, Ordering::SeqCst);
        Self(control)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
}

impl ServerHandle {
    /// 停止接受新连接，并等待正在处理的请求结束，超时返回错误
    pub async fn shutdown(&self, wait: Duration) -> Result<(), Exception> {
        info!("开始优雅停机，最多等待{}ms", wait.as_millis());
        self.control.stopping.send_replace(true);
        let idle = async {
            loop {
                let notified = self.control.idle.notified();
                if self.control.active.load(Ordering::SeqCst) == 0 {
                    break;
                }
                notified.await;
            }
        };
        match timeout(wait, idle).await {
            Ok(()) => {
                info!("所有连接已处理完毕");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "停机超时，仍有{}个活跃连接",
                    self.control.active.load(Ordering::SeqCst)
                );
                Err(Exception::ShutdownTimeout)
            }
        }
    }

    /// 立即停止，中止所有连接
    pub fn close(&self) {
        warn!("服务器立即关闭");
        self.control.stopping.send_replace(true);
        self.control.closed.send_replace(true);
    }

    pub fn active_connections(&self) -> usize {
        self.control.active.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        *self.control.stopping.borrow()
    }
}
