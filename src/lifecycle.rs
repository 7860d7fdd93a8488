// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 请求生命周期
//!
//! [`Service`] 包装普通的处理函数：
//! 1. 在处理函数运行前设置 `Cache-Control: no-store`；
//! 2. 拦截处理函数中的 panic（包括 [`Http::fatal`]），转换为 [`Exception`]；
//! 3. 错误只交给统一错误处理函数一次；
//! 4. 按注册顺序执行 `close_on_end` 注册的清理动作；
//! 5. 调试模式下输出访问日志。

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::{Cell, RefCell},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Once},
    time::Instant,
};

use log::{error, warn};

use crate::{
    context::Http,
    exception::Exception,
    request::Request,
    response::ResponseWriter,
    router::Handler,
    server::AppState,
    util::{escape_html, service_log},
};

/// [`Http::fatal`] 的 panic 负载
#[derive(Debug, Clone)]
pub struct Abort(pub String);

thread_local! {
    static IN_SERVICE: Cell<bool> = const { Cell::new(false) };
    static CAPTURE_BACKTRACE: Cell<bool> = const { Cell::new(false) };
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// 在原有 panic hook 之前插入一层：处理函数内部的 panic 只记录调用栈，不打印到标准错误
fn install_panic_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_SERVICE.with(Cell::get) {
                if CAPTURE_BACKTRACE.with(Cell::get) {
                    let trace = Backtrace::force_capture().to_string();
                    LAST_BACKTRACE.with(|b| *b.borrow_mut() = Some(trace));
                }
                return;
            }
            previous(info);
        }));
    });
}

/// 标记当前线程处于处理函数中，离开作用域时恢复
struct ServiceScope {
    outer: bool,
}

impl ServiceScope {
    fn enter(debug: bool) -> Self {
        install_panic_hook();
        CAPTURE_BACKTRACE.with(|c| c.set(debug));
        LAST_BACKTRACE.with(|b| b.borrow_mut().take());
        Self {
            outer: IN_SERVICE.with(|f| f.replace(true)),
        }
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        IN_SERVICE.with(|f| f.set(self.outer));
    }
}

/// 把 panic 负载转换为错误
pub(crate) fn fault_to_exception(payload: Box<dyn Any + Send>) -> Exception {
    let payload = match payload.downcast::<Abort>() {
        Ok(abort) => return Exception::Abort(abort.0),
        Err(p) => p,
    };
    let payload = match payload.downcast::<Exception>() {
        Ok(e) => return *e,
        Err(p) => p,
    };
    if let Some(s) = payload.downcast_ref::<&str>() {
        Exception::Panic(s.to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Exception::Panic(s.clone())
    } else {
        Exception::Panic("unknown panic".to_string())
    }
}

/// 在恢复屏障内执行 `f`，panic 被转换为错误
pub(crate) fn catch_fault<R>(
    id: u128,
    debug: bool,
    f: impl FnOnce() -> Result<R, Exception>,
) -> Result<R, Exception> {
    let scope = ServiceScope::enter(debug);
    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
    drop(scope);
    match outcome {
        Ok(result) => result,
        Err(payload) => {
            let err = fault_to_exception(payload);
            if debug {
                let trace = LAST_BACKTRACE.with(|b| b.borrow_mut().take());
                error!("[ID{}]==> {}\n{}", id, err, trace.unwrap_or_default());
            }
            Err(err)
        }
    }
}

/// 默认的统一错误处理函数，状态码取自 [`Exception::status_code`]：
/// 拦截到的 HTTP 错误保留原状态码，参数错误为 400，文件 I/O 错误为 404/403，
/// 其余错误一律 500。
pub fn default_error_handle(http: &mut Http, err: &Exception) {
    let w = http.writer();
    w.headers().set("Content-Type", "text/html; charset=utf-8");
    w.write_header(err.status_code());
    w.write_str("<p>Service Error</p>");
    w.write_str(&format!("<p>{}</p>", escape_html(&err.to_string())));
    error!("[ID{}]Error: {}", http.request().id(), err);
}

/// 把错误交给统一错误处理函数；错误处理函数自身的 panic 只记录日志
pub(crate) fn dispatch_error(http: &mut Http, err: &Exception) {
    let handler = Arc::clone(http.state().error_handler());
    let id = http.request().id();
    let debug = http.state().debug();
    let result = catch_fault(id, debug, || {
        handler(http, err);
        Ok(())
    });
    if let Err(e) = result {
        error!("[ID{}]统一错误处理函数发生异常: {}", id, e);
    }
}

pub struct Service<F> {
    handler: F,
}

impl<F> Service<F>
where
    F: Fn(&mut Http) -> Result<(), Exception> + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> Handler for Service<F>
where
    F: Fn(&mut Http) -> Result<(), Exception> + Send + Sync,
{
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        let begin = Instant::now();
        let debug = state.debug();
        let mut http = Http::new(request, w, state);
        http.writer().headers().add("Cache-Control", "no-store");

        let result = catch_fault(request.id(), debug, || (self.handler)(&mut http));
        if let Err(err) = &result {
            dispatch_error(&mut http, err);
        }

        for closer in http.take_closers() {
            if let Err(e) = catch_fault(request.id(), debug, || {
                closer.close();
                Ok(())
            }) {
                warn!("[ID{}]清理动作发生异常: {}", request.id(), e);
            }
        }

        if debug {
            service_log(
                &request.method().to_string(),
                begin,
                request.path(),
                http.label(),
            );
        }
    }
}
