// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 错误拦截
//!
//! 包装一个不了解统一错误处理函数的处理器（例如文件系统服务）。一旦它宣告了
//! 不小于 400 的状态码，状态码与之后写出的内容都不再转发，而是在处理结束后
//! 作为 [`HttpError`] 交给统一错误处理函数。

use std::{io, sync::Arc};

use log::debug;

use crate::{
    context::Http,
    exception::{Exception, HttpError},
    headers::Headers,
    lifecycle::dispatch_error,
    request::Request,
    response::ResponseWriter,
    router::Handler,
    server::AppState,
};

pub struct ErrorInterceptor<'w> {
    inner: &'w mut dyn ResponseWriter,
    error_code: Option<u16>,
    message: Vec<u8>,
}

impl<'w> ErrorInterceptor<'w> {
    pub fn new(inner: &'w mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            error_code: None,
            message: Vec::with_capacity(20),
        }
    }

    /// 处于错误状态时返回被拦截的错误
    pub fn into_error(self) -> Option<HttpError> {
        self.error_code
            .map(|code| HttpError::new(code, String::from_utf8_lossy(&self.message)))
    }
}

impl ResponseWriter for ErrorInterceptor<'_> {
    fn headers(&mut self) -> &mut Headers {
        self.inner.headers()
    }

    fn write_header(&mut self, status: u16) {
        if status >= 400 {
            self.error_code = Some(status);
        } else {
            self.inner.write_header(status);
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error_code.is_some() {
            self.message.extend_from_slice(buf);
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }
}

/// 为任意处理器加上错误拦截
pub struct WrapErrorHandler {
    inner: Arc<dyn Handler>,
}

impl WrapErrorHandler {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

impl Handler for WrapErrorHandler {
    fn serve(&self, state: &Arc<AppState>, request: &Request, w: &mut dyn ResponseWriter) {
        let error = {
            let mut interceptor = ErrorInterceptor::new(&mut *w);
            self.inner.serve(state, request, &mut interceptor);
            interceptor.into_error()
        };

        if let Some(error) = error {
            debug!("[ID{}]拦截到错误状态码 {}", request.id(), error.code);
            let mut http = Http::new(request, w, state);
            dispatch_error(&mut http, &Exception::Http(error));
        }
    }
}
