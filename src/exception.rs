// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # Exception 模块
//!
//! 该模块定义了请求处理生命周期中可能出现的各类错误。
//!
//! ## 分类
//! - **I/O 错误**：文件不存在、读取失败等，直接传播给调用方，不做重试。
//! - **模板错误**：模板解析/渲染失败，在文件下次变更后才会重新编译。
//! - **业务错误**：处理函数显式返回的错误，交由统一错误处理器。
//! - **运行时故障**：处理函数 panic 被恢复屏障拦截后转换而来。
//! - **HTTP 错误码**：静态文件回退路径中被拦截的 4xx/5xx 状态。
//!
//! 每个变体都能通过 [`Exception::status_code`] 映射到 HTTP 状态码。

use std::{fmt, io};

use thiserror::Error;

/// 携带 HTTP 状态码的错误，由错误拦截包装器产生。
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub code: u16,
    pub message: String,
}

impl HttpError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP {}: {}", self.code, self.message.trim_end())
    }
}

impl std::error::Error for HttpError {}

/// 服务器处理请求过程中发生的异常类型。
#[derive(Debug, Error)]
pub enum Exception {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Http(HttpError),

    /// 请求参数无法转换为期望的类型
    #[error("bad parameter: {name} not {kind}: {value:?}")]
    BadParam {
        name: String,
        value: String,
        kind: &'static str,
    },

    /// `url_param` 没有提供任何输出参数
    #[error("not out bind param")]
    BindOutParam,

    /// `url_param` 在 URL 中找不到固定的基准片段
    #[error("not found 'fixBase' in URL")]
    BindNotFix,

    /// 处理函数 panic，由恢复屏障捕获
    #[error("handler panicked: {0}")]
    Panic(String),

    /// 通过 `Http::fatal` 主动中止的请求
    #[error("request aborted: {0}")]
    Abort(String),

    #[error("Request bytes can't be parsed in UTF-8")]
    RequestIsNotUtf8,

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("Unsupported request method")]
    UnSupportedRequestMethod,

    #[error("Unsupported HTTP version")]
    UnsupportedHttpVersion,

    #[error("request exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid path (400)")]
    InvalidPath,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cookie error: {0}")]
    Cookie(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// 业务代码自定义的错误描述
    #[error("{0}")]
    Handler(String),
}

impl Exception {
    /// 返回该错误对应的 HTTP 状态码。
    pub fn status_code(&self) -> u16 {
        match self {
            Exception::Http(e) => e.code,
            Exception::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => 404,
                io::ErrorKind::PermissionDenied => 403,
                _ => 500,
            },
            Exception::BadParam { .. }
            | Exception::BindOutParam
            | Exception::BindNotFix
            | Exception::RequestIsNotUtf8
            | Exception::MalformedRequest(_)
            | Exception::UnsupportedHttpVersion
            | Exception::InvalidPath => 400,
            Exception::UnSupportedRequestMethod => 405,
            Exception::PayloadTooLarge(_) => 413,
            _ => 500,
        }
    }

    /// 便捷构造业务错误。
    pub fn msg(message: impl Into<String>) -> Self {
        Exception::Handler(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let not_found = Exception::Io(io::Error::new(io::ErrorKind::NotFound, "x"));
        assert_eq!(not_found.status_code(), 404);
        assert_eq!(Exception::Http(HttpError::new(416, "")).status_code(), 416);
        assert_eq!(Exception::BindNotFix.status_code(), 400);
        assert_eq!(Exception::Panic("boom".into()).status_code(), 500);
        assert_eq!(Exception::msg("nope").status_code(), 500);
    }

    #[test]
    fn test_display() {
        let e = Exception::BadParam {
            name: "age".into(),
            value: "x".into(),
            kind: "integer",
        };
        assert_eq!(e.to_string(), "bad parameter: age not integer: \"x\"");
        let e = Exception::Http(HttpError::new(404, "404 page not found\n"));
        assert_eq!(e.to_string(), "HTTP 404: 404 page not found");
    }
}
